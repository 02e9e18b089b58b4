use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::conflict::{find_conflict, query_window};
use super::{Engine, EngineError};

/// Optional equality filters for slot listings. `None` matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub location: Option<Location>,
    pub vehicle_class: Option<VehicleClass>,
    pub status: Option<SlotStatus>,
}

impl SlotFilter {
    pub fn matches(&self, slot: &Slot) -> bool {
        self.location.is_none_or(|l| l == slot.location)
            && self.vehicle_class.is_none_or(|c| c == slot.vehicle_class)
            && self.status.is_none_or(|s| s == slot.status)
    }
}

/// Orders `girls-hostel-bus-2` before `girls-hostel-bus-10`.
fn slot_number_key(number: &str) -> (&str, u64) {
    match number.rsplit_once('-') {
        Some((prefix, n)) => match n.parse() {
            Ok(n) => (prefix, n),
            Err(_) => (number, 0),
        },
        None => (number, 0),
    }
}

impl Engine {
    pub async fn get_slot(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = shared.read().await;
        Ok(guard.slot.clone())
    }

    /// Slots matching `filter`, ordered by location then slot number.
    pub async fn list_slots(&self, filter: &SlotFilter) -> Vec<Slot> {
        let mut out = Vec::new();
        for shared in self.slots.handles() {
            let guard = shared.read().await;
            if filter.matches(&guard.slot) {
                out.push(guard.slot.clone());
            }
        }
        out.sort_by(|a, b| {
            a.location
                .cmp(&b.location)
                .then_with(|| slot_number_key(&a.slot_number).cmp(&slot_number_key(&b.slot_number)))
        });
        out
    }

    /// Slots currently `available` for a location and vehicle class.
    pub async fn available_slots(&self, location: Location, vehicle_class: VehicleClass) -> Vec<Slot> {
        self.list_slots(&SlotFilter {
            location: Some(location),
            vehicle_class: Some(vehicle_class),
            status: Some(SlotStatus::Available),
        })
        .await
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let slot_id = self
            .bookings
            .slot_for(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = shared.read().await;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// A user's booking history, newest first.
    pub async fn bookings_for_user(&self, user: &str) -> Vec<Booking> {
        let mut out = Vec::new();
        for id in self.bookings.ids_for_user(user) {
            if let Ok(b) = self.get_booking(id).await {
                out.push(b);
            }
        }
        sort_newest_first(&mut out);
        out
    }

    /// Every booking on a slot, ordered by start time.
    pub async fn bookings_for_slot(&self, slot_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = shared.read().await;
        Ok(guard.bookings.clone())
    }

    /// Every booking in the system, newest first.
    pub async fn all_bookings(&self) -> Vec<Booking> {
        let mut out = Vec::new();
        for shared in self.slots.handles() {
            let guard = shared.read().await;
            out.extend(guard.bookings.iter().cloned());
        }
        sort_newest_first(&mut out);
        out
    }

    /// True if a pending/active booking on the slot overlaps `[start, end)`.
    pub async fn has_conflict(&self, slot_id: Ulid, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let query = query_window(start, end)?;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = shared.read().await;
        Ok(find_conflict(&guard, &query).is_some())
    }

    /// The pending/active bookings that overlap `[start, end)` on a slot.
    pub async fn conflicts(&self, slot_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Booking>, EngineError> {
        let query = query_window(start, end)?;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = shared.read().await;
        Ok(guard.live_overlapping(&query).cloned().collect())
    }

    pub async fn slot_free_windows(&self, slot_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let query = query_window(start, end)?;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = shared.read().await;
        Ok(free_windows(&guard, &query))
    }

    /// Bookings whose clock has run past a lifecycle boundary at `now`:
    /// pending bookings that have started and active bookings that have ended.
    /// A pending booking whose whole window already passed goes straight to
    /// its activation first; the next sweep completes it.
    pub async fn due_transitions(&self, now: Ms) -> Vec<(Ulid, BookingStatus)> {
        let mut due = Vec::new();
        for shared in self.slots.handles() {
            let guard = shared.read().await;
            for b in &guard.bookings {
                match b.status {
                    BookingStatus::Pending if b.span.start <= now => {
                        due.push((b.id, BookingStatus::Active));
                    }
                    BookingStatus::Active if b.span.end <= now => {
                        due.push((b.id, BookingStatus::Completed));
                    }
                    _ => {}
                }
            }
        }
        due
    }
}

fn sort_newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}
