use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Authoritative slot inventory. Each slot lives behind its own lock together
/// with the bookings that reference it.
#[derive(Default)]
pub struct SlotStore {
    slots: DashMap<Ulid, SharedSlotState>,
    /// (location, slot_number) → slot id; slot numbers are unique per location.
    numbers: DashMap<(Location, String), Ulid>,
}

impl SlotStore {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every slot handle. Callers lock each one individually.
    pub fn handles(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub fn id_for_number(&self, location: Location, number: &str) -> Option<Ulid> {
        self.numbers
            .get(&(location, number.to_string()))
            .map(|e| *e.value())
    }

    /// Reserve a slot number for `id`. Fails with the holder's id if taken.
    pub fn claim_number(&self, location: Location, number: &str, id: Ulid) -> Result<(), EngineError> {
        match self.numbers.entry((location, number.to_string())) {
            Entry::Occupied(e) => Err(EngineError::AlreadyExists(*e.get())),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    pub fn release_number(&self, location: Location, number: &str) {
        self.numbers.remove(&(location, number.to_string()));
    }

    pub fn insert(&self, state: SlotState) {
        let id = state.slot.id;
        self.numbers
            .insert((state.slot.location, state.slot.slot_number.clone()), id);
        self.slots.insert(id, Arc::new(RwLock::new(state)));
    }
}

/// Indexes over bookings. The booking records themselves live in their slot's
/// `SlotState` so a reservation and its slot update commit under one lock.
#[derive(Default)]
pub struct BookingStore {
    booking_to_slot: DashMap<Ulid, Ulid>,
    by_user: DashMap<UserId, Vec<Ulid>>,
}

impl BookingStore {
    pub fn len(&self) -> usize {
        self.booking_to_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.booking_to_slot.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.booking_to_slot.contains_key(id)
    }

    pub fn slot_for(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn ids_for_user(&self, user: &str) -> Vec<Ulid> {
        self.by_user
            .get(user)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Bind a new booking id to its slot before the reservation is logged.
    /// Ids are global, so this is the one check that spans slot locks.
    pub fn claim(&self, booking_id: Ulid, slot_id: Ulid) -> Result<(), EngineError> {
        match self.booking_to_slot.entry(booking_id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(booking_id)),
            Entry::Vacant(e) => {
                e.insert(slot_id);
                Ok(())
            }
        }
    }

    /// Drop a claim whose reservation never made it into the WAL.
    pub fn release(&self, booking_id: &Ulid) {
        self.booking_to_slot.remove(booking_id);
    }

    pub fn index(&self, booking_id: Ulid, slot_id: Ulid, user: &str) {
        self.booking_to_slot.insert(booking_id, slot_id);
        let mut ids = self.by_user.entry(user.to_string()).or_default();
        if !ids.contains(&booking_id) {
            ids.push(booking_id);
        }
    }
}

/// Apply a slot-scoped event to its state. The caller holds the slot lock.
/// `SlotProvisioned` and `SlotRestored` create states and are handled by the caller.
pub fn apply_event(state: &mut SlotState, event: &Event, bookings: &BookingStore) {
    match event {
        Event::SlotStatusSet { status, at, .. } => {
            let slot = &mut state.slot;
            slot.status = *status;
            if matches!(status, SlotStatus::Available | SlotStatus::Maintenance) {
                slot.current_booking = None;
            }
            slot.last_updated = *at;
        }
        Event::BookingReserved {
            id,
            slot_id,
            user,
            vehicle_class,
            vehicle_number,
            span,
            duration_hours,
            total_amount,
            at,
        } => {
            state.insert_booking(Booking {
                id: *id,
                user: user.clone(),
                slot_id: *slot_id,
                vehicle_class: *vehicle_class,
                vehicle_number: vehicle_number.clone(),
                span: *span,
                duration_hours: *duration_hours,
                status: BookingStatus::Pending,
                total_amount: *total_amount,
                created_at: *at,
            });
            bookings.index(*id, *slot_id, user);
            state.slot.status = SlotStatus::Reserved;
            state.slot.current_booking = Some(*id);
            state.slot.last_updated = *at;
        }
        Event::BookingCancelled { id, at, .. } => {
            if let Some(b) = state.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
            // A slot reassigned since this booking was made keeps its new occupant.
            if state.slot.current_booking == Some(*id) {
                state.slot.status = SlotStatus::Available;
                state.slot.current_booking = None;
                state.slot.last_updated = *at;
            }
        }
        Event::BookingAdvanced { id, status, at, .. } => {
            if let Some(b) = state.booking_mut(id) {
                b.status = *status;
            }
            if state.slot.current_booking == Some(*id) {
                match status {
                    BookingStatus::Active => state.slot.status = SlotStatus::Occupied,
                    BookingStatus::Completed | BookingStatus::Cancelled => {
                        state.slot.status = SlotStatus::Available;
                        state.slot.current_booking = None;
                    }
                    BookingStatus::Pending => {}
                }
                state.slot.last_updated = *at;
            }
        }
        Event::BookingRestored {
            id,
            slot_id,
            user,
            vehicle_class,
            vehicle_number,
            span,
            duration_hours,
            status,
            total_amount,
            created_at,
        } => {
            state.insert_booking(Booking {
                id: *id,
                user: user.clone(),
                slot_id: *slot_id,
                vehicle_class: *vehicle_class,
                vehicle_number: vehicle_number.clone(),
                span: *span,
                duration_hours: *duration_hours,
                status: *status,
                total_amount: *total_amount,
                created_at: *created_at,
            });
            bookings.index(*id, *slot_id, user);
        }
        Event::SlotProvisioned { .. } | Event::SlotRestored { .. } => {}
    }
}

/// Build a fresh state from a slot-creating event.
pub fn state_from_event(event: &Event) -> Option<SlotState> {
    match event {
        Event::SlotProvisioned {
            id,
            location,
            slot_number,
            vehicle_class,
            coordinates,
            at,
        } => Some(SlotState::new(Slot {
            id: *id,
            location: *location,
            slot_number: slot_number.clone(),
            vehicle_class: *vehicle_class,
            status: SlotStatus::Available,
            current_booking: None,
            coordinates: *coordinates,
            last_updated: *at,
        })),
        Event::SlotRestored {
            id,
            location,
            slot_number,
            vehicle_class,
            coordinates,
            status,
            current_booking,
            last_updated,
        } => Some(SlotState::new(Slot {
            id: *id,
            location: *location,
            slot_number: slot_number.clone(),
            vehicle_class: *vehicle_class,
            status: *status,
            current_booking: *current_booking,
            coordinates: *coordinates,
            last_updated: *last_updated,
        })),
        _ => None,
    }
}

/// Events that recreate one slot's current state exactly. Used by WAL compaction.
pub fn snapshot_events(state: &SlotState) -> Vec<Event> {
    let slot = &state.slot;
    let mut events = Vec::with_capacity(state.bookings.len() + 1);
    events.push(Event::SlotRestored {
        id: slot.id,
        location: slot.location,
        slot_number: slot.slot_number.clone(),
        vehicle_class: slot.vehicle_class,
        coordinates: slot.coordinates,
        status: slot.status,
        current_booking: slot.current_booking,
        last_updated: slot.last_updated,
    });
    events.extend(state.bookings.iter().map(|b| Event::BookingRestored {
        id: b.id,
        slot_id: b.slot_id,
        user: b.user.clone(),
        vehicle_class: b.vehicle_class,
        vehicle_number: b.vehicle_number.clone(),
        span: b.span,
        duration_hours: b.duration_hours,
        status: b.status,
        total_amount: b.total_amount,
        created_at: b.created_at,
    }));
    events
}
