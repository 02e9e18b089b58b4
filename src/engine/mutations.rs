use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{booking_window, find_conflict, now_ms};
use super::store::snapshot_events;
use super::{Engine, EngineError, WalCommand};

/// Inventory entry for a new slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub id: Ulid,
    pub location: Location,
    pub slot_number: String,
    pub vehicle_class: VehicleClass,
    pub coordinates: Coordinates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub user: UserId,
    pub slot_id: Ulid,
    pub vehicle_class: VehicleClass,
    pub start: Ms,
    pub duration_hours: u32,
    pub vehicle_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub booking: Booking,
    /// False when the slot had already moved on to another occupant.
    pub slot_released: bool,
}

impl Engine {
    pub async fn provision_slot(&self, spec: SlotSpec) -> Result<Slot, EngineError> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if spec.slot_number.is_empty() || spec.slot_number.len() > MAX_SLOT_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("slot number empty or too long"));
        }
        let _provisioning = self.provision_lock.lock().await;
        if self.slots.contains(&spec.id) {
            return Err(EngineError::AlreadyExists(spec.id));
        }
        self.slots
            .claim_number(spec.location, &spec.slot_number, spec.id)?;

        let at = now_ms();
        let event = Event::SlotProvisioned {
            id: spec.id,
            location: spec.location,
            slot_number: spec.slot_number.clone(),
            vehicle_class: spec.vehicle_class,
            coordinates: spec.coordinates,
            at,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.slots.release_number(spec.location, &spec.slot_number);
            return Err(e);
        }
        let slot = Slot {
            id: spec.id,
            location: spec.location,
            slot_number: spec.slot_number,
            vehicle_class: spec.vehicle_class,
            status: SlotStatus::Available,
            current_booking: None,
            coordinates: spec.coordinates,
            last_updated: at,
        };
        self.slots.insert(SlotState::new(slot.clone()));
        metrics::gauge!(observability::SLOTS_TOTAL).set(self.slots.len() as f64);
        tracing::debug!(slot_id = %slot.id, number = %slot.slot_number, "slot provisioned");
        Ok(slot)
    }

    /// Provision every spec whose slot number is not yet taken at its location.
    /// Returns how many slots were created.
    pub async fn provision_inventory(&self, specs: Vec<SlotSpec>) -> Result<usize, EngineError> {
        let mut created = 0;
        for spec in specs {
            if self
                .slots
                .id_for_number(spec.location, &spec.slot_number)
                .is_some()
            {
                continue;
            }
            self.provision_slot(spec).await?;
            created += 1;
        }
        Ok(created)
    }

    /// Book a slot for a time window. The checks and the booking + slot update
    /// run under the slot's write lock, so concurrent requests for the same
    /// slot behave as if serialized.
    pub async fn reserve(&self, req: ReservationRequest) -> Result<Booking, EngineError> {
        let slot_id = req.slot_id;
        let result = self.try_reserve(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(b) => tracing::info!(booking_id = %b.id, %slot_id, user = %b.user, "slot reserved"),
            Err(e) => tracing::debug!(%slot_id, "reserve rejected: {e}"),
        }
        result
    }

    async fn try_reserve(&self, req: ReservationRequest) -> Result<Booking, EngineError> {
        let span = booking_window(req.start, req.duration_hours)?;
        if req.user.len() > MAX_USER_ID_LEN {
            return Err(EngineError::LimitExceeded("user id too long"));
        }
        if let Some(ref n) = req.vehicle_number
            && n.len() > MAX_VEHICLE_NUMBER_LEN {
                return Err(EngineError::LimitExceeded("vehicle number too long"));
            }

        let mut guard = self.lock_slot(req.slot_id).await?;
        if self.bookings.contains(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let slot = &guard.slot;
        if slot.status != SlotStatus::Available {
            // A slot held by a booking that overlaps the request reports the overlap.
            if slot.status.holds_booking()
                && let Some(existing) = find_conflict(&guard, &span)
            {
                return Err(EngineError::TimeConflict(existing));
            }
            return Err(EngineError::SlotUnavailable {
                slot_id: slot.id,
                status: slot.status,
            });
        }
        if slot.vehicle_class != req.vehicle_class {
            return Err(EngineError::VehicleClassMismatch {
                slot_class: slot.vehicle_class,
                requested: req.vehicle_class,
            });
        }
        if let Some(existing) = find_conflict(&guard, &span) {
            return Err(EngineError::TimeConflict(existing));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }
        // Another slot may be committing the same id right now.
        self.bookings.claim(req.id, req.slot_id)?;

        let total_amount = self.pricing.amount(req.vehicle_class, req.duration_hours);
        let event = Event::BookingReserved {
            id: req.id,
            slot_id: req.slot_id,
            user: req.user,
            vehicle_class: req.vehicle_class,
            vehicle_number: req.vehicle_number,
            span,
            duration_hours: req.duration_hours,
            total_amount,
            at: now_ms(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.bookings.release(&req.id);
            return Err(e);
        }
        guard
            .booking(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))
    }

    /// Cancel a pending or active booking owned by `user` (any owner when
    /// `privileged`). Frees the slot only if it still points at this booking.
    pub async fn cancel(
        &self,
        user: &str,
        booking_id: Ulid,
        privileged: bool,
    ) -> Result<Cancellation, EngineError> {
        let mut guard = self.lock_booking_slot(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if (!privileged && booking.user != user) || !booking.status.is_live() {
            return Err(EngineError::NotCancellable(booking_id));
        }

        let slot_released = guard.slot.current_booking == Some(booking_id);
        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id: guard.slot.id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        if slot_released {
            tracing::info!(%booking_id, slot_id = %guard.slot.id, "booking cancelled, slot released");
        } else {
            tracing::info!(%booking_id, slot_id = %guard.slot.id, "booking cancelled, slot left with its current occupant");
        }

        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(Cancellation {
            booking,
            slot_released,
        })
    }

    /// Administrative override. `available` and `maintenance` drop the slot's
    /// booking reference; the booking itself keeps whatever status it had.
    pub async fn set_slot_status(&self, slot_id: Ulid, status: SlotStatus) -> Result<Slot, EngineError> {
        let mut guard = self.lock_slot(slot_id).await?;
        if let Some(orphan) = guard.slot.current_booking
            && !status.holds_booking() {
                tracing::warn!(%slot_id, booking_id = %orphan, %status, "override detaches booking from slot");
            }
        let event = Event::SlotStatusSet {
            slot_id,
            status,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(%slot_id, %status, "slot status overridden");
        Ok(guard.slot.clone())
    }

    /// Move a booking forward: pending → active, or active → completed.
    pub async fn advance_state(
        &self,
        booking_id: Ulid,
        target: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.lock_booking_slot(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.status.can_advance_to(target) {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: target,
            });
        }

        let event = Event::BookingAdvanced {
            id: booking_id,
            slot_id: guard.slot.id,
            status: target,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => target.as_str()).increment(1);
        tracing::debug!(%booking_id, to = %target, "booking advanced");
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Every slot's read lock (and the provisioning lock) is held until the
    /// writer has swapped files, so no mutation can land in the old log after
    /// its slot was snapshotted.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _provisioning = self.provision_lock.lock().await;
        let mut guards = Vec::new();
        let mut events = Vec::new();
        for shared in self.slots.handles() {
            let guard = shared.read_owned().await;
            events.extend(snapshot_events(&guard));
            guards.push(guard);
        }
        let event_count = events.len();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!(events = event_count, "WAL compacted");
        Ok(())
    }
}
