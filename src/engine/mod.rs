mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod stats;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping};
pub use conflict::{find_conflict, now_ms};
pub use error::EngineError;
pub use mutations::{Cancellation, ReservationRequest, SlotSpec};
pub use queries::SlotFilter;
pub use store::{BookingStore, SharedSlotState, SlotStore};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedRwLockWriteGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::config::LockPolicy;
use crate::model::*;
use crate::observability;
use crate::pricing::{HourlyRates, PricingPolicy};
use crate::wal::Wal;

use store::{apply_event, state_from_event};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Appends from different slots that arrive together share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                if handle_non_append(&mut wal, other) {
                    return;
                }
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut pending = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    pending = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(clone_result(&result));
        }

        if let Some(cmd) = pending
            && handle_non_append(&mut wal, cmd) {
                return;
            }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn clone_result(result: &io::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
    }
}

/// Returns true when the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            false
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            false
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            true
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Collaborators injected at construction.
#[derive(Clone)]
pub struct EngineOptions {
    pub pricing: Arc<dyn PricingPolicy>,
    pub lock: LockPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pricing: Arc::new(HourlyRates::default()),
            lock: LockPolicy::default(),
        }
    }
}

/// The reservation engine. Owns the slot and booking stores and the WAL writer.
pub struct Engine {
    pub slots: SlotStore,
    pub bookings: BookingStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) pricing: Arc<dyn PricingPolicy>,
    pub(super) lock_policy: LockPolicy,
    /// Serializes slot provisioning against WAL compaction.
    pub(super) provision_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: SlotStore::default(),
            bookings: BookingStore::default(),
            wal_tx,
            pricing: options.pricing,
            lock_policy: options.lock,
            provision_lock: tokio::sync::Mutex::new(()),
        };

        // Replay into plain states first; nothing else can see them yet.
        let mut replayed: HashMap<Ulid, SlotState> = HashMap::new();
        for event in &events {
            if let Some(state) = state_from_event(event) {
                replayed.insert(state.slot.id, state);
            } else if let Some(state) = replayed.get_mut(&event.slot_id()) {
                apply_event(state, event, &engine.bookings);
            }
        }
        let slot_count = replayed.len();
        for (_, state) in replayed {
            engine.slots.insert(state);
        }
        metrics::gauge!(observability::SLOTS_TOTAL).set(slot_count as f64);
        tracing::info!(
            events = events.len(),
            slots = slot_count,
            bookings = engine.bookings.len(),
            "engine state replayed from {}",
            wal_path.display()
        );

        Ok(engine)
    }

    pub fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. The caller holds the slot's write lock, so
    /// readers see either none or all of the event's effects.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(state, event, &self.bookings);
        Ok(())
    }

    /// Acquire a slot's write lock, waiting at most `lock_policy.timeout` per
    /// attempt and backing off between attempts.
    pub(super) async fn lock_slot(
        &self,
        slot_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(self.lock_policy.timeout, shared.clone().write_owned()).await {
                Ok(guard) => {
                    metrics::histogram!(observability::SLOT_LOCK_WAIT_SECONDS)
                        .record(started.elapsed().as_secs_f64());
                    return Ok(guard);
                }
                Err(_) if attempt < self.lock_policy.retries => {
                    metrics::counter!(observability::SLOT_LOCK_RETRIES_TOTAL).increment(1);
                    tracing::debug!(%slot_id, attempt, "slot lock timed out, backing off");
                    tokio::time::sleep(self.lock_policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(_) => {
                    metrics::counter!(observability::SLOT_CONTENTION_TOTAL).increment(1);
                    tracing::warn!(%slot_id, attempts = attempt + 1, "giving up on slot lock");
                    return Err(EngineError::Contention(slot_id));
                }
            }
        }
    }

    /// Resolve a booking to its slot and lock that slot.
    pub(super) async fn lock_booking_slot(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot_id = self
            .bookings
            .slot_for(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        self.lock_slot(slot_id).await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Flush and stop the WAL writer. Mutations after shutdown fail with `WalError`.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer already stopped".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("engine shut down");
        Ok(())
    }
}
