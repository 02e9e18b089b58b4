use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::pricing::HourlyRates;

const H: Ms = HOUR_MS;
/// 2025-06-15T15:06:40Z
const T: Ms = 1_750_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn rates() -> HourlyRates {
    HourlyRates {
        two_wheeler: 10,
        four_wheeler: 20,
        bus: 50,
    }
}

fn engine_at(path: PathBuf) -> Engine {
    Engine::new(
        path,
        EngineOptions {
            pricing: Arc::new(rates()),
            lock: LockPolicy::default(),
        },
    )
    .unwrap()
}

fn spec(location: Location, class: VehicleClass, n: u32) -> SlotSpec {
    SlotSpec {
        id: Ulid::new(),
        location,
        slot_number: crate::inventory::slot_number(location, class, n),
        vehicle_class: class,
        coordinates: Coordinates { x: 0, y: n as i32 },
    }
}

async fn four_wheeler_slot(engine: &Engine) -> Ulid {
    let n = engine.slots.len() as u32 + 1;
    engine
        .provision_slot(spec(Location::AdminBlock, VehicleClass::FourWheeler, n))
        .await
        .unwrap()
        .id
}

fn request(user: &str, slot_id: Ulid, start: Ms, hours: u32) -> ReservationRequest {
    ReservationRequest {
        id: Ulid::new(),
        user: user.into(),
        slot_id,
        vehicle_class: VehicleClass::FourWheeler,
        start,
        duration_hours: hours,
        vehicle_number: None,
    }
}

// ── Pure checker ─────────────────────────────────────────

fn state_with(bookings: &[(Ms, Ms, BookingStatus)]) -> SlotState {
    let mut state = SlotState::new(Slot {
        id: Ulid::new(),
        location: Location::Tiffac,
        slot_number: "tiffac-four-wheeler-1".into(),
        vehicle_class: VehicleClass::FourWheeler,
        status: SlotStatus::Available,
        current_booking: None,
        coordinates: Coordinates::default(),
        last_updated: 0,
    });
    for &(start, end, status) in bookings {
        state.insert_booking(Booking {
            id: Ulid::new(),
            user: "u".into(),
            slot_id: state.slot.id,
            vehicle_class: VehicleClass::FourWheeler,
            vehicle_number: None,
            span: Span::new(start, end),
            duration_hours: ((end - start) / H) as u32,
            status,
            total_amount: 0,
            created_at: 0,
        });
    }
    state
}

#[test]
fn empty_slot_has_no_conflict() {
    let state = state_with(&[]);
    assert_eq!(find_conflict(&state, &Span::new(T, T + H)), None);
}

#[test]
fn touching_windows_do_not_conflict() {
    let state = state_with(&[(T, T + 2 * H, BookingStatus::Pending)]);
    assert_eq!(find_conflict(&state, &Span::new(T + 2 * H, T + 3 * H)), None);
    assert_eq!(find_conflict(&state, &Span::new(T - H, T)), None);
    assert!(find_conflict(&state, &Span::new(T + 2 * H - 1, T + 3 * H)).is_some());
}

#[test]
fn only_live_bookings_conflict() {
    let state = state_with(&[
        (T, T + H, BookingStatus::Cancelled),
        (T + H, T + 2 * H, BookingStatus::Completed),
    ]);
    assert_eq!(find_conflict(&state, &Span::new(T, T + 2 * H)), None);

    let state = state_with(&[(T, T + H, BookingStatus::Active)]);
    assert!(find_conflict(&state, &Span::new(T, T + 2 * H)).is_some());
}

#[test]
fn free_windows_between_bookings() {
    let state = state_with(&[
        (T + H, T + 2 * H, BookingStatus::Pending),
        (T + 2 * H, T + 3 * H, BookingStatus::Active),
        (T + 4 * H, T + 5 * H, BookingStatus::Cancelled),
    ]);
    let free = free_windows(&state, &Span::new(T, T + 6 * H));
    assert_eq!(free, vec![Span::new(T, T + H), Span::new(T + 3 * H, T + 6 * H)]);
}

#[test]
fn free_windows_clamps_to_query() {
    let state = state_with(&[(T, T + 4 * H, BookingStatus::Pending)]);
    assert!(free_windows(&state, &Span::new(T + H, T + 2 * H)).is_empty());
    assert_eq!(
        free_windows(&state, &Span::new(T + 3 * H, T + 5 * H)),
        vec![Span::new(T + 4 * H, T + 5 * H)]
    );
}

#[test]
fn unavailable_slot_has_no_free_windows() {
    let mut state = state_with(&[(T, T + H, BookingStatus::Pending)]);
    for status in [SlotStatus::Reserved, SlotStatus::Occupied, SlotStatus::Maintenance] {
        state.slot.status = status;
        assert!(free_windows(&state, &Span::new(T, T + 4 * H)).is_empty());
    }
}

#[test]
fn merge_joins_adjacent_spans() {
    let merged = merge_overlapping(&[Span::new(0, 10), Span::new(10, 20), Span::new(30, 40)]);
    assert_eq!(merged, vec![Span::new(0, 20), Span::new(30, 40)]);
}

// ── Reserve ──────────────────────────────────────────────

#[tokio::test]
async fn reserve_cancel_reserve_scenario() {
    let engine = engine_at(test_wal_path("scenario.wal"));
    let s1 = four_wheeler_slot(&engine).await;

    let b1 = engine.reserve(request("u1", s1, T, 2)).await.unwrap();
    assert_eq!(b1.status, BookingStatus::Pending);
    assert_eq!(b1.span, Span::new(T, T + 2 * H));
    assert_eq!(b1.total_amount, 2 * rates().four_wheeler);
    let slot = engine.get_slot(s1).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Reserved);
    assert_eq!(slot.current_booking, Some(b1.id));

    let err = engine.reserve(request("u2", s1, T + H, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::TimeConflict(id) if id == b1.id));

    let cancelled = engine.cancel("u1", b1.id, false).await.unwrap();
    assert!(cancelled.slot_released);
    assert_eq!(cancelled.booking.status, BookingStatus::Cancelled);
    assert_eq!(
        engine.get_slot(s1).await.unwrap().status,
        SlotStatus::Available
    );

    let b2 = engine.reserve(request("u2", s1, T + H, 1)).await.unwrap();
    assert_eq!(b2.user, "u2");
    assert_eq!(
        engine.get_slot(s1).await.unwrap().current_booking,
        Some(b2.id)
    );
}

#[tokio::test]
async fn reserve_unknown_slot_not_found() {
    let engine = engine_at(test_wal_path("unknown_slot.wal"));
    let missing = Ulid::new();
    let err = engine.reserve(request("u1", missing, T, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn reserve_maintenance_slot_unavailable() {
    let engine = engine_at(test_wal_path("maintenance.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    engine
        .set_slot_status(slot_id, SlotStatus::Maintenance)
        .await
        .unwrap();

    let err = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotUnavailable {
            status: SlotStatus::Maintenance,
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn reserved_slot_rejects_non_overlapping_request() {
    let engine = engine_at(test_wal_path("reserved_guard.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    let err = engine
        .reserve(request("u2", slot_id, T + 10 * H, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotUnavailable {
            status: SlotStatus::Reserved,
            ..
        }
    ));
}

#[tokio::test]
async fn reserve_wrong_class_mismatch() {
    let engine = engine_at(test_wal_path("class_mismatch.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let mut req = request("u1", slot_id, T, 1);
    req.vehicle_class = VehicleClass::Bus;

    let err = engine.reserve(req).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::VehicleClassMismatch {
            slot_class: VehicleClass::FourWheeler,
            requested: VehicleClass::Bus,
        }
    ));
    assert_eq!(
        engine.get_slot(slot_id).await.unwrap().status,
        SlotStatus::Available
    );
}

#[tokio::test]
async fn reserve_zero_hours_invalid() {
    let engine = engine_at(test_wal_path("zero_hours.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let err = engine.reserve(request("u1", slot_id, T, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval(_)));
    assert!(engine.bookings.is_empty());
}

#[tokio::test]
async fn reserve_limits() {
    let engine = engine_at(test_wal_path("reserve_limits.wal"));
    let slot_id = four_wheeler_slot(&engine).await;

    let err = engine
        .reserve(request("u1", slot_id, T, crate::limits::MAX_BOOKING_HOURS + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let err = engine.reserve(request("u1", slot_id, 0, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let mut req = request("u1", slot_id, T, 1);
    req.vehicle_number = Some("X".repeat(crate::limits::MAX_VEHICLE_NUMBER_LEN + 1));
    assert!(matches!(
        engine.reserve(req).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let engine = engine_at(test_wal_path("dup_booking.wal"));
    let a = four_wheeler_slot(&engine).await;
    let b = four_wheeler_slot(&engine).await;
    let first = engine.reserve(request("u1", a, T, 1)).await.unwrap();

    let mut again = request("u1", b, T, 1);
    again.id = first.id;
    let err = engine.reserve(again).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == first.id));
    assert_eq!(
        engine.get_slot(b).await.unwrap().status,
        SlotStatus::Available
    );
}

#[tokio::test]
async fn retried_reserve_reports_already_exists() {
    let engine = engine_at(test_wal_path("retry_booking.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let req = request("u1", slot_id, T, 2);
    let first = engine.reserve(req.clone()).await.unwrap();

    let err = engine.reserve(req).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == first.id));
    assert_eq!(engine.bookings_for_slot(slot_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_booking_id_commits_on_one_slot_only() {
    let engine = Arc::new(engine_at(test_wal_path("shared_id.wal")));

    for _ in 0..16 {
        let a = four_wheeler_slot(&engine).await;
        let b = four_wheeler_slot(&engine).await;
        let id = Ulid::new();

        let mut handles = Vec::new();
        for slot_id in [a, b] {
            let eng = engine.clone();
            let mut req = request("u1", slot_id, T, 1);
            req.id = id;
            handles.push(tokio::spawn(async move { eng.reserve(req).await }));
        }
        let mut committed = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(booking) => {
                    assert_eq!(booking.id, id);
                    committed += 1;
                }
                Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(committed, 1);

        engine.cancel("admin", id, true).await.unwrap();
        for slot_id in [a, b] {
            let slot = engine.get_slot(slot_id).await.unwrap();
            assert_eq!(slot.status, SlotStatus::Available);
            assert_eq!(slot.current_booking, None);
        }
    }
}

#[tokio::test]
async fn touching_reservations_on_reopened_slot() {
    let engine = engine_at(test_wal_path("touching.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let first = engine.reserve(request("u1", slot_id, T, 2)).await.unwrap();

    // Reopen the slot; the first booking stays pending and keeps its window.
    engine
        .set_slot_status(slot_id, SlotStatus::Available)
        .await
        .unwrap();
    let err = engine
        .reserve(request("u2", slot_id, T + H, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TimeConflict(id) if id == first.id));

    let second = engine
        .reserve(request("u2", slot_id, T + 2 * H, 1))
        .await
        .unwrap();
    assert_eq!(second.span.start, first.span.end);
    assert_eq!(
        engine.get_booking(first.id).await.unwrap().status,
        BookingStatus::Pending
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_exactly_one_wins() {
    let engine = Arc::new(Engine::new(
        test_wal_path("concurrent.wal"),
        EngineOptions {
            pricing: Arc::new(rates()),
            lock: LockPolicy {
                timeout: Duration::from_secs(5),
                retries: 5,
                backoff_base: Duration::from_millis(5),
            },
        },
    )
    .unwrap());
    let slot_id = four_wheeler_slot(&engine).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.reserve(request(&format!("u{i}"), slot_id, T, 2)).await
        }));
    }

    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(b) => winners.push(b),
            Err(EngineError::TimeConflict(_)) | Err(EngineError::SlotUnavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let slot = engine.get_slot(slot_id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Reserved);
    assert_eq!(slot.current_booking, Some(winners[0].id));
    assert_eq!(engine.bookings_for_slot(slot_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_slots_book_independently() {
    let engine = Arc::new(engine_at(test_wal_path("independent.wal")));
    let mut slots = Vec::new();
    for _ in 0..8 {
        slots.push(four_wheeler_slot(&engine).await);
    }

    let mut handles = Vec::new();
    for (i, slot_id) in slots.iter().copied().enumerate() {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.reserve(request(&format!("u{i}"), slot_id, T, 1)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    for slot_id in slots {
        assert_eq!(
            engine.get_slot(slot_id).await.unwrap().status,
            SlotStatus::Reserved
        );
    }
}

#[tokio::test]
async fn held_slot_lock_reports_contention() {
    let engine = Engine::new(
        test_wal_path("contention.wal"),
        EngineOptions {
            pricing: Arc::new(rates()),
            lock: LockPolicy {
                timeout: Duration::from_millis(10),
                retries: 1,
                backoff_base: Duration::from_millis(1),
            },
        },
    )
    .unwrap();
    let slot_id = four_wheeler_slot(&engine).await;

    let guard = engine.get_slot_state(&slot_id).unwrap().write_owned().await;
    let err = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::Contention(id) if id == slot_id));
    assert!(err.is_retryable());
    drop(guard);

    engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();
}

// ── Cancel ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_unknown_booking_not_found() {
    let engine = engine_at(test_wal_path("cancel_unknown.wal"));
    let err = engine.cancel("u1", Ulid::new(), false).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn cancel_requires_owner_unless_privileged() {
    let engine = engine_at(test_wal_path("cancel_owner.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    let err = engine.cancel("u2", b.id, false).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable(id) if id == b.id));
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().status,
        BookingStatus::Pending
    );

    let c = engine.cancel("admin", b.id, true).await.unwrap();
    assert_eq!(c.booking.status, BookingStatus::Cancelled);
    assert!(c.slot_released);
}

#[tokio::test]
async fn cancel_twice_not_cancellable() {
    let engine = engine_at(test_wal_path("cancel_twice.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();
    engine.cancel("u1", b.id, false).await.unwrap();

    let err = engine.cancel("u1", b.id, false).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable(_)));
}

#[tokio::test]
async fn cancel_completed_not_cancellable() {
    let engine = engine_at(test_wal_path("cancel_completed.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();
    engine.advance_state(b.id, BookingStatus::Active).await.unwrap();
    engine
        .advance_state(b.id, BookingStatus::Completed)
        .await
        .unwrap();

    let err = engine.cancel("u1", b.id, false).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable(_)));
}

#[tokio::test]
async fn stale_cancel_leaves_new_occupant() {
    let engine = engine_at(test_wal_path("stale_cancel.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let old = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    // Override frees the slot, someone else takes a later window.
    engine
        .set_slot_status(slot_id, SlotStatus::Available)
        .await
        .unwrap();
    let new = engine
        .reserve(request("u2", slot_id, T + 5 * H, 1))
        .await
        .unwrap();

    let c = engine.cancel("u1", old.id, false).await.unwrap();
    assert!(!c.slot_released);
    let slot = engine.get_slot(slot_id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Reserved);
    assert_eq!(slot.current_booking, Some(new.id));
}

// ── Override and lifecycle ───────────────────────────────

#[tokio::test]
async fn override_to_maintenance_clears_booking_reference() {
    let engine = engine_at(test_wal_path("override_maintenance.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    let slot = engine
        .set_slot_status(slot_id, SlotStatus::Maintenance)
        .await
        .unwrap();
    assert_eq!(slot.status, SlotStatus::Maintenance);
    assert_eq!(slot.current_booking, None);
    // The orphaned booking keeps its status.
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().status,
        BookingStatus::Pending
    );
}

#[tokio::test]
async fn override_to_occupied_keeps_reference() {
    let engine = engine_at(test_wal_path("override_occupied.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    let slot = engine
        .set_slot_status(slot_id, SlotStatus::Occupied)
        .await
        .unwrap();
    assert_eq!(slot.current_booking, Some(b.id));
}

#[tokio::test]
async fn override_unknown_slot_not_found() {
    let engine = engine_at(test_wal_path("override_unknown.wal"));
    assert!(matches!(
        engine.set_slot_status(Ulid::new(), SlotStatus::Available).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn advance_moves_slot_through_lifecycle() {
    let engine = engine_at(test_wal_path("advance.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    let active = engine.advance_state(b.id, BookingStatus::Active).await.unwrap();
    assert_eq!(active.status, BookingStatus::Active);
    assert_eq!(
        engine.get_slot(slot_id).await.unwrap().status,
        SlotStatus::Occupied
    );

    let done = engine
        .advance_state(b.id, BookingStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    let slot = engine.get_slot(slot_id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Available);
    assert_eq!(slot.current_booking, None);
}

#[tokio::test]
async fn advance_rejects_illegal_transitions() {
    let engine = engine_at(test_wal_path("advance_illegal.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();

    let err = engine
        .advance_state(b.id, BookingStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Pending,
            to: BookingStatus::Completed,
        }
    ));
    assert!(matches!(
        engine.advance_state(b.id, BookingStatus::Pending).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.advance_state(Ulid::new(), BookingStatus::Active).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn advance_orphaned_booking_leaves_slot_alone() {
    let engine = engine_at(test_wal_path("advance_orphan.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();
    engine
        .set_slot_status(slot_id, SlotStatus::Maintenance)
        .await
        .unwrap();

    engine.advance_state(b.id, BookingStatus::Active).await.unwrap();
    assert_eq!(
        engine.get_slot(slot_id).await.unwrap().status,
        SlotStatus::Maintenance
    );
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn has_conflict_checks_window() {
    let engine = engine_at(test_wal_path("has_conflict.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    engine.reserve(request("u1", slot_id, T, 2)).await.unwrap();

    assert!(engine.has_conflict(slot_id, T + H, T + 3 * H).await.unwrap());
    assert!(!engine.has_conflict(slot_id, T + 2 * H, T + 3 * H).await.unwrap());
    assert!(matches!(
        engine.has_conflict(slot_id, T, T).await,
        Err(EngineError::InvalidInterval(_))
    ));
    assert!(matches!(
        engine.has_conflict(Ulid::new(), T, T + H).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn slot_free_windows_and_conflicts() {
    let engine = engine_at(test_wal_path("free_windows.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    let b = engine.reserve(request("u1", slot_id, T + H, 1)).await.unwrap();

    // Reserved slots refuse every request, so nothing is reported free.
    let free = engine
        .slot_free_windows(slot_id, T, T + 3 * H)
        .await
        .unwrap();
    assert!(free.is_empty());
    assert!(matches!(
        engine.reserve(request("u2", slot_id, T, 1)).await,
        Err(EngineError::SlotUnavailable { .. })
    ));

    engine
        .set_slot_status(slot_id, SlotStatus::Available)
        .await
        .unwrap();
    let free = engine
        .slot_free_windows(slot_id, T, T + 3 * H)
        .await
        .unwrap();
    assert_eq!(free, vec![Span::new(T, T + H), Span::new(T + 2 * H, T + 3 * H)]);
    for window in &free {
        let hours = ((window.end - window.start) / H) as u32;
        engine
            .reserve(request("u2", slot_id, window.start, hours))
            .await
            .unwrap();
        engine
            .set_slot_status(slot_id, SlotStatus::Available)
            .await
            .unwrap();
    }

    let hits = engine.conflicts(slot_id, T, T + 3 * H).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, b.id);
}

#[tokio::test]
async fn list_and_filter_slots() {
    let engine = engine_at(test_wal_path("list_slots.wal"));
    engine
        .provision_inventory(crate::inventory::campus_layout())
        .await
        .unwrap();

    assert_eq!(engine.list_slots(&SlotFilter::default()).await.len(), 195);
    let tiffac_cars = engine
        .available_slots(Location::Tiffac, VehicleClass::FourWheeler)
        .await;
    assert_eq!(tiffac_cars.len(), 5);
    assert_eq!(tiffac_cars[0].slot_number, "tiffac-four-wheeler-1");
    assert_eq!(tiffac_cars[4].slot_number, "tiffac-four-wheeler-5");

    // Seeding twice is a no-op.
    let again = engine
        .provision_inventory(crate::inventory::campus_layout())
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn provision_duplicate_number_rejected() {
    let engine = engine_at(test_wal_path("dup_number.wal"));
    let first = engine
        .provision_slot(spec(Location::Tiffac, VehicleClass::Bus, 1))
        .await
        .unwrap();
    let err = engine
        .provision_slot(spec(Location::Tiffac, VehicleClass::Bus, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == first.id));

    // Same number at another location is fine.
    let mut other = spec(Location::Tiffac, VehicleClass::Bus, 1);
    other.location = Location::Polytechnic;
    engine.provision_slot(other).await.unwrap();
    assert_eq!(engine.slots.len(), 2);
}

#[tokio::test]
async fn user_history_newest_first() {
    let engine = engine_at(test_wal_path("history.wal"));
    let a = four_wheeler_slot(&engine).await;
    let b = four_wheeler_slot(&engine).await;
    let first = engine.reserve(request("u1", a, T, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = engine.reserve(request("u1", b, T, 1)).await.unwrap();
    engine.reserve(request("u2", four_wheeler_slot(&engine).await, T, 1)).await.unwrap();

    let history = engine.bookings_for_user("u1").await;
    let ids: Vec<_> = history.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(engine.bookings_for_user("nobody").await.is_empty());
    assert_eq!(engine.all_bookings().await.len(), 3);
}

// ── Statistics ───────────────────────────────────────────

#[tokio::test]
async fn statistics_on_empty_engine() {
    let engine = engine_at(test_wal_path("stats_empty.wal"));
    assert!(engine.booking_statistics(0, Ms::MAX).await.unwrap().is_empty());
    assert!(engine.occupancy().await.is_empty());
}

#[tokio::test]
async fn booking_statistics_group_by_day_and_status() {
    let engine = engine_at(test_wal_path("stats_bookings.wal"));
    let a = four_wheeler_slot(&engine).await;
    let b = four_wheeler_slot(&engine).await;
    let kept = engine.reserve(request("u1", a, T, 2)).await.unwrap();
    let dropped = engine.reserve(request("u1", b, T, 3)).await.unwrap();
    engine.cancel("u1", dropped.id, false).await.unwrap();

    let stats = engine.booking_statistics(0, Ms::MAX).await.unwrap();
    assert_eq!(stats.len(), 1);
    let day = &stats[0];
    assert_eq!(
        day.day,
        chrono::DateTime::from_timestamp_millis(kept.created_at)
            .unwrap()
            .date_naive()
    );
    assert_eq!(
        day.statuses,
        vec![
            BookingStatusTotals {
                status: BookingStatus::Pending,
                count: 1,
                total_amount: 2 * rates().four_wheeler,
            },
            BookingStatusTotals {
                status: BookingStatus::Cancelled,
                count: 1,
                total_amount: 3 * rates().four_wheeler,
            },
        ]
    );

    // Range before any booking was created.
    assert!(engine.booking_statistics(0, 1).await.unwrap().is_empty());
    assert!(matches!(
        engine.booking_statistics(10, 5).await,
        Err(EngineError::InvalidInterval(_))
    ));
}

#[tokio::test]
async fn occupancy_groups_by_location_class_status() {
    let engine = engine_at(test_wal_path("stats_occupancy.wal"));
    engine
        .provision_slot(spec(Location::Tiffac, VehicleClass::TwoWheeler, 1))
        .await
        .unwrap();
    engine
        .provision_slot(spec(Location::Tiffac, VehicleClass::TwoWheeler, 2))
        .await
        .unwrap();
    let bus = engine
        .provision_slot(spec(Location::EleventhBlock, VehicleClass::Bus, 1))
        .await
        .unwrap();
    engine
        .set_slot_status(bus.id, SlotStatus::Maintenance)
        .await
        .unwrap();

    let occupancy = engine.occupancy().await;
    assert_eq!(
        occupancy,
        vec![
            LocationOccupancy {
                location: Location::Tiffac,
                classes: vec![ClassOccupancy {
                    vehicle_class: VehicleClass::TwoWheeler,
                    statuses: vec![StatusTotal {
                        status: SlotStatus::Available,
                        count: 2
                    }],
                }],
            },
            LocationOccupancy {
                location: Location::EleventhBlock,
                classes: vec![ClassOccupancy {
                    vehicle_class: VehicleClass::Bus,
                    statuses: vec![StatusTotal {
                        status: SlotStatus::Maintenance,
                        count: 1
                    }],
                }],
            },
        ]
    );
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (slot_id, kept, cancelled) = {
        let engine = engine_at(path.clone());
        let slot_id = four_wheeler_slot(&engine).await;
        let cancelled = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap();
        engine.cancel("u1", cancelled.id, false).await.unwrap();
        let kept = engine
            .reserve(request("u2", slot_id, T + 4 * H, 2))
            .await
            .unwrap();
        engine.advance_state(kept.id, BookingStatus::Active).await.unwrap();
        engine.shutdown().await.unwrap();
        (slot_id, kept, cancelled)
    };

    let engine = engine_at(path);
    let slot = engine.get_slot(slot_id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Occupied);
    assert_eq!(slot.current_booking, Some(kept.id));

    let restored = engine.get_booking(kept.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Active);
    assert_eq!(restored.span, kept.span);
    assert_eq!(restored.total_amount, kept.total_amount);
    assert_eq!(restored.created_at, kept.created_at);
    assert_eq!(
        engine.get_booking(cancelled.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(engine.bookings_for_user("u2").await.len(), 1);

    // The number index is rebuilt too.
    assert_eq!(
        engine.slots.id_for_number(slot.location, &slot.slot_number),
        Some(slot_id)
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let (slot_id, booking_id) = {
        let engine = engine_at(path.clone());
        let slot_id = four_wheeler_slot(&engine).await;
        let mut last = None;
        for i in 0..5 {
            let b = engine
                .reserve(request("u1", slot_id, T + i * 3 * H, 1))
                .await
                .unwrap();
            if i < 4 {
                engine.cancel("u1", b.id, false).await.unwrap();
            }
            last = Some(b.id);
        }
        engine.set_slot_status(slot_id, SlotStatus::Occupied).await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        engine.shutdown().await.unwrap();
        (slot_id, last.unwrap())
    };

    let engine = engine_at(path);
    let slot = engine.get_slot(slot_id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Occupied);
    assert_eq!(slot.current_booking, Some(booking_id));
    let bookings = engine.bookings_for_slot(slot_id).await.unwrap();
    assert_eq!(bookings.len(), 5);
    assert_eq!(
        bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Cancelled)
            .count(),
        4
    );
}

#[tokio::test]
async fn mutations_fail_after_shutdown() {
    let engine = engine_at(test_wal_path("after_shutdown.wal"));
    let slot_id = four_wheeler_slot(&engine).await;
    engine.shutdown().await.unwrap();

    let err = engine.reserve(request("u1", slot_id, T, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::WalError(_)));
    // Nothing was applied.
    assert_eq!(
        engine.get_slot(slot_id).await.unwrap().status,
        SlotStatus::Available
    );
    assert!(engine.bookings.is_empty());
}
