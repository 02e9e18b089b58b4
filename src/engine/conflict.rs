use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn check_timestamps(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Window for a booking of `duration_hours` starting at `start`.
pub(crate) fn booking_window(start: Ms, duration_hours: u32) -> Result<Span, EngineError> {
    if duration_hours < 1 {
        return Err(EngineError::InvalidInterval("duration must be at least one hour"));
    }
    if duration_hours > MAX_BOOKING_HOURS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    let span = Span::from_hours(start, duration_hours)
        .ok_or(EngineError::InvalidInterval("end time overflows"))?;
    check_timestamps(&span)?;
    Ok(span)
}

/// Window for a read-only query over `[start, end)`.
pub(crate) fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// First pending/active booking on this slot whose window overlaps `span`.
pub fn find_conflict(state: &SlotState, span: &Span) -> Option<Ulid> {
    state.live_overlapping(span).map(|b| b.id).next()
}
