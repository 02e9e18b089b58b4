use crate::model::*;

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Sub-windows of `query` that `reserve` would accept: none unless the slot
/// is available, otherwise the gaps between pending/active bookings.
pub fn free_windows(state: &SlotState, query: &Span) -> Vec<Span> {
    if state.slot.status != SlotStatus::Available {
        return Vec::new();
    }
    let mut busy: Vec<Span> = state
        .live_overlapping(query)
        .map(|b| Span::new(b.span.start.max(query.start), b.span.end.min(query.end)))
        .collect();
    busy.sort_by_key(|s| s.start);

    let mut free = Vec::new();
    let mut cursor = query.start;
    for held in merge_overlapping(&busy) {
        if held.start > cursor {
            free.push(Span::new(cursor, held.start));
        }
        cursor = cursor.max(held.end);
    }
    if cursor < query.end {
        free.push(Span::new(cursor, query.end));
    }
    free
}
