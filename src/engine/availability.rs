use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Free intervals on one date: the operating window minus the merged union of occupants.
/// `window = None` (closed) yields nothing.
pub fn free_spans(window: Option<Span>, occupants: &[Occupant]) -> Vec<Span> {
    let Some(window) = window else {
        return Vec::new();
    };
    let mut occupied: Vec<Span> = occupants.iter().map(|o| o.span).collect();
    occupied.sort_by_key(|s| s.start);
    let occupied = merge_overlapping(&occupied);
    subtract_intervals(&[window], &occupied)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
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

/// `base` minus `to_remove`. Both must be sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Slice free intervals into `granularity`-minute cells on a grid anchored at `anchor`
/// (the opening time). A cell is emitted only if it fits entirely inside one free interval.
pub fn slice_slots(free: &[Span], anchor: TimeOfDay, granularity: u16) -> Vec<Span> {
    debug_assert!(granularity > 0);
    let step = granularity;
    let mut slots = Vec::new();
    for f in free {
        // First grid line at or after f.start.
        let offset = f.start.minutes().saturating_sub(anchor.minutes());
        let mut start = anchor.minutes() + offset.div_ceil(step) * step;
        while start + step <= f.end.minutes() {
            if let (Some(s), Some(e)) = (TimeOfDay::from_minutes(start), TimeOfDay::from_minutes(start + step)) {
                slots.push(Span::new(s, e));
            }
            start += step;
        }
    }
    slots
}
