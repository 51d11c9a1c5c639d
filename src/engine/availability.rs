use crate::model::*;

use super::conflict::occupied_spans;

// ── Booking calendar ──────────────────────────────────────────────

/// Free stretches of `window` on a resource: the window minus every active
/// reservation (padded by the resource's turnaround buffer), so any span
/// that fits inside a returned window can be booked.
pub fn free_windows(resource: &ResourceState, window: &Span) -> Vec<Span> {
    let occupied = merge_overlapping(&occupied_spans(resource, window));
    subtract_intervals(&[*window], &occupied)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Subtract sorted, disjoint `to_remove` spans from sorted `base` spans.
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

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const D: Ms = 86_400_000;
    const H: Ms = 3_600_000;

    fn van(buffer_after: Option<Ms>, bookings: &[(Ms, Ms, ReservationStatus)]) -> ResourceState {
        let id = Ulid::new();
        let mut rs = ResourceState::new(id, Some("Transit".into()), Some("cargo".into()), buffer_after);
        for &(start, end, status) in bookings {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                resource_id: id,
                span: Span::new(start, end),
                status,
                customer_name: None,
                customer_email: None,
                created_at: 0,
            });
        }
        rs
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(
            subtract_intervals(&base, &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&base, &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── free_windows ─────────────────────────────────────

    #[test]
    fn free_windows_empty_resource_is_whole_window() {
        let rs = van(None, &[]);
        let window = Span::new(0, 10 * D);
        assert_eq!(free_windows(&rs, &window), vec![window]);
    }

    #[test]
    fn free_windows_around_bookings() {
        let rs = van(
            None,
            &[
                (D, 3 * D, ReservationStatus::Confirmed),
                (5 * D, 6 * D, ReservationStatus::Pending),
            ],
        );
        assert_eq!(
            free_windows(&rs, &Span::new(0, 10 * D)),
            vec![Span::new(0, D), Span::new(3 * D, 5 * D), Span::new(6 * D, 10 * D)]
        );
    }

    #[test]
    fn free_windows_ignore_history() {
        let rs = van(
            None,
            &[
                (D, 3 * D, ReservationStatus::Cancelled),
                (4 * D, 5 * D, ReservationStatus::Completed),
            ],
        );
        let window = Span::new(0, 10 * D);
        assert_eq!(free_windows(&rs, &window), vec![window]);
    }

    #[test]
    fn free_windows_include_turnaround() {
        let rs = van(Some(4 * H), &[(D, 2 * D, ReservationStatus::Confirmed)]);
        assert_eq!(
            free_windows(&rs, &Span::new(0, 3 * D)),
            vec![Span::new(0, D - 4 * H), Span::new(2 * D + 4 * H, 3 * D)]
        );
    }

    #[test]
    fn free_windows_clip_booking_that_started_before_window() {
        let rs = van(None, &[(0, 2 * D, ReservationStatus::Confirmed)]);
        assert_eq!(
            free_windows(&rs, &Span::new(D, 4 * D)),
            vec![Span::new(2 * D, 4 * D)]
        );
    }
}
