use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{Result, ServiceError};

/// A half-open time range `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub fn new(start: f64, end: f64) -> Self {
        Interval { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Compute the ordered keep-intervals that survive a cut list.
///
/// Given the source duration and a set of delete-intervals (unsorted,
/// possibly overlapping or nested), returns the ordered, disjoint ranges
/// covering the complement of the merged delete set within `[0, duration]`.
///
/// Pure and deterministic. A delete interval with `end < start` is clamped
/// to empty rather than rejected; a negative or non-finite duration is an
/// `InvalidInput` error.
pub fn plan_keep_intervals(duration: f64, deletes: &[Interval]) -> Result<Vec<Interval>> {
    if !duration.is_finite() || duration < 0.0 {
        return Err(ServiceError::InvalidInput(format!(
            "video duration must be a non-negative number, got {}",
            duration
        )));
    }
    if duration == 0.0 {
        return Ok(Vec::new());
    }
    if deletes.is_empty() {
        return Ok(vec![Interval::new(0.0, duration)]);
    }

    // Clamp malformed intervals (end < start) to empty, then sort by start
    // with ties broken by end. The sweep below only tracks the running
    // frontier, so the tie-break never changes the result.
    let mut sorted: Vec<Interval> = deletes
        .iter()
        .map(|iv| Interval::new(iv.start, iv.end.max(iv.start)))
        .collect();
    sorted.sort_by(|a, b| {
        a.start
            .partial_cmp(&b.start)
            .unwrap_or(Ordering::Equal)
            .then(a.end.partial_cmp(&b.end).unwrap_or(Ordering::Equal))
    });

    // Forward-only sweep: an interval fully contained in an earlier one
    // contributes nothing because the cursor never moves backward.
    let mut keep = Vec::new();
    let mut cursor = 0.0_f64;
    for iv in &sorted {
        if cursor < iv.start {
            keep.push(Interval::new(cursor, iv.start.min(duration)));
        }
        cursor = cursor.max(iv.end);
    }
    if cursor < duration {
        keep.push(Interval::new(cursor, duration));
    }

    keep.retain(|iv| iv.end > iv.start);
    Ok(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn iv(start: f64, end: f64) -> Interval {
        Interval::new(start, end)
    }

    #[test]
    fn test_overlapping_deletes_merge() {
        let keep =
            plan_keep_intervals(100.0, &[iv(10.0, 20.0), iv(15.0, 25.0), iv(80.0, 100.0)]).unwrap();
        assert_eq!(keep, vec![iv(0.0, 10.0), iv(25.0, 80.0)]);
    }

    #[test]
    fn test_empty_cut_list_keeps_everything() {
        let keep = plan_keep_intervals(42.5, &[]).unwrap();
        assert_eq!(keep, vec![iv(0.0, 42.5)]);
    }

    #[test]
    fn test_full_deletion_keeps_nothing() {
        let keep = plan_keep_intervals(60.0, &[iv(0.0, 60.0)]).unwrap();
        assert!(keep.is_empty());
    }

    #[test]
    fn test_nested_delete_contributes_nothing() {
        let keep = plan_keep_intervals(50.0, &[iv(5.0, 40.0), iv(10.0, 20.0)]).unwrap();
        assert_eq!(keep, vec![iv(0.0, 5.0), iv(40.0, 50.0)]);
    }

    #[test]
    fn test_inverted_interval_is_clamped_to_empty() {
        let keep = plan_keep_intervals(30.0, &[iv(20.0, 10.0)]).unwrap();
        assert_eq!(keep, vec![iv(0.0, 30.0)]);
    }

    #[test]
    fn test_delete_beyond_duration() {
        let keep = plan_keep_intervals(10.0, &[iv(8.0, 99.0)]).unwrap();
        assert_eq!(keep, vec![iv(0.0, 8.0)]);
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let err = plan_keep_intervals(-1.0, &[]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[test]
    fn test_zero_duration_keeps_nothing() {
        assert!(plan_keep_intervals(0.0, &[]).unwrap().is_empty());
    }

    fn arb_deletes() -> impl Strategy<Value = Vec<Interval>> {
        prop::collection::vec((0.0_f64..200.0, 0.0_f64..200.0), 0..12)
            .prop_map(|pairs| pairs.into_iter().map(|(s, e)| Interval::new(s, e)).collect())
    }

    proptest! {
        /// Output intervals are strictly ordered, pairwise disjoint, and
        /// confined to [0, duration].
        #[test]
        fn prop_keep_intervals_ordered_and_disjoint(
            duration in 0.1_f64..200.0,
            deletes in arb_deletes(),
        ) {
            let keep = plan_keep_intervals(duration, &deletes).unwrap();
            for w in keep.windows(2) {
                prop_assert!(w[0].end <= w[1].start);
            }
            for k in &keep {
                prop_assert!(k.end > k.start);
                prop_assert!(k.start >= 0.0);
                prop_assert!(k.end <= duration);
            }
        }

        /// No keep interval overlaps any (clamped) delete interval.
        #[test]
        fn prop_keep_intervals_avoid_deletes(
            duration in 0.1_f64..200.0,
            deletes in arb_deletes(),
        ) {
            let keep = plan_keep_intervals(duration, &deletes).unwrap();
            for k in &keep {
                for d in &deletes {
                    let d_end = d.end.max(d.start);
                    let overlap = k.start.max(d.start) < k.end.min(d_end);
                    prop_assert!(!overlap, "keep {:?} overlaps delete {:?}", k, d);
                }
            }
        }

        /// Total kept time equals the duration minus the merged delete
        /// coverage inside [0, duration].
        #[test]
        fn prop_kept_time_is_the_complement(
            duration in 0.1_f64..200.0,
            deletes in arb_deletes(),
        ) {
            let keep = plan_keep_intervals(duration, &deletes).unwrap();
            let kept: f64 = keep.iter().map(Interval::duration).sum();

            // Merged delete coverage clipped to [0, duration], computed the
            // slow way for comparison.
            let mut clipped: Vec<Interval> = deletes
                .iter()
                .map(|d| Interval::new(d.start.clamp(0.0, duration), d.end.max(d.start).clamp(0.0, duration)))
                .filter(|d| d.end > d.start)
                .collect();
            clipped.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());
            let mut deleted = 0.0_f64;
            let mut frontier = 0.0_f64;
            for d in &clipped {
                let s = d.start.max(frontier);
                if d.end > s {
                    deleted += d.end - s;
                    frontier = d.end;
                }
                frontier = frontier.max(d.end);
            }

            prop_assert!((kept - (duration - deleted)).abs() < 1e-6);
        }
    }
}
