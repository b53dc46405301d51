//! Time-scaled percept replay for DREAM cycles
//!
//! A dream's percepts are spread over the PERCEPTS window at offsets
//! proportional to where they fell in the original capture:
//!   offset_i = (t_i - t_first) / (t_last - t_first) * window

use mindcycle_core::{MindMoment, Percept};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledPercept {
    pub offset: Duration,
    pub percept: Percept,
}

/// Compute replay offsets. Unparseable timestamps are dropped; equal
/// timestamps keep their input order.
pub fn disperse(percepts: impl IntoIterator<Item = Percept>, window: Duration) -> Vec<ScheduledPercept> {
    let mut timed: Vec<_> = percepts
        .into_iter()
        .filter_map(|p| match p.parsed_timestamp() {
            Some(t) => Some((t, p)),
            None => {
                debug!("Dropping replay percept with bad timestamp {:?}", p.timestamp);
                None
            }
        })
        .collect();
    // sort_by_key is stable
    timed.sort_by_key(|(t, _)| *t);

    let (Some((first, _)), Some((last, _))) = (timed.first(), timed.last()) else {
        return Vec::new();
    };
    let span_ms = (*last - *first).num_milliseconds().max(0) as u128;
    let first = *first;
    let window_ms = window.as_millis();

    timed
        .into_iter()
        .map(|(t, percept)| {
            let offset_ms = if span_ms == 0 {
                0
            } else {
                let elapsed = (t - first).num_milliseconds().max(0) as u128;
                (elapsed * window_ms / span_ms).min(window_ms)
            };
            ScheduledPercept { offset: Duration::from_millis(offset_ms as u64), percept }
        })
        .collect()
}

/// Pending replay anchored at a PERCEPTS start.
#[derive(Debug)]
pub struct Dispersal {
    anchor: Instant,
    queue: VecDeque<ScheduledPercept>,
}

impl Dispersal {
    pub fn new(anchor: Instant, scheduled: Vec<ScheduledPercept>) -> Self {
        Self { anchor, queue: scheduled.into() }
    }

    /// Schedule a dream's visual and audio percepts over `window` from `anchor`.
    pub fn for_moment(moment: &MindMoment, anchor: Instant, window: Duration) -> Self {
        Self::new(anchor, disperse(moment.percepts().cloned(), window))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|s| self.anchor + s.offset)
    }

    /// Pop everything due at `now`, in schedule order.
    pub fn due(&mut self, now: Instant) -> Vec<Percept> {
        let mut out = Vec::new();
        while self.queue.front().is_some_and(|s| self.anchor + s.offset <= now) {
            if let Some(s) = self.queue.pop_front() {
                out.push(s.percept);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mindcycle_core::Modality;
    use serde_json::json;

    fn at(secs: i64, label: &str) -> Percept {
        Percept::new(
            Modality::Visual,
            json!(label),
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        )
    }

    fn offsets(s: &[ScheduledPercept]) -> Vec<u64> {
        s.iter().map(|p| p.offset.as_millis() as u64).collect()
    }

    #[test]
    fn linear_rescale_into_window() {
        let s = disperse(vec![at(0, "a"), at(10, "b"), at(40, "c")], Duration::from_secs(20));
        assert_eq!(offsets(&s), vec![0, 5_000, 20_000]);
    }

    #[test]
    fn sorted_by_timestamp_with_stable_ties() {
        let s = disperse(
            vec![at(30, "late"), at(0, "x"), at(0, "y"), at(15, "mid")],
            Duration::from_secs(30),
        );
        let labels: Vec<_> = s.iter().map(|p| p.percept.payload.clone()).collect();
        assert_eq!(labels, vec![json!("x"), json!("y"), json!("mid"), json!("late")]);
        assert_eq!(offsets(&s), vec![0, 0, 15_000, 30_000]);
    }

    #[test]
    fn single_percept_and_zero_span_go_at_zero() {
        assert_eq!(offsets(&disperse(vec![at(5, "solo")], Duration::from_secs(35))), vec![0]);
        assert_eq!(
            offsets(&disperse(vec![at(5, "a"), at(5, "b")], Duration::from_secs(35))),
            vec![0, 0]
        );
    }

    #[test]
    fn bad_timestamps_are_dropped() {
        let mut bad = at(0, "bad");
        bad.timestamp = "not a time".into();
        let s = disperse(vec![bad, at(0, "a"), at(2, "b")], Duration::from_secs(10));
        assert_eq!(s.len(), 2);
        assert_eq!(offsets(&s), vec![0, 10_000]);
        assert!(disperse(Vec::new(), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn due_pops_in_order() {
        let anchor = Instant::now();
        let mut d = Dispersal::new(
            anchor,
            disperse(vec![at(0, "a"), at(1, "b"), at(2, "c")], Duration::from_millis(200)),
        );
        assert_eq!(d.next_deadline(), Some(anchor));
        assert_eq!(d.due(anchor).len(), 1);
        assert_eq!(d.next_deadline(), Some(anchor + Duration::from_millis(100)));
        assert!(d.due(anchor + Duration::from_millis(99)).is_empty());
        assert_eq!(d.due(anchor + Duration::from_millis(500)).len(), 2);
        assert!(d.is_empty());
        assert_eq!(d.next_deadline(), None);
    }
}
