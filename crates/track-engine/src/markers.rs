//! Timecode-triggered callbacks for a playing track.
//!
//! Every marker ends in exactly one terminal [`MarkerState`] and its handler runs
//! at most once. Handlers are always invoked after the tracker lock is released,
//! so they may call back into the tracker.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Terminal state a marker handler is called with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerState {
    /// Playback crossed the timecode.
    Reached,
    /// A seek jumped over the timecode.
    Bypassed,
    /// The position was already past the timecode when the marker was armed.
    Late,
    /// Cleared explicitly or superseded by [`MarkerTracker::set`].
    Removed,
}

type Handler = Box<dyn FnOnce(MarkerState) + Send + 'static>;

pub struct TrackMarker {
    timecode_ms: u64,
    handler: Handler,
}

impl TrackMarker {
    pub fn new(timecode_ms: u64, handler: impl FnOnce(MarkerState) + Send + 'static) -> Self {
        Self {
            timecode_ms,
            handler: Box::new(handler),
        }
    }

    pub fn timecode_ms(&self) -> u64 {
        self.timecode_ms
    }

    fn fire(self, state: MarkerState) {
        tracing::debug!(timecode_ms = self.timecode_ms, ?state, "track marker fired");
        (self.handler)(state);
    }
}

/// Identifies an armed marker for [`MarkerTracker::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MarkerId(u64);

#[derive(Default)]
struct Armed {
    next_id: u64,
    markers: Vec<(MarkerId, TrackMarker)>,
}

#[derive(Default)]
pub struct MarkerTracker {
    armed: Mutex<Armed>,
}

impl MarkerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every armed marker with `marker`.
    ///
    /// Superseded markers fire [`MarkerState::Removed`] before the new one is
    /// armed. A marker at or behind `current_ms` fires [`MarkerState::Late`].
    pub fn set(&self, marker: Option<TrackMarker>, current_ms: u64) -> Option<MarkerId> {
        let removed = std::mem::take(&mut self.lock().markers);
        for (_, old) in removed {
            old.fire(MarkerState::Removed);
        }
        marker.and_then(|m| self.add(m, current_ms))
    }

    /// Arm `marker` next to the existing ones.
    pub fn add(&self, marker: TrackMarker, current_ms: u64) -> Option<MarkerId> {
        if marker.timecode_ms <= current_ms {
            marker.fire(MarkerState::Late);
            return None;
        }
        let mut armed = self.lock();
        armed.next_id += 1;
        let id = MarkerId(armed.next_id);
        armed.markers.push((id, marker));
        Some(id)
    }

    /// Disarm one marker, firing [`MarkerState::Removed`]. Returns whether it was armed.
    pub fn remove(&self, id: MarkerId) -> bool {
        let removed = {
            let mut armed = self.lock();
            let idx = armed.markers.iter().position(|(i, _)| *i == id);
            idx.map(|idx| armed.markers.remove(idx).1)
        };
        match removed {
            Some(marker) => {
                marker.fire(MarkerState::Removed);
                true
            }
            None => false,
        }
    }

    /// Disarm every marker, firing [`MarkerState::Removed`].
    pub fn clear(&self) {
        self.set(None, 0);
    }

    /// Playback advanced to `timecode_ms`.
    pub fn check_playback_timecode(&self, timecode_ms: u64) {
        self.fire_where(MarkerState::Reached, |m| m.timecode_ms <= timecode_ms);
    }

    /// A seek moved playback to `timecode_ms`. Markers jumped over or landed on
    /// are bypassed.
    pub fn check_seek_timecode(&self, timecode_ms: u64) {
        self.fire_where(MarkerState::Bypassed, |m| m.timecode_ms <= timecode_ms);
    }

    pub fn len(&self) -> usize {
        self.lock().markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fire_where(&self, state: MarkerState, due: impl Fn(&TrackMarker) -> bool) {
        let fired: Vec<TrackMarker> = {
            let mut armed = self.lock();
            if armed.markers.is_empty() {
                return;
            }
            let (ready, keep): (Vec<_>, Vec<_>) =
                std::mem::take(&mut armed.markers).into_iter().partition(|(_, m)| due(m));
            armed.markers = keep;
            ready.into_iter().map(|(_, m)| m).collect()
        };
        for marker in fired {
            marker.fire(state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Armed> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;

    fn recording(
        timecode_ms: u64,
        label: &'static str,
        tx: &mpsc::Sender<(&'static str, MarkerState)>,
    ) -> TrackMarker {
        let tx = tx.clone();
        TrackMarker::new(timecode_ms, move |state| {
            let _ = tx.send((label, state));
        })
    }

    #[test]
    fn marker_fires_once_when_reached() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        tracker.add(recording(1_000, "a", &tx), 0);
        tracker.check_playback_timecode(980);
        assert!(rx.try_recv().is_err());
        tracker.check_playback_timecode(1_000);
        tracker.check_playback_timecode(1_020);
        assert_eq!(rx.try_recv().unwrap(), ("a", MarkerState::Reached));
        assert!(rx.try_recv().is_err());
        assert!(tracker.is_empty());
    }

    #[test]
    fn set_removes_previous_markers_before_arming() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        tracker.add(recording(500, "a", &tx), 0);
        tracker.add(recording(600, "b", &tx), 0);
        tracker.set(Some(recording(700, "c", &tx)), 0);

        let mut removed: Vec<_> = rx.try_iter().collect();
        removed.sort_by_key(|(label, _)| *label);
        assert_eq!(
            removed,
            vec![("a", MarkerState::Removed), ("b", MarkerState::Removed)]
        );
        assert_eq!(tracker.len(), 1);

        tracker.check_playback_timecode(700);
        assert_eq!(rx.try_recv().unwrap(), ("c", MarkerState::Reached));
    }

    #[test]
    fn seek_past_marker_bypasses_it() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        tracker.add(recording(1_000, "a", &tx), 0);
        tracker.add(recording(9_000, "b", &tx), 0);
        tracker.check_seek_timecode(5_000);
        assert_eq!(rx.try_recv().unwrap(), ("a", MarkerState::Bypassed));
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn marker_behind_position_is_late() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        assert!(tracker.add(recording(100, "a", &tx), 200).is_none());
        assert_eq!(rx.try_recv().unwrap(), ("a", MarkerState::Late));
        assert!(tracker.is_empty());
    }

    #[test]
    fn marker_at_position_is_late() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        assert!(tracker.add(recording(200, "a", &tx), 200).is_none());
        assert!(tracker.set(Some(recording(300, "b", &tx)), 300).is_none());
        assert_eq!(rx.try_recv().unwrap(), ("a", MarkerState::Late));
        assert_eq!(rx.try_recv().unwrap(), ("b", MarkerState::Late));
        assert!(tracker.is_empty());
    }

    #[test]
    fn seek_onto_marker_bypasses_it() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        tracker.add(recording(5_000, "a", &tx), 0);
        tracker.add(recording(5_001, "b", &tx), 0);
        tracker.check_seek_timecode(5_000);
        assert_eq!(rx.try_recv().unwrap(), ("a", MarkerState::Bypassed));
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn remove_fires_removed_once() {
        let (tx, rx) = mpsc::channel();
        let tracker = MarkerTracker::new();
        let id = tracker.add(recording(100, "a", &tx), 0).unwrap();
        assert!(tracker.remove(id));
        assert!(!tracker.remove(id));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn handler_may_rearm_from_callback() {
        let tracker = Arc::new(MarkerTracker::new());
        let inner = tracker.clone();
        tracker.add(
            TrackMarker::new(100, move |_| {
                inner.add(TrackMarker::new(200, |_| {}), 100);
            }),
            0,
        );
        tracker.check_playback_timecode(100);
        assert_eq!(tracker.len(), 1);
    }
}
