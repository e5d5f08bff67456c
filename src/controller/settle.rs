use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::snapshot::Snapshot;

/// Leading-edge debounce over whole snapshots.
///
/// A reading equal to `last_stable` restarts the window. Any other reading is
/// accepted once the window has been open for longer than `settle_duration`,
/// whether or not the differing readings agree with each other. A held stick
/// whose value jitters therefore still settles, while a blip shorter than the
/// window is dropped as soon as the stable value is seen again.
///
/// The window starts at construction, so the very first change can settle
/// sooner than `settle_duration` after it was first seen. Acceptance does not
/// restart the window either; the next reading equal to the new stable state
/// does.
#[derive(Debug)]
pub struct SettleDetector {
    settle_duration: Duration,
    last_stable: Snapshot,
    change_start: Instant,
}

impl SettleDetector {
    pub fn new(settle_duration: Duration) -> Self {
        Self::starting_at(settle_duration, Instant::now())
    }

    pub fn starting_at(settle_duration: Duration, start: Instant) -> Self {
        Self {
            settle_duration,
            last_stable: Snapshot::empty(),
            change_start: start,
        }
    }

    pub fn last_stable(&self) -> &Snapshot {
        &self.last_stable
    }

    pub fn settle_duration(&self) -> Duration {
        self.settle_duration
    }

    /// Feeds one reading taken at `now`.
    ///
    /// Returns `(previous_stable, accepted)` when the reading is accepted as
    /// the new stable state.
    pub fn observe(&mut self, incoming: Snapshot, now: Instant) -> Option<(Snapshot, Snapshot)> {
        if incoming == self.last_stable {
            self.change_start = now;
            return None;
        }

        let elapsed = now.saturating_duration_since(self.change_start);
        if elapsed <= self.settle_duration {
            trace!("Change pending for {:?}", elapsed);
            return None;
        }

        debug!("State settled after {:?}: {}", elapsed, incoming);
        let previous = std::mem::replace(&mut self.last_stable, incoming.clone());
        Some((previous, incoming))
    }
}
