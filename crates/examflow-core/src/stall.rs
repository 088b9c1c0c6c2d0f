//! Playback stall monitor.
//!
//! Watches the active audio resource. A stall with less than a second of
//! buffered audio ahead of the playhead shows a waiting indicator and arms a
//! grace deadline; if playback has not progressed when it passes, the
//! monitor blocks until an explicit reload succeeds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub const DEFAULT_BUFFER_THRESHOLD: Duration = Duration::from_secs(1);
pub const DEFAULT_STALL_GRACE: Duration = Duration::from_secs(5);

/// A buffered time range reported by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedRange {
    pub start: Duration,
    pub end: Duration,
}

/// Seconds of audio buffered past `position`.
pub fn buffered_ahead(position: Duration, ranges: &[BufferedRange]) -> Duration {
    ranges
        .iter()
        .filter(|r| r.start <= position && position <= r.end)
        .map(|r| r.end - position)
        .max()
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallState {
    Idle,
    Waiting {
        since: Instant,
        grace_deadline: Instant,
        position: Duration,
    },
    Blocked {
        position: Duration,
        reload_in_flight: bool,
    },
}

/// What changed as a result of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallSignal {
    Unchanged,
    /// A genuine stall began; show the waiting indicator.
    WaitingShown,
    /// Playback resumed inside the grace window.
    WaitingCleared,
    /// The grace window passed or the resource failed to load; block.
    Escalated,
}

#[derive(Debug, Clone)]
pub struct StallMonitor {
    state: StallState,
    threshold: Duration,
    grace: Duration,
    episodes: u32,
    escalations: u32,
}

impl Default for StallMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_THRESHOLD, DEFAULT_STALL_GRACE)
    }
}

impl StallMonitor {
    pub fn new(threshold: Duration, grace: Duration) -> Self {
        Self {
            state: StallState::Idle,
            threshold,
            grace,
            episodes: 0,
            escalations: 0,
        }
    }

    pub fn state(&self) -> StallState {
        self.state
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.state, StallState::Blocked { .. })
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, StallState::Waiting { .. })
    }

    /// Stall episodes seen since creation.
    pub fn episodes(&self) -> u32 {
        self.episodes
    }

    /// Times the monitor entered the blocked state.
    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            StallState::Waiting { grace_deadline, .. } => Some(grace_deadline),
            _ => None,
        }
    }

    pub fn on_stall(
        &mut self,
        now: Instant,
        position: Duration,
        buffered: &[BufferedRange],
    ) -> StallSignal {
        if self.state != StallState::Idle {
            return StallSignal::Unchanged;
        }

        let ahead = buffered_ahead(position, buffered);
        if ahead > self.threshold {
            tracing::debug!(?position, ?ahead, "stall signal with enough buffer, ignoring");
            return StallSignal::Unchanged;
        }

        self.episodes += 1;
        self.state = StallState::Waiting {
            since: now,
            grace_deadline: now + self.grace,
            position,
        };
        tracing::info!(?position, ?ahead, episode = self.episodes, "playback stalled");
        StallSignal::WaitingShown
    }

    /// Playback progressed. Clears a pending stall; a blocked monitor stays
    /// blocked until a reload succeeds.
    pub fn on_progress(&mut self, now: Instant) -> StallSignal {
        match self.state {
            StallState::Waiting { since, .. } => {
                tracing::info!(stalled_for = ?now.duration_since(since), "playback recovered");
                self.state = StallState::Idle;
                StallSignal::WaitingCleared
            }
            _ => StallSignal::Unchanged,
        }
    }

    /// Fire the grace deadline if it has passed.
    pub fn poll(&mut self, now: Instant) -> StallSignal {
        match self.state {
            StallState::Waiting {
                grace_deadline,
                position,
                ..
            } if now >= grace_deadline => {
                self.block(position);
                tracing::warn!(?position, "stall outlasted grace window, blocking playback");
                StallSignal::Escalated
            }
            _ => StallSignal::Unchanged,
        }
    }

    /// The resource could not be loaded at all.
    pub fn fail_load(&mut self, position: Duration) -> StallSignal {
        if self.is_blocked() {
            return StallSignal::Unchanged;
        }
        self.block(position);
        StallSignal::Escalated
    }

    fn block(&mut self, position: Duration) {
        self.escalations += 1;
        self.state = StallState::Blocked {
            position,
            reload_in_flight: false,
        };
    }

    /// Claim the reload action. Returns the position to resume from, or
    /// `None` when not blocked or a reload is already running.
    pub fn begin_reload(&mut self) -> Option<Duration> {
        match self.state {
            StallState::Blocked {
                position,
                reload_in_flight: false,
            } => {
                self.state = StallState::Blocked {
                    position,
                    reload_in_flight: true,
                };
                Some(position)
            }
            _ => None,
        }
    }

    /// Settle a reload. On success returns the resume position and goes
    /// idle; on failure stays blocked with the action re-enabled.
    pub fn finish_reload(&mut self, succeeded: bool) -> Option<Duration> {
        let StallState::Blocked { position, .. } = self.state else {
            return None;
        };
        if succeeded {
            self.state = StallState::Idle;
            Some(position)
        } else {
            self.state = StallState::Blocked {
                position,
                reload_in_flight: false,
            };
            None
        }
    }

    /// Forget any stall; used when the active resource changes.
    pub fn reset(&mut self) -> StallSignal {
        let was_waiting = self.is_waiting();
        self.state = StallState::Idle;
        if was_waiting {
            StallSignal::WaitingCleared
        } else {
            StallSignal::Unchanged
        }
    }
}
