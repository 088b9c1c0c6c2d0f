//! Timer service: per-phase clocks and the exactly-once expiry guard.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Fixed budget for the timed reading phase of an exam.
pub const READING_BUDGET: Duration = Duration::from_secs(75 * 60);

/// Time credited for the untimed, audio-paced listening phase.
pub const LISTENING_NOMINAL: Duration = Duration::from_secs(45 * 60);

/// Result of observing a countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTick {
    Running { remaining: Duration },
    /// Reached zero. Reported once per countdown.
    Expired,
    /// Already reported as expired.
    Spent,
}

#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    budget: Duration,
    started_at: Instant,
    expired: bool,
}

impl Countdown {
    pub fn start(budget: Duration, now: Instant) -> Self {
        Self {
            budget,
            started_at: now,
            expired: false,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.budget
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    pub fn tick(&mut self, now: Instant) -> TimerTick {
        if self.expired {
            return TimerTick::Spent;
        }
        let remaining = self.remaining(now);
        if remaining.is_zero() {
            self.expired = true;
            TimerTick::Expired
        } else {
            TimerTick::Running { remaining }
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }
}

/// Which phase a clock segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Listening,
    Reading,
    Practice,
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    /// Credited with a fixed duration regardless of wall time.
    Untimed { nominal: Duration },
    Countdown(Countdown),
    Stopwatch { started_at: Instant },
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    kind: SegmentKind,
    clock: Clock,
    stopped_at: Option<Instant>,
}

impl Segment {
    fn elapsed(&self, now: Instant) -> Duration {
        let at = self.stopped_at.unwrap_or(now);
        match self.clock {
            Clock::Untimed { nominal } => nominal,
            Clock::Countdown(c) => c.budget().saturating_sub(c.remaining(at)),
            Clock::Stopwatch { started_at } => at.saturating_duration_since(started_at),
        }
    }
}

/// Sequence of phase clocks. At most one is active at a time.
#[derive(Debug, Clone, Default)]
pub struct TimerService {
    segments: Vec<Segment>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: SegmentKind, clock: Clock, now: Instant) {
        self.stop(now);
        self.segments.push(Segment {
            kind,
            clock,
            stopped_at: None,
        });
    }

    pub fn start_untimed(&mut self, kind: SegmentKind, nominal: Duration, now: Instant) {
        self.push(kind, Clock::Untimed { nominal }, now);
    }

    pub fn start_countdown(&mut self, kind: SegmentKind, budget: Duration, now: Instant) {
        self.push(kind, Clock::Countdown(Countdown::start(budget, now)), now);
    }

    pub fn start_stopwatch(&mut self, kind: SegmentKind, now: Instant) {
        self.push(kind, Clock::Stopwatch { started_at: now }, now);
    }

    fn active_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut().filter(|s| s.stopped_at.is_none())
    }

    fn active(&self) -> Option<&Segment> {
        self.segments.last().filter(|s| s.stopped_at.is_none())
    }

    pub fn active_kind(&self) -> Option<SegmentKind> {
        self.active().map(|s| s.kind)
    }

    /// Freeze the active segment.
    pub fn stop(&mut self, now: Instant) {
        if let Some(segment) = self.active_mut() {
            segment.stopped_at = Some(now);
        }
    }

    /// Expiry deadline of the running countdown, if it has not fired yet.
    pub fn deadline(&self) -> Option<Instant> {
        match self.active()?.clock {
            Clock::Countdown(c) if !c.is_expired() => Some(c.deadline()),
            _ => None,
        }
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.active()?.clock {
            Clock::Countdown(c) => Some(c.remaining(now)),
            _ => None,
        }
    }

    /// Observe the running countdown. `None` when no countdown is active.
    pub fn tick(&mut self, now: Instant) -> Option<TimerTick> {
        match &mut self.active_mut()?.clock {
            Clock::Countdown(c) => Some(c.tick(now)),
            _ => None,
        }
    }

    /// Sum of time spent across every segment.
    pub fn total_elapsed(&self, now: Instant) -> Duration {
        self.segments.iter().map(|s| s.elapsed(now)).sum()
    }
}
