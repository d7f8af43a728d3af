//! Session timers - Deadlines polled by the orchestrator loop

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Extra minutes added on top of the restart interval
const RESTART_JITTER_MINUTES: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Re-read the current game's card count
    Progress,
    /// Reload the badge listing while batch idling
    BatchAdvance,
    /// Respawn processes that exited
    Watchdog,
    /// Restart idle processes so playtime registers
    Restart,
}

const ALL: [TimerKind; 4] = [
    TimerKind::Progress,
    TimerKind::BatchAdvance,
    TimerKind::Watchdog,
    TimerKind::Restart,
];

/// Armed deadlines, one slot per timer
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 4],
}

impl Timers {
    fn slot(kind: TimerKind) -> usize {
        match kind {
            TimerKind::Progress => 0,
            TimerKind::BatchAdvance => 1,
            TimerKind::Watchdog => 2,
            TimerKind::Restart => 3,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines[Self::slot(kind)] = Some(Instant::now() + after);
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        self.deadlines[Self::slot(kind)] = None;
    }

    pub fn disarm_all(&mut self) {
        self.deadlines = [None; 4];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[Self::slot(kind)].is_some()
    }

    /// The earliest armed deadline
    pub fn next_due(&self) -> Option<(TimerKind, Instant)> {
        ALL.iter()
            .filter_map(|&kind| self.deadlines[Self::slot(kind)].map(|at| (kind, at)))
            .min_by_key(|&(_, at)| at)
    }
}

/// Wait until `deadline`, or forever when nothing is armed
pub async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Restart interval: the configured minutes plus 0 to 9 random extra minutes
pub fn restart_interval(base_minutes: u32) -> Duration {
    let extra = rand::rng().random_range(0..=RESTART_JITTER_MINUTES);
    minutes(base_minutes.saturating_add(extra))
}

pub fn minutes(m: u32) -> Duration {
    Duration::from_secs(u64::from(m) * 60)
}
