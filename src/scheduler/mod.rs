//! Sync Scheduler: decides when the next cycle runs.
//!
//! [`SchedulerCore`] is a pure state machine driven with explicit instants;
//! the async driver in [`crate::instance`] feeds it signals and timers and
//! runs the cycles it hands out.

mod backoff;

pub use backoff::Backoff;

use crate::config::SyncConfig;
use crate::engine::CycleKind;
use crate::error::FailureClass;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A cycle is wanted once `due` has passed
    Pending { due: Instant },
    /// A cycle is in flight; `rerun` records changes that arrived meanwhile
    Running { rerun: bool },
}

#[derive(Debug)]
pub struct SchedulerCore {
    debounce: Duration,
    background_interval: Duration,
    phase: Phase,
    backoff: Backoff,
    /// End of the current retry backoff; edits never schedule a cycle before it
    retry_not_before: Option<Instant>,
    /// Set after a fatal failure; nothing runs until [`SchedulerCore::resume`]
    halted: bool,
    visible: bool,
    next_background: Instant,
}

impl SchedulerCore {
    pub fn new(config: &SyncConfig, now: Instant) -> Self {
        Self {
            debounce: config.debounce(),
            background_interval: config.background_interval(),
            phase: Phase::Idle,
            backoff: Backoff::new(&config.retry),
            retry_not_before: None,
            halted: false,
            visible: true,
            next_background: now + config.background_interval(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    /// A local edit or a "remote may have changed" signal. Restarts the
    /// debounce window, but never ends a retry backoff early.
    pub fn on_change(&mut self, now: Instant) {
        match &mut self.phase {
            Phase::Running { rerun } => *rerun = true,
            _ => {
                let debounced = now + self.debounce;
                let due = match self.retry_not_before {
                    Some(not_before) => debounced.max(not_before),
                    None => debounced,
                };
                self.phase = Phase::Pending { due };
            }
        }
    }

    /// Explicit request: run as soon as possible, skipping the debounce and
    /// any retry backoff.
    pub fn request(&mut self, now: Instant) {
        match &mut self.phase {
            Phase::Running { rerun } => *rerun = true,
            _ => self.phase = Phase::Pending { due: now },
        }
    }

    /// The instance was granted leadership. Pending markers left by siblings
    /// or a crashed leader may be waiting, so schedule a cycle.
    pub fn on_leadership_gained(&mut self, now: Instant) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Pending { due: now };
        }
    }

    /// A sibling leader finished a cycle. A non-leader with nothing left to
    /// push has nothing to wait for.
    pub fn on_sibling_synced(&mut self, now: Instant, tracker_empty: bool) {
        self.next_background = now + self.background_interval;
        if tracker_empty && matches!(self.phase, Phase::Pending { .. }) {
            debug!("[scheduler] sibling synced, nothing left pending");
            self.phase = Phase::Idle;
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Leave the halted state after a configuration change and retry now.
    pub fn resume(&mut self, now: Instant) {
        if self.halted {
            info!("[scheduler] resuming automatic sync");
        }
        self.halted = false;
        self.backoff.reset();
        self.retry_not_before = None;
        if !self.is_running() {
            self.phase = Phase::Pending { due: now };
        }
    }

    /// Hand out the next cycle if one should start at `now`.
    pub fn poll(&mut self, now: Instant, is_leader: bool) -> Option<CycleKind> {
        if self.halted || !is_leader {
            return None;
        }
        match self.phase {
            Phase::Pending { due } if due <= now => {
                self.phase = Phase::Running { rerun: false };
                Some(CycleKind::Full)
            }
            Phase::Idle if self.visible && self.next_background <= now => {
                self.phase = Phase::Running { rerun: false };
                Some(CycleKind::PullOnly)
            }
            _ => None,
        }
    }

    /// Record the end of the running cycle.
    pub fn on_cycle_finished(&mut self, now: Instant, failure: Option<FailureClass>) {
        let rerun = matches!(self.phase, Phase::Running { rerun: true });
        self.next_background = now + self.background_interval;

        match failure {
            None => {
                self.backoff.reset();
                self.retry_not_before = None;
                self.phase = if rerun {
                    Phase::Pending {
                        due: now + self.debounce,
                    }
                } else {
                    Phase::Idle
                };
            }
            Some(FailureClass::Fatal) => {
                warn!("[scheduler] fatal sync failure, automatic sync halted");
                self.halted = true;
                self.phase = Phase::Pending { due: now };
            }
            Some(class) => {
                let delay = self.backoff.next_delay();
                debug!("[scheduler] {:?} failure, retrying in {:?}", class, delay);
                self.retry_not_before = Some(now + delay);
                self.phase = Phase::Pending { due: now + delay };
            }
        }
    }

    /// Deadline the driver should wake up at, if any.
    pub fn next_wakeup(&self, is_leader: bool) -> Option<Instant> {
        if self.halted || !is_leader {
            return None;
        }
        match self.phase {
            Phase::Pending { due } => Some(due),
            Phase::Idle if self.visible => Some(self.next_background),
            _ => None,
        }
    }
}
