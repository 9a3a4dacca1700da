//! Pressure Governor.
//!
//! Turns memory-pressure and lifecycle signals into a [`PressureResponse`]
//! the engine applies across admission, the stores and disk. The governor
//! itself only keeps the pressure window and the lifecycle state.

use std::time::Duration;

use feedmedia_model::Priority;
use tokio::time::Instant;

use crate::config::PressureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureLevel {
    Moderate,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Foregrounded,
    Backgrounded,
}

/// Actions for the engine to carry out, in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PressureResponse {
    /// Cancel every tracked request strictly below this priority.
    pub cancel_below: Option<Priority>,
    /// Drop completed-request bookkeeping. Retry records survive.
    pub clear_bookkeeping: bool,
    /// `release_partial` percentage for both memory stores; zero skips.
    pub release_percent: u8,
    /// Also shed the same share of the disk spillover.
    pub release_disk: bool,
    /// Re-run queue admission.
    pub drain_queue: bool,
    /// Reconcile live handles whose OS resources may have gone stale.
    pub reconcile_live: bool,
}

#[derive(Debug)]
pub struct PressureGovernor {
    cooldown: Duration,
    moderate_release_percent: u8,
    critical_release_percent: u8,
    level: Option<PressureLevel>,
    until: Option<Instant>,
    lifecycle: LifecycleState,
}

impl PressureGovernor {
    pub fn new(config: &PressureConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            moderate_release_percent: config.moderate_release_percent,
            critical_release_percent: config.critical_release_percent,
            level: None,
            until: None,
            lifecycle: LifecycleState::default(),
        }
    }

    pub fn level(&self) -> Option<PressureLevel> {
        self.level
    }

    pub fn is_under_pressure(&self) -> bool {
        self.level.is_some()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn on_pressure(
        &mut self,
        level: PressureLevel,
        now: Instant,
    ) -> PressureResponse {
        let level = self.level.map_or(level, |current| current.max(level));
        self.level = Some(level);
        self.until = Some(now + self.cooldown);

        let release_percent = match level {
            PressureLevel::Moderate => self.moderate_release_percent,
            PressureLevel::Critical => self.critical_release_percent,
        };
        tracing::info!(?level, release_percent, "memory pressure signalled");

        PressureResponse {
            cancel_below: Some(Priority::High),
            clear_bookkeeping: true,
            release_percent,
            release_disk: level == PressureLevel::Critical,
            ..PressureResponse::default()
        }
    }

    pub fn on_lifecycle(&mut self, state: LifecycleState) -> PressureResponse {
        let previous = std::mem::replace(&mut self.lifecycle, state);
        tracing::debug!(?previous, ?state, "lifecycle transition");
        match state {
            LifecycleState::Backgrounded => PressureResponse {
                cancel_below: Some(Priority::Normal),
                ..PressureResponse::default()
            },
            LifecycleState::Foregrounded => PressureResponse {
                drain_queue: true,
                reconcile_live: previous == LifecycleState::Backgrounded,
                ..PressureResponse::default()
            },
        }
    }

    /// Ends the pressure window once its cooldown has passed. Returns true
    /// on the transition back to normal.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.until {
            Some(until) if now >= until => {
                tracing::info!(level = ?self.level, "memory pressure lapsed");
                self.level = None;
                self.until = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.level = None;
        self.until = None;
    }
}
