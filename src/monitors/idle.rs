//! User-inactivity detection from login sessions and load average.

use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{EcoError, Result};
use crate::hw::{read_field, run_cmd};

/// Idle classification of one sample or period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdleState {
    /// Sessions present and the machine is busy.
    Active,
    /// Sessions present but load below the cutoff.
    Session,
    /// No sessions but load above the cutoff.
    Load,
    /// Neither sessions nor load.
    Idle,
}

impl std::fmt::Display for IdleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleState::Active => write!(f, "ACTIVE"),
            IdleState::Session => write!(f, "SESSION"),
            IdleState::Load => write!(f, "LOAD"),
            IdleState::Idle => write!(f, "IDLE"),
        }
    }
}

/// Samples `(active sessions, loadavg)` and accumulates idle time.
pub struct IdleMonitor {
    pub interval: u64,
    load_cutoff: f64,
    /// loadavg field: 1 = 1-minute, 2 = 5-minute, 3 = 15-minute.
    load_period: usize,
    loadavg_path: PathBuf,
    sessions_cmd: String,
    idle_duration: u64,
    last_sessions: u64,
    last_load: f64,
    max_sessions: u64,
    max_load: f64,
}

const LOADAVG_FILE: &str = "/proc/loadavg";

impl IdleMonitor {
    /// Present unless `[idle] IdleMonitor` disables it.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        let enabled = cfg.get("idle", "idlemonitor").unwrap_or("on");
        if crate::is_disabled(enabled) {
            return Ok(None);
        }
        let interval = cfg.get_u64("monitor", "interval")?.unwrap_or(5);
        let load_cutoff = cfg.get_f64("idle", "loadcutoff")?.unwrap_or(0.05);
        let load_period = cfg.get_u64("idle", "loadperiod")?.unwrap_or(1) as usize;
        if !(1..=3).contains(&load_period) {
            return Err(EcoError::Config(format!(
                "unknown load period: {} (expected 1, 2 or 3)",
                load_period
            )));
        }
        Ok(Some(Self::new(interval, load_cutoff, load_period)))
    }

    pub fn new(interval: u64, load_cutoff: f64, load_period: usize) -> Self {
        Self {
            interval,
            load_cutoff,
            load_period,
            loadavg_path: PathBuf::from(LOADAVG_FILE),
            sessions_cmd: "w".into(),
            idle_duration: 0,
            last_sessions: 0,
            last_load: 0.0,
            max_sessions: 0,
            max_load: 0.0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_loadavg<P: AsRef<std::path::Path>>(mut self, path: P, sessions_cmd: &str) -> Self {
        self.loadavg_path = path.as_ref().to_path_buf();
        self.sessions_cmd = sessions_cmd.into();
        self
    }

    fn active_sessions(&self) -> u64 {
        match run_cmd(&self.sessions_cmd, &["-h"]) {
            Some(out) => out.lines().filter(|l| !l.trim().is_empty()).count() as u64,
            None => {
                warn!("idle: session listing failed");
                0
            }
        }
    }

    fn active_load(&self) -> f64 {
        read_field(&self.loadavg_path, self.load_period - 1)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    }

    /// Classify a raw sample against the load cutoff.
    pub fn state_of(&self, sessions: u64, load: f64) -> IdleState {
        if sessions > 0 && load > self.load_cutoff {
            IdleState::Active
        } else if sessions > 0 {
            IdleState::Session
        } else if load > self.load_cutoff {
            IdleState::Load
        } else {
            IdleState::Idle
        }
    }

    pub fn update(&mut self) {
        let sessions = self.active_sessions();
        let load = self.active_load();
        self.observe(sessions, load);
    }

    /// Core accumulation step, split out from the sampling for tests.
    pub(crate) fn observe(&mut self, sessions: u64, load: f64) {
        self.last_sessions = sessions;
        self.last_load = load;
        self.max_sessions = self.max_sessions.max(sessions);
        self.max_load = self.max_load.max(load);
        if self.period_idle() == IdleState::Idle {
            self.idle_duration += self.interval;
        } else {
            self.idle_duration = 0;
        }
    }

    /// Period classification from the period maxima.
    pub fn period_idle(&self) -> IdleState {
        self.state_of(self.max_sessions, self.max_load)
    }

    /// Classification of the latest sample alone.
    pub fn last_idle(&self) -> IdleState {
        self.state_of(self.last_sessions, self.last_load)
    }

    pub fn idle_duration(&self) -> u64 {
        self.idle_duration
    }

    pub fn last_load(&self) -> f64 {
        self.last_load
    }

    pub fn max_sessions(&self) -> u64 {
        self.max_sessions
    }

    pub fn max_load(&self) -> f64 {
        self.max_load
    }

    pub fn reset_period(&mut self) {
        self.max_sessions = 0;
        self.max_load = 0.0;
    }

    /// Full reset, also clearing the accumulated idle time.
    pub fn reset(&mut self) {
        self.idle_duration = 0;
        self.last_sessions = 0;
        self.last_load = 0.0;
        self.reset_period();
    }
}
