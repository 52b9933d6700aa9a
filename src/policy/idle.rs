//! Idle policy: suspend-to-RAM after a sustained user-inactivity window.

use log::warn;

use crate::config::Config;
use crate::hw::{suspend, Suspend};
use crate::logger::EcoLogger;
use crate::monitors::IdleMonitor;

/// Suspends the machine once the idle monitor has accumulated more than
/// `SuspendAfter` seconds of uninterrupted idleness.
pub struct SuspendIdlePolicy {
    pub idle_timeout: u64,
    mode: String,
    hw: Suspend,
}

impl SuspendIdlePolicy {
    /// Built only when `[idle] SuspendAfter` is configured.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        cfg.get("idle", "suspendafter")?;
        let idle_timeout = cfg
            .get("idle", "suspendafter")
            .and_then(|v| v.parse().ok())
            .unwrap_or(600);
        let mode = cfg
            .get("idle", "suspendmode")
            .unwrap_or(suspend::S2RAM)
            .to_string();
        Some(Self {
            idle_timeout,
            mode,
            hw: Suspend::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_hw(idle_timeout: u64, mode: &str, hw: Suspend) -> Self {
        Self {
            idle_timeout,
            mode: mode.to_string(),
            hw,
        }
    }

    /// Fire the suspend when the idle window is exceeded. Logs the
    /// `SUSPEND` control line before sleeping; returns whether a suspend
    /// happened (the write blocks until resume).
    pub fn check_idle(&self, idlemon: &mut IdleMonitor, log: &mut EcoLogger) -> bool {
        if idlemon.idle_duration() > self.idle_timeout {
            idlemon.reset();
            log.print_cmd("suspend");
            if let Err(e) = self.hw.suspend(&self.mode) {
                warn!("suspend failed: {}", e);
            }
            true
        } else {
            false
        }
    }

    pub fn info_string(&self) -> String {
        format!("SuspendIdlePolicy (timeout = {} sec)", self.idle_timeout)
    }
}
