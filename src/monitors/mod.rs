//! Monitors: periodic sampling of energy, frequency and idleness.
//!
//! [`MonitorManager`] composes the configured monitors, aligns their
//! sampling intervals with the provider polling period, and fuses their
//! readings for the control loop and the IPC `info` command.

pub mod energy;
pub mod freq;
pub mod idle;

pub use energy::{EnergyBackend, EnergyMonitor};
pub use freq::CpuFreqMonitor;
pub use idle::{IdleMonitor, IdleState};

use crate::config::Config;
use crate::error::Result;
use crate::mqtt::MqttRegistry;

/// Sensor adapter bundle the monitor constructors draw from.
#[derive(Debug, Clone)]
pub struct MonitorHw {
    pub powercap: crate::hw::Powercap,
    pub amdmsr: crate::hw::AmdMsr,
    pub nvidia: crate::hw::NvidiaSmi,
    pub ipmi: crate::hw::Ipmi,
    pub cpufreq: crate::hw::CpuFreq,
    pub cpuinfo: crate::hw::CpuInfo,
}

impl Default for MonitorHw {
    fn default() -> Self {
        Self {
            powercap: crate::hw::Powercap::new(),
            amdmsr: crate::hw::AmdMsr::new(),
            nvidia: crate::hw::NvidiaSmi::new(),
            ipmi: crate::hw::Ipmi::new(),
            cpufreq: crate::hw::CpuFreq::new(),
            cpuinfo: crate::hw::CpuInfo::new(),
        }
    }
}

/// Composition of all configured monitors.
pub struct MonitorManager {
    energy: Vec<EnergyMonitor>,
    freq: Option<CpuFreqMonitor>,
    idle: Option<IdleMonitor>,
}

impl MonitorManager {
    pub fn from_config(cfg: &Config, hw: &MonitorHw, mqtt: &mut MqttRegistry) -> Result<Self> {
        let energy = EnergyMonitor::from_config(cfg, hw, mqtt)?;
        let freq = CpuFreqMonitor::from_config(cfg, &hw.cpufreq)?;
        let idle = IdleMonitor::from_config(cfg)?;
        Ok(Self { energy, freq, idle })
    }

    pub fn new(
        energy: Vec<EnergyMonitor>,
        freq: Option<CpuFreqMonitor>,
        idle: Option<IdleMonitor>,
    ) -> Self {
        Self { energy, freq, idle }
    }

    pub fn info_string(&self) -> String {
        let mut parts = Vec::new();
        for m in &self.energy {
            parts.push(format!("{} (interval = {} sec)", m.label(), m.interval));
        }
        if let Some(f) = &self.freq {
            parts.push(format!("CpuFreqMonitor (interval = {} sec)", f.interval));
        }
        if let Some(i) = &self.idle {
            parts.push(format!("IdleMonitor (interval = {} sec)", i.interval));
        }
        if parts.is_empty() {
            "None".into()
        } else {
            parts.join(", ")
        }
    }

    fn intervals(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.energy.iter().map(|m| m.interval).collect();
        if let Some(f) = &self.freq {
            v.push(f.interval);
        }
        if let Some(i) = &self.idle {
            v.push(i.interval);
        }
        v
    }

    /// Align sampling with the provider period.
    ///
    /// The tick interval is the rounded `period / ceil(period / min)` reduced
    /// until it divides the period; every monitor interval is then snapped
    /// down to a multiple of it. Returns the tick interval.
    pub fn adjust_interval(&mut self, period: u64) -> u64 {
        let period = period.max(1);
        let min_interval = self.intervals().into_iter().min().unwrap_or(period).max(1);
        let ratio = period.div_ceil(min_interval);
        let mut sample = ((period as f64 / ratio as f64).round() as u64).clamp(1, period);
        while period % sample != 0 {
            sample -= 1;
        }
        let snap = |interval: &mut u64| {
            if *interval % sample != 0 {
                *interval = (sample * (*interval / sample)).max(sample);
            }
        };
        for m in &mut self.energy {
            snap(&mut m.interval);
        }
        if let Some(f) = &mut self.freq {
            snap(&mut f.interval);
        }
        if let Some(i) = &mut self.idle {
            snap(&mut i.interval);
        }
        sample
    }

    /// Run every monitor whose interval divides the logical duration.
    pub fn update(&mut self, duration: u64) {
        for m in &mut self.energy {
            if duration % m.interval == 0 {
                m.update();
            }
        }
        if let Some(f) = &mut self.freq {
            if duration % f.interval == 0 {
                f.update();
            }
        }
        if let Some(i) = &mut self.idle {
            if duration % i.interval == 0 {
                i.update();
            }
        }
    }

    pub fn reset_period(&mut self) {
        for m in &mut self.energy {
            m.reset_period();
        }
        if let Some(f) = &mut self.freq {
            f.reset_period();
        }
        if let Some(i) = &mut self.idle {
            i.reset_period();
        }
    }

    /// Reset everything, including totals-independent idle accumulation.
    /// Used after a resume so the sleep window is not billed.
    pub fn reset_after_wakeup(&mut self) {
        self.reset_period();
        if let Some(i) = &mut self.idle {
            i.reset();
        }
    }

    pub fn period_energy(&self) -> f64 {
        self.energy.iter().map(EnergyMonitor::period_energy).sum()
    }

    pub fn total_energy(&self) -> f64 {
        self.energy.iter().map(EnergyMonitor::total_energy).sum()
    }

    pub fn period_avg_power(&self) -> f64 {
        self.energy.iter().map(EnergyMonitor::period_avg_power).sum()
    }

    pub fn last_avg_power(&self) -> f64 {
        self.energy.iter().map(EnergyMonitor::last_avg_power).sum()
    }

    pub fn period_cpu_avg_freq(&self, unit: f64) -> Option<f64> {
        self.freq.as_ref().and_then(|f| f.period_avg_freq(unit))
    }

    pub fn period_idle(&self) -> Option<IdleState> {
        self.idle.as_ref().map(IdleMonitor::period_idle)
    }

    pub fn idle_monitor_mut(&mut self) -> Option<&mut IdleMonitor> {
        self.idle.as_mut()
    }

    pub fn idle_monitor(&self) -> Option<&IdleMonitor> {
        self.idle.as_ref()
    }

    /// Live counters for the IPC `info` command.
    pub fn stats(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut stats = serde_json::Map::new();
        if let Some(i) = &self.idle {
            stats.insert("State".into(), i.period_idle().to_string().into());
            stats.insert("LastState".into(), i.last_idle().to_string().into());
            stats.insert("MaxSessions".into(), i.max_sessions().into());
            stats.insert("MaxLoad".into(), i.max_load().into());
            stats.insert("LastLoad".into(), i.last_load().into());
            stats.insert("IdleDuration".into(), i.idle_duration().into());
        }
        stats
    }
}
