//! GPU scaling policies over the NVIDIA management CLI.

use log::warn;

use crate::config::Section;
use crate::error::{EcoError, Result};
use crate::governor::{Governor, Unit};
use crate::hw;
use crate::record::Signal;

use super::{governor_from_section, section_get, Domain, EcoPolicy, PolicyHw};

const POWER_UNITS: &[Unit] = &[Unit { name: "w", factor: 1.0 }];
const FREQ_UNITS: &[Unit] = &[
    Unit { name: "mhz", factor: 1.0 },
    Unit { name: "ghz", factor: 1e3 },
];

const WATT_UNIT: Unit = Unit { name: "w", factor: 1.0 };
const MHZ_UNIT: Unit = Unit { name: "mhz", factor: 1.0 };

/// Build the configured GPU policy; `auto` quietly yields `None` on
/// GPU-less hosts.
pub fn from_config(section: &Section, hw: &PolicyHw) -> Result<Option<Box<dyn EcoPolicy>>> {
    let control = section_get(section, "control").unwrap_or("auto");
    let control = control.to_ascii_lowercase();
    let control = if control == "auto" {
        if hw.nvidia.available() {
            "power".to_string()
        } else {
            return Ok(None);
        }
    } else {
        control
    };

    match control.as_str() {
        "power" => Ok(Some(Box::new(GpuPowerPolicy::new(section, hw.nvidia.clone())?))),
        "frequency" => Ok(Some(Box::new(GpuFreqPolicy::new(section, hw.nvidia.clone())?))),
        // cgroups do not cover GPUs; CPU-side scaling has to carry it
        "cgroup" => Ok(None),
        c if crate::is_disabled(c) => Ok(None),
        other => Err(EcoError::Config(format!("unknown policy: {}", other))),
    }
}

/// Caps the GPU board power limit.
pub struct GpuPowerPolicy {
    hw: hw::NvidiaSmi,
    governor: Option<Governor>,
    pub pmin: f64,
    pub pmax: f64,
    pub pstart: f64,
}

impl GpuPowerPolicy {
    pub fn new(section: &Section, hw: hw::NvidiaSmi) -> Result<Self> {
        let limits = hw
            .power_limit_all()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| EcoError::Unavailable("NVIDIA driver not found".into()))?;
        let (pmin, pmax, pstart) = limits[0];
        let governor = governor_from_section(section, pmin, pmax, POWER_UNITS)?;
        Ok(Self {
            hw,
            governor,
            pmin,
            pmax,
            pstart,
        })
    }

    fn set_power(&self, watts: i64) {
        if watts > 0 {
            if let Err(e) = self.hw.set_power_limit(watts as f64) {
                warn!("gpu power: failed to set limit: {}", e);
            }
        }
    }
}

impl EcoPolicy for GpuPowerPolicy {
    fn domain(&self) -> Domain {
        Domain::Gpu
    }

    fn set_signal(&mut self, signal: &Signal) {
        if let Some(watts) = self.governor.as_ref().and_then(|g| g.value(signal)) {
            self.set_power(watts);
        }
    }

    fn reset(&mut self) {
        self.set_power(self.pmax.round() as i64);
    }

    fn info_string(&self) -> String {
        let g = self
            .governor
            .as_ref()
            .map(|g| g.info_string(&WATT_UNIT))
            .unwrap_or_else(|| "None".into());
        format!("GpuPowerPolicy (governor = {})", g)
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("control".into(), "power".into());
        cfg.insert(
            "governor".into(),
            self.governor
                .as_ref()
                .map(|g| g.info_string(&WATT_UNIT))
                .unwrap_or_else(|| "none".into()),
        );
        cfg
    }
}

/// Caps the GPU graphics clock.
pub struct GpuFreqPolicy {
    hw: hw::NvidiaSmi,
    governor: Option<Governor>,
    pub fmin: f64,
    pub fmax: f64,
}

impl GpuFreqPolicy {
    pub fn new(section: &Section, hw: hw::NvidiaSmi) -> Result<Self> {
        let fmax = hw
            .hw_max_freq()
            .and_then(|f| f.first().copied())
            .ok_or_else(|| EcoError::Unavailable("NVIDIA driver not found".into()))?;
        let fmin = 0.3 * fmax;
        let governor = governor_from_section(section, fmin, fmax, FREQ_UNITS)?;
        Ok(Self {
            hw,
            governor,
            fmin,
            fmax,
        })
    }

    fn set_freq(&self, mhz: i64) {
        if mhz > 0 {
            if let Err(e) = self.hw.set_freq_limit(mhz as f64) {
                warn!("gpu freq: failed to set clock cap: {}", e);
            }
        }
    }
}

impl EcoPolicy for GpuFreqPolicy {
    fn domain(&self) -> Domain {
        Domain::Gpu
    }

    fn set_signal(&mut self, signal: &Signal) {
        if let Some(mhz) = self.governor.as_ref().and_then(|g| g.value(signal)) {
            self.set_freq(mhz);
        }
    }

    fn reset(&mut self) {
        if let Err(e) = self.hw.reset_freq_limit() {
            warn!("gpu freq: failed to reset clocks: {}", e);
        }
    }

    fn info_string(&self) -> String {
        let g = self
            .governor
            .as_ref()
            .map(|g| g.info_string(&MHZ_UNIT))
            .unwrap_or_else(|| "None".into());
        format!("GpuFreqPolicy (governor = {})", g)
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("control".into(), "frequency".into());
        cfg.insert(
            "governor".into(),
            self.governor
                .as_ref()
                .map(|g| g.info_string(&MHZ_UNIT))
                .unwrap_or_else(|| "none".into()),
        );
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::offline_hw;

    fn sec(pairs: &[(&str, &str)]) -> Section {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_auto_without_gpu_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let hw = offline_hw(dir.path());
        let section = sec(&[("control", "auto"), ("governor", "linear")]);
        assert!(from_config(&section, &hw).unwrap().is_none());
    }

    #[test]
    fn test_explicit_power_without_gpu_errors() {
        let dir = tempfile::tempdir().unwrap();
        let hw = offline_hw(dir.path());
        let section = sec(&[("control", "power"), ("governor", "linear")]);
        assert!(from_config(&section, &hw).is_err());
    }

    #[test]
    fn test_cgroup_control_is_cpu_only() {
        let dir = tempfile::tempdir().unwrap();
        let hw = offline_hw(dir.path());
        let section = sec(&[("control", "cgroup")]);
        assert!(from_config(&section, &hw).unwrap().is_none());
    }
}
