//! CPU scaling policies: frequency cap, package power cap, cgroup quota and
//! Docker container quota.

use log::warn;

use crate::config::Section;
use crate::error::{EcoError, Result};
use crate::governor::{Governor, Unit};
use crate::hw;
use crate::record::Signal;

use super::{governor_from_section, section_get, Domain, EcoPolicy, PolicyHw};

const FREQ_UNITS: &[Unit] = &[
    Unit { name: "mhz", factor: 1e3 },
    Unit { name: "ghz", factor: 1e6 },
];
const POWER_UNITS: &[Unit] = &[Unit { name: "w", factor: 1.0 }];
const QUOTA_UNITS: &[Unit] = &[Unit { name: "c", factor: 1.0 }];

const MHZ_UNIT: Unit = Unit { name: "mhz", factor: 1e3 };
const WATT_UNIT: Unit = Unit { name: "w", factor: 1.0 };
const CORE_UNIT: Unit = Unit { name: "c", factor: 1.0 };

/// Build the configured CPU policy, or `None` when scaling is disabled.
pub fn from_config(section: &Section, hw: &PolicyHw) -> Result<Option<Box<dyn EcoPolicy>>> {
    let control = section_get(section, "control").unwrap_or("auto");
    let control = control.to_ascii_lowercase();
    let control = if control == "auto" {
        if hw.powercap.available(false) && hw.powercap.enabled("0") {
            "power".to_string()
        } else if hw.esmi.available() && hw.esmi.enabled() {
            "power".to_string()
        } else if hw.cpufreq.available() {
            "frequency".to_string()
        } else {
            return Err(EcoError::Unavailable(
                "power management interface not found".into(),
            ));
        }
    } else {
        control
    };

    match control.as_str() {
        "power" => Ok(Some(Box::new(CpuPowerPolicy::new(section, hw)?))),
        "frequency" => Ok(Some(Box::new(CpuFreqPolicy::new(section, hw.cpufreq.clone())?))),
        "cgroup" => Ok(Some(Box::new(CpuCgroupPolicy::new(section, hw)?))),
        "docker" => Ok(Some(Box::new(CpuDockerPolicy::new(section, hw)?))),
        c if crate::is_disabled(c) => Ok(None),
        other => Err(EcoError::Config(format!("unknown policy: {}", other))),
    }
}

/// Caps `scaling_max_freq` across all CPUs.
pub struct CpuFreqPolicy {
    hw: hw::CpuFreq,
    governor: Option<Governor>,
    pub fmin: f64,
    pub fmax: f64,
    pub fstart: Option<f64>,
}

impl CpuFreqPolicy {
    pub fn new(section: &Section, hw: hw::CpuFreq) -> Result<Self> {
        if !hw.available() {
            return Err(EcoError::Unavailable(
                "CPU frequency scaling driver not found".into(),
            ));
        }
        let fmin = hw
            .hw_min_freq(0, hw::cpufreq::KHZ)
            .ok_or_else(|| EcoError::Unavailable("cpuinfo_min_freq".into()))?;
        let fmax = hw
            .hw_max_freq(0, hw::cpufreq::KHZ)
            .ok_or_else(|| EcoError::Unavailable("cpuinfo_max_freq".into()))?;
        let fstart = hw.gov_max_freq(0, hw::cpufreq::KHZ);
        let governor = governor_from_section(section, fmin, fmax, FREQ_UNITS)?;
        Ok(Self {
            hw,
            governor,
            fmin,
            fmax,
            fstart,
        })
    }

    fn set_freq(&self, freq_khz: i64) {
        if freq_khz > 0 {
            if let Err(e) = self.hw.set_gov_max_freq(freq_khz as u64) {
                warn!("cpufreq: failed to set max frequency: {}", e);
            }
        }
    }
}

impl EcoPolicy for CpuFreqPolicy {
    fn domain(&self) -> Domain {
        Domain::Cpu
    }

    fn set_signal(&mut self, signal: &Signal) {
        if let Some(freq) = self.governor.as_ref().and_then(|g| g.value(signal)) {
            self.set_freq(freq);
        }
    }

    fn reset(&mut self) {
        self.set_freq(self.fmax as i64);
    }

    fn info_string(&self) -> String {
        let g = self
            .governor
            .as_ref()
            .map(|g| g.info_string(&MHZ_UNIT))
            .unwrap_or_else(|| "None".into());
        format!("CpuFreqPolicy (governor = {})", g)
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

/// Package power control plane: ESMI when present, RAPL powercap otherwise.
enum PowerCtl {
    Esmi { esmi: hw::AmdEsmi, sockets: usize },
    Rapl(hw::Powercap),
}

impl PowerCtl {
    fn set_power_limit(&self, watts: f64) -> Result<()> {
        match self {
            PowerCtl::Esmi { esmi, sockets } => esmi.set_power_limit(watts, *sockets),
            PowerCtl::Rapl(pc) => pc.set_power_limit(watts, hw::powercap::WATT),
        }
    }
}

/// Caps the CPU package power limit.
pub struct CpuPowerPolicy {
    ctl: PowerCtl,
    governor: Option<Governor>,
    pub pmin: f64,
    pub pmax: f64,
    pub pstart: Option<f64>,
}

impl CpuPowerPolicy {
    pub fn new(section: &Section, hw: &PolicyHw) -> Result<Self> {
        let (ctl, pmax, pstart) = if hw.esmi.available() {
            let pmax = hw
                .esmi
                .package_hw_max_power(0)
                .ok_or_else(|| EcoError::Unavailable("ESMI power limit".into()))?;
            let pstart = hw.esmi.package_power_limit(0);
            let sockets = hw.cpuinfo.sockets();
            (PowerCtl::Esmi { esmi: hw.esmi.clone(), sockets }, pmax, pstart)
        } else {
            if !hw.powercap.available(false) {
                return Err(EcoError::Unavailable("RAPL powercap driver not found".into()));
            }
            if !hw.powercap.enabled("0") {
                return Err(EcoError::Unavailable(
                    "RAPL driver found, but powercap is disabled".into(),
                ));
            }
            let pmax = hw
                .powercap
                .package_hw_max_power("0", hw::powercap::WATT)
                .ok_or_else(|| EcoError::Unavailable("RAPL hw max power".into()))?;
            let pstart = hw.powercap.package_power_limit("0", hw::powercap::WATT);
            (PowerCtl::Rapl(hw.powercap.clone()), pmax, pstart)
        };
        let pmin = 0.1 * pmax;
        let governor = governor_from_section(section, pmin, pmax, POWER_UNITS)?;
        Ok(Self {
            ctl,
            governor,
            pmin,
            pmax,
            pstart,
        })
    }

    fn set_power(&self, watts: i64) {
        if watts > 0 {
            if let Err(e) = self.ctl.set_power_limit(watts as f64) {
                warn!("cpu power: failed to set limit: {}", e);
            }
        }
    }
}

impl EcoPolicy for CpuPowerPolicy {
    fn domain(&self) -> Domain {
        Domain::Cpu
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
        format!("CpuPowerPolicy (governor = {})", g)
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

/// Throttles a cgroup's CPU quota, optionally freezing it at the minimum.
pub struct CpuCgroupPolicy {
    pub(crate) cg: hw::Cgroup,
    grp: String,
    use_freeze: bool,
    governor: Option<Governor>,
    pub qmin: f64,
    pub qmax: f64,
    pub qstart: Option<f64>,
}

impl CpuCgroupPolicy {
    pub fn new(section: &Section, hw: &PolicyHw) -> Result<Self> {
        let grp = section_get(section, "cgroup").unwrap_or("user.slice").to_string();
        let cg = hw::Cgroup::detect(&hw.cgroup_root, &grp).ok_or_else(|| {
            EcoError::Unavailable(format!(
                "cgroup not found or cpu controller disabled: {}",
                grp
            ))
        })?;
        let use_freeze = section_get(section, "cgroupfreeze")
            .map(crate::parse_bool)
            .unwrap_or(true)
            && cg.enabled("freezer", &grp);
        let ncores = hw.cpuinfo.cores() as f64;
        let qstart = cg.cpu_quota(&grp, ncores).ok();
        let governor = governor_from_section(section, 0.0, ncores, QUOTA_UNITS)?;
        Ok(Self {
            cg,
            grp,
            use_freeze,
            governor,
            qmin: 0.0,
            qmax: ncores,
            qstart,
        })
    }

    fn set_quota(&self, quota: i64) {
        if self.use_freeze {
            if quota as f64 == self.qmin {
                if let Err(e) = self.cg.freeze(&self.grp) {
                    warn!("cgroup: freeze failed: {}", e);
                }
                return;
            }
            if let Err(e) = self.cg.unfreeze(&self.grp) {
                warn!("cgroup: unfreeze failed: {}", e);
            }
        }
        if quota > 0 {
            if let Err(e) = self.cg.set_cpu_quota(&self.grp, quota as f64, None) {
                warn!("cgroup: failed to set quota: {}", e);
            }
        }
    }
}

impl EcoPolicy for CpuCgroupPolicy {
    fn domain(&self) -> Domain {
        Domain::Cpu
    }

    fn set_signal(&mut self, signal: &Signal) {
        if let Some(quota) = self.governor.as_ref().and_then(|g| g.value(signal)) {
            self.set_quota(quota);
        }
    }

    fn reset(&mut self) {
        self.set_quota(self.qmax as i64);
    }

    fn info_string(&self) -> String {
        let g = self
            .governor
            .as_ref()
            .map(|g| g.info_string(&CORE_UNIT))
            .unwrap_or_else(|| "None".into());
        format!("CpuCgroupPolicy (cgroup = {}, governor = {})", self.grp, g)
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("control".into(), "cgroup".into());
        cfg.insert("cgroup".into(), self.grp.clone());
        cfg.insert(
            "governor".into(),
            self.governor
                .as_ref()
                .map(|g| g.info_string(&CORE_UNIT))
                .unwrap_or_else(|| "none".into()),
        );
        cfg
    }
}

/// Throttles running Docker containers via `--cpus`, optionally pausing
/// them at the minimum quota.
pub struct CpuDockerPolicy {
    docker: hw::DockerCli,
    ctrs: Vec<String>,
    use_freeze: bool,
    governor: Option<Governor>,
    pub qmin: f64,
    pub qmax: f64,
}

/// Docker's `--cpus 0` means "no limit".
const UNLIMITED: f64 = 0.0;

impl CpuDockerPolicy {
    pub fn new(section: &Section, hw: &PolicyHw) -> Result<Self> {
        if !hw.docker.available() {
            return Err(EcoError::Unavailable("docker not found".into()));
        }
        let ctrs: Vec<String> = section_get(section, "containers")
            .map(|s| s.split(',').map(|c| c.trim().to_string()).collect())
            .unwrap_or_default();
        let use_freeze = section_get(section, "cgroupfreeze")
            .map(crate::parse_bool)
            .unwrap_or(false);
        let qmax = match section_get(section, "maxcpus") {
            Some(v) => v
                .parse()
                .map_err(|_| EcoError::Config(format!("bad maxcpus: {}", v)))?,
            None => hw.cpuinfo.cores() as f64,
        };
        let governor = governor_from_section(section, 0.0, qmax, QUOTA_UNITS)?;
        Ok(Self {
            docker: hw.docker.clone(),
            ctrs,
            use_freeze,
            governor,
            qmin: 0.0,
            qmax,
        })
    }

    fn set_quota(&self, quota: f64) {
        if self.use_freeze {
            if quota == self.qmin {
                if let Err(e) = self.docker.set_pause(&self.ctrs, true) {
                    warn!("docker: pause failed: {}", e);
                }
                return;
            }
            if let Err(e) = self.docker.set_pause(&self.ctrs, false) {
                warn!("docker: unpause failed: {}", e);
            }
        }
        if let Err(e) = self.docker.set_container_cpus(&self.ctrs, quota) {
            warn!("docker: failed to set cpus: {}", e);
        }
    }
}

impl EcoPolicy for CpuDockerPolicy {
    fn domain(&self) -> Domain {
        Domain::Cpu
    }

    fn set_signal(&mut self, signal: &Signal) {
        if let Some(quota) = self.governor.as_ref().and_then(|g| g.value(signal)) {
            if quota > 0 {
                self.set_quota(quota as f64);
            } else if self.use_freeze {
                self.set_quota(self.qmin);
            }
        }
    }

    fn reset(&mut self) {
        // restore the no-limit setpoint
        if self.use_freeze {
            if let Err(e) = self.docker.set_pause(&self.ctrs, false) {
                warn!("docker: unpause failed: {}", e);
            }
        }
        if let Err(e) = self.docker.set_container_cpus(&self.ctrs, UNLIMITED) {
            warn!("docker: failed to reset cpus: {}", e);
        }
    }

    fn info_string(&self) -> String {
        let g = self
            .governor
            .as_ref()
            .map(|g| g.info_string(&CORE_UNIT))
            .unwrap_or_else(|| "None".into());
        let ctrs = if self.ctrs.is_empty() {
            "all".to_string()
        } else {
            self.ctrs.join(",")
        };
        format!("CpuDockerPolicy (containers = {}, governor = {})", ctrs, g)
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("control".into(), "docker".into());
        cfg.insert(
            "governor".into(),
            self.governor
                .as_ref()
                .map(|g| g.info_string(&CORE_UNIT))
                .unwrap_or_else(|| "none".into()),
        );
        if !self.ctrs.is_empty() {
            cfg.insert("containers".into(), self.ctrs.join(","));
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::cpufreq::tests::fake_cpufreq;
    use crate::hw::powercap::tests::fake_powercap;
    use crate::policy::tests::offline_hw;

    fn sec(pairs: &[(&str, &str)]) -> Section {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_freq_policy_applies_governor() {
        let dir = tempfile::tempdir().unwrap();
        let hw = fake_cpufreq(dir.path(), 2, &[2_000_000, 2_000_000]);
        let section = sec(&[("governor", "linear:100=max:800=min")]);
        let mut pol = CpuFreqPolicy::new(&section, hw.clone()).unwrap();
        pol.set_signal(&Signal::Num(450.0));
        assert_eq!(hw.gov_max_freq(0, hw::cpufreq::KHZ), Some(2_400_000.0));
        assert_eq!(hw.gov_max_freq(1, hw::cpufreq::KHZ), Some(2_400_000.0));
    }

    #[test]
    fn test_freq_policy_reset_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let hw = fake_cpufreq(dir.path(), 1, &[2_000_000]);
        let section = sec(&[("governor", "linear:100=max:800=min")]);
        let mut pol = CpuFreqPolicy::new(&section, hw.clone()).unwrap();
        pol.set_signal(&Signal::Num(800.0));
        pol.reset();
        let after_first = hw.gov_max_freq(0, hw::cpufreq::KHZ);
        pol.reset();
        assert_eq!(hw.gov_max_freq(0, hw::cpufreq::KHZ), after_first);
        assert_eq!(after_first, Some(4_000_000.0));
        // a subsequent signal overwrites the reset value
        pol.set_signal(&Signal::Num(800.0));
        assert_eq!(hw.gov_max_freq(0, hw::cpufreq::KHZ), Some(800_000.0));
    }

    #[test]
    fn test_freq_policy_requires_driver() {
        let dir = tempfile::tempdir().unwrap();
        let hw = hw::CpuFreq::with_root(dir.path());
        let section = sec(&[("governor", "linear")]);
        assert!(matches!(
            CpuFreqPolicy::new(&section, hw),
            Err(EcoError::Unavailable(_))
        ));
    }

    #[test]
    fn test_power_policy_range_from_rapl() {
        let dir = tempfile::tempdir().unwrap();
        let mut hw = offline_hw(dir.path());
        hw.powercap = fake_powercap(&dir.path().join("powercap"));
        let section = sec(&[("governor", "linear:100=max:800=min")]);
        let mut pol = CpuPowerPolicy::new(&section, &hw).unwrap();
        assert_eq!(pol.pmax, 125.0);
        assert_eq!(pol.pmin, 12.5);
        pol.set_signal(&Signal::Num(800.0));
        // governor minimum is pmin, applied through the powercap path
        assert_eq!(
            hw.powercap.package_power_limit("0", hw::powercap::WATT),
            Some(12.5)
        );
        pol.reset();
        assert_eq!(
            hw.powercap.package_power_limit("0", hw::powercap::WATT),
            Some(125.0)
        );
    }

    #[test]
    fn test_power_policy_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let hw = offline_hw(dir.path());
        let section = sec(&[("governor", "linear")]);
        assert!(CpuPowerPolicy::new(&section, &hw).is_err());
    }

    #[test]
    fn test_cgroup_policy_quota_and_freeze() {
        let dir = tempfile::tempdir().unwrap();
        let mut hw = offline_hw(dir.path());
        crate::hw::cgroup::tests::fake_v2(&dir.path().join("cgroup"), "user.slice");
        let section = sec(&[
            ("governor", "step:500=min:200=max"),
            ("cgroup", "user.slice"),
            ("cgroupfreeze", "on"),
        ]);
        hw.cgroup_root = dir.path().join("cgroup");
        let mut pol = CpuCgroupPolicy::new(&section, &hw).unwrap();
        // core-count fallback comes from num_cpus on offline lscpu; quota
        // range still starts at zero
        assert_eq!(pol.qmin, 0.0);

        pol.set_signal(&Signal::Num(300.0));
        let frozen = dir.path().join("cgroup").join("user.slice").join("cgroup.freeze");
        assert_eq!(std::fs::read_to_string(&frozen).unwrap(), "0");
        assert_eq!(pol.cg.cpu_quota("user.slice", pol.qmax).unwrap(), pol.qmax);

        // minimum quota engages the freezer instead
        pol.set_signal(&Signal::Num(600.0));
        assert_eq!(std::fs::read_to_string(&frozen).unwrap(), "1");

        pol.reset();
        assert_eq!(std::fs::read_to_string(&frozen).unwrap(), "0");
    }

    #[test]
    fn test_auto_selection_prefers_power() {
        let dir = tempfile::tempdir().unwrap();
        let mut hw = offline_hw(dir.path());
        hw.powercap = fake_powercap(&dir.path().join("powercap"));
        hw.cpufreq = fake_cpufreq(&dir.path().join("cpu"), 1, &[1_000_000]);
        let section = sec(&[("control", "auto"), ("governor", "linear")]);
        let pol = from_config(&section, &hw).unwrap().unwrap();
        assert_eq!(pol.get_config().get("control").map(String::as_str), Some("power"));
    }

    #[test]
    fn test_auto_selection_falls_back_to_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let mut hw = offline_hw(dir.path());
        hw.cpufreq = fake_cpufreq(&dir.path().join("cpu"), 1, &[1_000_000]);
        let section = sec(&[("control", "auto"), ("governor", "linear")]);
        let pol = from_config(&section, &hw).unwrap().unwrap();
        assert_eq!(
            pol.get_config().get("control").map(String::as_str),
            Some("frequency")
        );
    }

    #[test]
    fn test_auto_selection_no_backend_errors() {
        let dir = tempfile::tempdir().unwrap();
        let hw = offline_hw(dir.path());
        let section = sec(&[("control", "auto")]);
        assert!(from_config(&section, &hw).is_err());
    }

    #[test]
    fn test_disabled_control() {
        let dir = tempfile::tempdir().unwrap();
        let hw = offline_hw(dir.path());
        let section = sec(&[("control", "off")]);
        assert!(from_config(&section, &hw).unwrap().is_none());
    }
}
