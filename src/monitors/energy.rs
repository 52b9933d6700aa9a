//! Energy monitors.
//!
//! RAPL-family backends (Intel powercap, AMD MSR) accumulate counter deltas
//! with wrap handling and an optional full-system power estimate; the
//! power-reading backends (IPMI, GPU, MQTT) integrate instantaneous power
//! trapezoidally over the sampling interval.

use std::collections::HashMap;

use log::warn;

use crate::config::Config;
use crate::error::{EcoError, Result};
use crate::hw::{AmdMsr, Ipmi, NvidiaSmi, Powercap};
use crate::mqtt::{MqttHandle, MqttRegistry};

use super::MonitorHw;

const UJ_IN_J: f64 = 1e6;

/// Counter source for the RAPL-family backends.
pub enum RaplSource {
    Powercap(Powercap),
    Msr(AmdMsr),
}

impl RaplSource {
    fn energy_uj(&self, pkg: &str) -> Option<f64> {
        match self {
            RaplSource::Powercap(pc) => pc.package_energy(pkg).ok().map(|e| e as f64),
            RaplSource::Msr(msr) => pkg.parse().ok().and_then(|p| msr.package_energy(p).ok()),
        }
    }

    fn energy_range_uj(&self, pkg: &str) -> Option<f64> {
        match self {
            RaplSource::Powercap(pc) => pc.package_energy_range(pkg).ok().map(|e| e as f64),
            RaplSource::Msr(msr) => pkg
                .parse()
                .ok()
                .and_then(|p| msr.package_energy_range(p).ok()),
        }
    }
}

/// RAPL counter accumulation state shared by powercap and MSR monitors.
pub struct RaplBackend {
    source: RaplSource,
    pkg_list: Vec<String>,
    psys_domain: bool,
    estimate_full_power: bool,
    coeff_const: f64,
    coeff_var: f64,
    cpu_max_power_uw: Option<f64>,
    last_energy: HashMap<String, f64>,
    energy_range: HashMap<String, f64>,
}

impl RaplBackend {
    fn new(
        cfg: &Config,
        source: RaplSource,
        pkg_list: Vec<String>,
        psys_domain: bool,
        cpu_max_power_uw: Option<f64>,
    ) -> Result<Self> {
        let estimate_full_power = cfg.get_bool("powercap", "estimatefullpower").unwrap_or(true);
        let coeff_const = cfg.get_f64("powercap", "fullpowerconstcoeff")?.unwrap_or(0.3);
        let coeff_var = cfg.get_f64("powercap", "fullpowervarcoeff")?.unwrap_or(0.25);
        let mut backend = Self {
            source,
            pkg_list,
            psys_domain,
            estimate_full_power,
            coeff_const,
            coeff_var,
            cpu_max_power_uw,
            last_energy: HashMap::new(),
            energy_range: HashMap::new(),
        };
        for pkg in backend.pkg_list.clone() {
            let range = backend.source.energy_range_uj(&pkg).unwrap_or(f64::MAX);
            backend.energy_range.insert(pkg.clone(), range);
            backend.last_energy.insert(pkg, 0.0);
        }
        // warm-up sample to baseline the counters; the diff is discarded
        backend.observed_diff_uj();
        Ok(backend)
    }

    /// Sum of per-package counter deltas since the previous call, with
    /// modular wrap handling.
    fn observed_diff_uj(&mut self) -> f64 {
        let mut diff = 0.0;
        for pkg in &self.pkg_list {
            let Some(new_energy) = self.source.energy_uj(pkg) else {
                continue;
            };
            let last = self.last_energy.get(pkg).copied().unwrap_or(0.0);
            let range = self.energy_range.get(pkg).copied().unwrap_or(f64::MAX);
            let pkg_diff = if new_energy >= last {
                new_energy - last
            } else {
                new_energy + (range - last)
            };
            self.last_energy.insert(pkg.clone(), new_energy);
            diff += pkg_diff;
        }
        diff
    }

    /// Scale an observed CPU+DRAM delta up to a whole-system estimate when
    /// no psys domain is visible.
    fn full_system_energy_uj(&self, diff_uj: f64, interval: u64) -> f64 {
        if self.psys_domain || !self.estimate_full_power {
            return diff_uj;
        }
        match self.cpu_max_power_uw {
            Some(pmax_uw) => {
                let base = pmax_uw * self.coeff_const * interval as f64;
                base + (1.0 + self.coeff_var) * diff_uj
            }
            None => diff_uj,
        }
    }

    fn sample_energy_j(&mut self, interval: u64) -> f64 {
        let diff = self.observed_diff_uj();
        self.full_system_energy_uj(diff, interval) / UJ_IN_J
    }
}

/// Backend flavour of one energy monitor.
pub enum EnergyBackend {
    Rapl(RaplBackend),
    Gpu { hw: NvidiaSmi, last_pwr: f64 },
    Ipmi { hw: Ipmi, last_pwr: f64 },
    Mqtt { handle: MqttHandle, last_pwr: f64 },
}

impl EnergyBackend {
    fn label(&self) -> &'static str {
        match self {
            EnergyBackend::Rapl(b) => match b.source {
                RaplSource::Powercap(_) => "PowercapEnergyMonitor",
                RaplSource::Msr(_) => "AmdMsrEnergyMonitor",
            },
            EnergyBackend::Gpu { .. } => "GpuEnergyMonitor",
            EnergyBackend::Ipmi { .. } => "IpmiEnergyMonitor",
            EnergyBackend::Mqtt { .. } => "MqttEnergyMonitor",
        }
    }

    /// Energy spent over the past interval, in joules.
    fn sample_energy_j(&mut self, interval: u64) -> f64 {
        match self {
            EnergyBackend::Rapl(b) => b.sample_energy_j(interval),
            EnergyBackend::Gpu { hw, last_pwr } => {
                let cur = hw.get_power().unwrap_or_else(|| {
                    warn!("GPU power reading failed");
                    *last_pwr
                });
                trapezoid(last_pwr, cur, interval)
            }
            EnergyBackend::Ipmi { hw, last_pwr } => {
                let cur = hw.get_power().unwrap_or_else(|| {
                    warn!("IPMI power reading failed");
                    *last_pwr
                });
                trapezoid(last_pwr, cur, interval)
            }
            EnergyBackend::Mqtt { handle, last_pwr } => {
                let cur = handle.last_f64().unwrap_or_else(|| {
                    warn!("MQTT power reading failed");
                    *last_pwr
                });
                trapezoid(last_pwr, cur, interval)
            }
        }
    }
}

/// Trapezoidal integration of two power readings over an interval.
fn trapezoid(last_pwr: &mut f64, cur_pwr: f64, interval: u64) -> f64 {
    let energy = 0.5 * (*last_pwr + cur_pwr) * interval as f64;
    *last_pwr = cur_pwr;
    energy
}

/// One energy sensor with period/total accumulators.
pub struct EnergyMonitor {
    backend: EnergyBackend,
    pub interval: u64,
    total_energy: f64,
    period_energy: f64,
    last_avg_power: f64,
    period_samples: u64,
}

impl EnergyMonitor {
    pub fn new(interval: u64, backend: EnergyBackend) -> Self {
        Self {
            backend,
            interval,
            total_energy: 0.0,
            period_energy: 0.0,
            last_avg_power: 0.0,
            period_samples: 0,
        }
    }

    /// Configured energy monitors.
    ///
    /// `auto` prefers whole-system IPMI; otherwise one RAPL-family CPU
    /// sensor (powercap, then MSR) plus a GPU sensor when a GPU is present.
    /// An explicit comma-separated `PowerSensor` list overrides.
    pub fn from_config(
        cfg: &Config,
        hw: &MonitorHw,
        mqtt: &mut MqttRegistry,
    ) -> Result<Vec<EnergyMonitor>> {
        let interval = cfg.get_u64("monitor", "interval")?.unwrap_or(5);
        let sensor = cfg.get("monitor", "powersensor").unwrap_or("auto");
        let sensor = sensor.to_ascii_lowercase();
        let mut monitors = Vec::new();
        if crate::is_disabled(&sensor) {
            return Ok(monitors);
        }
        if sensor == "auto" {
            if hw.ipmi.available() {
                monitors.push(Self::new(interval, ipmi_backend(hw)));
            } else {
                if powercap_usable(&hw.powercap) {
                    monitors.push(Self::new(interval, powercap_backend(cfg, hw)?));
                } else if hw.amdmsr.available() {
                    monitors.push(Self::new(interval, amdmsr_backend(cfg, hw)?));
                }
                if hw.nvidia.available() {
                    monitors.push(Self::new(interval, gpu_backend(hw)));
                }
            }
            return Ok(monitors);
        }
        for s in sensor.split(',') {
            let backend = match s.trim() {
                "rapl" => powercap_backend(cfg, hw)?,
                "amd_msr" => amdmsr_backend(cfg, hw)?,
                "ipmi" => ipmi_backend(hw),
                "gpu" => gpu_backend(hw),
                "mqtt" => mqtt_backend(cfg, mqtt)?,
                other => {
                    return Err(EcoError::Config(format!("unknown power sensor: {}", other)))
                }
            };
            let interval = if s.trim() == "mqtt" {
                mqtt_interval(cfg, interval)
            } else {
                interval
            };
            monitors.push(Self::new(interval, backend));
        }
        Ok(monitors)
    }

    pub fn label(&self) -> &'static str {
        self.backend.label()
    }

    pub fn update(&mut self) {
        let energy = self.backend.sample_energy_j(self.interval);
        self.last_avg_power = energy / self.interval as f64;
        self.total_energy += energy;
        self.period_energy += energy;
        self.period_samples += 1;
    }

    pub fn period_energy(&self) -> f64 {
        self.period_energy
    }

    pub fn total_energy(&self) -> f64 {
        self.total_energy
    }

    pub fn last_avg_power(&self) -> f64 {
        self.last_avg_power
    }

    pub fn period_avg_power(&self) -> f64 {
        if self.period_samples > 0 {
            self.period_energy / (self.period_samples * self.interval) as f64
        } else {
            0.0
        }
    }

    pub fn reset_period(&mut self) {
        self.period_energy = 0.0;
        self.period_samples = 0;
    }
}

fn powercap_usable(pc: &Powercap) -> bool {
    pc.package_energy("0").map(|e| e > 0).unwrap_or(false)
}

fn powercap_backend(cfg: &Config, hw: &MonitorHw) -> Result<EnergyBackend> {
    let pc = hw.powercap.clone();
    let psys = pc.package_list("psys");
    let (pkg_list, psys_domain, pmax_uw) = if !psys.is_empty() {
        (psys, true, None)
    } else {
        let mut pkgs = pc.package_list("package-");
        if pkgs.is_empty() {
            return Err(EcoError::Unavailable("RAPL powercap counters".into()));
        }
        let pmax_uw = if pc.available(false) {
            pc.package_hw_max_power(&pkgs[0], crate::hw::powercap::UWATT)
        } else {
            hw.cpuinfo.tdp_uw()
        };
        pkgs.extend(pc.package_list("dram"));
        (pkgs, false, pmax_uw)
    };
    Ok(EnergyBackend::Rapl(RaplBackend::new(
        cfg,
        RaplSource::Powercap(pc),
        pkg_list,
        psys_domain,
        pmax_uw,
    )?))
}

fn amdmsr_backend(cfg: &Config, hw: &MonitorHw) -> Result<EnergyBackend> {
    let msr = hw.amdmsr.clone();
    let pkg_list: Vec<String> = msr.package_list().iter().map(u32::to_string).collect();
    if pkg_list.is_empty() {
        return Err(EcoError::Unavailable("AMD MSR energy counters".into()));
    }
    let pmax_uw = hw.cpuinfo.tdp_uw();
    Ok(EnergyBackend::Rapl(RaplBackend::new(
        cfg,
        RaplSource::Msr(msr),
        pkg_list,
        false,
        pmax_uw,
    )?))
}

fn gpu_backend(hw: &MonitorHw) -> EnergyBackend {
    EnergyBackend::Gpu {
        hw: hw.nvidia.clone(),
        last_pwr: 0.0,
    }
}

fn ipmi_backend(hw: &MonitorHw) -> EnergyBackend {
    EnergyBackend::Ipmi {
        hw: hw.ipmi.clone(),
        last_pwr: 0.0,
    }
}

fn mqtt_interval(cfg: &Config, default: u64) -> u64 {
    cfg.get_u64("mqtt_power", "interval")
        .ok()
        .flatten()
        .unwrap_or(default)
}

fn mqtt_backend(cfg: &Config, mqtt: &mut MqttRegistry) -> Result<EnergyBackend> {
    let section = cfg
        .section("mqtt_power")
        .cloned()
        .ok_or_else(|| EcoError::Config("PowerSensor = mqtt needs a [mqtt_power] section".into()))?;
    let handle = mqtt.add_client("mqtt_power", &section);
    Ok(EnergyBackend::Mqtt {
        handle,
        last_pwr: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::powercap::tests::fake_powercap;

    fn powercap_monitor(dir: &std::path::Path, estimate: bool) -> (Powercap, EnergyMonitor) {
        let pc = fake_powercap(dir);
        let toml = if estimate {
            "[powercap]\nEstimateFullPower = \"on\"\n"
        } else {
            "[powercap]\nEstimateFullPower = \"off\"\n"
        };
        let cfg = Config::from_toml(toml).unwrap();
        let hw = MonitorHw {
            powercap: pc.clone(),
            ..crate::monitors::tests::offline_monitor_hw()
        };
        let backend = powercap_backend(&cfg, &hw).unwrap();
        (pc, EnergyMonitor::new(5, backend))
    }

    fn write_energy(dir: &std::path::Path, pkg: &str, uj: u64) {
        std::fs::write(
            dir.join(format!("intel-rapl:{}", pkg)).join("energy_uj"),
            format!("{}\n", uj),
        )
        .unwrap();
    }

    #[test]
    fn test_rapl_delta_without_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let (_pc, mut mon) = powercap_monitor(dir.path(), false);
        // package grows by 2 J, dram by 1 J
        write_energy(dir.path(), "0", 3_000_000);
        write_energy(dir.path(), "0:0", 1_500_000);
        mon.update();
        assert!((mon.period_energy() - 3.0).abs() < 1e-9);
        assert!((mon.last_avg_power() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_rapl_counter_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let (_pc, mut mon) = powercap_monitor(dir.path(), false);
        // wrap: counter restarts near zero; delta = new + (range - last)
        write_energy(dir.path(), "0", 10);
        let range = 262_143_328_850u64;
        let expected = (10.0 + (range as f64 - 1_000_000.0) + 500_000.0) / 1e6;
        // dram stays at its baseline by rewriting the same value
        write_energy(dir.path(), "0:0", 1_000_000);
        mon.update();
        assert!((mon.period_energy() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_rapl_wrap_arithmetic() {
        // last = range - 5, new = 10 -> delta = 15
        let range = 1_000.0;
        let last = range - 5.0;
        let new = 10.0;
        let delta = if new >= last { new - last } else { new + (range - last) };
        assert_eq!(delta, 15.0);
    }

    #[test]
    fn test_full_system_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let (_pc, mut mon) = powercap_monitor(dir.path(), true);
        write_energy(dir.path(), "0", 3_000_000);
        write_energy(dir.path(), "0:0", 1_500_000);
        mon.update();
        // pmax = 125 W = 125e6 uW; const share = 125e6*0.3*5 uJ = 187.5 J
        // var share = 1.25 * 3 J = 3.75 J
        assert!((mon.period_energy() - (187.5 + 3.75)).abs() < 1e-6);
    }

    #[test]
    fn test_trapezoid_integration() {
        let mut last = 0.0;
        // first sample: 0.5*(0+100)*5 = 250 J
        assert_eq!(trapezoid(&mut last, 100.0, 5), 250.0);
        // steady state: 0.5*(100+100)*5 = 500 J
        assert_eq!(trapezoid(&mut last, 100.0, 5), 500.0);
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_monotone_totals() {
        let dir = tempfile::tempdir().unwrap();
        let (_pc, mut mon) = powercap_monitor(dir.path(), false);
        let mut prev_total = 0.0;
        for i in 1..=5u64 {
            write_energy(dir.path(), "0", 1_000_000 + i * 500_000);
            mon.update();
            assert!(mon.total_energy() >= prev_total);
            prev_total = mon.total_energy();
        }
        // period resets do not touch the total
        mon.reset_period();
        assert_eq!(mon.period_energy(), 0.0);
        assert!(mon.total_energy() >= prev_total);
    }

    #[test]
    fn test_period_avg_power() {
        let dir = tempfile::tempdir().unwrap();
        let (_pc, mut mon) = powercap_monitor(dir.path(), false);
        write_energy(dir.path(), "0", 6_000_000); // +5 J
        write_energy(dir.path(), "0:0", 1_500_000); // +0.5 J
        mon.update();
        write_energy(dir.path(), "0", 11_000_000); // +5 J
        mon.update();
        // 10.5 J over 2 samples * 5 s
        assert!((mon.period_avg_power() - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_sensor_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_toml("[monitor]\nPowerSensor = \"teapot\"\n").unwrap();
        let hw = crate::monitors::tests::offline_monitor_hw();
        let mut mqtt = MqttRegistry::new();
        let _ = dir;
        assert!(EnergyMonitor::from_config(&cfg, &hw, &mut mqtt).is_err());
    }
}
