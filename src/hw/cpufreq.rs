//! ACPI cpufreq sysfs adapter.
//!
//! Per-CPU frequency limits and readings under
//! `/sys/devices/system/cpu/cpuN/cpufreq/`. Frequencies are kHz at the sysfs
//! contract; accessors take a unit divisor for MHz/GHz views.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hw::{read_value, write_value};

/// Frequency unit divisors (sysfs values are kHz).
pub const KHZ: f64 = 1.0;
pub const MHZ: f64 = 1e3;
pub const GHZ: f64 = 1e6;

const DEFAULT_ROOT: &str = "/sys/devices/system/cpu";

/// DVFS driver interface over the cpufreq sysfs tree.
#[derive(Debug, Clone)]
pub struct CpuFreq {
    root: PathBuf,
}

impl Default for CpuFreq {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuFreq {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn cpu_field(&self, cpu: usize, field: &str) -> PathBuf {
        self.root.join(format!("cpu{}", cpu)).join("cpufreq").join(field)
    }

    pub fn available(&self) -> bool {
        self.cpu_field(0, "scaling_driver").is_file()
    }

    fn get_string(&self, field: &str, cpu: usize) -> Option<String> {
        read_value(&self.cpu_field(cpu, field)).ok()
    }

    fn get_scaled(&self, field: &str, cpu: usize, unit: f64) -> Option<f64> {
        let s = self.get_string(field, cpu)?;
        s.parse::<u64>().ok().map(|khz| khz as f64 / unit)
    }

    pub fn driver(&self) -> Option<String> {
        self.get_string("scaling_driver", 0)
    }

    pub fn governor(&self) -> Option<String> {
        self.get_string("scaling_governor", 0)
    }

    pub fn hw_min_freq(&self, cpu: usize, unit: f64) -> Option<f64> {
        self.get_scaled("cpuinfo_min_freq", cpu, unit)
    }

    pub fn hw_max_freq(&self, cpu: usize, unit: f64) -> Option<f64> {
        self.get_scaled("cpuinfo_max_freq", cpu, unit)
    }

    pub fn hw_cur_freq(&self, cpu: usize, unit: f64) -> Option<f64> {
        self.get_scaled("cpuinfo_cur_freq", cpu, unit)
    }

    pub fn gov_min_freq(&self, cpu: usize, unit: f64) -> Option<f64> {
        self.get_scaled("scaling_min_freq", cpu, unit)
    }

    pub fn gov_max_freq(&self, cpu: usize, unit: f64) -> Option<f64> {
        self.get_scaled("scaling_max_freq", cpu, unit)
    }

    pub fn gov_cur_freq(&self, cpu: usize, unit: f64) -> Option<f64> {
        self.get_scaled("scaling_cur_freq", cpu, unit)
    }

    /// Average current frequency across all online CPUs.
    pub fn avg_cur_freq(&self, unit: f64) -> Option<f64> {
        let mut cpu = 0;
        let mut fsum = 0.0;
        while let Some(f) = self.gov_cur_freq(cpu, unit) {
            fsum += f;
            cpu += 1;
        }
        if cpu > 0 {
            Some(fsum / cpu as f64)
        } else {
            None
        }
    }

    fn set_field_all(&self, field: &str, val: &str) -> Result<()> {
        let mut cpu = 0;
        while write_value(&self.cpu_field(cpu, field), val)? {
            cpu += 1;
        }
        Ok(())
    }

    /// Cap the scaling governor's maximum frequency (kHz) on every CPU.
    pub fn set_gov_max_freq(&self, freq_khz: u64) -> Result<()> {
        self.set_field_all("scaling_max_freq", &freq_khz.to_string())
    }

    pub fn info_string(&self) -> String {
        if !self.available() {
            return "DVFS driver not found".into();
        }
        let driver = self.driver().unwrap_or_default();
        let governor = self.governor().unwrap_or_default();
        let fmt = |v: Option<f64>| v.map(|f| (f.round() as u64).to_string()).unwrap_or_else(|| "?".into());
        format!(
            "driver = {}, governor = {}, hw limits = {} - {} MHz, policy = {} - {} MHz",
            driver,
            governor,
            fmt(self.hw_min_freq(0, MHZ)),
            fmt(self.hw_max_freq(0, MHZ)),
            fmt(self.gov_min_freq(0, MHZ)),
            fmt(self.gov_max_freq(0, MHZ)),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    /// Lay out a fake cpufreq tree for `ncpus` CPUs.
    pub(crate) fn fake_cpufreq(dir: &Path, ncpus: usize, cur_khz: &[u64]) -> CpuFreq {
        for cpu in 0..ncpus {
            let d = dir.join(format!("cpu{}", cpu)).join("cpufreq");
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join("scaling_driver"), "acpi-cpufreq\n").unwrap();
            fs::write(d.join("scaling_governor"), "schedutil\n").unwrap();
            fs::write(d.join("cpuinfo_min_freq"), "800000\n").unwrap();
            fs::write(d.join("cpuinfo_max_freq"), "4000000\n").unwrap();
            fs::write(d.join("scaling_min_freq"), "800000\n").unwrap();
            fs::write(d.join("scaling_max_freq"), "4000000\n").unwrap();
            fs::write(d.join("scaling_cur_freq"), format!("{}\n", cur_khz[cpu])).unwrap();
        }
        CpuFreq::with_root(dir)
    }

    #[test]
    fn test_availability_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let hw = fake_cpufreq(dir.path(), 2, &[1_200_000, 1_800_000]);
        assert!(hw.available());
        assert_eq!(hw.hw_min_freq(0, KHZ), Some(800_000.0));
        assert_eq!(hw.hw_max_freq(0, MHZ), Some(4000.0));
        assert_eq!(hw.driver().as_deref(), Some("acpi-cpufreq"));
    }

    #[test]
    fn test_avg_cur_freq() {
        let dir = tempfile::tempdir().unwrap();
        let hw = fake_cpufreq(dir.path(), 2, &[1_200_000, 1_800_000]);
        assert_eq!(hw.avg_cur_freq(KHZ), Some(1_500_000.0));
        assert_eq!(hw.avg_cur_freq(MHZ), Some(1500.0));
    }

    #[test]
    fn test_set_gov_max_freq_all_cpus() {
        let dir = tempfile::tempdir().unwrap();
        let hw = fake_cpufreq(dir.path(), 3, &[1_000_000, 1_000_000, 1_000_000]);
        hw.set_gov_max_freq(2_500_000).unwrap();
        for cpu in 0..3 {
            assert_eq!(hw.gov_max_freq(cpu, KHZ), Some(2_500_000.0));
        }
        // loop terminated at the first missing CPU, nothing else written
        assert!(!dir.path().join("cpu3").exists());
    }

    #[test]
    fn test_missing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let hw = CpuFreq::with_root(dir.path());
        assert!(!hw.available());
        assert_eq!(hw.avg_cur_freq(KHZ), None);
        assert!(hw.set_gov_max_freq(1_000_000).is_ok());
    }
}
