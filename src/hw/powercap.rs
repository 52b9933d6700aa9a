//! Intel RAPL powercap sysfs adapter.
//!
//! Energy counters and power-limit constraints under
//! `/sys/class/powercap/intel-rapl:*`. Energy is microjoules, limits are
//! microwatts at the sysfs contract; accessors take a unit divisor.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hw::{read_u64, read_value, write_value};

/// Power unit divisors (sysfs values are µW).
pub const UWATT: f64 = 1.0;
pub const MWATT: f64 = 1e3;
pub const WATT: f64 = 1e6;

const DEFAULT_ROOT: &str = "/sys/class/powercap";
const PKG_MAX: usize = 256;

/// RAPL domain access through the Linux powercap subsystem.
#[derive(Debug, Clone)]
pub struct Powercap {
    root: PathBuf,
}

impl Default for Powercap {
    fn default() -> Self {
        Self::new()
    }
}

impl Powercap {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn package_path(&self, pkg: &str) -> PathBuf {
        self.root.join(format!("intel-rapl:{}", pkg))
    }

    fn package_file(&self, pkg: &str, fname: &str) -> PathBuf {
        self.package_path(pkg).join(fname)
    }

    fn read_package_u64(&self, pkg: &str, fname: &str) -> Result<u64> {
        read_u64(&self.package_file(pkg, fname))
    }

    /// Package ids whose domain name starts with `domain`.
    ///
    /// Top-level domains (`package-`, `psys`) are plain indices; sub-domains
    /// (`dram`, `core`, `uncore`) are `N:M` codes.
    pub fn package_list(&self, domain: &str) -> Vec<String> {
        let mut list = Vec::new();
        for pkg in 0..PKG_MAX {
            let pkg_id = pkg.to_string();
            let name_file = self.package_file(&pkg_id, "name");
            if !name_file.is_file() {
                break;
            }
            if let Ok(name) = read_value(&name_file) {
                if name.starts_with(domain) {
                    list.push(pkg_id.clone());
                }
            }
            if matches!(domain, "dram" | "core" | "uncore") {
                for sub in 0..PKG_MAX {
                    let sub_id = format!("{}:{}", pkg, sub);
                    let name_file = self.package_file(&sub_id, "name");
                    if !name_file.is_file() {
                        break;
                    }
                    if let Ok(name) = read_value(&name_file) {
                        if name.starts_with(domain) {
                            list.push(sub_id);
                        }
                    }
                }
            }
        }
        list
    }

    /// Whether the powercap tree is usable; `readonly` probes only the
    /// energy counter, not the writable constraint.
    pub fn available(&self, readonly: bool) -> bool {
        if readonly {
            self.package_file("0", "energy_uj").is_file()
        } else {
            self.package_file("0", "constraint_0_power_limit_uw").is_file()
        }
    }

    pub fn enabled(&self, pkg: &str) -> bool {
        self.read_package_u64(pkg, "enabled").map(|v| v != 0).unwrap_or(false)
    }

    /// Current energy counter in µJ.
    pub fn package_energy(&self, pkg: &str) -> Result<u64> {
        self.read_package_u64(pkg, "energy_uj")
    }

    /// Counter wrap boundary in µJ.
    pub fn package_energy_range(&self, pkg: &str) -> Result<u64> {
        self.read_package_u64(pkg, "max_energy_range_uj")
    }

    pub fn package_hw_max_power(&self, pkg: &str, unit: f64) -> Option<f64> {
        self.read_package_u64(pkg, "constraint_0_max_power_uw")
            .ok()
            .map(|v| v as f64 / unit)
    }

    pub fn package_power_limit(&self, pkg: &str, unit: f64) -> Option<f64> {
        self.read_package_u64(pkg, "constraint_0_power_limit_uw")
            .ok()
            .map(|v| v as f64 / unit)
    }

    /// Sum of the active power limits over all CPU packages.
    pub fn power_limit(&self, unit: f64) -> Option<f64> {
        let pkgs = self.package_list("package-");
        if pkgs.is_empty() {
            return None;
        }
        let mut power = 0.0;
        for pkg in &pkgs {
            power += self.package_power_limit(pkg, unit)?;
        }
        Some(power)
    }

    pub fn set_package_power_limit(&self, pkg: &str, power: f64, unit: f64) -> Result<bool> {
        let uw = (power * unit).round() as u64;
        write_value(
            &self.package_file(pkg, "constraint_0_power_limit_uw"),
            &uw.to_string(),
        )
    }

    /// Apply a power limit to every CPU package.
    pub fn set_power_limit(&self, power: f64, unit: f64) -> Result<()> {
        for pkg in self.package_list("package-") {
            self.set_package_power_limit(&pkg, power, unit)?;
        }
        Ok(())
    }

    /// Restore the hardware maximum limit on every CPU package.
    pub fn reset_power_limit(&self) -> Result<()> {
        for pkg in self.package_list("package-") {
            if let Some(maxp) = self.package_hw_max_power(&pkg, UWATT) {
                self.set_package_power_limit(&pkg, maxp, UWATT)?;
            }
        }
        Ok(())
    }

    pub fn info_string(&self) -> String {
        if !self.available(true) {
            return "RAPL powercap not found".into();
        }
        let mut parts = Vec::new();
        for (label, domain) in [("CPU", "package-"), ("DRAM", "dram"), ("PSYS", "psys")] {
            let pkgs = self.package_list(domain);
            if let Some(first) = pkgs.first() {
                let maxp = self.package_hw_max_power(first, WATT);
                let curp = self.package_power_limit(first, WATT);
                parts.push(format!(
                    "{} domains: count = {}, hw_limit = {:?} W, current_limit = {:?} W",
                    label,
                    pkgs.len(),
                    maxp,
                    curp
                ));
            }
        }
        parts.join("; ")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    /// Fake powercap tree: one package with a dram sub-domain.
    pub(crate) fn fake_powercap(dir: &Path) -> Powercap {
        let pkg = dir.join("intel-rapl:0");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("name"), "package-0\n").unwrap();
        fs::write(pkg.join("energy_uj"), "1000000\n").unwrap();
        fs::write(pkg.join("max_energy_range_uj"), "262143328850\n").unwrap();
        fs::write(pkg.join("enabled"), "1\n").unwrap();
        fs::write(pkg.join("constraint_0_power_limit_uw"), "125000000\n").unwrap();
        fs::write(pkg.join("constraint_0_max_power_uw"), "125000000\n").unwrap();
        let dram = dir.join("intel-rapl:0:0");
        fs::create_dir_all(&dram).unwrap();
        fs::write(dram.join("name"), "dram\n").unwrap();
        fs::write(dram.join("energy_uj"), "500000\n").unwrap();
        fs::write(dram.join("max_energy_range_uj"), "65712999613\n").unwrap();
        Powercap::with_root(dir)
    }

    #[test]
    fn test_package_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let pc = fake_powercap(dir.path());
        assert_eq!(pc.package_list("package-"), vec!["0"]);
        assert_eq!(pc.package_list("dram"), vec!["0:0"]);
        assert!(pc.package_list("psys").is_empty());
        assert!(pc.available(true));
        assert!(pc.available(false));
        assert!(pc.enabled("0"));
    }

    #[test]
    fn test_energy_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let pc = fake_powercap(dir.path());
        assert_eq!(pc.package_energy("0").unwrap(), 1_000_000);
        assert_eq!(pc.package_energy_range("0").unwrap(), 262_143_328_850);
        assert_eq!(pc.package_hw_max_power("0", WATT), Some(125.0));
        assert_eq!(pc.power_limit(WATT), Some(125.0));
    }

    #[test]
    fn test_set_power_limit_watts() {
        let dir = tempfile::tempdir().unwrap();
        let pc = fake_powercap(dir.path());
        pc.set_power_limit(90.0, WATT).unwrap();
        assert_eq!(pc.package_power_limit("0", WATT), Some(90.0));
        pc.reset_power_limit().unwrap();
        assert_eq!(pc.package_power_limit("0", WATT), Some(125.0));
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pc = Powercap::with_root(dir.path());
        assert!(!pc.available(true));
        assert!(pc.package_list("package-").is_empty());
        assert_eq!(pc.power_limit(WATT), None);
    }
}
