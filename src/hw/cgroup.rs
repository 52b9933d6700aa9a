//! Linux cgroup v1/v2 CPU quota and freezer adapter.
//!
//! Quotas are expressed in CPU-equivalents (`quota_us / period_us`) at this
//! contract; the unlimited quota (`-1` on v1, `max` on v2) reads back as the
//! machine's core count.

use std::path::{Path, PathBuf};

use crate::error::{EcoError, Result};
use crate::hw::{read_u64, read_value, write_value};

const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl std::fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// Cgroup filesystem access for one hierarchy version.
#[derive(Debug, Clone)]
pub struct Cgroup {
    root: PathBuf,
    version: CgroupVersion,
}

impl Cgroup {
    pub fn v1() -> Self {
        Self::v1_with_root(DEFAULT_ROOT)
    }

    pub fn v2() -> Self {
        Self::v2_with_root(DEFAULT_ROOT)
    }

    pub fn v1_with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            version: CgroupVersion::V1,
        }
    }

    pub fn v2_with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            version: CgroupVersion::V2,
        }
    }

    /// Mounted-and-enabled hierarchy for a group, v1 preferred.
    pub fn detect<P: AsRef<Path>>(root: P, grp: &str) -> Option<Self> {
        let v1 = Self::v1_with_root(root.as_ref());
        if v1.enabled("cpu", grp) {
            return Some(v1);
        }
        let v2 = Self::v2_with_root(root.as_ref());
        if v2.enabled("cpu", grp) {
            return Some(v2);
        }
        None
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn mounted(&self) -> bool {
        self.root.exists()
    }

    fn subsys_file(&self, sub: &str, grp: &str, fname: &str) -> PathBuf {
        match self.version {
            CgroupVersion::V1 => self.root.join(sub).join(grp).join(fname),
            CgroupVersion::V2 => self.root.join(grp).join(fname),
        }
    }

    /// Whether a controller is usable for the group.
    pub fn enabled(&self, sub: &str, grp: &str) -> bool {
        match (self.version, sub) {
            (CgroupVersion::V1, "cpu") => self.subsys_file("cpu", grp, "cpu.cfs_quota_us").is_file(),
            (CgroupVersion::V1, "freezer") => {
                self.subsys_file("freezer", grp, "freezer.state").is_file()
            }
            (CgroupVersion::V2, "cpu") => self.subsys_file("", grp, "cpu.max").is_file(),
            (CgroupVersion::V2, "freezer") => self.subsys_file("", grp, "cgroup.freeze").is_file(),
            _ => false,
        }
    }

    /// Set the CPU quota in CPU-equivalents; `period` (µs) overrides the
    /// configured scheduler period when given.
    pub fn set_cpu_quota(&self, grp: &str, quota_cpus: f64, period: Option<u64>) -> Result<()> {
        match self.version {
            CgroupVersion::V1 => {
                let period_file = self.subsys_file("cpu", grp, "cpu.cfs_period_us");
                let period_us = match period {
                    Some(p) => {
                        write_value(&period_file, &p.to_string())?;
                        p
                    }
                    None => read_u64(&period_file)?,
                };
                let quota_us = (quota_cpus * period_us as f64) as i64;
                write_value(
                    &self.subsys_file("cpu", grp, "cpu.cfs_quota_us"),
                    &quota_us.to_string(),
                )?;
            }
            CgroupVersion::V2 => {
                let quota_file = self.subsys_file("", grp, "cpu.max");
                let period_us = match period {
                    Some(p) => p,
                    None => crate::hw::read_field(&quota_file, 1)?.parse().map_err(|_| {
                        EcoError::Parse(format!("{}: bad cpu.max period", quota_file.display()))
                    })?,
                };
                let quota_us = (quota_cpus * period_us as f64) as u64;
                write_value(&quota_file, &format!("{} {}", quota_us, period_us))?;
            }
        }
        Ok(())
    }

    /// Current CPU quota in CPU-equivalents; unlimited maps to `ncores`.
    pub fn cpu_quota(&self, grp: &str, ncores: f64) -> Result<f64> {
        match self.version {
            CgroupVersion::V1 => {
                let quota_us =
                    read_value(&self.subsys_file("cpu", grp, "cpu.cfs_quota_us"))?
                        .parse::<i64>()
                        .map_err(|e| EcoError::Parse(format!("cpu.cfs_quota_us: {}", e)))?;
                if quota_us == -1 {
                    return Ok(ncores);
                }
                let period_us = read_u64(&self.subsys_file("cpu", grp, "cpu.cfs_period_us"))?;
                Ok(quota_us as f64 / period_us as f64)
            }
            CgroupVersion::V2 => {
                let line = read_value(&self.subsys_file("", grp, "cpu.max"))?;
                let mut toks = line.split_whitespace();
                let quota = toks.next().unwrap_or_default();
                let period: f64 = toks
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| EcoError::Parse(format!("bad cpu.max line: {}", line)))?;
                if quota == "max" {
                    Ok(ncores)
                } else {
                    let quota: f64 = quota
                        .parse()
                        .map_err(|_| EcoError::Parse(format!("bad cpu.max quota: {}", quota)))?;
                    Ok(quota / period)
                }
            }
        }
    }

    pub fn freeze(&self, grp: &str) -> Result<()> {
        match self.version {
            CgroupVersion::V1 => {
                write_value(&self.subsys_file("freezer", grp, "freezer.state"), "FROZEN")?
            }
            CgroupVersion::V2 => write_value(&self.subsys_file("", grp, "cgroup.freeze"), "1")?,
        };
        Ok(())
    }

    pub fn unfreeze(&self, grp: &str) -> Result<()> {
        match self.version {
            CgroupVersion::V1 => {
                write_value(&self.subsys_file("freezer", grp, "freezer.state"), "THAWED")?
            }
            CgroupVersion::V2 => write_value(&self.subsys_file("", grp, "cgroup.freeze"), "0")?,
        };
        Ok(())
    }

    pub fn info_string(&self) -> String {
        if !self.mounted() {
            return "cgroup filesystem not mounted".into();
        }
        let subs: Vec<&str> = ["cpu", "freezer"]
            .into_iter()
            .filter(|s| self.enabled(s, ""))
            .collect();
        format!("cgroup {} ({})", self.version, subs.join(","))
    }
}
