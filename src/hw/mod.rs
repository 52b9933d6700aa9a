//! Hardware adapters.
//!
//! Thin wrappers around the sysfs/devfs nodes and vendor CLIs EcoFreq reads
//! and actuates: RAPL powercap, AMD MSR/ESMI, ACPI cpufreq, NVIDIA
//! management, cgroup v1/v2, Docker, IPMI DCMI and ACPI suspend.
//!
//! Sysfs-backed adapters carry their filesystem root so tests can point them
//! at a scratch tree. Writes to attributes that do not exist return
//! `Ok(false)` ("no such CPU/package"), which lets per-CPU loops terminate
//! naturally; a failed CLI or MSR invocation yields `None` instead of an
//! error.

pub mod amd;
pub mod cgroup;
pub mod cpufreq;
pub mod cpuinfo;
pub mod docker;
pub mod ipmi;
pub mod nvidia;
pub mod powercap;
pub mod suspend;

pub use amd::{AmdEsmi, AmdMsr};
pub use cgroup::{Cgroup, CgroupVersion};
pub use cpufreq::CpuFreq;
pub use cpuinfo::CpuInfo;
pub use docker::DockerCli;
pub use ipmi::Ipmi;
pub use nvidia::NvidiaSmi;
pub use powercap::Powercap;
pub use suspend::Suspend;

use std::path::Path;
use std::process::Command;

use crate::error::Result;

/// Read the first line of a file, trimmed.
pub(crate) fn read_value(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.lines().next().unwrap_or("").trim().to_string())
}

/// Read a whitespace-separated field from the first line of a file.
pub(crate) fn read_field(path: &Path, field: usize) -> Result<String> {
    let line = read_value(path)?;
    line.split_whitespace()
        .nth(field)
        .map(str::to_string)
        .ok_or_else(|| {
            crate::EcoError::Parse(format!("{}: missing field {}", path.display(), field))
        })
}

pub(crate) fn read_u64(path: &Path) -> Result<u64> {
    let s = read_value(path)?;
    s.parse()
        .map_err(|_| crate::EcoError::Parse(format!("{}: not an integer: {}", path.display(), s)))
}

/// Write a value to a sysfs attribute.
///
/// Returns `Ok(false)` when the attribute does not exist; other failures
/// (notably EACCES) propagate.
pub(crate) fn write_value(path: &Path, val: &str) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    std::fs::write(path, val)?;
    Ok(true)
}

/// Run an external tool with stderr silenced; `None` on spawn failure or
/// non-zero exit.
pub(crate) fn run_cmd(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd)
        .args(args)
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_missing_attribute_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("scaling_max_freq");
        assert!(!write_value(&missing, "1000").unwrap());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let attr = dir.path().join("enabled");
        std::fs::write(&attr, "0\n").unwrap();
        assert!(write_value(&attr, "1").unwrap());
        assert_eq!(read_value(&attr).unwrap(), "1");
    }

    #[test]
    fn test_read_field() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("loadavg");
        std::fs::write(&f, "0.52 0.58 0.59 1/389 12345\n").unwrap();
        assert_eq!(read_field(&f, 1).unwrap(), "0.58");
        assert!(read_field(&f, 9).is_err());
    }
}
