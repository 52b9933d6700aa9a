//! AMD power interfaces: RAPL via MSR and the EPYC ESMI vendor tool.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{EcoError, Result};
use crate::hw::read_u64;

/// AMD RAPL energy counters read from model-specific registers.
///
/// Registers follow the Zen layout: 0xC0010299 holds the energy unit,
/// 0xC001029A the per-core counter, 0xC001029B the package counter.
#[derive(Debug, Clone)]
pub struct AmdMsr {
    msr_root: PathBuf,
    topology_root: PathBuf,
}

const MSR_ROOT: &str = "/dev/cpu";
const TOPOLOGY_ROOT: &str = "/sys/devices/system/cpu";
const CPU_MAX: usize = 4096;

const UNIT_MSR: u64 = 0xC001_0299;
const CORE_MSR: u64 = 0xC001_029A;
const PACKAGE_MSR: u64 = 0xC001_029B;
const ENERGY_UNIT_MASK: u64 = 0x1F00;
const ENERGY_STATUS_MASK: u64 = 0xFFFF_FFFF;
const UJOULE_IN_JOULE: f64 = 1e6;

impl Default for AmdMsr {
    fn default() -> Self {
        Self::new()
    }
}

impl AmdMsr {
    pub fn new() -> Self {
        Self::with_roots(MSR_ROOT, TOPOLOGY_ROOT)
    }

    pub fn with_roots<P: AsRef<Path>, Q: AsRef<Path>>(msr_root: P, topology_root: Q) -> Self {
        Self {
            msr_root: msr_root.as_ref().to_path_buf(),
            topology_root: topology_root.as_ref().to_path_buf(),
        }
    }

    fn msr_file(&self, cpu: u32) -> PathBuf {
        self.msr_root.join(cpu.to_string()).join("msr")
    }

    fn topology_file(&self, cpu: u32) -> PathBuf {
        self.topology_root
            .join(format!("cpu{}", cpu))
            .join("topology")
            .join("physical_package_id")
    }

    fn read_msr(&self, path: &Path, register: u64) -> Result<u64> {
        let mut f = std::fs::File::open(path)?;
        f.seek(SeekFrom::Start(register))?;
        let mut buf = [0u8; 8];
        f.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Distinct physical package ids present in the CPU topology.
    pub fn package_list(&self) -> Vec<u32> {
        let mut pkgs = Vec::new();
        for cpu in 0..CPU_MAX as u32 {
            let fname = self.topology_file(cpu);
            if !fname.is_file() {
                break;
            }
            if let Ok(pkg) = read_u64(&fname) {
                let pkg = pkg as u32;
                if !pkgs.contains(&pkg) {
                    pkgs.push(pkg);
                }
            }
        }
        pkgs
    }

    /// First CPU belonging to a physical package.
    pub fn pkg_to_cpu(&self, pkg: u32) -> Option<u32> {
        for cpu in 0..CPU_MAX as u32 {
            let fname = self.topology_file(cpu);
            if !fname.is_file() {
                break;
            }
            if read_u64(&fname).ok()? as u32 == pkg {
                return Some(cpu);
            }
        }
        None
    }

    fn energy_factor(&self, msr_path: &Path) -> Result<f64> {
        let unit_msr = self.read_msr(msr_path, UNIT_MSR)?;
        let factor = 0.5f64.powi(((unit_msr & ENERGY_UNIT_MASK) >> 8) as i32);
        Ok(factor * UJOULE_IN_JOULE)
    }

    fn energy(&self, msr_path: &Path, register: u64) -> Result<f64> {
        let factor = self.energy_factor(msr_path)?;
        let counter = self.read_msr(msr_path, register)? & ENERGY_STATUS_MASK;
        Ok(counter as f64 * factor)
    }

    /// Package energy counter in µJ.
    pub fn package_energy(&self, pkg: u32) -> Result<f64> {
        let cpu = self
            .pkg_to_cpu(pkg)
            .ok_or_else(|| EcoError::Unavailable(format!("no CPU in package {}", pkg)))?;
        self.energy(&self.msr_file(cpu), PACKAGE_MSR)
    }

    /// Per-core energy counter in µJ.
    pub fn core_energy(&self, cpu: u32) -> Result<f64> {
        self.energy(&self.msr_file(cpu), CORE_MSR)
    }

    /// Counter wrap boundary in µJ (32-bit counter scaled by the unit).
    pub fn package_energy_range(&self, pkg: u32) -> Result<f64> {
        let cpu = self
            .pkg_to_cpu(pkg)
            .ok_or_else(|| EcoError::Unavailable(format!("no CPU in package {}", pkg)))?;
        let factor = self.energy_factor(&self.msr_file(cpu))?;
        Ok(ENERGY_STATUS_MASK as f64 * factor)
    }

    pub fn available(&self) -> bool {
        self.package_energy(0).map(|e| e > 0.0).unwrap_or(false)
    }
}

/// AMD EPYC System Management Interface CLI adapter.
///
/// Power limits are milliwatts on the tool's set path but watts at this
/// contract.
#[derive(Debug, Clone)]
pub struct AmdEsmi {
    tool: PathBuf,
}

const ESMI_TOOL: &str = "/opt/e-sms/e_smi/bin/e_smi_tool";
const MAX_PLIMIT_LABEL: &str = "PowerLimitMax (Watts)";
const CUR_PLIMIT_LABEL: &str = "PowerLimit (Watts)";

/// Parse the `| field | v0 | v1 |` table the ESMI tool prints.
pub(crate) fn parse_esmi_table(out: &str) -> BTreeMap<String, Vec<String>> {
    let mut table = BTreeMap::new();
    for line in out.lines() {
        let toks: Vec<&str> = line.split('|').collect();
        if toks.len() > 3 {
            let field = toks[1].trim().to_string();
            if field.is_empty() {
                continue;
            }
            let vals = toks[2..toks.len() - 1]
                .iter()
                .map(|v| v.trim().to_string())
                .collect();
            table.insert(field, vals);
        }
    }
    table
}

impl Default for AmdEsmi {
    fn default() -> Self {
        Self::new()
    }
}

impl AmdEsmi {
    pub fn new() -> Self {
        Self {
            tool: PathBuf::from(ESMI_TOOL),
        }
    }

    pub fn with_tool<P: AsRef<Path>>(tool: P) -> Self {
        Self {
            tool: tool.as_ref().to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> Option<String> {
        let out = std::process::Command::new(&self.tool)
            .args(args)
            .stderr(std::process::Stdio::null())
            .output()
            .ok()?;
        // the tool reports partially-supported platforms with exit code 210
        // while still printing the table
        if !out.status.success() && out.status.code() != Some(210) {
            return None;
        }
        String::from_utf8(out.stdout).ok()
    }

    pub fn available(&self) -> bool {
        self.run(&["-v"]).is_some()
    }

    pub fn enabled(&self) -> bool {
        self.package_power_limit(0).is_some()
    }

    fn query_power_field(&self, label: &str, pkg: usize) -> Option<f64> {
        let out = self.run(&["--showsockpower"])?;
        let table = parse_esmi_table(&out);
        table.get(label)?.get(pkg)?.parse().ok()
    }

    /// Hardware maximum power limit of a socket in W.
    pub fn package_hw_max_power(&self, pkg: usize) -> Option<f64> {
        self.query_power_field(MAX_PLIMIT_LABEL, pkg)
    }

    /// Active power limit of a socket in W.
    pub fn package_power_limit(&self, pkg: usize) -> Option<f64> {
        self.query_power_field(CUR_PLIMIT_LABEL, pkg)
    }

    /// Sum of the active power limits over all sockets, in W.
    pub fn power_limit(&self) -> Option<f64> {
        let out = self.run(&["--showsockpower"])?;
        let table = parse_esmi_table(&out);
        let vals = table.get(CUR_PLIMIT_LABEL)?;
        let mut sum = 0.0;
        for v in vals {
            sum += v.parse::<f64>().ok()?;
        }
        Some(sum)
    }

    pub fn set_package_power_limit(&self, pkg: usize, power_w: f64) -> Result<()> {
        let mw = (power_w * 1000.0).round() as u64;
        self.run(&["--setpowerlimit", &pkg.to_string(), &mw.to_string()])
            .map(|_| ())
            .ok_or_else(|| EcoError::CommandFailed("e_smi_tool --setpowerlimit".into()))
    }

    /// Apply a power limit (W) to every socket.
    pub fn set_power_limit(&self, power_w: f64, sockets: usize) -> Result<()> {
        for pkg in 0..sockets {
            self.set_package_power_limit(pkg, power_w)?;
        }
        Ok(())
    }

    pub fn info_string(&self) -> String {
        if let Some(out) = self.run(&[]) {
            let table = parse_esmi_table(&out);
            let maxp = table.get(MAX_PLIMIT_LABEL).and_then(|v| v.first()).cloned();
            let curp = table.get(CUR_PLIMIT_LABEL).and_then(|v| v.first()).cloned();
            format!(
                "ESMI: max_hw_limit = {} W, current_limit = {} W",
                maxp.unwrap_or_else(|| "?".into()),
                curp.unwrap_or_else(|| "?".into())
            )
        } else {
            "AMD E-SMI tool not found".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_topology(dir: &Path, pkg_of_cpu: &[u32]) {
        for (cpu, pkg) in pkg_of_cpu.iter().enumerate() {
            let d = dir.join(format!("cpu{}", cpu)).join("topology");
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join("physical_package_id"), format!("{}\n", pkg)).unwrap();
        }
    }

    #[test]
    fn test_package_list_and_mapping() {
        let dir = tempfile::tempdir().unwrap();
        fake_topology(dir.path(), &[0, 0, 1, 1]);
        let msr = AmdMsr::with_roots(dir.path().join("dev"), dir.path());
        assert_eq!(msr.package_list(), vec![0, 1]);
        // first CPU whose physical_package_id matches the package
        assert_eq!(msr.pkg_to_cpu(0), Some(0));
        assert_eq!(msr.pkg_to_cpu(1), Some(2));
        assert_eq!(msr.pkg_to_cpu(7), None);
    }

    #[test]
    fn test_msr_energy_decoding() {
        // The register number is a byte offset into /dev/cpu/N/msr; emulate
        // the device with a sparse file holding the unit and package words.
        use std::io::{Seek, SeekFrom, Write};
        let dir = tempfile::tempdir().unwrap();
        fake_topology(dir.path(), &[0]);
        let msr_dir = dir.path().join("dev").join("0");
        fs::create_dir_all(&msr_dir).unwrap();
        let mut f = fs::File::create(msr_dir.join("msr")).unwrap();
        // energy unit exponent 16 -> factor 0.5^16
        let unit: u64 = 16 << 8;
        f.seek(SeekFrom::Start(UNIT_MSR)).unwrap();
        f.write_all(&unit.to_le_bytes()).unwrap();
        let counter: u64 = 1 << 20;
        f.seek(SeekFrom::Start(PACKAGE_MSR)).unwrap();
        f.write_all(&counter.to_le_bytes()).unwrap();
        drop(f);

        let msr = AmdMsr::with_roots(dir.path().join("dev"), dir.path());
        let energy_uj = msr.package_energy(0).unwrap();
        // 2^20 * 0.5^16 J = 16 J = 16e6 uJ
        assert!((energy_uj - 16e6).abs() < 1e-3);
        let range = msr.package_energy_range(0).unwrap();
        assert!((range - 0xFFFF_FFFFu64 as f64 * 0.5f64.powi(16) * 1e6).abs() < 1.0);
    }

    #[test]
    fn test_esmi_table_parsing() {
        let out = "\
----------------------------------------------------------------\n\
| Sensor                      | Socket 0       | Socket 1       |\n\
----------------------------------------------------------------\n\
| NR_SOCKETS                  | 2              |\n\
| PowerLimit (Watts)          | 200.000        | 200.000        |\n\
| PowerLimitMax (Watts)       | 240.000        | 240.000        |\n\
----------------------------------------------------------------\n";
        let table = parse_esmi_table(out);
        assert_eq!(table["PowerLimit (Watts)"][0], "200.000");
        assert_eq!(table["PowerLimitMax (Watts)"][1], "240.000");
        assert_eq!(table["NR_SOCKETS"][0], "2");
    }

    #[test]
    fn test_esmi_missing_tool() {
        let esmi = AmdEsmi::with_tool("/nonexistent/e_smi_tool");
        assert!(!esmi.available());
        assert_eq!(esmi.power_limit(), None);
    }
}
