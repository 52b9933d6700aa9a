//! CPU topology info from `lscpu`.

use std::collections::BTreeMap;

use crate::hw::run_cmd;

#[derive(Debug, Clone)]
pub struct CpuInfo {
    cmd: String,
    /// TDP override from the config (`[monitor] TdpWatts`), in W.
    tdp_watts: Option<f64>,
}

/// Parse the `Key: value` table lscpu prints.
pub(crate) fn parse_lscpu(out: &str) -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    for line in out.lines() {
        if let Some((key, val)) = line.split_once(':') {
            info.insert(key.trim().to_string(), val.trim().to_string());
        }
    }
    info
}

fn cores_from_table(info: &BTreeMap<String, String>) -> Option<usize> {
    let threads: usize = info.get("CPU(s)")?.parse().ok()?;
    let per_core: usize = info.get("Thread(s) per core")?.parse().ok()?;
    Some(threads / per_core)
}

impl Default for CpuInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuInfo {
    pub fn new() -> Self {
        Self {
            cmd: "lscpu".into(),
            tdp_watts: None,
        }
    }

    pub fn with_command(cmd: &str) -> Self {
        Self {
            cmd: cmd.into(),
            tdp_watts: None,
        }
    }

    pub fn with_tdp_watts(mut self, tdp: Option<f64>) -> Self {
        self.tdp_watts = tdp;
        self
    }

    pub fn available(&self) -> bool {
        run_cmd(&self.cmd, &[]).is_some()
    }

    fn table(&self) -> Option<BTreeMap<String, String>> {
        run_cmd(&self.cmd, &[]).map(|out| parse_lscpu(&out))
    }

    /// Physical core count; falls back to the logical CPU count when lscpu
    /// is unavailable.
    pub fn cores(&self) -> usize {
        self.table()
            .and_then(|t| cores_from_table(&t))
            .unwrap_or_else(num_cpus::get_physical)
    }

    pub fn sockets(&self) -> usize {
        self.table()
            .and_then(|t| t.get("Socket(s)")?.parse().ok())
            .unwrap_or(1)
    }

    /// CPU thermal design power in µW, when configured.
    pub fn tdp_uw(&self) -> Option<f64> {
        self.tdp_watts.map(|w| w * 1e6)
    }

    pub fn info_string(&self) -> String {
        match self.table() {
            Some(t) => {
                let model = t.get("Model name").map(String::as_str).unwrap_or("?");
                let sockets = t.get("Socket(s)").map(String::as_str).unwrap_or("?");
                let threads = t.get("CPU(s)").map(String::as_str).unwrap_or("?");
                let cores = cores_from_table(&t)
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".into());
                format!(
                    "CPU model: {}, sockets/cores/threads: {}/{}/{}",
                    model, sockets, cores, threads
                )
            }
            None => "CPU info not available".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSCPU_OUT: &str = "\
Architecture:        x86_64\n\
CPU(s):              16\n\
Thread(s) per core:  2\n\
Core(s) per socket:  8\n\
Socket(s):           1\n\
Model name:          AMD Ryzen 7 5800X 8-Core Processor\n";

    #[test]
    fn test_parse_lscpu_table() {
        let t = parse_lscpu(LSCPU_OUT);
        assert_eq!(t["CPU(s)"], "16");
        assert_eq!(t["Model name"], "AMD Ryzen 7 5800X 8-Core Processor");
    }

    #[test]
    fn test_core_count() {
        let t = parse_lscpu(LSCPU_OUT);
        assert_eq!(cores_from_table(&t), Some(8));
    }

    #[test]
    fn test_tdp_override() {
        let info = CpuInfo::new().with_tdp_watts(Some(105.0));
        assert_eq!(info.tdp_uw(), Some(105e6));
        let info = CpuInfo::new();
        assert_eq!(info.tdp_uw(), None);
    }
}
