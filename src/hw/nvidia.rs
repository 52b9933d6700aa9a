//! NVIDIA GPU management through `nvidia-smi`.
//!
//! Power limits are watts, clocks are MHz, matching the tool's units.
//! Multi-GPU readings are summed for power and reported per-device for
//! limits and clocks.

use crate::error::{EcoError, Result};
use crate::hw::run_cmd;

#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    cmd: String,
}

/// Split `--format=csv,noheader` output into trimmed cell rows.
pub(crate) fn parse_csv(out: &str) -> Vec<Vec<String>> {
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split(',').map(|c| c.trim().to_string()).collect())
        .collect()
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self {
            cmd: "nvidia-smi".into(),
        }
    }

    pub fn with_command(cmd: &str) -> Self {
        Self { cmd: cmd.into() }
    }

    fn query_gpus(&self, fields: &str, fmt: &str, qcmd: &str) -> Option<Vec<Vec<String>>> {
        let out = run_cmd(
            &self.cmd,
            &[&format!("--format={}", fmt), &format!("{}={}", qcmd, fields)],
        )?;
        Some(parse_csv(&out))
    }

    fn query(&self, fields: &str) -> Option<Vec<Vec<String>>> {
        self.query_gpus(fields, "csv,noheader,nounits", "--query-gpu")
    }

    /// Driver present and power management enabled on the first GPU.
    pub fn available(&self) -> bool {
        self.query("power.draw,power.management")
            .and_then(|rows| rows.first().and_then(|r| r.get(1)).cloned())
            .map(|pm| pm.contains("Enabled"))
            .unwrap_or(false)
    }

    fn sum_field(&self, field: &str) -> Option<f64> {
        let rows = self.query(field)?;
        if rows.is_empty() {
            return None;
        }
        let mut sum = 0.0;
        for row in rows {
            sum += row.first()?.parse::<f64>().ok()?;
        }
        Some(sum)
    }

    /// Current power draw summed over all GPUs, in W.
    pub fn get_power(&self) -> Option<f64> {
        self.sum_field("power.draw")
    }

    /// Active power limit summed over all GPUs, in W.
    pub fn get_power_limit(&self) -> Option<f64> {
        self.sum_field("power.limit")
    }

    /// Per-device `(min, max, current)` power limits in W.
    pub fn power_limit_all(&self) -> Option<Vec<(f64, f64, f64)>> {
        let rows = self.query("power.min_limit,power.max_limit,power.limit")?;
        let mut limits = Vec::with_capacity(rows.len());
        for row in rows {
            let min = row.first()?.parse().ok()?;
            let max = row.get(1)?.parse().ok()?;
            let cur = row.get(2)?.parse().ok()?;
            limits.push((min, max, cur));
        }
        Some(limits)
    }

    pub fn set_power_limit(&self, power_w: f64) -> Result<()> {
        run_cmd(&self.cmd, &["-pl", &power_w.to_string()])
            .map(|_| ())
            .ok_or_else(|| EcoError::CommandFailed("nvidia-smi -pl".into()))
    }

    /// Per-device maximum graphics clock in MHz.
    pub fn hw_max_freq(&self) -> Option<Vec<f64>> {
        let rows = self.query("clocks.max.gr")?;
        rows.iter().map(|r| r.first()?.parse().ok()).collect()
    }

    /// Cap the graphics clock range to `0..freq` MHz and enable persistent
    /// mode so the cap survives driver unloads.
    pub fn set_freq_limit(&self, max_freq_mhz: f64) -> Result<()> {
        run_cmd(
            &self.cmd,
            &["-lgc", &format!("0,{}", max_freq_mhz as u64), "--mode=1"],
        )
        .map(|_| ())
        .ok_or_else(|| EcoError::CommandFailed("nvidia-smi -lgc".into()))
    }

    /// Restore the driver default clock range.
    pub fn reset_freq_limit(&self) -> Result<()> {
        run_cmd(&self.cmd, &["-rgc"])
            .map(|_| ())
            .ok_or_else(|| EcoError::CommandFailed("nvidia-smi -rgc".into()))
    }

    pub fn info_string(&self) -> String {
        match self.query_gpus(
            "name,power.min_limit,power.max_limit,power.limit",
            "csv,noheader",
            "--query-gpu",
        ) {
            Some(rows) if !rows.is_empty() => rows
                .iter()
                .enumerate()
                .map(|(i, gi)| {
                    format!(
                        "GPU{}: {}, min_hw_limit = {}, max_hw_limit = {}, current_limit = {}",
                        i,
                        gi.first().map(String::as_str).unwrap_or("?"),
                        gi.get(1).map(String::as_str).unwrap_or("?"),
                        gi.get(2).map(String::as_str).unwrap_or("?"),
                        gi.get(3).map(String::as_str).unwrap_or("?"),
                    )
                })
                .collect::<Vec<_>>()
                .join("; "),
            _ => "NVIDIA driver not found".into(),
        }
    }
}
