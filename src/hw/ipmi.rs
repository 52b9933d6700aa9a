//! IPMI DCMI platform power reading.

use crate::hw::run_cmd;

#[derive(Debug, Clone)]
pub struct Ipmi {
    cmd: String,
}

impl Default for Ipmi {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the instantaneous power (W) from `ipmitool dcmi power reading`.
pub(crate) fn parse_power_reading(out: &str) -> Option<f64> {
    for line in out.lines() {
        let mut toks = line.splitn(2, ':');
        let key = toks.next()?.trim();
        if key == "Instantaneous power reading" {
            let val = toks.next()?.trim();
            return val.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

impl Ipmi {
    pub fn new() -> Self {
        Self {
            cmd: "ipmitool".into(),
        }
    }

    pub fn with_command(cmd: &str) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn available(&self) -> bool {
        self.get_power().is_some()
    }

    /// Instantaneous platform power in W.
    pub fn get_power(&self) -> Option<f64> {
        let out = run_cmd(&self.cmd, &["dcmi", "power", "reading"])?;
        parse_power_reading(&out)
    }

    pub fn info_string(&self) -> String {
        format!(
            "IPMI available: {}",
            if self.available() { "YES" } else { "NO" }
        )
    }
}
