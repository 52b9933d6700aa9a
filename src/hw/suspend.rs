//! ACPI system sleep adapter (`/sys/power`).

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hw::{read_value, write_value};

/// Suspend-to-RAM variant written to `mem_sleep` before entering `mem`.
pub const S2RAM: &str = "deep";
pub const S2MEM: &str = "mem";
pub const S2IDLE: &str = "s2idle";
pub const S2DISK: &str = "disk";

const DEFAULT_ROOT: &str = "/sys/power";

#[derive(Debug, Clone)]
pub struct Suspend {
    root: PathBuf,
}

impl Default for Suspend {
    fn default() -> Self {
        Self::new()
    }
}

impl Suspend {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn available(&self) -> bool {
        self.root.is_dir()
    }

    /// Sleep states advertised by the kernel, including mem_sleep variants
    /// when `mem` is supported.
    pub fn supported_modes(&self) -> Vec<String> {
        let mut modes = Vec::new();
        if let Ok(states) = read_value(&self.root.join("state")) {
            modes.extend(states.split_whitespace().map(str::to_string));
        }
        if modes.iter().any(|m| m == S2MEM) {
            if let Ok(variants) = read_value(&self.root.join("mem_sleep")) {
                modes.extend(variants.split_whitespace().map(str::to_string));
            }
        }
        modes
    }

    /// Enter the given sleep mode. `deep` selects suspend-to-RAM via
    /// `mem_sleep` and then enters `mem`; other modes go straight to
    /// `state`. The write blocks until resume.
    pub fn suspend(&self, mode: &str) -> Result<()> {
        let state = if mode == S2RAM {
            write_value(&self.root.join("mem_sleep"), S2RAM)?;
            S2MEM
        } else {
            mode
        };
        write_value(&self.root.join("state"), state)?;
        Ok(())
    }

    pub fn info_string(&self) -> String {
        let modes = self.supported_modes();
        let s2ram = if modes.iter().any(|m| m == &format!("[{}]", S2RAM) || m == S2RAM) {
            "YES"
        } else {
            "NO"
        };
        format!(
            "Suspend-to-RAM available: {}, modes: {}",
            s2ram,
            modes.join(" ")
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn fake_power_tree(dir: &Path) -> Suspend {
        fs::write(dir.join("state"), "freeze mem disk\n").unwrap();
        fs::write(dir.join("mem_sleep"), "s2idle [deep]\n").unwrap();
        Suspend::with_root(dir)
    }

    #[test]
    fn test_supported_modes() {
        let dir = tempfile::tempdir().unwrap();
        let sus = fake_power_tree(dir.path());
        let modes = sus.supported_modes();
        assert!(modes.contains(&"mem".to_string()));
        assert!(modes.contains(&"[deep]".to_string()));
    }

    #[test]
    fn test_deep_suspend_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let sus = fake_power_tree(dir.path());
        sus.suspend(S2RAM).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("mem_sleep")).unwrap(), "deep");
        assert_eq!(fs::read_to_string(dir.path().join("state")).unwrap(), "mem");
    }

    #[test]
    fn test_plain_mode_writes_state_only() {
        let dir = tempfile::tempdir().unwrap();
        let sus = fake_power_tree(dir.path());
        sus.suspend(S2IDLE).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("state")).unwrap(), "s2idle");
        // mem_sleep untouched
        assert_eq!(
            fs::read_to_string(dir.path().join("mem_sleep")).unwrap(),
            "s2idle [deep]\n"
        );
    }
}
