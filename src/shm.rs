//! Shared-memory export: one space-separated line rewritten every tick.
//!
//! External clients read `/dev/shm/ecofreq` for sub-provider-interval
//! precision; the control loop extends the accounted totals linearly with
//! the last known signals before writing.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub struct ShmWriter {
    path: PathBuf,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

impl ShmWriter {
    pub fn new() -> Self {
        Self::with_path(crate::SHM_FILE)
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate-rewrite the export line `"<unix_ts> <joules> <co2_g> <cost_ct>"`.
    pub fn write(&self, ts: i64, energy_j: f64, co2_g: f64, cost_ct: f64) -> Result<()> {
        let line = format!(
            "{} {} {} {}",
            ts,
            round3(energy_j),
            round3(co2_g),
            round3(cost_ct)
        );
        std::fs::write(&self.path, line)?;
        Ok(())
    }

    /// Remove the export file on normal shutdown.
    pub fn remove(&self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Default for ShmWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_not_append() {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShmWriter::with_path(dir.path().join("ecofreq"));
        shm.write(1_700_000_000, 100.0, 0.5, 0.25).unwrap();
        shm.write(1_700_000_005, 600.123456, 0.8333, 0.0166).unwrap();
        let content = std::fs::read_to_string(shm.path()).unwrap();
        assert_eq!(content, "1700000005 600.123 0.833 0.017");
        let fields: Vec<&str> = content.split(' ').collect();
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn test_remove_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShmWriter::with_path(dir.path().join("ecofreq"));
        shm.write(0, 0.0, 0.0, 0.0).unwrap();
        assert!(shm.path().exists());
        shm.remove();
        assert!(!shm.path().exists());
        shm.remove();
    }
}
