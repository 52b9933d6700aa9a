//! Docker CLI adapter for container CPU quotas and pausing.

use crate::error::{EcoError, Result};
use crate::hw::run_cmd;

#[derive(Debug, Clone)]
pub struct DockerCli {
    cmd: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            cmd: "docker".into(),
        }
    }

    pub fn with_command(cmd: &str) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn available(&self) -> bool {
        run_cmd(&self.cmd, &["-v"]).is_some()
    }

    /// IDs of all running containers.
    pub fn container_ids(&self) -> Result<Vec<String>> {
        let out = run_cmd(&self.cmd, &["ps", "--format", "{{.ID}}"])
            .ok_or_else(|| EcoError::CommandFailed("docker ps".into()))?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Apply `--cpus` to the given containers, or to all running ones when
    /// the list is empty.
    pub fn set_container_cpus(&self, ctrs: &[String], cpus: f64) -> Result<()> {
        let targets = if ctrs.is_empty() {
            self.container_ids()?
        } else {
            ctrs.to_vec()
        };
        let cpus = cpus.to_string();
        for c in &targets {
            run_cmd(&self.cmd, &["container", "update", "--cpus", &cpus, c])
                .ok_or_else(|| EcoError::CommandFailed(format!("docker update {}", c)))?;
        }
        Ok(())
    }

    /// Pause or unpause containers (`-a` for all when no list is given).
    pub fn set_pause(&self, ctrs: &[String], pause: bool) -> Result<()> {
        let verb = if pause { "pause" } else { "unpause" };
        let mut args: Vec<&str> = vec![verb];
        if ctrs.is_empty() {
            args.push("-a");
        } else {
            args.extend(ctrs.iter().map(String::as_str));
        }
        run_cmd(&self.cmd, &args)
            .map(|_| ())
            .ok_or_else(|| EcoError::CommandFailed(format!("docker {}", verb)))
    }
}
