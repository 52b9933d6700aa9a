//! Scaling policies: a governor bound to a hardware actuator.
//!
//! A policy owns the discovered actuator range, the parsed governor and the
//! adapter it drives. [`EcoPolicyManager`] keeps at most one active policy
//! per domain (CPU and GPU are independent), fans the selected signal out to
//! all of them, and guarantees that an outgoing policy is reset exactly once
//! — and only after its replacement validated.

pub mod cpu;
pub mod gpu;
pub mod idle;

pub use cpu::{CpuCgroupPolicy, CpuDockerPolicy, CpuFreqPolicy, CpuPowerPolicy};
pub use gpu::{GpuFreqPolicy, GpuPowerPolicy};
pub use idle::SuspendIdlePolicy;

use std::path::PathBuf;

use crate::config::{Config, Section};
use crate::error::Result;
use crate::record::{EcoRecord, Metric, Signal};

/// Actuator domain a policy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Cpu,
    Gpu,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Cpu => write!(f, "cpu"),
            Domain::Gpu => write!(f, "gpu"),
        }
    }
}

/// Uniform contract every scaling policy implements.
pub trait EcoPolicy: Send {
    fn domain(&self) -> Domain;
    /// Apply the governor's setpoint for a new signal value.
    fn set_signal(&mut self, signal: &Signal);
    /// Drive the actuator back to its safe maximum.
    fn reset(&mut self);
    fn info_string(&self) -> String;
    /// Control/governor pair as re-parseable config keys.
    fn get_config(&self) -> Section;
}

/// Adapter bundle the policy constructors draw from; tests substitute
/// scratch roots and stub commands.
#[derive(Debug, Clone)]
pub struct PolicyHw {
    pub cpufreq: crate::hw::CpuFreq,
    pub powercap: crate::hw::Powercap,
    pub esmi: crate::hw::AmdEsmi,
    pub nvidia: crate::hw::NvidiaSmi,
    pub docker: crate::hw::DockerCli,
    pub cpuinfo: crate::hw::CpuInfo,
    pub cgroup_root: PathBuf,
}

impl Default for PolicyHw {
    fn default() -> Self {
        Self {
            cpufreq: crate::hw::CpuFreq::new(),
            powercap: crate::hw::Powercap::new(),
            esmi: crate::hw::AmdEsmi::new(),
            nvidia: crate::hw::NvidiaSmi::new(),
            docker: crate::hw::DockerCli::new(),
            cpuinfo: crate::hw::CpuInfo::new(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

/// Per-domain policy sections plus the shared metric for one (re)configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicySetup {
    pub cpu: Option<Section>,
    pub gpu: Option<Section>,
    pub metric: Metric,
}

impl PolicySetup {
    /// Setup from the static config sections (`[policy]`, `[cpu_policy]`,
    /// `[gpu_policy]`).
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let cpu = cfg.domain_policy_section("cpu");
        let gpu = cfg.domain_policy_section("gpu");
        let metric = cpu
            .get("metric")
            .map(|m| m.parse())
            .transpose()?
            .unwrap_or(Metric::Co2);
        Ok(Self {
            cpu: Some(cpu),
            gpu: Some(gpu),
            metric,
        })
    }
}

/// Owner of the active per-domain policies.
pub struct EcoPolicyManager {
    policies: Vec<Box<dyn EcoPolicy>>,
    metric: Metric,
    hw: PolicyHw,
}

impl EcoPolicyManager {
    pub fn from_config(cfg: &Config, hw: PolicyHw) -> Result<Self> {
        let setup = PolicySetup::from_config(cfg)?;
        let policies = build_policies(&setup, &hw)?;
        Ok(Self {
            policies,
            metric: setup.metric,
            hw,
        })
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Replace the active policies atomically: the incoming set is
    /// constructed and validated first; only then is the outgoing set reset
    /// and retired. On error the previous policies stay installed untouched.
    pub fn set_config(&mut self, setup: &PolicySetup) -> Result<()> {
        let new_policies = build_policies(setup, &self.hw)?;
        self.reset();
        self.policies = new_policies;
        self.metric = setup.metric;
        Ok(())
    }

    /// Apply the configured metric of a fresh record to every policy.
    /// A missing signal leaves the actuators untouched (carry-forward).
    pub fn set_record(&mut self, record: &EcoRecord) {
        if let Some(signal) = record.signal(self.metric) {
            for p in &mut self.policies {
                p.set_signal(&signal);
            }
        }
    }

    /// Drive all actuators back to their safe maxima.
    pub fn reset(&mut self) {
        for p in &mut self.policies {
            p.reset();
        }
    }

    pub fn info_string(&self) -> String {
        if self.policies.is_empty() {
            return "None".into();
        }
        let mut parts: Vec<String> = self.policies.iter().map(|p| p.info_string()).collect();
        parts.push(format!("metric = {}", self.metric));
        parts.join(", ")
    }

    /// Nested per-domain config, as returned by the `get_policy` command.
    pub fn get_config(&self) -> serde_json::Value {
        let mut res = serde_json::Map::new();
        for p in &self.policies {
            let mut sec = serde_json::Map::new();
            for (k, v) in p.get_config() {
                sec.insert(k, serde_json::Value::String(v));
            }
            sec.insert(
                "metric".into(),
                serde_json::Value::String(self.metric.to_string()),
            );
            res.insert(p.domain().to_string(), serde_json::Value::Object(sec));
        }
        serde_json::Value::Object(res)
    }
}

fn build_policies(setup: &PolicySetup, hw: &PolicyHw) -> Result<Vec<Box<dyn EcoPolicy>>> {
    let mut policies: Vec<Box<dyn EcoPolicy>> = Vec::new();
    if let Some(sec) = &setup.cpu {
        if let Some(p) = cpu::from_config(sec, hw)? {
            policies.push(p);
        }
    }
    if let Some(sec) = &setup.gpu {
        if let Some(p) = gpu::from_config(sec, hw)? {
            policies.push(p);
        }
    }
    Ok(policies)
}

/// Governor spec lookup shared by the policy constructors.
pub(crate) fn governor_from_section(
    section: &Section,
    vmin: f64,
    vmax: f64,
    units: &[crate::governor::Unit],
) -> Result<Option<crate::governor::Governor>> {
    let spec = section.get("governor").map(String::as_str).unwrap_or("linear");
    let default_spec = section.get("defaultgovernor").map(String::as_str);
    crate::governor::Governor::parse(spec, default_spec, vmin, vmax, units)
}

pub(crate) fn section_get<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    section.get(key).map(String::as_str)
}
