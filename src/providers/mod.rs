//! Eco-signal providers.
//!
//! A provider fetches one or more signal fields from an upstream source
//! (REST API, MQTT topic, file, constant) and normalises them into an
//! [`EcoRecord`]. [`EcoProviderManager`] maps metrics to providers: either
//! one `all` provider supplies the full record, or per-metric providers
//! each contribute their field.

pub mod local;
pub mod mqtt;
pub mod rest;

pub use local::{ConstantProvider, MockProvider};
pub use mqtt::MqttProvider;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::{Config, Section};
use crate::error::{EcoError, Result};
use crate::mqtt::MqttRegistry;
use crate::record::{EcoRecord, IndexValue, Metric};

/// Uniform provider contract.
#[async_trait]
pub trait EcoProvider: Send {
    /// Poll the upstream source. `None` marks a transient failure; the
    /// caller carries the last known values forward.
    async fn get_data(&mut self) -> Option<EcoRecord>;

    /// Provider label as used in the `[provider]` section.
    fn label(&self) -> &'static str;

    /// Polling interval in seconds.
    fn interval(&self) -> u64;

    /// Documented config keys, re-read by `get_provider`.
    fn get_config(&self) -> Section;

    /// Value for the `[provider]` slot referencing this provider.
    fn cfg_string(&self) -> String {
        self.label().to_string()
    }

    fn info_string(&self) -> String {
        format!("{} (interval = {} sec)", self.label(), self.interval())
    }
}

/// Slot a provider occupies in the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Slot {
    All,
    Metric(Metric),
}

impl Slot {
    fn key(&self) -> String {
        match self {
            Slot::All => "all".into(),
            Slot::Metric(m) => m.to_string(),
        }
    }
}

/// Map of metric slots to providers plus the global polling interval.
pub struct EcoProviderManager {
    pub interval: u64,
    providers: BTreeMap<Slot, Box<dyn EcoProvider>>,
}

impl EcoProviderManager {
    pub fn from_config(cfg: &Config, mqtt: &mut MqttRegistry) -> Result<Self> {
        let interval = cfg.get_u64("provider", "interval")?.unwrap_or(600).max(1);
        let mut providers = BTreeMap::new();
        let mut slots = vec![(Slot::All, "all".to_string())];
        slots.extend(Metric::ALL.iter().map(|m| (Slot::Metric(*m), m.to_string())));
        for (slot, key) in slots {
            let Some(label) = cfg.get("provider", &key) else {
                continue;
            };
            let label = label.trim().to_string();
            if label.is_empty() || crate::is_disabled(&label) {
                continue;
            }
            let provider = build_provider(&label, &slot, cfg, interval, mqtt)?;
            providers.insert(slot, provider);
        }
        Ok(Self { interval, providers })
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Fetch and merge one record: the `all` provider first, then the
    /// per-metric contributions on top.
    pub async fn get_data(&mut self) -> EcoRecord {
        let mut record = EcoRecord::default();
        if let Some(p) = self.providers.get_mut(&Slot::All) {
            if let Some(rec) = p.get_data().await {
                record = rec;
            }
        }
        for (slot, p) in self.providers.iter_mut() {
            let Slot::Metric(metric) = slot else {
                continue;
            };
            let data = p.get_data().await;
            match metric {
                Metric::Index => {
                    record.index = data.as_ref().and_then(index_of);
                }
                m => {
                    let val = data.as_ref().and_then(|r| r.field(*m));
                    record.set_field(*m, val);
                }
            }
        }
        record
    }

    pub fn info_string(&self) -> String {
        if self.providers.is_empty() {
            return "None".into();
        }
        self.providers
            .iter()
            .map(|(slot, p)| format!("{} = {}", slot.key(), p.info_string()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Provider configuration as nested sections, for `get_provider`.
    pub fn get_config(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        let mut provider_sec = serde_json::Map::new();
        provider_sec.insert("interval".into(), self.interval.into());
        for (slot, p) in &self.providers {
            provider_sec.insert(slot.key(), p.cfg_string().into());
            let mut sec = serde_json::Map::new();
            for (k, v) in p.get_config() {
                sec.insert(k, v.into());
            }
            root.insert(p.label().to_string(), serde_json::Value::Object(sec));
        }
        root.insert("provider".into(), serde_json::Value::Object(provider_sec));
        serde_json::Value::Object(root)
    }
}

/// Index contribution of a per-metric provider record: an explicit index,
/// or the single-value default slot as an integer level.
fn index_of(rec: &EcoRecord) -> Option<IndexValue> {
    rec.index
        .clone()
        .or_else(|| rec.default.map(|v| IndexValue::Level(v as i64)))
}

fn build_provider(
    label: &str,
    slot: &Slot,
    cfg: &Config,
    interval: u64,
    mqtt: &mut MqttRegistry,
) -> Result<Box<dyn EcoProvider>> {
    // `const:<value>` shorthand binds the literal to the slot's metric
    if let Some(val) = label.strip_prefix("const:") {
        let Slot::Metric(metric) = slot else {
            return Err(EcoError::Config(
                "const:<value> needs a per-metric provider slot".into(),
            ));
        };
        let mut section = Section::new();
        section.insert(metric.to_string(), val.to_string());
        return Ok(Box::new(ConstantProvider::new(&section, interval)?));
    }
    // any `mqtt*` label names its own config section
    if label.starts_with("mqtt") {
        let section = cfg.section(label).cloned().ok_or_else(|| {
            EcoError::Config(format!("missing config section for provider: {}", label))
        })?;
        let handle = mqtt.add_client(label, &section);
        return Ok(Box::new(MqttProvider::new(label, &section, interval, handle)));
    }
    let section = cfg.section_or_empty(label);
    let lower = label.to_ascii_lowercase();
    let provider: Box<dyn EcoProvider> = match lower.as_str() {
        "const" => Box::new(ConstantProvider::new(&section, interval)?),
        "mock" => Box::new(MockProvider::new(&section, interval)?),
        "co2signal" => Box::new(rest::CO2Signal::new(&section, interval)?),
        "electricitymaps" => Box::new(rest::ElectricityMaps::new(&section, interval)?),
        "ukgrid" => Box::new(rest::UkGrid::new(&section, interval)?),
        "watttime" => Box::new(rest::WattTime::new(&section, interval)?),
        "stromgedacht" => Box::new(rest::StromGedacht::new(&section, interval)?),
        "energycharts" => Box::new(rest::EnergyCharts::new(&section, interval)?),
        "gridstatus.io" => Box::new(rest::GridStatusIo::new(&section, interval)?),
        "tibber" => Box::new(rest::Tibber::new(&section, interval)?),
        "octopus" => Box::new(rest::Octopus::new(&section, interval)?),
        "awattar" => Box::new(rest::Awattar::new(&section, interval)?),
        other => {
            return Err(EcoError::Config(format!("unknown eco provider: {}", other)));
        }
    };
    Ok(provider)
}

/// Per-provider interval: the provider section may override the global one.
pub(crate) fn section_interval(section: &Section, glob_interval: u64) -> u64 {
    section
        .get("interval")
        .and_then(|v| v.parse().ok())
        .unwrap_or(glob_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_const_shorthand_and_per_metric_merge() {
        let cfg = Config::from_toml(
            "[provider]\nInterval = 60\nco2 = \"const:300\"\nprice = \"const:25\"\n",
        )
        .unwrap();
        let mut mqtt = MqttRegistry::new();
        let mut mgr = EcoProviderManager::from_config(&cfg, &mut mqtt).unwrap();
        assert_eq!(mgr.interval, 60);
        let rec = mgr.get_data().await;
        assert_eq!(rec.co2, Some(300.0));
        assert_eq!(rec.price, Some(25.0));
        assert_eq!(rec.fossil_pct, None);
    }

    #[tokio::test]
    async fn test_all_slot_supplies_whole_record() {
        let cfg = Config::from_toml(
            "[provider]\nInterval = 30\nall = \"mock\"\n[mock]\nco2range = \"200-200\"\n",
        )
        .unwrap();
        let mut mqtt = MqttRegistry::new();
        let mut mgr = EcoProviderManager::from_config(&cfg, &mut mqtt).unwrap();
        let rec = mgr.get_data().await;
        assert_eq!(rec.co2, Some(200.0));
        assert!(rec.fossil_pct.is_some());
    }

    #[test]
    fn test_unknown_provider_fails_construction() {
        let cfg = Config::from_toml("[provider]\nco2 = \"darkmatter\"\n").unwrap();
        let mut mqtt = MqttRegistry::new();
        assert!(EcoProviderManager::from_config(&cfg, &mut mqtt).is_err());
    }

    #[test]
    fn test_disabled_slot_is_skipped() {
        let cfg = Config::from_toml("[provider]\nco2 = \"none\"\n").unwrap();
        let mut mqtt = MqttRegistry::new();
        let mgr = EcoProviderManager::from_config(&cfg, &mut mqtt).unwrap();
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_get_config_shape() {
        let cfg =
            Config::from_toml("[provider]\nInterval = 120\nco2 = \"const:420\"\n").unwrap();
        let mut mqtt = MqttRegistry::new();
        let mgr = EcoProviderManager::from_config(&cfg, &mut mqtt).unwrap();
        let js = mgr.get_config();
        assert_eq!(js["provider"]["interval"], 120);
        assert_eq!(js["provider"]["co2"], "const:420");
        assert_eq!(js["const"]["co2"], "420");
    }
}
