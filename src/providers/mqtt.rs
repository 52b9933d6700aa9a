//! MQTT eco-signal provider: subscribes to a topic, last value wins.

use async_trait::async_trait;

use crate::config::Section;
use crate::mqtt::MqttHandle;
use crate::record::EcoRecord;

use super::{section_interval, EcoProvider};

/// Single-value provider fed by an MQTT subscription. The value lands in
/// the record's default slot, so it serves whichever metric the slot is
/// bound to.
pub struct MqttProvider {
    label: String,
    topic: Option<String>,
    interval: u64,
    handle: MqttHandle,
}

impl MqttProvider {
    pub fn new(label: &str, section: &Section, glob_interval: u64, handle: MqttHandle) -> Self {
        Self {
            label: label.to_string(),
            topic: section.get("topic").cloned(),
            interval: section_interval(section, glob_interval),
            handle,
        }
    }
}

#[async_trait]
impl EcoProvider for MqttProvider {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        Some(EcoRecord {
            default: self.handle.last_f64(),
            ..Default::default()
        })
    }

    fn label(&self) -> &'static str {
        "mqtt"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn cfg_string(&self) -> String {
        self.label.clone()
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("label".into(), self.label.clone());
        if let Some(t) = &self.topic {
            cfg.insert("topic".into(), t.clone());
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MqttRegistry;

    #[tokio::test]
    async fn test_default_slot_carries_value() {
        let mut reg = MqttRegistry::new();
        let mut section = Section::new();
        section.insert("topic".into(), "grid/price".into());
        let handle = reg.add_client("mqtt_price", &section);
        let mut p = MqttProvider::new("mqtt_price", &section, 300, handle);
        // nothing received yet
        let rec = p.get_data().await.unwrap();
        assert_eq!(rec.default, None);
        assert_eq!(p.cfg_string(), "mqtt_price");
        assert_eq!(p.get_config().get("topic").map(String::as_str), Some("grid/price"));
    }
}
