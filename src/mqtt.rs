//! MQTT client registry.
//!
//! Each configured MQTT endpoint (power sensor, eco-signal subscription,
//! info publisher) gets one client task on the shared runtime. Subscriptions
//! keep only the most recent payload ("last value wins"); publishes drain a
//! queue. Connections are retried with a fixed 5-second backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::config::Section;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection settings for one client, from its config section.
#[derive(Debug, Clone)]
pub struct MqttClientCfg {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sub_topic: Option<String>,
    pub pub_topic: Option<String>,
    /// Restrict published records to these keys.
    pub pub_fields: Option<Vec<String>>,
}

impl MqttClientCfg {
    pub fn from_section(section: &Section) -> Self {
        Self {
            host: section.get("host").cloned().unwrap_or_else(|| "localhost".into()),
            port: section
                .get("port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            username: section.get("username").cloned(),
            password: section.get("password").cloned(),
            sub_topic: section.get("topic").cloned(),
            pub_topic: section.get("pubtopic").cloned(),
            pub_fields: section
                .get("pubfields")
                .map(|f| f.split(',').map(|s| s.trim().to_string()).collect()),
        }
    }
}

/// Cheap handle onto a client's last received payload and publish queue.
#[derive(Debug, Clone)]
pub struct MqttHandle {
    last_msg: Arc<Mutex<Option<String>>>,
    pub_tx: mpsc::UnboundedSender<serde_json::Value>,
    pub_fields: Option<Vec<String>>,
}

impl MqttHandle {
    /// Most recent payload on the subscribed topic.
    pub fn last_value(&self) -> Option<String> {
        self.last_msg.lock().ok()?.clone()
    }

    pub fn last_f64(&self) -> Option<f64> {
        self.last_value()?.trim().parse().ok()
    }

    /// Queue a JSON object for publishing, filtered to the configured
    /// fields when a `pubfields` list is set.
    pub fn publish(&self, data: &serde_json::Value) {
        let payload = match (&self.pub_fields, data.as_object()) {
            (Some(fields), Some(obj)) => {
                let filtered: serde_json::Map<String, serde_json::Value> = obj
                    .iter()
                    .filter(|(k, _)| fields.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                serde_json::Value::Object(filtered)
            }
            _ => data.clone(),
        };
        let _ = self.pub_tx.send(payload);
    }
}

struct ClientSpec {
    label: String,
    cfg: MqttClientCfg,
    last_msg: Arc<Mutex<Option<String>>>,
    pub_rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

/// Owner of all MQTT clients of the daemon.
#[derive(Default)]
pub struct MqttRegistry {
    handles: HashMap<String, MqttHandle>,
    pending: Vec<ClientSpec>,
}

impl MqttRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client for a config section; the connection task starts
    /// with [`MqttRegistry::spawn_all`].
    pub fn add_client(&mut self, label: &str, section: &Section) -> MqttHandle {
        if let Some(handle) = self.handles.get(label) {
            return handle.clone();
        }
        let cfg = MqttClientCfg::from_section(section);
        let last_msg = Arc::new(Mutex::new(None));
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        let handle = MqttHandle {
            last_msg: last_msg.clone(),
            pub_tx,
            pub_fields: cfg.pub_fields.clone(),
        };
        self.handles.insert(label.to_string(), handle.clone());
        self.pending.push(ClientSpec {
            label: label.to_string(),
            cfg,
            last_msg,
            pub_rx,
        });
        handle
    }

    pub fn get(&self, label: &str) -> Option<MqttHandle> {
        self.handles.get(label).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawn one connection task per registered client.
    pub fn spawn_all(&mut self) {
        for spec in self.pending.drain(..) {
            tokio::spawn(run_client(spec));
        }
    }
}

async fn run_client(mut spec: ClientSpec) {
    loop {
        info!("mqtt[{}]: connecting to {}:{}", spec.label, spec.cfg.host, spec.cfg.port);
        let mut opts = MqttOptions::new(
            format!("ecofreq-{}", spec.label),
            spec.cfg.host.clone(),
            spec.cfg.port,
        );
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&spec.cfg.username, &spec.cfg.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let (client, mut eventloop) = AsyncClient::new(opts, 16);
        if let Some(topic) = &spec.cfg.sub_topic {
            if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                warn!("mqtt[{}]: subscribe failed: {}", spec.label, e);
            }
        }
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        let payload = String::from_utf8_lossy(&msg.payload).to_string();
                        if let Ok(mut last) = spec.last_msg.lock() {
                            *last = Some(payload);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt[{}]: connection error: {}", spec.label, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        break;
                    }
                },
                data = spec.pub_rx.recv() => {
                    let Some(data) = data else { return };
                    if let Some(topic) = &spec.cfg.pub_topic {
                        let payload = data.to_string();
                        if let Err(e) = client
                            .publish(topic.clone(), QoS::AtMostOnce, false, payload.into_bytes())
                            .await
                        {
                            warn!("mqtt[{}]: publish failed: {}", spec.label, e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sec(pairs: &[(&str, &str)]) -> Section {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_cfg_from_section() {
        let s = sec(&[
            ("host", "broker.local"),
            ("port", "8883"),
            ("topic", "power/meter"),
            ("pubfields", "total_energy_j, total_co2"),
        ]);
        let cfg = MqttClientCfg::from_section(&s);
        assert_eq!(cfg.host, "broker.local");
        assert_eq!(cfg.port, 8883);
        assert_eq!(cfg.sub_topic.as_deref(), Some("power/meter"));
        assert_eq!(
            cfg.pub_fields,
            Some(vec!["total_energy_j".to_string(), "total_co2".to_string()])
        );
    }

    #[test]
    fn test_registry_deduplicates_labels() {
        let mut reg = MqttRegistry::new();
        let s = sec(&[("host", "localhost"), ("topic", "t")]);
        let h1 = reg.add_client("mqtt_power", &s);
        let h2 = reg.add_client("mqtt_power", &s);
        // same underlying slot
        if let Ok(mut m) = h1.last_msg.lock() {
            *m = Some("42".into());
        }
        assert_eq!(h2.last_f64(), Some(42.0));
        assert_eq!(reg.pending.len(), 1);
    }

    #[test]
    fn test_publish_field_filter() {
        let mut reg = MqttRegistry::new();
        let s = sec(&[("pubtopic", "out"), ("pubfields", "a")]);
        let h = reg.add_client("mqtt_logger", &s);
        h.publish(&serde_json::json!({"a": 1, "b": 2}));
        let spec = &mut reg.pending[0];
        let sent = spec.pub_rx.try_recv().unwrap();
        assert_eq!(sent, serde_json::json!({"a": 1}));
    }
}
