//! Daemon configuration.
//!
//! The config file is an INI-like TOML document: every top-level table is a
//! section (`[general]`, `[provider]`, `[policy]`, `[monitor]`, `[idle]`,
//! `[server]`, plus one section per configured provider). Keys are matched
//! case-insensitively and values are kept as strings, so live
//! reconfiguration over IPC can merge partial updates the same way the
//! config file itself is read.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EcoError, Result};

/// One config section: lowercased keys to raw string values.
pub type Section = BTreeMap<String, String>;

/// Full daemon configuration as an ordered section map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    sections: BTreeMap<String, Section>,
}

fn toml_to_string(val: &toml::Value) -> String {
    match val {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Config {
    /// Built-in defaults, applied before the config file is read.
    pub fn with_defaults() -> Self {
        let mut cfg = Config::default();
        cfg.set("general", "logfile", crate::LOG_FILE);
        cfg.set("provider", "interval", "600");
        cfg.set("policy", "control", "auto");
        cfg.set("policy", "governor", "linear");
        cfg.set("policy", "co2range", "auto");
        cfg.set("monitor", "powersensor", "auto");
        cfg.set("monitor", "interval", "5");
        cfg
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut cfg = Config::with_defaults();
        cfg.merge_toml(content)?;
        Ok(cfg)
    }

    /// Load a config file on top of the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EcoError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Merge a TOML document into this config.
    pub fn merge_toml(&mut self, content: &str) -> Result<()> {
        let doc: toml::Value = content
            .parse()
            .map_err(|e| EcoError::Config(format!("TOML parse error: {}", e)))?;
        let table = doc
            .as_table()
            .ok_or_else(|| EcoError::Config("config root must be a table".into()))?;
        for (name, val) in table {
            match val {
                toml::Value::Table(sec) => {
                    for (k, v) in sec {
                        self.set(name, k, &toml_to_string(v));
                    }
                }
                other => {
                    // bare top-level keys land in [general]
                    self.set("general", name, &toml_to_string(other));
                }
            }
        }
        Ok(())
    }

    /// Merge a nested JSON object (`{section: {key: value}}`), as received
    /// from the `set_provider` IPC command.
    pub fn merge_json(&mut self, obj: &serde_json::Value) -> Result<()> {
        let table = obj
            .as_object()
            .ok_or_else(|| EcoError::Config("expected a JSON object of sections".into()))?;
        for (name, val) in table {
            let sec = val
                .as_object()
                .ok_or_else(|| EcoError::Config(format!("section {} must be an object", name)))?;
            for (k, v) in sec {
                self.set(name, k, &json_to_string(v));
            }
        }
        Ok(())
    }

    pub fn set(&mut self, section: &str, key: &str, val: &str) {
        self.sections
            .entry(section.to_ascii_lowercase())
            .or_default()
            .insert(key.to_ascii_lowercase(), val.to_string());
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(&section.to_ascii_lowercase())
    }

    pub fn section(&self, section: &str) -> Option<&Section> {
        self.sections.get(&section.to_ascii_lowercase())
    }

    /// Section contents, or an empty section when absent.
    pub fn section_or_empty(&self, section: &str) -> Section {
        self.section(section).cloned().unwrap_or_default()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)
            .and_then(|s| s.get(&key.to_ascii_lowercase()))
            .map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    pub fn get_u64(&self, section: &str, key: &str) -> Result<Option<u64>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| EcoError::Config(format!("[{}] {}: not an integer: {}", section, key, v))),
        }
    }

    pub fn get_f64(&self, section: &str, key: &str) -> Result<Option<f64>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| EcoError::Config(format!("[{}] {}: not a number: {}", section, key, v))),
        }
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.get(section, key).map(crate::parse_bool)
    }

    /// Effective policy section for a domain: `[cpu_policy]`/`[gpu_policy]`
    /// when present, the shared `[policy]` section otherwise.
    pub fn domain_policy_section(&self, domain: &str) -> Section {
        let specific = format!("{}_policy", domain);
        if let Some(s) = self.section(&specific) {
            s.clone()
        } else {
            self.section_or_empty("policy")
        }
    }
}

/// Command-line overrides applied on top of the loaded file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_file: Option<String>,
    pub governor: Option<String>,
    pub co2token: Option<String>,
    pub interval: Option<u64>,
}

impl CliOverrides {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(ref f) = self.log_file {
            cfg.set("general", "logfile", f);
        }
        if let Some(ref g) = self.governor {
            cfg.set("policy", "governor", g);
        }
        if let Some(ref t) = self.co2token {
            cfg.set("co2signal", "token", t);
        }
        if let Some(i) = self.interval {
            cfg.set("provider", "interval", &i.to_string());
        }
    }
}
