//! The normalised eco-signal record and its field selectors.
//!
//! [`EcoRecord`] is the sole contract between providers and policies: every
//! provider normalises its upstream schema into this shape, and every policy
//! selects exactly one field through its configured [`Metric`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EcoError;

/// Discrete grid state tag, either symbolic (`"green"`) or numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexValue {
    Level(i64),
    Tag(String),
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Level(v) => write!(f, "{}", v),
            IndexValue::Tag(s) => write!(f, "{}", s),
        }
    }
}

/// Normalised signal carrier produced by every provider poll.
///
/// All fields are optional; a missing field means the corresponding signal
/// is unknown for this period and the last known value is carried forward
/// by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcoRecord {
    /// Carbon intensity in g CO₂-eq per kWh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
    /// Electricity price in ct/kWh (canonicalised).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Tax component of the price in ct/kWh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax: Option<f64>,
    /// Fossil share of generation, 0–100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fossil_pct: Option<f64>,
    /// Renewable share of generation, 0–100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ren_pct: Option<f64>,
    /// Vendor-defined grid state index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexValue>,
    /// Single-value providers (MQTT) publish here; metric selection falls
    /// back to this field when the requested one is absent.
    #[serde(rename = "_default", skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
}

/// Signal value handed to a governor.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Num(f64),
    Tag(String),
}

impl Signal {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Signal::Num(v) => Some(*v),
            Signal::Tag(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Num(v) => {
                if v.fract() == 0.0 {
                    write!(f, "{}", *v as i64)
                } else {
                    write!(f, "{}", v)
                }
            }
            Signal::Tag(s) => write!(f, "{}", s),
        }
    }
}

/// Metric a provider supplies or a policy consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Co2,
    Price,
    FossilPct,
    RenPct,
    Index,
}

impl Metric {
    /// Per-metric provider slots recognised in the `[provider]` section.
    pub const ALL: [Metric; 4] = [Metric::Co2, Metric::Price, Metric::Index, Metric::FossilPct];
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Co2
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Metric::Co2 => "co2",
            Metric::Price => "price",
            Metric::FossilPct => "fossil_pct",
            Metric::RenPct => "ren_pct",
            Metric::Index => "index",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Metric {
    type Err = EcoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "co2" => Ok(Metric::Co2),
            "price" => Ok(Metric::Price),
            "fossil_pct" => Ok(Metric::FossilPct),
            "ren_pct" => Ok(Metric::RenPct),
            "index" => Ok(Metric::Index),
            other => Err(EcoError::Config(format!("unknown metric: {}", other))),
        }
    }
}

impl EcoRecord {
    /// Numeric value of a field, falling back to the provider default slot.
    pub fn field(&self, metric: Metric) -> Option<f64> {
        let val = match metric {
            Metric::Co2 => self.co2,
            Metric::Price => self.price,
            Metric::FossilPct => self.fossil_pct,
            Metric::RenPct => self.ren_pct,
            Metric::Index => match &self.index {
                Some(IndexValue::Level(v)) => Some(*v as f64),
                _ => None,
            },
        };
        val.or(self.default)
    }

    /// Signal for a governor: numeric fields as numbers, index tags as tags.
    pub fn signal(&self, metric: Metric) -> Option<Signal> {
        if metric == Metric::Index {
            if let Some(idx) = &self.index {
                return Some(match idx {
                    IndexValue::Level(v) => Signal::Num(*v as f64),
                    IndexValue::Tag(s) => Signal::Tag(s.clone()),
                });
            }
        }
        self.field(metric).map(Signal::Num)
    }

    /// Store a per-metric provider contribution.
    pub fn set_field(&mut self, metric: Metric, val: Option<f64>) {
        match metric {
            Metric::Co2 => self.co2 = val,
            Metric::Price => self.price = val,
            Metric::FossilPct => self.fossil_pct = val,
            Metric::RenPct => self.ren_pct = val,
            Metric::Index => self.index = val.map(|v| IndexValue::Level(v as i64)),
        }
    }
}

/// Canonicalisation factor for an upstream price unit string.
///
/// Prices are kept in ct/kWh internally; unknown or missing units pass
/// through unscaled.
pub fn price_unit_factor(unit: &str) -> f64 {
    match unit.to_ascii_lowercase().as_str() {
        "ct/kwh" => 1.0,
        "eur/kwh" => 100.0,
        "eur/mwh" => 0.1,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_selection() {
        let rec = EcoRecord {
            co2: Some(250.0),
            price: Some(31.5),
            ..Default::default()
        };
        assert_eq!(rec.field(Metric::Co2), Some(250.0));
        assert_eq!(rec.field(Metric::Price), Some(31.5));
        assert_eq!(rec.field(Metric::FossilPct), None);
    }

    #[test]
    fn test_default_fallback() {
        let rec = EcoRecord {
            default: Some(410.0),
            ..Default::default()
        };
        assert_eq!(rec.field(Metric::Co2), Some(410.0));
        assert_eq!(rec.field(Metric::Price), Some(410.0));
    }

    #[test]
    fn test_index_signal() {
        let rec = EcoRecord {
            index: Some(IndexValue::Tag("red".into())),
            ..Default::default()
        };
        assert_eq!(rec.signal(Metric::Index), Some(Signal::Tag("red".into())));

        let rec = EcoRecord {
            index: Some(IndexValue::Level(3)),
            ..Default::default()
        };
        assert_eq!(rec.signal(Metric::Index), Some(Signal::Num(3.0)));
        assert_eq!(rec.field(Metric::Index), Some(3.0));
    }

    #[test]
    fn test_price_units() {
        assert_eq!(price_unit_factor("ct/kWh"), 1.0);
        assert_eq!(price_unit_factor("Eur/kWh"), 100.0);
        assert_eq!(price_unit_factor("eur/mwh"), 0.1);
        assert_eq!(price_unit_factor("usd/gal"), 1.0);
        assert_eq!(price_unit_factor(""), 1.0);
    }

    #[test]
    fn test_serde_wire_shape() {
        let rec = EcoRecord {
            co2: Some(200.0),
            index: Some(IndexValue::Tag("green".into())),
            ..Default::default()
        };
        let js = serde_json::to_value(&rec).unwrap();
        assert_eq!(js["co2"], 200.0);
        assert_eq!(js["index"], "green");
        assert!(js.get("price").is_none());
        let back: EcoRecord = serde_json::from_value(js).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_metric_roundtrip() {
        for m in [Metric::Co2, Metric::Price, Metric::FossilPct, Metric::RenPct, Metric::Index] {
            assert_eq!(m.to_string().parse::<Metric>().unwrap(), m);
        }
        assert!("joules".parse::<Metric>().is_err());
    }
}
