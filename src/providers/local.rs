//! I/O-free providers: fixed constants and the mock replay/random source.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use rand::Rng;

use crate::config::Section;
use crate::error::{EcoError, Result};
use crate::record::{EcoRecord, IndexValue, Metric};

use super::{section_interval, EcoProvider};

/// Emits one fixed metric value, no I/O.
pub struct ConstantProvider {
    interval: u64,
    metric: Metric,
    value: f64,
}

impl ConstantProvider {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let mut found = None;
        for (k, v) in section {
            if k == "interval" {
                continue;
            }
            let metric: Metric = k.parse()?;
            let value: f64 = v
                .parse()
                .map_err(|_| EcoError::Config(format!("const provider: bad value: {}", v)))?;
            found = Some((metric, value));
        }
        let (metric, value) = found
            .ok_or_else(|| EcoError::Config("const provider needs a <metric> = <value> pair".into()))?;
        Ok(Self {
            interval,
            metric,
            value,
        })
    }
}

#[async_trait]
impl EcoProvider for ConstantProvider {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let mut rec = EcoRecord::default();
        rec.set_field(self.metric, Some(self.value));
        Some(rec)
    }

    fn label(&self) -> &'static str {
        "const"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn cfg_string(&self) -> String {
        format!("const:{}", self.value)
    }

    fn info_string(&self) -> String {
        self.cfg_string()
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert(self.metric.to_string(), self.value.to_string());
        cfg
    }
}

/// Replays a recorded report log in a ring, or draws uniform random CO₂
/// values from a configured range.
pub struct MockProvider {
    interval: u64,
    co2min: i64,
    co2max: i64,
    co2file: Option<String>,
    co2_ring: Option<VecDeque<Option<f64>>>,
    fossil_ring: Option<VecDeque<Option<f64>>>,
    price_ring: Option<VecDeque<Option<f64>>>,
    index_ring: Option<VecDeque<Option<String>>>,
}

/// Column indices discovered from a report-log header line.
#[derive(Debug, Clone, PartialEq)]
struct MockColumns {
    co2: usize,
    fossil: Option<usize>,
    price: Option<(usize, f64)>,
    index: Option<usize>,
}

impl Default for MockColumns {
    fn default() -> Self {
        // headerless files carry co2 and fossil share in the first columns
        Self {
            co2: 0,
            fossil: Some(1),
            price: None,
            index: None,
        }
    }
}

fn parse_header(line: &str) -> MockColumns {
    let toks: Vec<String> = line
        .trim_start_matches('#')
        .split('\t')
        .map(|t| t.trim().to_string())
        .collect();
    let find = |name: &str| toks.iter().position(|t| t == name);
    let co2 = find("CI [g/kWh]").or_else(|| find("gCO2/kWh")).unwrap_or(0);
    let fossil = find("Fossil [%]");
    let price = find("Price/kWh")
        .map(|i| (i, 1.0))
        .or_else(|| find("EUR/MWh").map(|i| (i, 0.1)));
    let index = find("co2index").or_else(|| find("Index"));
    MockColumns {
        co2,
        fossil,
        price,
        index,
    }
}

fn parse_cell(toks: &[&str], field: usize) -> Option<f64> {
    let cell = toks.get(field)?.trim();
    if cell == "NA" {
        None
    } else {
        cell.parse().ok()
    }
}

impl MockProvider {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let co2range = section.get("co2range").map(String::as_str).unwrap_or("100-800");
        let (co2min, co2max) = co2range
            .split_once('-')
            .and_then(|(lo, hi)| Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)))
            .ok_or_else(|| EcoError::Config(format!("mock: bad co2range: {}", co2range)))?;
        let co2file = section.get("co2file").cloned();
        let mut provider = Self {
            interval,
            co2min,
            co2max,
            co2file,
            co2_ring: None,
            fossil_ring: None,
            price_ring: None,
            index_ring: None,
        };
        if let Some(fname) = provider.co2file.clone() {
            provider.read_co2_file(Path::new(&fname))?;
        }
        Ok(provider)
    }

    fn read_co2_file(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(EcoError::Config(format!("file not found: {}", path.display())));
        }
        let content = std::fs::read_to_string(path)?;
        let mut cols = MockColumns::default();
        let mut co2_ring = VecDeque::new();
        let mut fossil_ring = VecDeque::new();
        let mut price_ring = VecDeque::new();
        let mut index_ring = VecDeque::new();
        for line in content.lines() {
            if line.starts_with("##") {
                continue;
            }
            if let Some(header) = line.strip_prefix('#') {
                cols = parse_header(header);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let toks: Vec<&str> = line.split('\t').collect();
            co2_ring.push_back(parse_cell(&toks, cols.co2));
            if let Some(f) = cols.fossil {
                if f < toks.len() {
                    fossil_ring.push_back(parse_cell(&toks, f));
                }
            }
            if let Some((p, factor)) = cols.price {
                if p < toks.len() {
                    price_ring.push_back(parse_cell(&toks, p).map(|v| v * factor));
                }
            }
            if let Some(i) = cols.index {
                if i < toks.len() {
                    let cell = toks[i].trim();
                    index_ring.push_back(if cell == "NA" {
                        None
                    } else {
                        Some(cell.to_string())
                    });
                }
            }
        }
        self.co2_ring = Some(co2_ring);
        self.fossil_ring = (!fossil_ring.is_empty()).then_some(fossil_ring);
        self.price_ring = (!price_ring.is_empty()).then_some(price_ring);
        self.index_ring = (!index_ring.is_empty()).then_some(index_ring);
        Ok(())
    }

    fn rotate<T: Clone>(ring: &mut Option<VecDeque<T>>) -> Option<T> {
        let q = ring.as_mut()?;
        let head = q.pop_front()?;
        q.push_back(head.clone());
        Some(head)
    }
}

#[async_trait]
impl EcoProvider for MockProvider {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let co2 = match Self::rotate(&mut self.co2_ring) {
            Some(v) => v,
            None => Some(rand::thread_rng().gen_range(self.co2min..=self.co2max) as f64),
        };
        let fossil_pct = match Self::rotate(&mut self.fossil_ring) {
            Some(v) => v,
            None => co2.map(|c| {
                let span = (self.co2max - self.co2min).max(1) as f64;
                let frac = (c - self.co2min as f64) / span;
                frac.clamp(0.0, 1.0) * 100.0
            }),
        };
        let price = Self::rotate(&mut self.price_ring).flatten();
        let index = Self::rotate(&mut self.index_ring)
            .flatten()
            .map(IndexValue::Tag);
        Some(EcoRecord {
            co2,
            fossil_pct,
            price,
            index,
            ..Default::default()
        })
    }

    fn label(&self) -> &'static str {
        "mock"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("co2range".into(), format!("{}-{}", self.co2min, self.co2max));
        if let Some(f) = &self.co2file {
            cfg.insert("co2file".into(), f.clone());
        }
        cfg
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

    #[tokio::test]
    async fn test_const_provider() {
        let mut p = ConstantProvider::new(&sec(&[("price", "31.5")]), 600).unwrap();
        let rec = p.get_data().await.unwrap();
        assert_eq!(rec.price, Some(31.5));
        assert_eq!(rec.co2, None);
        assert_eq!(p.cfg_string(), "const:31.5");
        assert!(ConstantProvider::new(&sec(&[]), 600).is_err());
    }

    #[tokio::test]
    async fn test_mock_random_range() {
        let mut p = MockProvider::new(&sec(&[("co2range", "100-800")]), 600).unwrap();
        for _ in 0..16 {
            let rec = p.get_data().await.unwrap();
            let co2 = rec.co2.unwrap();
            assert!((100.0..=800.0).contains(&co2));
            let fossil = rec.fossil_pct.unwrap();
            assert!((0.0..=100.0).contains(&fossil));
        }
    }

    #[tokio::test]
    async fn test_mock_file_ring_replay() {
        let dir = tempfile::tempdir().unwrap();
        let fname = dir.path().join("trace.log");
        std::fs::write(
            &fname,
            "#Timestamp\tgCO2/kWh\tFossil [%]\tPrice/kWh\n\
             ##2024-01-01T00:00:00\tSTART\n\
             2024-01-01T00:00:00\t200\t20\t0.10\n\
             2024-01-01T01:00:00\t400\t40\t0.20\n",
        )
        .unwrap();
        let mut p = MockProvider::new(
            &sec(&[("co2file", fname.to_str().unwrap())]),
            600,
        )
        .unwrap();
        let r1 = p.get_data().await.unwrap();
        let r2 = p.get_data().await.unwrap();
        let r3 = p.get_data().await.unwrap();
        assert_eq!((r1.co2, r1.fossil_pct, r1.price), (Some(200.0), Some(20.0), Some(0.10)));
        assert_eq!((r2.co2, r2.fossil_pct, r2.price), (Some(400.0), Some(40.0), Some(0.20)));
        // ring wraps back to the first row
        assert_eq!(r3.co2, Some(200.0));
    }

    #[test]
    fn test_header_column_discovery() {
        let cols = parse_header("Timestamp\tgCO2/kWh\tFmax [MHz]\tCI [g/kWh]\tFossil [%]\tEUR/MWh");
        // CI [g/kWh] takes precedence over gCO2/kWh
        assert_eq!(cols.co2, 3);
        assert_eq!(cols.fossil, Some(4));
        assert_eq!(cols.price, Some((5, 0.1)));
        assert_eq!(cols.index, None);
    }

    #[test]
    fn test_na_cells_are_none() {
        let toks: Vec<&str> = "2024\tNA\t40".split('\t').collect();
        assert_eq!(parse_cell(&toks, 1), None);
        assert_eq!(parse_cell(&toks, 2), Some(40.0));
        assert_eq!(parse_cell(&toks, 9), None);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let r = MockProvider::new(&sec(&[("co2file", "/nonexistent/trace.log")]), 600);
        assert!(r.is_err());
    }
}
