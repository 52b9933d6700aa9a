//! REST eco-signal providers.
//!
//! Each provider keeps its upstream URL scheme and field mapping; the
//! `remap` step that turns upstream JSON into an [`EcoRecord`] is a pure
//! function over the fetched documents so the translation is testable
//! without a network. Fetch failures are logged and surface as `None`
//! records (last known values carry forward upstream).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::warn;
use serde_json::Value;

use crate::config::Section;
use crate::error::{EcoError, Result};
use crate::record::{price_unit_factor, EcoRecord, IndexValue};

use super::{section_interval, EcoProvider};

const USER_AGENT: &str = "Mozilla/5.0 (X11; U; Linux i686) Gecko/20071127 Firefox/2.0.0.11";

/// Shared HTTP client with the provider timeout policy:
/// `min(30 s, interval / 2)`.
fn http_client(interval: u64) -> Result<reqwest::Client> {
    let timeout = Duration::from_secs((interval / 2).clamp(1, 30));
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

async fn fetch_json(req: reqwest::RequestBuilder, what: &str) -> Option<Value> {
    match req.send().await {
        Ok(resp) => match resp.json().await {
            Ok(js) => Some(js),
            Err(e) => {
                warn!("{}: bad JSON response: {}", what, e);
                None
            }
        },
        Err(e) => {
            warn!("{}: request failed: {}", what, e);
            None
        }
    }
}

/// Epoch seconds of an ISO-8601 timestamp, with or without offset.
fn parse_iso_ts(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    let s = s.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
}

/// Auto-detected coordinates from ipinfo.io, for zone-less configs.
async fn my_coords(client: &reqwest::Client) -> Option<(String, String)> {
    let js = fetch_json(client.get("http://ipinfo.io").header("Accept", "application/json"), "geoip")
        .await?;
    let loc = js.get("loc")?.as_str()?;
    let (lat, lon) = loc.split_once(',')?;
    Some((lat.to_string(), lon.to_string()))
}

// ---------------------------------------------------------------------------
// CO2Signal

pub struct CO2Signal {
    interval: u64,
    token: String,
    country: String,
    coords: Option<(String, String)>,
    client: reqwest::Client,
}

impl CO2Signal {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let token = section
            .get("token")
            .cloned()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EcoError::Config("co2signal: API token is required".into()))?;
        let country = section.get("country").cloned().unwrap_or_else(|| "auto".into());
        Ok(Self {
            interval,
            token,
            country,
            coords: None,
            client: http_client(interval)?,
        })
    }

    fn remap(js: &Value) -> Option<EcoRecord> {
        let data = js.get("data")?;
        Some(EcoRecord {
            co2: Some(data.get("carbonIntensity")?.as_f64()?),
            fossil_pct: Some(data.get("fossilFuelPercentage")?.as_f64()?),
            ..Default::default()
        })
    }

    async fn api_url(&mut self) -> Option<String> {
        if !self.country.to_ascii_lowercase().starts_with("auto") {
            return Some(format!(
                "https://api.co2signal.com/v1/latest?countryCode={}",
                self.country
            ));
        }
        if self.coords.is_none() {
            self.coords = my_coords(&self.client).await;
            if self.coords.is_none() {
                warn!("co2signal: failed to autodetect location");
            }
        }
        let (lat, lon) = self.coords.as_ref()?;
        Some(format!(
            "https://api.co2signal.com/v1/latest?lat={}&lon={}",
            lat, lon
        ))
    }
}

#[async_trait]
impl EcoProvider for CO2Signal {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let url = self.api_url().await?;
        let js = fetch_json(
            self.client.get(&url).header("auth-token", self.token.clone()),
            "co2signal",
        )
        .await?;
        Self::remap(&js)
    }

    fn label(&self) -> &'static str {
        "co2signal"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("token".into(), self.token.clone());
        cfg.insert("country".into(), self.country.clone());
        cfg
    }
}

// ---------------------------------------------------------------------------
// ElectricityMaps

pub struct ElectricityMaps {
    interval: u64,
    zone: String,
    token: Option<String>,
    no_estimates: bool,
    ef_type: String,
    coords: Option<(String, String)>,
    client: reqwest::Client,
}

impl ElectricityMaps {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        Ok(Self {
            interval,
            zone: section.get("zone").cloned().unwrap_or_else(|| "auto".into()),
            token: section.get("token").cloned(),
            no_estimates: section
                .get("disableestimations")
                .map(|v| crate::parse_bool(v))
                .unwrap_or(false),
            ef_type: section
                .get("emissionfactortype")
                .cloned()
                .unwrap_or_else(|| "lifecycle".into()),
            coords: None,
            client: http_client(interval)?,
        })
    }

    fn remap(jsco2: Option<&Value>, jsmix: Option<&Value>) -> Option<EcoRecord> {
        let mix = jsmix?;
        Some(EcoRecord {
            co2: jsco2.and_then(|j| j.get("carbonIntensity")).and_then(Value::as_f64),
            ren_pct: mix.get("renewablePercentage").and_then(Value::as_f64),
            fossil_pct: Some(100.0 - mix.get("fossilFreePercentage")?.as_f64()?),
            ..Default::default()
        })
    }

    async fn zone_param(&mut self) -> Option<String> {
        if !self.zone.to_ascii_lowercase().starts_with("auto") {
            return Some(format!("&zone={}", self.zone));
        }
        if self.coords.is_none() {
            self.coords = my_coords(&self.client).await;
            if self.coords.is_none() {
                warn!("electricitymaps: failed to autodetect location");
            }
        }
        let (lat, lon) = self.coords.as_ref()?;
        Some(format!("&lat={}&lon={}", lat, lon))
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("auth-token", token.clone());
        }
        req
    }
}

#[async_trait]
impl EcoProvider for ElectricityMaps {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let zone = self.zone_param().await?;
        let url_co2 = format!(
            "https://api.electricitymap.org/v3/carbon-intensity/latest?disableEstimations={}&emissionFactorType={}{}",
            self.no_estimates, self.ef_type, zone
        );
        let url_mix = format!(
            "https://api.electricitymap.org/v3/power-breakdown/latest?disableEstimations={}{}",
            self.no_estimates, zone
        );
        let jsco2 = fetch_json(self.request(&url_co2), "electricitymaps").await;
        let jsmix = fetch_json(self.request(&url_mix), "electricitymaps").await;
        Self::remap(jsco2.as_ref(), jsmix.as_ref())
    }

    fn label(&self) -> &'static str {
        "electricitymaps"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("zone".into(), self.zone.clone());
        cfg.insert("disableestimations".into(), self.no_estimates.to_string());
        cfg.insert("emissionfactortype".into(), self.ef_type.clone());
        if let Some(t) = &self.token {
            cfg.insert("token".into(), t.clone());
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// UK National Grid

pub struct UkGrid {
    interval: u64,
    region: Option<String>,
    postcode: Option<String>,
    client: reqwest::Client,
}

impl UkGrid {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        Ok(Self {
            interval,
            region: section.get("regionid").cloned(),
            postcode: section.get("postcode").cloned(),
            client: http_client(interval)?,
        })
    }

    fn api_url(&self) -> String {
        const BASE: &str = "https://api.carbonintensity.org.uk/";
        if let Some(pc) = &self.postcode {
            format!("{}regional/postcode/{}", BASE, pc)
        } else if let Some(region) = &self.region {
            format!("{}regional/regionid/{}", BASE, region)
        } else {
            format!("{}intensity", BASE)
        }
    }

    fn remap(js: &Value) -> Option<EcoRecord> {
        let mut jsdata = js.get("data")?.get(0)?;
        if let Some(inner) = jsdata.get("data") {
            jsdata = inner.get(0)?;
        }
        let intensity = jsdata.get("intensity")?;
        let mut rec = EcoRecord {
            co2: Some(intensity.get("forecast")?.as_f64()?),
            index: Some(IndexValue::Tag(intensity.get("index")?.as_str()?.to_string())),
            ..Default::default()
        };
        if let Some(mix) = jsdata.get("generationmix").and_then(Value::as_array) {
            let mut fossil = 0.0;
            for f in mix {
                let fuel = f.get("fuel").and_then(Value::as_str).unwrap_or_default();
                if matches!(fuel, "coal" | "gas" | "other") {
                    fossil += f.get("perc").and_then(Value::as_f64).unwrap_or(0.0);
                }
            }
            rec.fossil_pct = Some(fossil);
        }
        Some(rec)
    }
}

#[async_trait]
impl EcoProvider for UkGrid {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let js = fetch_json(
            self.client.get(self.api_url()).header("Accept", "application/json"),
            "ukgrid",
        )
        .await?;
        Self::remap(&js)
    }

    fn label(&self) -> &'static str {
        "ukgrid"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        if let Some(r) = &self.region {
            cfg.insert("regionid".into(), r.clone());
        }
        if let Some(pc) = &self.postcode {
            cfg.insert("postcode".into(), pc.clone());
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// WattTime

pub struct WattTime {
    interval: u64,
    username: String,
    password: String,
    region: String,
    signal_type: String,
    use_index: bool,
    use_forecast: bool,
    client: reqwest::Client,
}

const LB_TO_KG: f64 = 0.453_592_37;

impl WattTime {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let region = section
            .get("region")
            .cloned()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| EcoError::Config("watttime: region code is missing".into()))?;
        Ok(Self {
            interval,
            username: section.get("username").cloned().unwrap_or_default(),
            password: section.get("password").cloned().unwrap_or_default(),
            region,
            signal_type: section
                .get("signaltype")
                .cloned()
                .unwrap_or_else(|| "co2_moer".into()),
            use_index: section.get("useindex").map(|v| crate::parse_bool(v)).unwrap_or(true),
            use_forecast: section
                .get("useforecast")
                .map(|v| crate::parse_bool(v))
                .unwrap_or(true),
            client: http_client(interval)?,
        })
    }

    /// Apply one signal document onto the record; the `units` metadata
    /// decides which field the value feeds.
    fn remap(js: &Value, rec: &mut EcoRecord) {
        let val = js
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|d| d.get("value"))
            .and_then(Value::as_f64);
        let units = js
            .get("meta")
            .and_then(|m| m.get("units"))
            .and_then(Value::as_str);
        match (units, val) {
            (Some("percentile"), Some(v)) => rec.index = Some(IndexValue::Level(v as i64)),
            (Some("lbs_co2_per_mwh"), Some(v)) => rec.co2 = Some(v * LB_TO_KG),
            _ => {}
        }
    }

    /// Tokens are short-lived; re-login on every poll.
    async fn login(&self) -> Option<String> {
        let js = fetch_json(
            self.client
                .get("https://api.watttime.org/login")
                .basic_auth(&self.username, Some(&self.password)),
            "watttime login",
        )
        .await?;
        js.get("token")?.as_str().map(str::to_string)
    }
}

#[async_trait]
impl EcoProvider for WattTime {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let token = self.login().await?;
        let mut rec = EcoRecord::default();
        let params = [
            ("region", self.region.clone()),
            ("signal_type", self.signal_type.clone()),
        ];
        if self.use_index {
            if let Some(js) = fetch_json(
                self.client
                    .get("https://api.watttime.org/v3/signal-index")
                    .bearer_auth(&token)
                    .query(&params),
                "watttime index",
            )
            .await
            {
                Self::remap(&js, &mut rec);
            }
        }
        if self.use_forecast {
            if let Some(js) = fetch_json(
                self.client
                    .get("https://api.watttime.org/v3/forecast")
                    .bearer_auth(&token)
                    .query(&params)
                    .query(&[("horizon_hours", "0")]),
                "watttime forecast",
            )
            .await
            {
                Self::remap(&js, &mut rec);
            }
        }
        Some(rec)
    }

    fn label(&self) -> &'static str {
        "watttime"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("region".into(), self.region.clone());
        cfg
    }
}

// ---------------------------------------------------------------------------
// StromGedacht

pub struct StromGedacht {
    interval: u64,
    postcode: String,
    int_states: bool,
    client: reqwest::Client,
}

impl StromGedacht {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        Ok(Self {
            interval,
            postcode: section.get("postcode").cloned().unwrap_or_else(|| "70173".into()),
            int_states: section
                .get("integerstates")
                .map(|v| crate::parse_bool(v))
                .unwrap_or(false),
            client: http_client(interval)?,
        })
    }

    fn state_tag(state: i64) -> Option<&'static str> {
        match state {
            -1 => Some("supergreen"),
            1 => Some("green"),
            3 => Some("orange"),
            4 => Some("red"),
            _ => None,
        }
    }

    /// Value of the forecast interval covering `ts`.
    fn val_now(ts: i64, arr: &Value) -> Option<f64> {
        let mut last: Option<(i64, f64)> = None;
        for entry in arr.as_array()? {
            let t = parse_iso_ts(entry.get("dateTime")?.as_str()?)?;
            if let Some((last_ts, last_val)) = last {
                if ts >= last_ts && ts < t {
                    return Some(last_val);
                }
            }
            last = Some((t, entry.get("value")?.as_f64()?));
        }
        None
    }

    fn remap(jsnow: &Value, jsforecast: &Value, ts: i64, int_states: bool) -> Option<EcoRecord> {
        let state = jsnow.get("state")?.as_i64()?;
        let index = if int_states {
            IndexValue::Level(state)
        } else {
            IndexValue::Tag(Self::state_tag(state)?.to_string())
        };
        let load = Self::val_now(ts, jsforecast.get("load")?)?;
        let residual = Self::val_now(ts, jsforecast.get("residualLoad")?)?;
        let super_green = Self::val_now(ts, jsforecast.get("superGreenThreshold")?)?;
        Some(EcoRecord {
            index: Some(index),
            fossil_pct: Some(100.0 * (residual - super_green) / load),
            ..Default::default()
        })
    }
}

#[async_trait]
impl EcoProvider for StromGedacht {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let url_now = format!("https://api.stromgedacht.de/v1/now?zip={}", self.postcode);
        let url_forecast = format!("https://api.stromgedacht.de/v1/forecast?zip={}", self.postcode);
        let jsnow = fetch_json(self.client.get(&url_now), "stromgedacht").await?;
        let jsforecast = fetch_json(self.client.get(&url_forecast), "stromgedacht").await?;
        Self::remap(&jsnow, &jsforecast, Utc::now().timestamp(), self.int_states)
    }

    fn label(&self) -> &'static str {
        "stromgedacht"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("postcode".into(), self.postcode.clone());
        cfg
    }
}

// ---------------------------------------------------------------------------
// Energy-Charts

pub struct EnergyCharts {
    interval: u64,
    country: String,
    postcode: Option<String>,
    price_zone: Option<String>,
    int_states: bool,
    client: reqwest::Client,
}

impl EnergyCharts {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        Ok(Self {
            interval,
            country: section
                .get("country")
                .map(|c| c.to_ascii_lowercase())
                .unwrap_or_else(|| "de".into()),
            postcode: section.get("postcode").cloned(),
            price_zone: section.get("pricezone").cloned(),
            int_states: section
                .get("integerstates")
                .map(|v| crate::parse_bool(v))
                .unwrap_or(false),
            client: http_client(interval)?,
        })
    }

    fn state_tag(state: i64) -> Option<&'static str> {
        match state {
            -1 => Some("black"),
            0 => Some("red"),
            1 => Some("yellow"),
            2 => Some("green"),
            _ => None,
        }
    }

    /// Index of the series interval covering `ts` in a `unix_seconds` axis.
    fn idx_now(ts: i64, seconds: &Value) -> Option<usize> {
        let arr = seconds.as_array()?;
        let mut last_ts: Option<i64> = None;
        let mut idx: isize = -1;
        for t in arr {
            let t = t.as_i64()?;
            if let Some(last) = last_ts {
                if ts >= last && ts < t {
                    return usize::try_from(idx).ok();
                }
            }
            last_ts = Some(t);
            idx += 1;
        }
        None
    }

    fn remap(
        jssignal: Option<&Value>,
        jsprice: Option<&Value>,
        ts: i64,
        int_states: bool,
    ) -> Option<EcoRecord> {
        let mut rec = EcoRecord::default();
        if let Some(sig) = jssignal {
            if let Some(idx) = Self::idx_now(ts, sig.get("unix_seconds")?) {
                let state = sig.get("signal")?.get(idx)?.as_i64()?;
                rec.index = Some(if int_states {
                    IndexValue::Level(state)
                } else {
                    IndexValue::Tag(Self::state_tag(state)?.to_string())
                });
                rec.ren_pct = sig.get("share")?.get(idx)?.as_f64();
            }
        }
        if let Some(price) = jsprice {
            if let Some(idx) = Self::idx_now(ts, price.get("unix_seconds")?) {
                let mut p = price.get("price")?.get(idx)?.as_f64()?;
                if let Some(unit) = price.get("unit").and_then(Value::as_str) {
                    p *= price_unit_factor(unit);
                }
                rec.price = Some(p);
            }
        }
        Some(rec)
    }
}

#[async_trait]
impl EcoProvider for EnergyCharts {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let mut url_signal = format!(
            "https://api.energy-charts.info/signal?country={}",
            self.country
        );
        if let Some(pc) = &self.postcode {
            url_signal.push_str(&format!("&postal_code={}", pc));
        }
        let jssignal = fetch_json(self.client.get(&url_signal), "energycharts signal").await;
        let jsprice = match &self.price_zone {
            Some(zone) => {
                let ts = Utc::now().timestamp();
                let fmt = "%Y-%m-%dT%H:%M";
                let window = 4 * 3600;
                let start = Utc.timestamp_opt(ts - window, 0).single()?.format(fmt);
                let end = Utc.timestamp_opt(ts + window, 0).single()?.format(fmt);
                let url = format!(
                    "https://api.energy-charts.info/price?bzn={}&start={}&end={}",
                    zone.to_ascii_uppercase(),
                    start,
                    end
                );
                fetch_json(self.client.get(&url), "energycharts price").await
            }
            None => None,
        };
        Self::remap(
            jssignal.as_ref(),
            jsprice.as_ref(),
            Utc::now().timestamp(),
            self.int_states,
        )
    }

    fn label(&self) -> &'static str {
        "energycharts"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("country".into(), self.country.clone());
        cfg.insert("integerstates".into(), self.int_states.to_string());
        if let Some(pc) = &self.postcode {
            cfg.insert("postcode".into(), pc.clone());
        }
        if let Some(z) = &self.price_zone {
            cfg.insert("pricezone".into(), z.clone());
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// gridstatus.io

pub struct GridStatusIo {
    interval: u64,
    token: Option<String>,
    iso: String,
    location: Option<String>,
    price_field: String,
    dataset: String,
    cached: Option<Value>,
    client: reqwest::Client,
}

impl GridStatusIo {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let iso = section
            .get("iso")
            .map(|i| i.to_ascii_lowercase())
            .unwrap_or_else(|| "caiso".into());
        let def_price = if iso == "ercot" { "spp" } else { "lmp" };
        let price_field = section
            .get("pricefield")
            .cloned()
            .unwrap_or_else(|| def_price.into());
        let dataset = section
            .get("dataset")
            .cloned()
            .unwrap_or_else(|| format!("{}_{}_day_ahead_hourly", iso, price_field));
        Ok(Self {
            interval,
            token: section.get("token").cloned(),
            iso,
            location: section.get("location").cloned(),
            price_field,
            dataset,
            cached: None,
            client: http_client(interval)?,
        })
    }

    fn remap_latest(js: &Value) -> Option<EcoRecord> {
        let p = js.get("data")?.get(0)?.get("latest_lmp")?.as_f64()?;
        Some(EcoRecord {
            price: Some(p * price_unit_factor("eur/mwh")),
            ..Default::default()
        })
    }

    /// Price record covering `ts` from the cached forecast window.
    fn remap_forecast(cached: &Value, ts: i64, price_field: &str) -> Option<EcoRecord> {
        for rec in cached.as_array()? {
            let t1 = parse_iso_ts(rec.get("interval_start_utc")?.as_str()?)?;
            let t2 = parse_iso_ts(rec.get("interval_end_utc")?.as_str()?)?;
            if ts >= t1 && ts <= t2 {
                let p = rec.get(price_field)?.as_f64()?;
                return Some(EcoRecord {
                    price: Some(p * price_unit_factor("eur/mwh")),
                    ..Default::default()
                });
            }
        }
        None
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.header("x-api-key", token.clone());
        }
        req
    }
}

#[async_trait]
impl EcoProvider for GridStatusIo {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let ts = Utc::now().timestamp();
        if let Some(location) = self.location.clone() {
            if let Some(cached) = &self.cached {
                if let Some(rec) = Self::remap_forecast(cached, ts, &self.price_field) {
                    return Some(rec);
                }
            }
            // cache exhausted; fetch the window starting at the current hour
            let hour = Utc.timestamp_opt(ts - ts % 3600, 0).single()?;
            let url = format!(
                "https://api.gridstatus.io/v1/datasets/{}/query/location/{}?start_time={}",
                self.dataset,
                location,
                hour.format("%Y-%m-%dT%H:%M:%SZ")
            );
            let js = fetch_json(self.request(&url), "gridstatus.io forecast").await?;
            self.cached = js.get("data").cloned();
            return Self::remap_forecast(self.cached.as_ref()?, ts, &self.price_field);
        }
        let url = format!(
            "https://api.gridstatus.io/v1/datasets/isos_latest/query/iso/{}",
            self.iso
        );
        let js = fetch_json(self.request(&url), "gridstatus.io latest").await?;
        Self::remap_latest(&js)
    }

    fn label(&self) -> &'static str {
        "gridstatus.io"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("iso".into(), self.iso.clone());
        cfg.insert("pricefield".into(), self.price_field.clone());
        cfg.insert("dataset".into(), self.dataset.clone());
        if let Some(t) = &self.token {
            cfg.insert("token".into(), t.clone());
        }
        if let Some(l) = &self.location {
            cfg.insert("location".into(), l.clone());
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// Tibber

pub struct Tibber {
    interval: u64,
    token: Option<String>,
    use_cache: bool,
    cached: Option<Value>,
    client: reqwest::Client,
}

impl Tibber {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        Ok(Self {
            interval,
            token: section.get("token").cloned(),
            use_cache: section.get("usecache").map(|v| crate::parse_bool(v)).unwrap_or(false),
            cached: None,
            client: http_client(interval)?,
        })
    }

    fn period(&self) -> &'static str {
        if self.use_cache {
            "today"
        } else {
            "current"
        }
    }

    fn query(&self) -> Value {
        let q = format!(
            "{{viewer {{homes {{currentSubscription {{priceInfo {{{} {{total energy tax startsAt }}}}}}}}}}}}",
            self.period()
        );
        serde_json::json!({ "query": q })
    }

    fn remap(cached: &Value, period: &str, ts: i64) -> Option<EcoRecord> {
        let price_info = cached
            .get("viewer")?
            .get("homes")?
            .get(0)?
            .get("currentSubscription")?
            .get("priceInfo")?
            .get(period)?;
        let entry = if period == "today" {
            let mut found = None;
            for rec in price_info.as_array()? {
                let t = parse_iso_ts(rec.get("startsAt")?.as_str()?)?;
                if ts >= t && ts <= t + 3600 {
                    found = Some(rec);
                    break;
                }
            }
            found?
        } else {
            price_info
        };
        Some(EcoRecord {
            price: Some(entry.get("total")?.as_f64()?),
            tax: entry.get("tax").and_then(Value::as_f64),
            ..Default::default()
        })
    }

    async fn fetch(&mut self) {
        let mut req = self
            .client
            .post("https://api.tibber.com/v1-beta/gql")
            .json(&self.query());
        if let Some(token) = &self.token {
            req = req.header("Authorization", token.clone());
        }
        if let Some(js) = fetch_json(req, "tibber").await {
            self.cached = js.get("data").cloned();
        }
    }
}

#[async_trait]
impl EcoProvider for Tibber {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let ts = Utc::now().timestamp();
        let period = self.period();
        if !self.use_cache {
            self.fetch().await;
        }
        if let Some(rec) = self.cached.as_ref().and_then(|c| Self::remap(c, period, ts)) {
            return Some(rec);
        }
        self.fetch().await;
        self.cached.as_ref().and_then(|c| Self::remap(c, period, ts))
    }

    fn label(&self) -> &'static str {
        "tibber"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("usecache".into(), self.use_cache.to_string());
        if let Some(t) = &self.token {
            cfg.insert("token".into(), t.clone());
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// Octopus Energy

pub struct Octopus {
    interval: u64,
    token: Option<String>,
    product: String,
    tariff: String,
    use_cache: bool,
    cached: Option<Value>,
    client: reqwest::Client,
}

impl Octopus {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let product = section
            .get("product")
            .cloned()
            .ok_or_else(|| EcoError::Config("octopus: product is required".into()))?;
        let tariff = section
            .get("tariff")
            .cloned()
            .ok_or_else(|| EcoError::Config("octopus: tariff is required".into()))?;
        Ok(Self {
            interval,
            token: section.get("token").cloned(),
            product,
            tariff,
            use_cache: section.get("usecache").map(|v| crate::parse_bool(v)).unwrap_or(true),
            cached: None,
            client: http_client(interval)?,
        })
    }

    fn remap(cached: &Value, ts: i64) -> Option<EcoRecord> {
        for rec in cached.get("results")?.as_array()? {
            let from = parse_iso_ts(rec.get("valid_from")?.as_str()?)?;
            let to = parse_iso_ts(rec.get("valid_to")?.as_str()?)?;
            if ts >= from && ts <= to {
                return Some(EcoRecord {
                    price: Some(rec.get("value_inc_vat")?.as_f64()?),
                    ..Default::default()
                });
            }
        }
        None
    }

    async fn fetch(&mut self) {
        let url = format!(
            "https://api.octopus.energy/v1/products/{}/electricity-tariffs/{}/standard-unit-rates",
            self.product, self.tariff
        );
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.basic_auth(token, Some(""));
        }
        if let Some(js) = fetch_json(req, "octopus").await {
            self.cached = Some(js);
        }
    }
}

#[async_trait]
impl EcoProvider for Octopus {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let ts = Utc::now().timestamp();
        if !self.use_cache {
            self.fetch().await;
        }
        if let Some(rec) = self.cached.as_ref().and_then(|c| Self::remap(c, ts)) {
            return Some(rec);
        }
        self.fetch().await;
        self.cached.as_ref().and_then(|c| Self::remap(c, ts))
    }

    fn label(&self) -> &'static str {
        "octopus"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("product".into(), self.product.clone());
        cfg.insert("tariff".into(), self.tariff.clone());
        cfg.insert("usecache".into(), self.use_cache.to_string());
        if let Some(t) = &self.token {
            cfg.insert("token".into(), t.clone());
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// aWATTar

pub struct Awattar {
    interval: u64,
    country: String,
    token: Option<String>,
    fixed_price: f64,
    vat: f64,
    cached: Value,
    client: reqwest::Client,
}

impl Awattar {
    pub fn new(section: &Section, glob_interval: u64) -> Result<Self> {
        let interval = section_interval(section, glob_interval);
        let country = section
            .get("country")
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or_else(|| "de".into());
        if !matches!(country.as_str(), "de" | "at") {
            return Err(EcoError::Config(format!(
                "awattar: country not supported: {}",
                country
            )));
        }
        let fixed_price = section
            .get("fixedprice")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| EcoError::Config("awattar: bad fixedprice".into()))?
            .unwrap_or(0.0);
        let vat = section
            .get("vat")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| EcoError::Config("awattar: bad vat".into()))?
            .unwrap_or(0.0);
        Ok(Self {
            interval,
            country,
            token: section.get("token").cloned(),
            fixed_price,
            vat,
            cached: Value::Array(Vec::new()),
            client: http_client(interval)?,
        })
    }

    /// Spot price of the market window covering `ts_ms`, with VAT and the
    /// fixed component applied on top of the canonicalised unit.
    fn remap(cached: &Value, ts_ms: f64, vat: f64, fixed_price: f64) -> Option<EcoRecord> {
        for rec in cached.as_array()? {
            let start = rec.get("start_timestamp")?.as_f64()?;
            let end = rec.get("end_timestamp")?.as_f64()?;
            if ts_ms >= start && ts_ms <= end {
                let mut p = rec.get("marketprice")?.as_f64()?;
                let unit = rec.get("unit").and_then(Value::as_str).unwrap_or_default();
                p *= price_unit_factor(unit);
                p *= 1.0 + vat;
                p += fixed_price;
                return Some(EcoRecord {
                    price: Some(p),
                    ..Default::default()
                });
            }
        }
        None
    }

    async fn fetch(&mut self) {
        let url = format!("https://api.awattar.{}/v1/marketdata", self.country);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.header("auth-token", token.clone());
        }
        if let Some(js) = fetch_json(req, "awattar").await {
            if let Some(data) = js.get("data") {
                self.cached = data.clone();
            }
        }
    }
}

#[async_trait]
impl EcoProvider for Awattar {
    async fn get_data(&mut self) -> Option<EcoRecord> {
        let ts_ms = Utc::now().timestamp_millis() as f64;
        if let Some(rec) = Self::remap(&self.cached, ts_ms, self.vat, self.fixed_price) {
            return Some(rec);
        }
        self.fetch().await;
        Self::remap(&self.cached, ts_ms, self.vat, self.fixed_price)
    }

    fn label(&self) -> &'static str {
        "awattar"
    }

    fn interval(&self) -> u64 {
        self.interval
    }

    fn get_config(&self) -> Section {
        let mut cfg = Section::new();
        cfg.insert("interval".into(), self.interval.to_string());
        cfg.insert("country".into(), self.country.clone());
        cfg
    }
}
