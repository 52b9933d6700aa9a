//! Report logger: the tab-separated power/CO₂ report and its control lines.
//!
//! One row is emitted per provider period. Missing values are printed as
//! literal `NA`; control events (`START`, `SET_POLICY`, `SUSPEND`, …) are
//! `##<timestamp>\t<CMD>` lines. The log file is opened per row so external
//! rotation works without signalling the daemon.

use std::io::Write;

use chrono::Local;
use log::warn;

use crate::config::Config;
use crate::monitors::IdleState;
use crate::record::{EcoRecord, IndexValue};

/// One report row, assembled by the control loop.
#[derive(Debug, Clone, Default)]
pub struct ReportRow {
    pub co2kwh: Option<f64>,
    pub max_freq_mhz: Option<f64>,
    pub avg_freq_mhz: Option<f64>,
    pub cpu_pmax_w: Option<f64>,
    pub gpu_pmax_w: Option<f64>,
    pub sys_pavg_w: Option<f64>,
    pub energy_j: Option<f64>,
    pub co2_g: Option<f64>,
    pub idle: Option<IdleState>,
    pub max_sessions: Option<u64>,
    pub max_load: Option<f64>,
    pub record: EcoRecord,
    pub price: Option<f64>,
    pub cost: Option<f64>,
}

pub struct EcoLogger {
    log_fname: Option<String>,
    idle_fields: bool,
    idle_debug: bool,
    cost_fields: bool,
    co2_extra: bool,
    echo: bool,
}

fn na_int(v: Option<f64>, width: usize) -> String {
    match v {
        Some(v) => format!("{:>width$}", v.round() as i64, width = width),
        None => format!("{:>width$}", "NA", width = width),
    }
}

fn na_num(v: Option<f64>, width: usize) -> String {
    match v {
        Some(v) => format!("{:>width$.3}", v, width = width),
        None => format!("{:>width$}", "NA", width = width),
    }
}

fn na_str(v: Option<&str>, width: usize) -> String {
    format!("{:>width$}", v.unwrap_or("NA"), width = width)
}

impl EcoLogger {
    pub fn from_config(cfg: &Config) -> Self {
        let log_fname = cfg
            .get("general", "logfile")
            .filter(|f| !crate::is_disabled(f))
            .map(str::to_string);
        Self {
            log_fname,
            idle_fields: false,
            idle_debug: false,
            cost_fields: cfg.get_bool("general", "logcost").unwrap_or(true),
            co2_extra: cfg.get_bool("general", "logco2extra").unwrap_or(false),
            echo: true,
        }
    }

    /// Enable the optional column groups before the header is printed.
    pub fn init_fields(&mut self, has_idle: bool) {
        self.idle_fields = has_idle;
    }

    /// Silence the stdout echo (used by tests).
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn log_fname(&self) -> Option<&str> {
        self.log_fname.as_deref()
    }

    fn log(&self, line: &str) {
        if self.echo {
            println!("{}", line);
        }
        if let Some(fname) = &self.log_fname {
            let res = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(fname)
                .and_then(|mut f| writeln!(f, "{}", line));
            if let Err(e) = res {
                warn!("report log write failed: {}", e);
            }
        }
    }

    pub fn print_header(&self) {
        let mut cols = vec![
            format!("#{:<19}", "Timestamp"),
            format!("{:>10}", "gCO2/kWh"),
            format!("{:>10}", "Fmax [MHz]"),
            format!("{:>10}", "Favg [MHz]"),
            format!("{:>12}", "CPU_Pmax [W]"),
            format!("{:>12}", "GPU_Pmax [W]"),
            format!("{:>12}", "SYS_Pavg [W]"),
            format!("{:>10}", "Energy [J]"),
            format!("{:>10}", "CO2 [g]"),
        ];
        if self.idle_fields {
            cols.push(format!("{:<7}", "State"));
        }
        if self.idle_debug {
            cols.push(format!("{:>10}", "MaxSessions"));
            cols.push(format!("{:>10}", "MaxLoad"));
        }
        if self.co2_extra {
            cols.push(format!("{:>10}", "CI [g/kWh]"));
            cols.push(format!("{:>8}", "Fossil [%]"));
            cols.push(format!("{:>10}", "Index"));
        }
        if self.cost_fields {
            cols.push(format!("{:>8}", "Price/kWh"));
            cols.push(format!("{:>8}", "Cost"));
        }
        self.log(&cols.join("\t"));
    }

    pub fn print_row(&self, row: &ReportRow) {
        let ts = Local::now().format(crate::TS_FORMAT).to_string();
        let mut cols = vec![
            format!("{:<20}", ts),
            na_int(row.co2kwh, 10),
            na_int(row.max_freq_mhz, 10),
            na_int(row.avg_freq_mhz, 10),
            na_num(row.cpu_pmax_w, 12),
            na_num(row.gpu_pmax_w, 12),
            na_num(row.sys_pavg_w, 12),
            na_num(row.energy_j, 10),
            na_num(row.co2_g, 10),
        ];
        if self.idle_fields {
            let state = row.idle.map(|s| s.to_string());
            cols.push(format!("{:<7}", state.as_deref().unwrap_or("NA")));
        }
        if self.idle_debug {
            cols.push(na_int(row.max_sessions.map(|s| s as f64), 10));
            cols.push(na_num(row.max_load, 10));
        }
        if self.co2_extra {
            cols.push(na_int(row.record.co2, 10));
            cols.push(na_num(row.record.fossil_pct, 8));
            let index = row.record.index.as_ref().map(IndexValue::to_string);
            cols.push(na_str(index.as_deref(), 10));
        }
        if self.cost_fields {
            cols.push(na_num(row.price, 8));
            cols.push(na_num(row.cost, 8));
        }
        self.log(&cols.join("\t"));
    }

    /// `##<timestamp>\t<CMD>` control line.
    pub fn print_cmd(&self, cmd: &str) {
        let ts = Local::now().format(crate::TS_FORMAT).to_string();
        self.log(&format!("##{}\t{}", ts, cmd.to_uppercase()));
    }
}

/// Retained CO₂ intensity samples with quantile accessors.
#[derive(Debug, Default)]
pub struct Co2History {
    values: Vec<f64>,
}

impl Co2History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, co2: f64) {
        self.values.push(co2);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn sorted(&self) -> Vec<f64> {
        let mut v = self.values.clone();
        v.sort_by(f64::total_cmp);
        v
    }

    fn quantile_count(&self, quantile: usize) -> usize {
        (self.values.len() * quantile) / 100 + 1
    }

    /// Quantile-trimmed minimum (the n-th smallest sample).
    pub fn min_co2(&self, quantile: usize) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let v = self.sorted();
        let n = self.quantile_count(quantile).min(v.len());
        v.get(n - 1).copied()
    }

    /// Quantile-trimmed maximum (the n-th largest sample).
    pub fn max_co2(&self, quantile: usize) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let v = self.sorted();
        let n = self.quantile_count(quantile).min(v.len());
        v.get(v.len() - n).copied()
    }
}
