//! CPU frequency monitor: streaming period average over all online CPUs.

use crate::config::Config;
use crate::error::Result;
use crate::hw::{cpufreq, CpuFreq};

pub struct CpuFreqMonitor {
    hw: CpuFreq,
    pub interval: u64,
    /// Running period average in kHz.
    period_freq: f64,
    period_samples: u64,
}

impl CpuFreqMonitor {
    /// Built for `FreqSensor = auto` (driver present) or an explicit `cpu`.
    pub fn from_config(cfg: &Config, hw: &CpuFreq) -> Result<Option<Self>> {
        let sensor = cfg.get("monitor", "freqsensor").unwrap_or("auto");
        let sensor = sensor.to_ascii_lowercase();
        if crate::is_disabled(&sensor) {
            return Ok(None);
        }
        if sensor == "auto" && !hw.available() {
            return Ok(None);
        }
        if sensor != "auto" && sensor != "cpu" {
            return Err(crate::EcoError::Config(format!(
                "unknown frequency sensor: {}",
                sensor
            )));
        }
        let interval = cfg.get_u64("monitor", "interval")?.unwrap_or(5);
        Ok(Some(Self::new(interval, hw.clone())))
    }

    pub fn new(interval: u64, hw: CpuFreq) -> Self {
        Self {
            hw,
            interval,
            period_freq: 0.0,
            period_samples: 0,
        }
    }

    pub fn update(&mut self) {
        if let Some(avg) = self.hw.avg_cur_freq(cpufreq::KHZ) {
            self.push_sample(avg);
        }
    }

    /// Streaming average: `avg·n/(n+1) + sample/(n+1)`.
    pub(crate) fn push_sample(&mut self, avg_khz: f64) {
        let frac_new = 1.0 / (self.period_samples + 1) as f64;
        let frac_old = self.period_samples as f64 * frac_new;
        self.period_freq = frac_old * self.period_freq + frac_new * avg_khz;
        self.period_samples += 1;
    }

    pub fn period_avg_freq(&self, unit: f64) -> Option<f64> {
        if self.period_samples == 0 {
            None
        } else {
            Some(self.period_freq / unit)
        }
    }

    pub fn reset_period(&mut self) {
        self.period_freq = 0.0;
        self.period_samples = 0;
    }
}
