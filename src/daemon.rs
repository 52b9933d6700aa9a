//! The EcoFreq daemon: aggregate ownership and the control loop.
//!
//! One logical-time tick loop drives everything: monitors sample every
//! `sample_interval` seconds, the eco-signal is refreshed every provider
//! interval, policies apply the fresh signal, and the shared-memory export
//! is rewritten each tick. IPC commands arrive over a channel and are
//! handled between ticks, so reconfiguration is never visible to a tick in
//! flight.

use std::time::Duration;

use chrono::{Local, Utc};
use log::{error, info, warn};
use serde_json::json;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::Result;
use crate::ipc::ControlReceiver;
use crate::logger::{Co2History, EcoLogger, ReportRow};
use crate::monitors::{MonitorHw, MonitorManager};
use crate::mqtt::{MqttHandle, MqttRegistry};
use crate::policy::{EcoPolicyManager, PolicyHw, PolicySetup, SuspendIdlePolicy};
use crate::providers::EcoProviderManager;
use crate::record::{EcoRecord, Metric};
use crate::shm::ShmWriter;
use crate::JOULES_IN_KWH;

/// Daemon aggregate: owns the managers, the runtime state and the loop.
pub struct EcoFreq {
    config: Config,
    provider: EcoProviderManager,
    policy: EcoPolicyManager,
    monitor: MonitorManager,
    logger: EcoLogger,
    history: Co2History,
    idle_policy: Option<SuspendIdlePolicy>,
    mqtt: MqttRegistry,
    mqtt_logger: Option<MqttHandle>,
    shm: ShmWriter,
    report_hw: PolicyHw,

    sample_interval: u64,
    last_record: EcoRecord,
    last_co2kwh: Option<f64>,
    last_price: Option<f64>,
    period_co2kwh: Option<f64>,
    period_price: Option<f64>,
    total_co2: f64,
    total_cost: f64,
    start_date: chrono::DateTime<Local>,
    provider_updated: bool,
}

impl EcoFreq {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_hw(config, PolicyHw::default(), MonitorHw::default(), ShmWriter::new())
    }

    /// Constructor with injectable adapters and export path.
    pub fn with_hw(
        config: Config,
        policy_hw: PolicyHw,
        monitor_hw: MonitorHw,
        shm: ShmWriter,
    ) -> Result<Self> {
        let mut mqtt = MqttRegistry::new();
        let provider = EcoProviderManager::from_config(&config, &mut mqtt)?;
        let policy = EcoPolicyManager::from_config(&config, policy_hw.clone())?;
        let mut monitor = MonitorManager::from_config(&config, &monitor_hw, &mut mqtt)?;
        let mut logger = EcoLogger::from_config(&config);
        logger.init_fields(monitor.period_idle().is_some());
        let idle_policy = SuspendIdlePolicy::from_config(&config);
        let mqtt_logger = if config.get_bool("general", "logmqtt").unwrap_or(false) {
            let section = config.section_or_empty("mqtt_logger");
            Some(mqtt.add_client("mqtt_logger", &section))
        } else {
            None
        };
        // the signal poll period must be a whole number of sampling ticks
        let sample_interval = monitor.adjust_interval(provider.interval);
        Ok(Self {
            config,
            provider,
            policy,
            monitor,
            logger,
            history: Co2History::new(),
            idle_policy,
            mqtt,
            mqtt_logger,
            shm,
            report_hw: policy_hw,
            sample_interval,
            last_record: EcoRecord::default(),
            last_co2kwh: None,
            last_price: None,
            period_co2kwh: None,
            period_price: None,
            total_co2: 0.0,
            total_cost: 0.0,
            start_date: Local::now(),
            provider_updated: false,
        })
    }

    pub fn sample_interval(&self) -> u64 {
        self.sample_interval
    }

    pub fn total_co2(&self) -> f64 {
        self.total_co2
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Summary block printed at startup and served by `info`.
    pub fn get_info(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut info = serde_json::Map::new();
        info.insert("logfile".into(), self.logger.log_fname().into());
        info.insert("co2provider".into(), self.provider.info_string().into());
        info.insert("co2policy".into(), self.policy.info_string().into());
        info.insert(
            "idlepolicy".into(),
            self.idle_policy
                .as_ref()
                .map(|p| p.info_string())
                .unwrap_or_else(|| "None".into())
                .into(),
        );
        info.insert("monitors".into(), self.monitor.info_string().into());
        info.insert(
            "start_date".into(),
            self.start_date.format(crate::TS_FORMAT).to_string().into(),
        );
        info
    }

    pub fn print_info(&self) {
        let info = self.get_info();
        let get = |k: &str| info.get(k).and_then(|v| v.as_str()).unwrap_or("None").to_string();
        println!("Log file:     {}", get("logfile"));
        println!("CO2 Provider: {}", get("co2provider"));
        println!("CO2 Policy:   {}", get("co2policy"));
        println!("Idle Policy:  {}", get("idlepolicy"));
        println!("Monitors:     {}", get("monitors"));
    }

    /// Fetch the initial record so period accounting has a baseline.
    pub async fn prime(&mut self) {
        let record = self.provider.get_data().await;
        self.last_co2kwh = record.co2;
        self.last_price = record.price;
        self.last_record = record;
    }

    /// Refresh the eco-signal, account the past period, emit the report
    /// row and drive the policies.
    async fn update_signal(&mut self) {
        let record = self.provider.get_data().await;
        let co2 = record.co2;
        self.period_co2kwh = match (co2, self.last_co2kwh) {
            (Some(c), Some(last)) => Some(0.5 * (c + last)),
            (Some(c), None) => Some(c),
            (None, last) => last,
        };
        let price = record.price;
        self.period_price = match (price, self.last_price) {
            (Some(p), Some(last)) => Some(0.5 * (p + last)),
            (Some(p), None) => Some(p),
            (None, last) => last,
        };

        // the row shows the period that just ended
        let energy = self.monitor.period_energy();
        let period_co2 = self.period_co2kwh.map(|ci| {
            let g = energy * ci / JOULES_IN_KWH;
            self.total_co2 += g;
            g
        });
        let period_cost = self.period_price.map(|p| {
            let ct = energy * p / JOULES_IN_KWH;
            self.total_cost += ct;
            ct
        });

        let row = ReportRow {
            co2kwh: self.period_co2kwh,
            max_freq_mhz: self.report_hw.cpufreq.gov_max_freq(0, crate::hw::cpufreq::MHZ),
            avg_freq_mhz: self.monitor.period_cpu_avg_freq(crate::hw::cpufreq::MHZ),
            cpu_pmax_w: self
                .report_hw
                .powercap
                .power_limit(crate::hw::powercap::WATT)
                .or_else(|| self.report_hw.esmi.power_limit()),
            gpu_pmax_w: self.report_hw.nvidia.get_power_limit(),
            sys_pavg_w: Some(self.monitor.period_avg_power()),
            energy_j: Some(energy),
            co2_g: period_co2,
            idle: self.monitor.period_idle(),
            max_sessions: self.monitor.idle_monitor().map(|i| i.max_sessions()),
            max_load: self.monitor.idle_monitor().map(|i| i.max_load()),
            record: record.clone(),
            price: self.period_price,
            cost: period_cost,
        };
        self.logger.print_row(&row);

        self.policy.set_record(&record);

        if let Some(co2) = co2 {
            self.history.push(co2);
        }
        self.last_record = record;
        self.last_co2kwh = co2;
        self.last_price = price;
    }

    /// Rewrite the shared-memory export, extending the accounted totals
    /// with the running period at the last known signal levels.
    fn write_shm(&self) -> Result<()> {
        let mut co2_g = self.total_co2;
        let mut cost = self.total_cost;
        let period_energy = self.monitor.period_energy();
        if period_energy > 0.0 {
            if let Some(ci) = self.last_co2kwh {
                co2_g += period_energy * ci / JOULES_IN_KWH;
            }
            if let Some(p) = self.last_price {
                cost += period_energy * p / JOULES_IN_KWH;
            }
        }
        self.shm
            .write(Utc::now().timestamp(), self.monitor.total_energy(), co2_g, cost)
    }

    fn write_mqtt(&mut self) {
        if let Some(handle) = self.mqtt_logger.clone() {
            let info = self.cmd_info();
            handle.publish(&info);
        }
    }

    /// One logical tick: sample monitors, refresh the signal on provider
    /// boundaries, export state.
    pub async fn tick(&mut self, duration: u64) -> Result<()> {
        self.monitor.update(duration);
        let mut do_update = duration % self.provider.interval == 0;
        if self.provider_updated {
            do_update = true;
            self.provider_updated = false;
        }
        if do_update {
            self.update_signal().await;
            self.monitor.reset_period();
        }
        self.write_shm()?;
        self.write_mqtt();
        Ok(())
    }

    /// The daemon loop. Returns on an unrecoverable error, with the
    /// policies already reset to their safe maxima.
    pub async fn run(&mut self, mut ctrl: ControlReceiver) -> Result<()> {
        self.mqtt.spawn_all();
        self.prime().await;
        info!(
            "daemon started (provider interval = {} s, sample interval = {} s)",
            self.provider.interval, self.sample_interval
        );
        self.logger.print_header();
        self.logger.print_cmd("start");
        self.monitor.reset_period();
        let mut duration = 0u64;
        let mut elapsed = 0.0f64;
        loop {
            let to_sleep = (self.sample_interval as f64 - elapsed).max(0.0);
            let sleep = tokio::time::sleep(Duration::from_secs_f64(to_sleep));
            tokio::pin!(sleep);
            // commands are served while the loop is between ticks
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    req = ctrl.recv() => match req {
                        Some(req) => {
                            let res = self.run_cmd(&req.cmd, &req.args);
                            let _ = req.reply.send(res);
                        }
                        None => {
                            // control channel gone; just finish the sleep
                            sleep.as_mut().await;
                            break;
                        }
                    },
                }
            }
            duration += self.sample_interval;
            let mut t1 = Instant::now();
            if let Err(e) = self.tick(duration).await {
                error!("control loop failed: {}", e);
                self.policy.reset();
                return Err(e);
            }
            if let Some(idle_policy) = &self.idle_policy {
                if let Some(idlemon) = self.monitor.idle_monitor_mut() {
                    if idle_policy.check_idle(idlemon, &mut self.logger) {
                        // back from suspend: refresh counters and drop the
                        // sleep window from the books
                        self.monitor.update(0);
                        self.monitor.reset_after_wakeup();
                        self.logger.print_cmd("wakeup");
                        t1 = Instant::now();
                    }
                }
            }
            elapsed = t1.elapsed().as_secs_f64();
            if elapsed > self.sample_interval as f64 {
                warn!("tick overran the sampling interval ({:.1}s)", elapsed);
            }
        }
    }

    /// Reset actuators and remove the shared-memory export.
    pub fn shutdown(&mut self) {
        self.policy.reset();
        self.shm.remove();
    }

    // -----------------------------------------------------------------
    // controller command handlers (IPC surface)

    /// Dispatch one IPC command against the live daemon.
    pub fn run_cmd(&mut self, cmd: &str, args: &serde_json::Value) -> serde_json::Value {
        let result = match cmd {
            "info" => Ok(self.cmd_info()),
            "get_policy" => Ok(json!({"co2policy": self.policy.get_config()})),
            "set_policy" => self.cmd_set_policy(args),
            "get_provider" => Ok(json!({"co2provider": self.provider.get_config()})),
            "set_provider" => self.cmd_set_provider(args),
            other => {
                return json!({"status": "ERROR", "error": format!("Unknown command: {}", other)})
            }
        };
        match result {
            Ok(mut res) => {
                if let Some(obj) = res.as_object_mut() {
                    obj.insert("status".into(), "OK".into());
                }
                res
            }
            Err(e) => json!({"status": "ERROR", "error": e.to_string()}),
        }
    }

    fn cmd_info(&self) -> serde_json::Value {
        let mut res = self.get_info();
        let stats = self.monitor.stats();
        match stats.get("LastState") {
            Some(state) => {
                res.insert("idle_state".into(), state.clone());
                res.insert(
                    "idle_load".into(),
                    stats.get("LastLoad").cloned().unwrap_or_default(),
                );
                res.insert(
                    "idle_duration".into(),
                    stats.get("IdleDuration").cloned().unwrap_or_default(),
                );
            }
            None => {
                res.insert("idle_state".into(), "NA".into());
            }
        }
        res.insert("avg_power".into(), self.monitor.last_avg_power().into());
        res.insert("total_energy_j".into(), self.monitor.total_energy().into());
        res.insert("total_co2".into(), self.total_co2.into());
        res.insert("total_cost".into(), self.total_cost.into());
        res.insert("last_co2kwh".into(), self.last_co2kwh.into());
        res.insert("last_price".into(), self.last_price.into());
        serde_json::Value::Object(res)
    }

    /// Merge the per-domain overrides onto the stored base config, build
    /// and validate the new policies, and re-apply the last signal.
    fn cmd_set_policy(&mut self, args: &serde_json::Value) -> Result<serde_json::Value> {
        let domains = args
            .get("co2policy")
            .and_then(|v| v.as_object())
            .ok_or_else(|| crate::EcoError::Config("set_policy: co2policy object missing".into()))?;
        let mut setup = PolicySetup {
            metric: self.policy.metric(),
            ..Default::default()
        };
        for (domain, overrides) in domains {
            let mut section = self.config.domain_policy_section(domain);
            if let Some(obj) = overrides.as_object() {
                for (k, v) in obj {
                    let val = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    section.insert(k.to_ascii_lowercase(), val);
                }
            }
            if let Some(m) = section.get("metric") {
                setup.metric = m.parse::<Metric>()?;
            }
            match domain.as_str() {
                "cpu" => setup.cpu = Some(section),
                "gpu" => setup.gpu = Some(section),
                other => {
                    return Err(crate::EcoError::Config(format!(
                        "set_policy: unknown domain: {}",
                        other
                    )))
                }
            }
        }
        self.policy.set_config(&setup)?;
        if self.last_record != EcoRecord::default() {
            self.policy.set_record(&self.last_record.clone());
        }
        self.logger.print_cmd("set_policy");
        Ok(json!({}))
    }

    /// Merge a provider config fragment and rebuild the provider manager;
    /// the next tick fast-forwards a signal fetch.
    fn cmd_set_provider(&mut self, args: &serde_json::Value) -> Result<serde_json::Value> {
        let fragment = args
            .get("co2provider")
            .ok_or_else(|| crate::EcoError::Config("set_provider: co2provider object missing".into()))?;
        let mut new_cfg = self.config.clone();
        new_cfg.merge_json(fragment)?;
        let provider = EcoProviderManager::from_config(&new_cfg, &mut self.mqtt)?;
        self.provider = provider;
        self.config = new_cfg;
        self.provider_updated = true;
        self.mqtt.spawn_all();
        self.logger.print_cmd("set_provider");
        Ok(json!({}))
    }

    #[cfg(test)]
    pub(crate) fn logger_mut(&mut self) -> &mut EcoLogger {
        &mut self.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw;

    fn offline_policy_hw(dir: &std::path::Path) -> PolicyHw {
        PolicyHw {
            cpufreq: hw::CpuFreq::with_root(dir.join("cpu")),
            powercap: hw::Powercap::with_root(dir.join("powercap")),
            esmi: hw::AmdEsmi::with_tool("/nonexistent/e_smi_tool"),
            nvidia: hw::NvidiaSmi::with_command("/nonexistent/nvidia-smi"),
            docker: hw::DockerCli::with_command("/nonexistent/docker"),
            cpuinfo: hw::CpuInfo::with_command("/nonexistent/lscpu"),
            cgroup_root: dir.join("cgroup"),
        }
    }

    fn offline_monitor_hw(dir: &std::path::Path) -> MonitorHw {
        MonitorHw {
            powercap: hw::Powercap::with_root(dir.join("powercap")),
            amdmsr: hw::AmdMsr::with_roots(dir.join("dev"), dir.join("cpu")),
            nvidia: hw::NvidiaSmi::with_command("/nonexistent/nvidia-smi"),
            ipmi: hw::Ipmi::with_command("/nonexistent/ipmitool"),
            cpufreq: hw::CpuFreq::with_root(dir.join("cpu")),
            cpuinfo: hw::CpuInfo::with_command("/nonexistent/lscpu"),
        }
    }

    /// Daemon over a fake powercap tree, const co2/price providers and a
    /// frequency policy, everything rooted in a tempdir.
    fn test_daemon(dir: &std::path::Path) -> EcoFreq {
        hw::cpufreq::tests::fake_cpufreq(&dir.join("cpu"), 2, &[2_000_000, 2_000_000]);
        hw::powercap::tests::fake_powercap(&dir.join("powercap"));
        let toml = format!(
            "[general]\nLogFile = \"{}\"\nLogCost = \"on\"\n\
             [provider]\nInterval = 10\nco2 = \"const:500\"\nprice = \"const:10\"\n\
             [cpu_policy]\nControl = \"frequency\"\nGovernor = \"linear:100=max:800=min\"\nMetric = \"co2\"\n\
             [monitor]\nPowerSensor = \"rapl\"\nFreqSensor = \"off\"\nInterval = 5\n\
             [powercap]\nEstimateFullPower = \"off\"\n\
             [idle]\nIdleMonitor = \"off\"\n",
            dir.join("eco.log").display()
        );
        let cfg = Config::from_toml(&toml).unwrap();
        let mut ef = EcoFreq::with_hw(
            cfg,
            offline_policy_hw(dir),
            offline_monitor_hw(dir),
            ShmWriter::with_path(dir.join("shm")),
        )
        .unwrap();
        ef.logger_mut().set_echo(false);
        ef
    }

    fn set_energy(dir: &std::path::Path, pkg: &str, uj: u64) {
        std::fs::write(
            dir.join("powercap")
                .join(format!("intel-rapl:{}", pkg))
                .join("energy_uj"),
            format!("{}\n", uj),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_loop_totals_after_one_minute() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        assert_eq!(ef.sample_interval(), 5);
        ef.prime().await;
        assert_eq!(ef.last_co2kwh, Some(500.0));
        ef.monitor.reset_period();

        // constant 100 W: +500 J per 5 s tick on the package counter
        // (fixture baselines: package 1 J, dram 0.5 J)
        let mut duration = 0u64;
        for _ in 0..12 {
            duration += 5;
            set_energy(dir.path(), "0", 1_000_000 + duration * 100_000_000);
            ef.tick(duration).await.unwrap();
        }
        // 60 s at 100 W -> 6 kJ; co2 = 6000*500/3.6e6 g; cost = 6000*10/3.6e6 ct
        assert!((ef.monitor.total_energy() - 6000.0).abs() < 1e-6);
        assert!((ef.total_co2() - 0.8333).abs() < 1e-3);
        assert!((ef.total_cost() - 0.016667).abs() < 1e-5);

        // shm export carries the same totals
        let shm = std::fs::read_to_string(dir.path().join("shm")).unwrap();
        let fields: Vec<&str> = shm.split(' ').collect();
        assert_eq!(fields[1], "6000");
        assert_eq!(fields[2], "0.833");
        assert_eq!(fields[3], "0.017");
    }

    #[tokio::test]
    async fn test_period_price_averages_consecutive_samples() {
        let dir = tempfile::tempdir().unwrap();
        hw::powercap::tests::fake_powercap(&dir.path().join("powercap"));
        let trace = dir.path().join("prices.log");
        std::fs::write(
            &trace,
            "#Timestamp\tgCO2/kWh\tFossil [%]\tPrice/kWh\n\
             2024-01-01T00:00:00\t500\t50\t10\n\
             2024-01-01T01:00:00\t500\t50\t20\n",
        )
        .unwrap();
        let toml = format!(
            "[general]\nLogFile = \"none\"\n\
             [provider]\nInterval = 10\nall = \"mock\"\n\
             [mock]\nco2file = \"{}\"\n\
             [cpu_policy]\nControl = \"off\"\n\
             [monitor]\nPowerSensor = \"rapl\"\nFreqSensor = \"off\"\nInterval = 5\n\
             [powercap]\nEstimateFullPower = \"off\"\n\
             [idle]\nIdleMonitor = \"off\"\n",
            trace.display()
        );
        let cfg = Config::from_toml(&toml).unwrap();
        let mut ef = EcoFreq::with_hw(
            cfg,
            offline_policy_hw(dir.path()),
            offline_monitor_hw(dir.path()),
            ShmWriter::with_path(dir.path().join("shm")),
        )
        .unwrap();
        ef.logger_mut().set_echo(false);

        // ring row 1 is the baseline sample
        ef.prime().await;
        assert_eq!(ef.last_price, Some(10.0));
        ef.monitor.reset_period();

        set_energy(dir.path(), "0", 1_000_000 + 500_000_000);
        ef.tick(5).await.unwrap();
        set_energy(dir.path(), "0", 1_000_000 + 1_000_000_000);
        ef.tick(10).await.unwrap();

        // boundary fetch saw row 2: the period price is the average of the
        // last and current samples, as for co2
        assert_eq!(ef.period_price, Some(15.0));
        assert_eq!(ef.period_co2kwh, Some(500.0));
        assert_eq!(ef.last_price, Some(20.0));
        // 1 kJ over the period billed at the averaged 15 ct/kWh
        assert!((ef.total_cost() - 1000.0 * 15.0 / JOULES_IN_KWH).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_policy_applied_on_provider_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        ef.prime().await;
        ef.tick(5).await.unwrap();
        // not a provider boundary yet: the cap still reads the fixture max
        let cpufreq = hw::CpuFreq::with_root(dir.path().join("cpu"));
        assert_eq!(cpufreq.gov_max_freq(0, hw::cpufreq::KHZ), Some(4_000_000.0));
        ef.tick(10).await.unwrap();
        // co2 = 500 on a 100..800 band over 800..4000 MHz
        let expect: f64 = 800_000.0 + (4_000_000.0 - 800_000.0) * (1.0 - (500.0 - 100.0) / 700.0);
        let got = cpufreq.gov_max_freq(0, hw::cpufreq::KHZ).unwrap();
        assert!((got - expect.round()).abs() <= 1.0, "{} vs {}", got, expect);
    }

    #[tokio::test]
    async fn test_ipc_policy_switch_stops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        ef.prime().await;
        ef.tick(10).await.unwrap();

        let res = ef.run_cmd("get_policy", &serde_json::Value::Null);
        assert_eq!(res["status"], "OK");
        assert_eq!(res["co2policy"]["cpu"]["control"], "frequency");
        assert_eq!(res["co2policy"]["cpu"]["metric"], "co2");

        let res = ef.run_cmd(
            "set_policy",
            &json!({"co2policy": {"cpu": {"governor": "none", "metric": "co2"}}}),
        );
        assert_eq!(res["status"], "OK");
        let res = ef.run_cmd("get_policy", &serde_json::Value::Null);
        assert_eq!(res["co2policy"]["cpu"]["governor"], "none");

        // ticking across further boundaries no longer touches the cap,
        // which stayed at the reset (hw max) value
        let cpufreq = hw::CpuFreq::with_root(dir.path().join("cpu"));
        assert_eq!(cpufreq.gov_max_freq(0, hw::cpufreq::KHZ), Some(4_000_000.0));
        ef.tick(20).await.unwrap();
        assert_eq!(cpufreq.gov_max_freq(0, hw::cpufreq::KHZ), Some(4_000_000.0));
    }

    #[tokio::test]
    async fn test_invalid_policy_request_keeps_old() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        ef.prime().await;
        let res = ef.run_cmd(
            "set_policy",
            &json!({"co2policy": {"cpu": {"governor": "quadratic"}}}),
        );
        assert_eq!(res["status"], "ERROR");
        // the original policy still reacts
        ef.tick(10).await.unwrap();
        let cpufreq = hw::CpuFreq::with_root(dir.path().join("cpu"));
        assert_ne!(cpufreq.gov_max_freq(0, hw::cpufreq::KHZ), Some(4_000_000.0));
    }

    #[tokio::test]
    async fn test_set_provider_fast_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        ef.prime().await;
        let res = ef.run_cmd(
            "set_provider",
            &json!({"co2provider": {"provider": {"co2": "const:900"}, "const": {"co2": 900}}}),
        );
        assert_eq!(res["status"], "OK", "{:?}", res);
        // off-boundary tick still refreshes because of the update flag
        ef.tick(5).await.unwrap();
        assert_eq!(ef.last_co2kwh, Some(900.0));
        // and the governor clamped the frequency to its minimum
        let cpufreq = hw::CpuFreq::with_root(dir.path().join("cpu"));
        assert_eq!(cpufreq.gov_max_freq(0, hw::cpufreq::KHZ), Some(800_000.0));
    }

    #[tokio::test]
    async fn test_info_command_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        ef.prime().await;
        ef.tick(10).await.unwrap();
        let res = ef.run_cmd("info", &serde_json::Value::Null);
        assert_eq!(res["status"], "OK");
        assert_eq!(res["idle_state"], "NA");
        assert_eq!(res["last_co2kwh"], 500.0);
        assert!(res["total_energy_j"].as_f64().unwrap() >= 0.0);
        assert!(res["co2policy"].as_str().unwrap().contains("CpuFreqPolicy"));
        assert!(res["start_date"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        let res = ef.run_cmd("reboot", &serde_json::Value::Null);
        assert_eq!(res["status"], "ERROR");
        assert!(res["error"].as_str().unwrap().contains("Unknown command"));
    }

    #[tokio::test]
    async fn test_shutdown_resets_and_removes_shm() {
        let dir = tempfile::tempdir().unwrap();
        let mut ef = test_daemon(dir.path());
        ef.prime().await;
        ef.tick(10).await.unwrap();
        assert!(dir.path().join("shm").exists());
        ef.shutdown();
        assert!(!dir.path().join("shm").exists());
        let cpufreq = hw::CpuFreq::with_root(dir.path().join("cpu"));
        assert_eq!(cpufreq.gov_max_freq(0, hw::cpufreq::KHZ), Some(4_000_000.0));
    }
}
