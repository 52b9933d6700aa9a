//! EcoFreq daemon entry point.

use clap::Parser;
use log::error;

use ecofreq::config::{CliOverrides, Config};
use ecofreq::daemon::EcoFreq;
use ecofreq::hw;
use ecofreq::ipc::{control_channel, EcoServer};

#[derive(Parser, Debug)]
#[command(
    name = "ecofreqd",
    about = "Energy-aware power scaling daemon",
    version
)]
struct Args {
    /// Config file name.
    #[arg(short = 'c', value_name = "FILE")]
    cfg_file: Option<String>,

    /// Show system info and exit.
    #[arg(short = 'd')]
    diag: bool,

    /// Power governor (off = no power scaling).
    #[arg(short = 'g', value_name = "GOVERNOR")]
    governor: Option<String>,

    /// Log file name.
    #[arg(short = 'l', value_name = "FILE")]
    log_fname: Option<String>,

    /// CO2Signal API token.
    #[arg(short = 't', value_name = "TOKEN")]
    co2token: Option<String>,

    /// Provider polling interval in seconds.
    #[arg(short = 'i', value_name = "SECONDS")]
    interval: Option<u64>,

    /// Run in rootless mode (limited functionality).
    #[arg(long = "user")]
    usermode: bool,
}

fn diag() {
    println!("EcoFreq v{}\n", env!("CARGO_PKG_VERSION"));
    println!("{}", hw::CpuInfo::new().info_string());
    println!("{}", hw::Powercap::new().info_string());
    println!("{}", hw::AmdEsmi::new().info_string());
    println!("{}", hw::CpuFreq::new().info_string());
    println!("{}", hw::NvidiaSmi::new().info_string());
    println!("{}", hw::Ipmi::new().info_string());
    println!("{}", hw::Cgroup::v2().info_string());
    println!("{}", hw::Suspend::new().info_string());
}

fn read_config(args: &Args) -> Result<Config, ecofreq::EcoError> {
    let mut cfg = match &args.cfg_file {
        Some(f) => Config::from_file(f)?,
        None => Config::with_defaults(),
    };
    let overrides = CliOverrides {
        log_file: args.log_fname.clone(),
        governor: args.governor.clone(),
        co2token: args.co2token.clone(),
        interval: args.interval,
    };
    overrides.apply(&mut cfg);
    Ok(cfg)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    diag();
    println!();
    if args.diag {
        return;
    }

    #[cfg(unix)]
    if !args.usermode && !nix::unistd::geteuid().is_root() {
        eprintln!("EcoFreq controls hardware power limits and needs root permissions.");
        eprintln!("Please run as root, or pass --user for read-only operation.");
        std::process::exit(1);
    }

    let cfg = match read_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ERROR: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async {
        let (tx, rx) = control_channel();
        let server = EcoServer::from_config(&cfg, tx);
        let mut ef = match EcoFreq::new(cfg) {
            Ok(ef) => ef,
            Err(e) => {
                eprintln!("ERROR: {}", e);
                if e.is_permission() {
                    eprintln!("\nPlease run EcoFreq with root permissions!\n");
                }
                return 1;
            }
        };
        ef.print_info();
        println!();

        let code = tokio::select! {
            res = ef.run(rx) => match res {
                Ok(()) => 0,
                Err(e) => {
                    error!("daemon failed: {}", e);
                    if e.is_permission() {
                        eprintln!("\nPlease run EcoFreq with root permissions!\n");
                    }
                    1
                }
            },
            res = server.run() => {
                if let Err(e) = res {
                    error!("IPC server failed: {}", e);
                }
                1
            }
            _ = tokio::signal::ctrl_c() => 0,
        };
        ef.shutdown();
        code
    });

    std::process::exit(exit_code);
}
