//! `adr-ioc` – ADR controller IOC.
//!
//! Bridges the ADR controller's ZeroMQ status stream and command endpoint to
//! a set of named process variables:
//!
//! 1. Resolves configuration: defaults, then `~/.adr-ioc/config.toml` (or
//!    `--config`), then `ADR_*` environment variables, then flags.
//! 2. Runs the IOC until Ctrl-C or SIGTERM, then shuts down gracefully.
//!
//! `--list-pvs` prints the variable table and exits.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use adr_registry::VariableRegistry;
use adr_runtime::{Ioc, init_tracing};
use config::StartCycleMode;

#[derive(Debug, Parser)]
#[command(name = "adr-ioc", version, about = "Process-variable bridge for the ADR cryostat controller")]
struct Args {
    /// Config file (default: ~/.adr-ioc/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Host running the ADR controller.
    #[arg(long)]
    address: Option<String>,

    /// Status publisher port.
    #[arg(long)]
    sub_port: Option<u16>,

    /// Command endpoint port.
    #[arg(long)]
    control_port: Option<u16>,

    /// Variable name prefix.
    #[arg(long)]
    prefix: Option<String>,

    /// Operator gateway WebSocket port.
    #[arg(long)]
    gateway_port: Option<u16>,

    /// Do not start the operator gateway.
    #[arg(long)]
    no_gateway: bool,

    /// When START_CYCLE writes send a start command.
    #[arg(long, value_enum)]
    start_cycle_policy: Option<StartCycleMode>,

    /// Minimum spacing for `min-interval`, in milliseconds.
    #[arg(long, value_name = "MS")]
    start_cycle_interval_ms: Option<u64>,

    /// Print the variable table and exit.
    #[arg(long)]
    list_pvs: bool,
}

impl Args {
    /// Flags win over everything else.
    fn apply(&self, cfg: &mut config::Config) {
        if let Some(address) = &self.address {
            cfg.address = address.clone();
        }
        if let Some(port) = self.sub_port {
            cfg.sub_port = port;
        }
        if let Some(port) = self.control_port {
            cfg.control_port = port;
        }
        if let Some(prefix) = &self.prefix {
            cfg.prefix = prefix.clone();
        }
        if let Some(port) = self.gateway_port {
            cfg.gateway_port = port;
        }
        if self.no_gateway {
            cfg.gateway_enabled = false;
        }
        if let Some(policy) = self.start_cycle_policy {
            cfg.start_cycle_policy = policy;
        }
        if let Some(ms) = self.start_cycle_interval_ms {
            cfg.start_cycle_interval_ms = ms;
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _tracing = init_tracing("adr-ioc");

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = match config::resolve(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut cfg);

    let ioc_config = cfg.to_ioc_config();
    if let Err(e) = ioc_config.validate() {
        error!(path = %path.display(), error = %e, "configuration error");
        return ExitCode::FAILURE;
    }
    let ioc = Ioc::new(ioc_config);
    if args.list_pvs {
        print_variable_table(&ioc.registry());
        return ExitCode::SUCCESS;
    }

    // The runtime is built after tracing so the OTLP exporter never needs one.
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    // Held until exit so receivers never see a dropped sender.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("termination signal received");
        let _ = signal_tx.send(true);
    }) {
        warn!(error = %e, "failed to install signal handler; stop the IOC by killing the process");
    }

    info!(
        config = %path.display(),
        policy = %cfg.start_cycle_policy,
        "starting adr-ioc v{}",
        env!("CARGO_PKG_VERSION")
    );

    match runtime.block_on(ioc.run(shutdown_rx)) {
        Ok(()) => {
            info!("adr-ioc stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "adr-ioc failed to start");
            ExitCode::FAILURE
        }
    }
}

fn print_variable_table(registry: &VariableRegistry) {
    println!();
    println!(
        "  {} {} {} {}",
        format!("{:<40}", "NAME").bold(),
        format!("{:<6}", "TYPE").bold(),
        format!("{:<3}", "RW").bold(),
        "DESCRIPTION".bold()
    );
    for info in registry.snapshot() {
        let access = if info.writable {
            format!("{:<3}", "rw").green()
        } else {
            format!("{:<3}", "ro").dimmed()
        };
        let description = match info.unit {
            Some(unit) => format!("{} [{}]", info.doc, unit),
            None => info.doc.to_string(),
        };
        println!(
            "  {} {:<6} {} {}",
            format!("{:<40}", info.full_name).cyan(),
            info.kind.to_string(),
            access,
            description
        );
    }
    println!();
}
