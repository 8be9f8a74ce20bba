//! ddc-gw - control monitor brightness, night mode, and picture toggles
//! from a MIDI control surface over DDC/CI.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ddc_gw::bindings::BindingTable;
use ddc_gw::config::AppConfig;
use ddc_gw::engine::Engine;
use ddc_gw::mapper::{ControlMapper, Feedback};
use ddc_gw::monitor::{DdcTransport, MonitorCommands, RetryPolicy};
use ddc_gw::surface::SurfaceDriver;

/// DDC Gateway - drive monitor VCP features from a MIDI control surface
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,

    /// Probe the configured VCP codes against the monitor and exit
    #[arg(long)]
    probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting ddc-gw...");

    if args.list_ports {
        list_ports_formatted();
        return Ok(());
    }

    info!("Configuration file: {}", args.config);
    let config = AppConfig::load(&args.config).await?;
    let table = BindingTable::compile(&config).context("Invalid control bindings")?;
    info!("Compiled {} control bindings", table.len());

    let retry = RetryPolicy {
        attempts: config.engine.retry_attempts,
        base_delay: std::time::Duration::from_millis(config.engine.retry_base_ms),
    };
    let transport = DdcTransport::open(config.monitor.model_match.as_deref())?;
    let mut monitor = MonitorCommands::new(Box::new(transport), retry);
    info!("Monitor: {}", monitor.describe());

    if args.probe {
        return probe_and_report(&mut monitor, &table).await;
    }

    run_app(config, table, monitor, shutdown_signal()).await?;

    info!("ddc-gw shutdown complete");
    Ok(())
}

async fn run_app(
    config: AppConfig,
    table: BindingTable,
    monitor: MonitorCommands,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let (feedback_tx, feedback_rx) = tokio::sync::mpsc::unbounded_channel::<Feedback>();
    let mut mapper = ControlMapper::new(table, monitor, &config.engine, feedback_tx);

    let supported = mapper.probe().await;
    info!("Probe complete: {} VCP codes supported", supported);

    mapper.initialize().await;

    let mut surface = SurfaceDriver::new(&config.midi.input_port, &config.midi.output_port);
    surface.connect()?;

    let events = surface
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("Surface event receiver already taken"))?;
    let output = surface
        .output()
        .ok_or_else(|| anyhow::anyhow!("Surface output not connected"))?;

    let feedback_task = output.spawn_feedback(feedback_rx);

    let engine = Engine::new(mapper);
    let ingestion = Engine::spawn_ingestion(engine.queue(), events);

    info!("Ready to process surface events");
    engine.run(shutdown).await;

    // The mapper (and its feedback sender) died with the engine, so the
    // forwarder drains and stops on its own
    info!("Shutting down...");
    ingestion.abort();
    if let Err(err) = feedback_task.await {
        if !err.is_cancelled() {
            warn!("Feedback forwarder failed: {}", err);
        }
    }
    surface.disconnect();

    Ok(())
}

async fn probe_and_report(monitor: &mut MonitorCommands, table: &BindingTable) -> Result<()> {
    let codes = table.probe_codes();
    let supported = monitor.probe(&codes).await;

    println!("\n=== VCP Probe: {} ===", monitor.describe());
    for code in &codes {
        if monitor.is_supported(*code) {
            let value = monitor
                .cached(*code)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!("  0x{:02X}  supported  (current: {})", code, value);
        } else {
            println!("  0x{:02X}  unsupported", code);
        }
    }
    println!("\n{}/{} codes supported\n", supported, codes.len());

    Ok(())
}

fn list_ports_formatted() {
    println!("\n=== MIDI Input Ports ===");
    match SurfaceDriver::list_input_ports() {
        Ok(ports) => {
            for (i, name) in ports.iter().enumerate() {
                println!("  {}: {}", i, name);
            }
        }
        Err(err) => println!("  Failed to list input ports: {}", err),
    }

    println!("\n=== MIDI Output Ports ===");
    match SurfaceDriver::list_output_ports() {
        Ok(ports) => {
            for (i, name) in ports.iter().enumerate() {
                println!("  {}: {}", i, name);
            }
        }
        Err(err) => println!("  Failed to list output ports: {}", err),
    }
    println!();
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C signal handler: {}", err);
        // Never resolve; the process keeps running without signal handling
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
