use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{LevelFilter, debug, error, info, warn};
use tokio_util::sync::CancellationToken;

mod config;
mod manager;
mod messages;
mod metrics;
mod mqtt;
mod notifier;
mod sampler;
mod state;
mod tls;

const DEFAULT_CONFIG_FILE: &str = "/etc/presence-monitor.toml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Reports network devices appearing and disappearing over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Print debug logs
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    info!("Started presence-monitor {}", env!("CARGO_PKG_VERSION"));

    let config = config::AppConfig::load(&args.config)
        .with_context(|| format!("could not read config file {}", args.config.display()))?;
    config.validate().context("could not validate config")?;

    debug!("Devices: {:?}", config.devices);

    let prometheus =
        Arc::new(metrics::PrometheusMetrics::new().context("could not build metrics")?);
    let telemetry: Arc<dyn metrics::Telemetry> = prometheus.clone();

    let probes = sampler::Probes::system(&config.icmp);
    let samplers = sampler::build_samplers(&config, &probes).context("could not build samplers")?;

    let (mqtt_client, mut eventloop) =
        mqtt::MqttClient::new(&config.mqtt, config.devices.len()).context("could not build notifier")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let metrics_handle = match config.metrics_socket_addr()? {
        Some(addr) => {
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = metrics::serve(addr, prometheus, cancel.clone()).await {
                    error!("can not start metrics server: {}", err);
                    cancel.cancel();
                }
            }))
        }
        None => None,
    };

    let mqtt_cancel = CancellationToken::new();
    let mut mqtt_handle = tokio::spawn({
        let telemetry = telemetry.clone();
        let mqtt_cancel = mqtt_cancel.clone();
        async move { mqtt::MqttClient::event_loop(&mut eventloop, telemetry, mqtt_cancel).await }
    });

    let core = manager::Manager::new(
        samplers,
        Arc::new(mqtt_client.clone()),
        Arc::new(state::MapState::new()),
        telemetry,
        config.always_send_notification,
        config.interval(),
    );
    core.run_loop(cancel.clone()).await;

    // Give the event loop a moment to flush pending publishes and the disconnect
    if let Err(err) = mqtt_client.disconnect() {
        warn!("Could not disconnect MQTT client: {}", err);
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut mqtt_handle).await.is_err() {
        mqtt_cancel.cancel();
        if let Err(err) = mqtt_handle.await {
            error!("MQTT event loop failed: {}", err);
        }
    }

    if let Some(handle) = metrics_handle {
        if let Err(err) = handle.await {
            error!("Metrics server failed: {}", err);
        }
    }

    info!("Exiting presence-monitor");
    Ok(())
}

fn init_logging(debug: bool) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

/// Cancels `cancel` on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Got SIGINT, quitting"),
        () = terminate => info!("Got SIGTERM, quitting"),
        () = cancel.cancelled() => return,
    }

    cancel.cancel();
}
