//! SCADA-IDS detector daemon.
//!
//! - UDP receiver for parsed-packet datagrams
//! - Fan-out to the aggregate and per-packet engines
//! - Text reports per scored window and per anomalous batch
//! - REST API for health, statistics and Prometheus metrics

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scada_ids::{
    api::{self, ApiState},
    config::{HostInventory, IdsConfig},
    engine::{BatchScorer, PacketTransform, ReportSink, StreamAggregator},
    fanout::{FanOut, FanOutConfig},
    features::Baseline,
    gateway::{UdpConfig, UdpReceiver},
    inference::{Ensemble, Predictor},
    metrics,
};

/// Initialize logging
fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("scada_ids={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = IdsConfig::from_env();
    init_logging(&config.log_level);
    metrics::init();

    tracing::info!(
        version = scada_ids::VERSION,
        git = scada_ids::build_info::GIT_HASH,
        "Starting SCADA-IDS"
    );

    // Artifacts: any failure here aborts startup
    let inventory = HostInventory::load(&config.inventory_path).with_context(|| {
        format!("loading inventory {}", config.inventory_path.display())
    })?;
    let baseline = Baseline::load(&config.baseline_path)
        .with_context(|| format!("loading baseline {}", config.baseline_path.display()))?;
    let ensemble = Ensemble::load(&config.model_paths).context("loading aggregate models")?;
    if ensemble.is_empty() {
        bail!("no aggregate models configured");
    }
    let packet_model = Predictor::load(&config.packet_model_path).with_context(|| {
        format!("loading per-packet model {}", config.packet_model_path.display())
    })?;

    tracing::info!(
        hosts = inventory.hosts.len(),
        models = ensemble.len(),
        packet_model = packet_model.name(),
        batch_size = config.batch_size,
        "Configuration loaded"
    );

    let aggregator = StreamAggregator::from_baseline(baseline, ensemble)
        .context("computing baseline statistics")?;
    let scorer = BatchScorer::new(
        packet_model,
        PacketTransform::new(&inventory),
        config.batch_size,
    );
    let aggregate_stats = aggregator.stats();
    let batch_stats = scorer.stats();

    let aggregate_sink = ReportSink::open(&config.aggregate_out)
        .with_context(|| format!("opening {:?}", config.aggregate_out))?;
    let packet_sink = ReportSink::open(&config.packet_out)
        .with_context(|| format!("opening {:?}", config.packet_out))?;

    // One queue per engine
    let mut fanout = FanOut::new(FanOutConfig {
        warn_depth: config.queue_warn_depth,
        queue_limit: config.queue_limit,
    });
    let aggregate_rx = fanout.subscribe("aggregate");
    let packet_rx = fanout.subscribe("per_packet");
    let lanes = fanout.stats();

    let aggregate_handle = tokio::spawn(aggregator.run(aggregate_rx, aggregate_sink));
    let packet_handle = tokio::spawn(scorer.run(packet_rx, packet_sink));

    // The receiver holds the only fan-out handle; stopping it closes every queue
    let udp_config = UdpConfig {
        bind_addr: config.udp_bind.clone(),
        ..Default::default()
    };
    let receiver = UdpReceiver::bind(udp_config, Arc::new(fanout))
        .await
        .with_context(|| format!("binding {}", config.udp_bind))?;
    let gateway_stats = receiver.stats();
    let receiver_handle = tokio::spawn(async move { receiver.run().await });

    let api_state = Arc::new(ApiState {
        lanes,
        aggregate: aggregate_stats,
        batch: batch_stats,
        gateway: Arc::clone(&gateway_stats),
    });
    let api_addr = config.api_bind.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::run_server(&api_addr, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    tracing::info!(
        udp = %config.udp_bind,
        api = %config.api_bind,
        "SCADA-IDS running"
    );

    shutdown_signal().await;

    tracing::info!("Shutting down...");

    receiver_handle.abort();
    let _ = receiver_handle.await;

    // Queues are closed; engines drain what is left and exit
    for (engine, handle) in [("aggregate", aggregate_handle), ("per_packet", packet_handle)] {
        if let Err(e) = handle.await {
            tracing::error!(engine, error = %e, "Engine task failed");
        }
    }
    api_handle.abort();

    let gateway = gateway_stats.snapshot();
    tracing::info!(
        received = gateway.received,
        parsed = gateway.parsed,
        parse_errors = gateway.parse_errors,
        "SCADA-IDS stopped"
    );

    Ok(())
}
