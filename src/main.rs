//! GPU Fleet Operator
//!
//! Runs the node controller that keeps `GPUDevice` and `GPUNodeState`
//! records in step with the cluster's GPUs, plus the probe server.

use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpu_fleet_operator::controlplane::server::{self, ProbeState};
use gpu_fleet_operator::controlplane::{
    BootstrapConfig, ExporterHeartbeatScraper, HeartbeatConfig, KubeEventRecorder, KubeStore,
    KubeWorkloadProber, OperatorMetrics, Orchestrator, OrchestratorConfig,
};
use gpu_fleet_operator::hardware::detection::{DetectionClientConfig, HttpDetectionClient};
use gpu_fleet_operator::{Error, ModuleSettings, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// GPU Fleet Operator - GPU inventory and bootstrap readiness controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Module settings file (YAML); defaults apply when omitted
    #[arg(long, env = "SETTINGS_PATH")]
    settings: Option<PathBuf>,

    /// Probe server bind address (/healthz, /readyz, /metrics)
    #[arg(long, env = "PROBE_ADDR", default_value = "0.0.0.0:8081")]
    probe_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Nodes reconciled in parallel
    #[arg(long, env = "CONCURRENCY", default_value = "4")]
    concurrency: u16,

    /// Namespace of the GPU support workloads
    #[arg(long, env = "WORKLOAD_NAMESPACE", default_value = "gpu-operator")]
    workload_namespace: String,

    /// Port of the per-node detection sidecar
    #[arg(long, env = "DETECTION_PORT", default_value = "9401")]
    detection_port: u16,

    /// Metrics port of the monitoring exporter
    #[arg(long, env = "EXPORTER_PORT", default_value = "9400")]
    exporter_port: u16,

    /// Timeout for workload probes and sidecar calls, in seconds
    #[arg(long, env = "PROBE_TIMEOUT", default_value = "5")]
    probe_timeout_secs: u64,

    /// Event reporter instance, usually the pod name
    #[arg(long, env = "POD_NAME")]
    instance: Option<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting GPU Fleet Operator");
    info!("  Version: {}", gpu_fleet_operator::VERSION);
    info!("  Probe server: {}", args.probe_addr);
    info!("  Workload namespace: {}", args.workload_namespace);
    info!("  Concurrency: {}", args.concurrency);

    let settings = ModuleSettings::load(args.settings.as_deref())?;
    info!(
        approval = ?settings.device_approval.mode,
        label_key = %settings.managed_nodes.label_key,
        resync = %settings.inventory.resync_period,
        "Loaded module settings"
    );

    let probe_addr: SocketAddr = args
        .probe_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid probe address: {}", e)))?;
    let timeout = Duration::from_secs(args.probe_timeout_secs);

    let client = Client::try_default().await?;
    let metrics = OperatorMetrics::new()?;
    let bootstrap = BootstrapConfig::default();

    let prober = KubeWorkloadProber::new(
        client.clone(),
        &args.workload_namespace,
        &bootstrap.components.validator,
        timeout,
    );
    let heartbeat = ExporterHeartbeatScraper::new(HeartbeatConfig {
        port: args.exporter_port,
        timeout,
        ..Default::default()
    })?;
    let detection = HttpDetectionClient::new(DetectionClientConfig {
        port: args.detection_port,
        timeout,
    })?;

    let orchestrator = Arc::new(
        Orchestrator::builder(
            settings,
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(KubeEventRecorder::new(client.clone(), args.instance.clone())),
            metrics.clone(),
        )
        .config(OrchestratorConfig {
            concurrency: args.concurrency,
            bootstrap,
            ..Default::default()
        })
        .prober(Arc::new(prober))
        .heartbeat(Arc::new(heartbeat))
        .detection(Arc::new(detection))
        .build()?,
    );

    let token = CancellationToken::new();

    let probe_state = ProbeState {
        ready: orchestrator.readiness(),
        metrics,
    };
    let probe_server = tokio::spawn(server::serve(probe_addr, probe_state, token.clone()));

    let shutdown = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    let result = orchestrator.run(client, token.clone()).await;
    token.cancel();

    match probe_server.await {
        Ok(Err(e)) => error!("Probe server error: {}", e),
        Err(e) => error!("Probe server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Operator shutdown complete");
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower_http=info", "axum=info"] {
        let directive: Directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Signals
// =============================================================================

/// Ctrl-C or SIGTERM, whichever arrives first
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
