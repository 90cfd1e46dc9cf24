//! servewatch: notify the co-located application when this pod starts or stops receiving
//! traffic from a service.

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use servewatch::config::{DEFAULT_NAMESPACE, DEFAULT_URL};
use servewatch::server::{self, DEFAULT_LISTEN_PORT};
use servewatch::{label_selector, Credentials, EndpointSliceSource, Monitor, MonitorConfig, Notifier};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Sidecar for monitoring a Kubernetes service and notifying the main application when it is live"
)]
struct Cli {
    /// Log level or filter directive (error, warn, info, debug, trace)
    #[arg(long, short = 'l', global = true, default_value = "warn", env = "LOG_LEVEL")]
    log_level: String,

    /// Path to a kubeconfig file, if not running in-cluster
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Monitor a Kubernetes service
    #[command(visible_alias = "m")]
    Monitor(MonitorArgs),
}

#[derive(Debug, Args)]
struct MonitorArgs {
    /// Kubernetes service to monitor for this pod
    #[arg(long, visible_alias = "svc", env = "SERVEWATCH_SERVICE")]
    service: Option<String>,

    /// Service labels to monitor for this pod, comma-delimited ex. "label1=value1,label2=value2"
    #[arg(long, env = "SERVEWATCH_SERVICE_LABELS")]
    service_labels: Option<String>,

    /// Kubernetes pod to monitor
    #[arg(long, short = 'p', env = "MY_POD_NAME", default_value = "")]
    pod: String,

    /// Kubernetes namespace to monitor
    #[arg(long, short = 'n', env = "MY_POD_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// URL which receives a POST on state change
    #[arg(long, short = 'u', env = "SERVEWATCH_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Disable state change notification
    #[arg(
        long,
        short = 'd',
        env = "SERVEWATCH_DISABLE_STATE_NOTIFIER",
        value_parser = BoolishValueParser::new()
    )]
    disable_notifier: bool,

    /// Port for the status HTTP server
    #[arg(long, env = "SERVEWATCH_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// Debounce window for membership changes, in milliseconds
    #[arg(long, env = "SERVEWATCH_DEBOUNCE_MS", default_value_t = 1000)]
    debounce_ms: u64,
}

impl MonitorArgs {
    fn into_config(self) -> MonitorConfig {
        MonitorConfig {
            namespace: self.namespace,
            pod_name: self.pod,
            service_name: self.service,
            service_labels: self.service_labels,
            url: self.url,
            disable_notifier: self.disable_notifier,
            debounce: Duration::from_millis(self.debounce_ms),
            ..Default::default()
        }
    }
}

/// Filter for `--log-level`. `panic` and `fatal` have no tracing level and map to `error`.
fn log_filter(level: &str) -> Result<EnvFilter, ParseError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "panic" | "fatal" => EnvFilter::try_new("error"),
        "warning" => EnvFilter::try_new("warn"),
        _ => EnvFilter::try_new(level),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match log_filter(&cli.log_level) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("invalid log level {:?}: {}", cli.log_level, e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Command::Monitor(args) = cli.command;
    let listen_port = args.listen_port;
    let config = match args.into_config().validate() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, cli.kubeconfig, listen_port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(reason = %format!("{e:#}"), "fatal error");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: MonitorConfig, kubeconfig: Option<PathBuf>, listen_port: u16) -> Result<()> {
    let credentials = Credentials::load(kubeconfig.as_deref()).context("load cluster credentials")?;
    let selector = label_selector(config.service_name.as_deref(), config.service_labels.as_deref());
    let source = EndpointSliceSource::new(credentials, config.namespace.as_str(), selector);
    let notifier = Notifier::builder().build().context("build notifier")?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port));
    let listener = server::bind(addr)
        .await
        .with_context(|| format!("bind status server on {addr}"))?;
    let server_shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server::serve(
        listener,
        server::router(notifier.subscribe()),
        server_shutdown.clone(),
    ));

    tracing::info!(
        pod = %config.pod_name,
        ns = %config.namespace,
        svc = ?config.service_name,
        labels = ?config.service_labels,
        "starting monitor"
    );
    let monitor = Monitor::new(config, source, notifier);
    let stop = monitor.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::debug!("shutdown signal received");
        stop.stop();
    });

    let state = monitor.run().await;
    tracing::info!(active = state.is_active, "monitor exited");

    server_shutdown.cancel();
    match server_task.await {
        Ok(res) => res.context("status server")?,
        Err(e) => tracing::warn!(reason = %e, "status server task failed"),
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(reason = %e, "listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(reason = %e, "listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
