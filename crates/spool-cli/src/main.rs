//! spool - session queue worker with an HTTP trigger

mod api;
mod config;
mod telemetry;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spool_core::QueueClient;
use spool_core::impls::{InMemoryBroker, MetricsTelemetry, NoopTelemetry};
use spool_core::ports::TelemetrySink;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::ApiState;
use crate::worker::ProcessMessageHandler;

#[derive(Parser)]
#[command(name = "spool", version, about = "Session-ordered queue worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file (JSON).
    #[arg(long, global = true, env = "SPOOL_CONFIG", default_value = "appsettings.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP trigger and the session workers (default).
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
    /// Validate settings and print them with secrets redacted.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_level, cli.log_json);

    let settings = config::load(&cli.config, std::env::vars())?;

    match cli.command.unwrap_or(Commands::Serve {
        bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
    }) {
        Commands::Serve { bind } => serve(settings, bind).await,
        Commands::CheckConfig => {
            let service_bus = settings
                .service_bus_settings
                .validate()
                .context("invalid ServiceBusSettings")?;
            println!("{service_bus:#?}");
            println!("{:#?}", settings.telemetry);
            println!("{:#?}", settings.downstream);
            Ok(())
        }
    }
}

async fn serve(settings: config::AppSettings, bind: SocketAddr) -> Result<()> {
    let service_bus = settings
        .service_bus_settings
        .validate()
        .context("invalid ServiceBusSettings")?;

    // Messages live in this process; the connection string is validated only.
    if !service_bus.connection.is_development_emulator() {
        warn!(
            endpoint = service_bus.connection.endpoint(),
            "remote namespaces are not reachable from this build; using the in-process broker"
        );
    }
    let broker = InMemoryBroker::new();
    broker.create_queue(service_bus.queue.clone()).await;

    let (sink, metrics) = if settings.telemetry.enabled {
        let handle = telemetry::install_prometheus()?;
        let sink: Arc<dyn TelemetrySink> =
            Arc::new(MetricsTelemetry::new(&settings.telemetry.service_name));
        (sink, Some(handle))
    } else {
        let sink: Arc<dyn TelemetrySink> = Arc::new(NoopTelemetry);
        (sink, None)
    };

    let client = QueueClient::builder(Arc::new(broker))
        .settings(&service_bus)
        .telemetry(sink)
        .service_name(settings.telemetry.service_name.clone())
        .build()
        .context("failed to build queue client")?;

    let http = worker::http_client(settings.downstream.timeout()).context("failed to build HTTP client")?;
    let handler = ProcessMessageHandler::new(http, settings.downstream.url.clone());
    let receiver = client.register_message_receiver(Arc::new(handler));

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, queue = %service_bus.queue, workers = receiver.worker_count(), "spool started");

    let app = api::router(ApiState { client, metrics });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("draining session workers");
    receiver.shutdown_and_join().await;
    info!("spool stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
