//! notification-processor CLI: runs the worker or feeds its queue.

use clap::{Parser, Subcommand};
use notification_processor::command::CommandFactory;
use notification_processor::config::Config;
use notification_processor::dispatch::CommandDispatcher;
use notification_processor::engine::{Pipeline, Worker, WorkerConfig};
use notification_processor::handler::builtin::default_registry;
use notification_processor::telemetry::{TelemetryConfig, init_telemetry};
use notification_processor::transport::{PgmqOptions, PgmqTransport};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "notification-processor", about = "Incident management notification service")]
struct Cli {
    /// Config file (TOML, or JSON with a .json extension) overriding the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the queue until interrupted (default)
    Serve,
    /// Enqueue a message for the worker
    Send {
        /// JSON payload, e.g. '{"description": "disk full"}'
        payload: String,
        /// Seconds before the message becomes visible
        #[arg(long, default_value_t = 0)]
        delay: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => cmd_serve(config).await,
        Command::Send { payload, delay } => cmd_send(config, payload, delay).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgmqTransport> {
    let url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let options = PgmqOptions {
        visibility_timeout_secs: config.visibility_timeout_secs,
        poll_interval: config.poll_interval,
        ..PgmqOptions::default()
    };
    let transport =
        PgmqTransport::connect(url.expose_secret(), &config.subscription_id, options).await?;
    transport.create_queue().await?;
    Ok(transport)
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(
        &config,
        "notification-processor",
    ))?;

    info!(
        project = %config.project_id,
        subscription = %config.subscription_id,
        max_messages = config.max_messages,
        "starting notification processor"
    );

    let transport = connect(&config).await?;
    let dispatcher = CommandDispatcher::new(Arc::new(default_registry()));
    let pipeline = Pipeline::new(CommandFactory::new(), dispatcher);
    let worker = Worker::new(transport, pipeline, WorkerConfig::from(&config));

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal, draining");
        shutdown.shutdown();
    });

    let report = worker.run().await?;
    info!(
        acknowledged = report.acknowledged,
        rejected = report.rejected,
        abandoned = report.abandoned,
        "notification processor stopped"
    );
    Ok(())
}

async fn cmd_send(config: Config, payload: String, delay: i32) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    let transport = connect(&config).await?;
    let msg_id = transport.send(&payload, delay).await?;
    println!("Sent: {msg_id} → {}", transport.queue());
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
