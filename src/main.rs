use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::Error as DotenvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dbpulse::app::AppContext;
use dbpulse::config::{self, AppConfig};
use dbpulse::metrics::AppMetrics;
use dbpulse::state::SharedState;
use dbpulse::{http, pipeline, sink, stress};

#[derive(Debug, Parser)]
#[command(author, version, about = "dbpulse: database health collection and alerting")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env DBPULSE_CONFIG or built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run cycles on the configured interval and serve the HTTP API (default).
    Serve,
    /// Run a single cycle and print its summary as JSON.
    Collect,
    /// Write a synthetic JSONL sample file for the sample source.
    Stress {
        #[arg(long, default_value_t = 1_000)]
        count: usize,
        #[arg(long, default_value = "sample_inputs/stress_metrics.jsonl")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Stress { count, output } => {
            let events = stress::generate_events(&mut rand::thread_rng(), count);
            stress::write_jsonl(&output, &events).await?;
            info!(count, path = %output.display(), "wrote synthetic sample file");
            Ok(())
        }
        Command::Collect => {
            let config = config::load_config(cli.config.as_deref())?;
            collect_once(config).await
        }
        Command::Serve => {
            let config = config::load_config(cli.config.as_deref())?;
            serve(config).await
        }
    }
}

async fn collect_once(config: AppConfig) -> anyhow::Result<()> {
    let metrics = AppMetrics::new()?;
    let state = SharedState::new();
    let sink = sink::from_config(&config.sink)?;
    let mut pipeline = pipeline::build(&config, sink, metrics, state).await?;

    let summary = pipeline.run_cycle(&CancellationToken::new()).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("failed to encode cycle summary")?
    );
    match summary.failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = AppMetrics::new()?;
    let state = SharedState::new();
    let sink = sink::from_config(&config.sink)?;
    let pipeline =
        pipeline::build(&config, sink.clone(), metrics.clone(), state.clone()).await?;

    let cancel = CancellationToken::new();
    let (handle, driver) =
        pipeline::spawn(pipeline, Some(config.schedule.interval), cancel.clone());

    let ctx = AppContext::new(config, metrics, state, sink, handle);
    let router = http::create_router(ctx.clone());

    info!(target_name = %ctx.target_name(), "dbpulse listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    // Let a running cycle stop at its next probe boundary.
    cancel.cancel();
    if let Err(err) = driver.await {
        error!(error = ?err, "pipeline driver panicked");
    }

    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dbpulse=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
