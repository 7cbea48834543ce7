use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use touchline::cache::{CacheStore, NoopStore, SqliteStore};
use touchline::config::Config;
use touchline::engine::Engine;
use touchline::net::HttpClient;
use touchline::notify::LogSink;
use touchline::queue::RetryQueue;

#[derive(Parser, Debug)]
#[command(name = "touchline")]
#[command(about = "Offline resource cache and background-sync engine for the Touchline front end")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/touchline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for the cache and queue databases
  #[arg(short, long)]
  data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  let data_dir = match args.data_dir {
    Some(dir) => dir,
    None => Config::default_data_dir()?,
  };
  let _log_guard = init_tracing(&data_dir)?;

  let store: Arc<dyn CacheStore> = if config.cache.enabled {
    Arc::new(SqliteStore::open(&data_dir.join("cache.db"))?)
  } else {
    Arc::new(NoopStore)
  };
  let queue = Arc::new(RetryQueue::open(&data_dir.join("queue.db"), config.queue)?);

  let (engine, handle) = Engine::new(config, store, queue, HttpClient::new()?, Arc::new(LogSink))?;
  let engine_task = tokio::spawn(engine.run());

  // Serve until interrupted; the hosting application drives `handle`.
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;

  tracing::info!("shutting down");
  drop(handle);
  engine_task.abort();

  Ok(())
}

fn init_tracing(data_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "touchline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
