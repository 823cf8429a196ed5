mod app;
mod cache;
mod config;
mod db;
mod event;
mod interceptor;
mod lifecycle;
mod messages;
mod notify;
mod queue;
mod remote;
mod sync;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

use crate::app::App;
use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::{Envelope, EventHandler};
use crate::queue::{MemoryQueue, MutationQueue, SqliteQueue};
use crate::remote::{HttpClient, Network};

#[derive(Parser, Debug)]
#[command(name = "taskpilot-offline")]
#[command(about = "Offline cache and mutation replay layer for TaskPilot")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/taskpilot/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// App origin that relative request URLs resolve against
  #[arg(short, long)]
  origin: Option<String>,

  /// Keep caches and the queue in memory only
  #[arg(long)]
  ephemeral: bool,

  /// Handle a single JSON event and exit instead of reading stdin
  #[arg(short, long)]
  event: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config { origin, ..config }
  } else {
    config
  };

  let data_dir = config.data_dir()?;
  let _guard = init_tracing((!args.ephemeral).then_some(data_dir.as_path()))?;

  let network: Arc<dyn Network> = Arc::new(HttpClient::new(config.api.timeout())?);

  if args.ephemeral {
    let app = App::new(
      config,
      Arc::new(MemoryStorage::new()),
      Arc::new(MemoryQueue::new()),
      network,
    )?;
    run(app, args.event).await
  } else {
    let db = Database::open(&data_dir)?;
    let app = App::new(
      config,
      Arc::new(SqliteStorage::new(db.clone())),
      Arc::new(SqliteQueue::new(db)) as Arc<dyn MutationQueue>,
      network,
    )?;
    run(app, args.event).await
  }
}

async fn run<S: CacheStorage>(app: App<S>, event: Option<String>) -> Result<()> {
  match event {
    Some(raw) => {
      let envelope: Envelope =
        serde_json::from_str(&raw).map_err(|e| eyre!("Failed to parse event: {}", e))?;
      let reply = app.handle(envelope).await;
      app.flush_writes().await;
      let line =
        serde_json::to_string(&reply).map_err(|e| eyre!("Failed to encode reply: {}", e))?;
      println!("{}", line);
      Ok(())
    }
    None => Arc::new(app).run(EventHandler::new()).await,
  }
}

/// Log to stderr, plus a daily file under the data directory when persistent.
///
/// stdout carries replies, so nothing else may write there.
fn init_tracing(data_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  use tracing_subscriber::{fmt, prelude::*, EnvFilter};

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match data_dir {
    Some(dir) => {
      let log_dir = dir.join("logs");
      std::fs::create_dir_all(&log_dir)
        .map_err(|e| eyre!("Failed to create log directory: {}", e))?;
      let appender = tracing_appender::rolling::daily(log_dir, "taskpilot.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  Ok(guard)
}
