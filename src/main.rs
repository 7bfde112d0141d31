use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use offline_sync::cache::{CacheStore, GetOptions};
use offline_sync::clock::SystemClock;
use offline_sync::config::Config;
use offline_sync::logging;
use offline_sync::network::NetworkMonitor;
use offline_sync::queue::{PendingWriteQueue, WriteId};
use offline_sync::storage::{KeyValueStore, SqliteStore};
use offline_sync::telemetry::{
  HttpTelemetrySink, TelemetryBatcher, TelemetryEvent, TelemetrySink,
};

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Inspect and repair the offline data store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the SQLite store (overrides storage.path)
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Summarize the queue, cache and telemetry backlog
  Status,
  /// Probe connectivity once
  Probe {
    /// Keep polling on the configured interval and print every change
    #[arg(long)]
    watch: bool,
  },
  /// Inspect or edit the pending write queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Inspect or clear cached responses
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Manage buffered telemetry
  Telemetry {
    #[command(subcommand)]
    action: TelemetryAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List queued writes in replay order
  List,
  /// Drop a queued write by id
  Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Print a cached value
  Get {
    key: String,
    /// Show the entry even if it is past its TTL
    #[arg(long)]
    ignore_expiry: bool,
  },
  /// Remove every cached entry
  Clear,
}

#[derive(Subcommand, Debug)]
enum TelemetryAction {
  /// Send buffered events now
  Flush,
}

/// Sink used when no collector is configured. Events stay buffered.
struct UnconfiguredSink;

impl TelemetrySink for UnconfiguredSink {
  fn send_batch<'a>(&'a self, _events: &'a [TelemetryEvent]) -> BoxFuture<'a, Result<()>> {
    future::ready(Err(eyre!("No telemetry endpoint configured"))).boxed()
  }
}

struct Context {
  config: Config,
  store: Arc<dyn KeyValueStore>,
}

impl Context {
  fn open(args: &Args) -> Result<Self> {
    let config = Config::load(args.config.as_deref())?;

    let store = match args.db.as_ref().or(config.storage.path.as_ref()) {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    };

    Ok(Self {
      config,
      store: Arc::new(store),
    })
  }

  fn cache(&self) -> CacheStore {
    CacheStore::new(self.store.clone(), Arc::new(SystemClock), self.config.cache_config())
  }

  async fn queue(&self) -> Result<PendingWriteQueue<Value>> {
    PendingWriteQueue::open(self.store.clone(), Arc::new(SystemClock)).await
  }

  fn sink(&self) -> Result<Arc<dyn TelemetrySink>> {
    match &self.config.telemetry.endpoint {
      Some(endpoint) => {
        let sink = HttpTelemetrySink::new(endpoint.clone(), self.config.probe_timeout())?
          .with_token(Config::telemetry_token());
        Ok(Arc::new(sink))
      }
      None => Ok(Arc::new(UnconfiguredSink)),
    }
  }

  async fn telemetry(&self) -> Result<TelemetryBatcher> {
    let config = self.config.telemetry_config();
    Ok(TelemetryBatcher::open(self.store.clone(), self.sink()?, config).await)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&logging::default_log_dir()?)?;

  let ctx = Context::open(&args)?;

  match args.command {
    Command::Status => status(&ctx).await,
    Command::Probe { watch } => probe(&ctx, watch).await,
    Command::Queue { action } => match action {
      QueueAction::List => queue_list(&ctx).await,
      QueueAction::Remove { id } => queue_remove(&ctx, &id).await,
    },
    Command::Cache { action } => match action {
      CacheAction::Get { key, ignore_expiry } => cache_get(&ctx, &key, ignore_expiry).await,
      CacheAction::Clear => cache_clear(&ctx).await,
    },
    Command::Telemetry { action } => match action {
      TelemetryAction::Flush => telemetry_flush(&ctx).await,
    },
  }
}

async fn status(ctx: &Context) -> Result<()> {
  let queue = ctx.queue().await?;
  let prefix = ctx.cache().storage_key("");
  let cached = ctx
    .store
    .get_all_keys()
    .await?
    .iter()
    .filter(|k| k.starts_with(&prefix))
    .count();
  let telemetry = ctx.telemetry().await?;

  println!("pending writes:    {}", queue.len().await);
  println!("cached entries:    {}", cached);
  println!("telemetry events:  {}", telemetry.pending().await);
  println!(
    "collector:         {}",
    ctx
      .config
      .telemetry
      .endpoint
      .as_ref()
      .map(|u| u.to_string())
      .unwrap_or_else(|| "(none)".to_string())
  );
  Ok(())
}

async fn probe(ctx: &Context, watch: bool) -> Result<()> {
  let probe = Arc::new(ctx.config.http_probe()?);

  if !watch {
    let monitor = NetworkMonitor::new(probe, ctx.config.probe_timeout());
    let connected = monitor.check_now().await;
    println!("{}", if connected { "connected" } else { "disconnected" });
    return Ok(());
  }

  let monitor = ctx.config.network_monitor(probe);
  let _subscription = monitor.subscribe(|| println!("connected"), || println!("disconnected"));
  // Changes are reported as edges, so print where we start from
  let connected = monitor.check_now().await;
  println!("{}", if connected { "connected" } else { "disconnected" });
  println!(
    "polling {} every {}s, Ctrl-C to stop",
    ctx.config.probe_url()?,
    ctx.config.poll_interval().as_secs()
  );

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;
  monitor.stop();
  Ok(())
}

async fn queue_list(ctx: &Context) -> Result<()> {
  let queue = ctx.queue().await?;
  let items = queue.list().await;

  if items.is_empty() {
    println!("queue is empty");
    return Ok(());
  }

  for item in items {
    let payload = serde_json::to_string(&item.payload)
      .map_err(|e| eyre!("Failed to encode payload of {}: {}", item.id, e))?;
    println!("{}\t{}\t{}", item.id, item.kind, payload);
  }
  Ok(())
}

async fn queue_remove(ctx: &Context, id: &str) -> Result<()> {
  let id: WriteId = id.parse()?;
  let queue = ctx.queue().await?;
  if queue.remove_by_id(id).await? {
    println!("removed {}", id);
    Ok(())
  } else {
    Err(eyre!("No queued write with id {}", id))
  }
}

async fn cache_get(ctx: &Context, key: &str, ignore_expiry: bool) -> Result<()> {
  let opts = GetOptions {
    check_expiry: !ignore_expiry,
  };

  match ctx.cache().get_entry::<Value>(key, opts).await {
    Some(entry) => {
      let value = serde_json::to_string_pretty(&entry.value)
        .map_err(|e| eyre!("Failed to encode cached value: {}", e))?;
      println!("# stored at {}", entry.stored_at.to_rfc3339());
      println!("{}", value);
      Ok(())
    }
    None => Err(eyre!("No cached value for '{}'", key)),
  }
}

async fn cache_clear(ctx: &Context) -> Result<()> {
  let removed = ctx.cache().clear_all().await;
  println!("removed {} cached entries", removed);
  Ok(())
}

async fn telemetry_flush(ctx: &Context) -> Result<()> {
  if ctx.config.telemetry.endpoint.is_none() {
    return Err(eyre!("No telemetry endpoint configured"));
  }

  let telemetry = ctx.telemetry().await?;
  let sent = telemetry.flush().await;
  let remaining = telemetry.pending().await;
  println!("sent {} events, {} still buffered", sent, remaining);
  Ok(())
}
