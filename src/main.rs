use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use sheetsync::config::Config;
use sheetsync::connectivity::{self, ConnectivityMonitor};
use sheetsync::sync::{ApiResponse, PendingMutation, ReadPolicy, Rows, SyncClient};
use sheetsync::{logging, open_client};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "sheetsync")]
#[command(about = "Offline-tolerant client for spreadsheet values")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sheetsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Skip the connectivity probe and treat the remote as unreachable
  #[arg(long)]
  offline: bool,

  /// Write logs to a daily-rolling file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Increase log verbosity (-v, -vv, -vvv)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a range, from cache when possible
  Read {
    resource: String,
    /// Always go to the network first
    #[arg(long, conflicts_with = "max_age")]
    network: bool,
    /// Accept cached data younger than this many seconds
    #[arg(long)]
    max_age: Option<u64>,
  },
  /// Append rows (JSON array of arrays) after the last row of a range
  Append { resource: String, rows: String },
  /// Overwrite a range with rows (JSON array of arrays)
  Update { resource: String, rows: String },
  /// Clear every value in a range
  Clear { resource: String },
  /// List mutations waiting for replay
  Pending,
  /// Drop a queued mutation by id
  Discard { id: String },
  /// Replay queued mutations now
  Replay,
  /// Show connectivity and queue state
  Status,
  /// Keep probing the remote and replay queued mutations on every reconnect
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose, args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;

  let online = if args.offline {
    false
  } else {
    let client = reqwest::Client::new();
    connectivity::probe(&client, &config.remote.base_url, PROBE_TIMEOUT).await
  };
  debug!("Starting {}", if online { "online" } else { "offline" });

  let monitor = ConnectivityMonitor::new(online);
  let client = open_client(&config, Arc::new(monitor.clone()))?;

  if client.is_online() && !client.pending_mutations().is_empty() {
    let report = client.replay_pending().await;
    info!(
      "Startup replay: {} succeeded, {} failed, {} deferred",
      report.succeeded, report.failed, report.deferred
    );
  }

  let output = match args.command {
    Command::Read {
      resource,
      network,
      max_age,
    } => {
      let policy = match (network, max_age) {
        (true, _) => ReadPolicy::NetworkFirst,
        (false, Some(secs)) => ReadPolicy::Fresh(Duration::from_secs(secs)),
        (false, None) => ReadPolicy::CacheFirst,
      };
      response_json(&client.fetch(&resource, policy).await)
    }
    Command::Append { resource, rows } => {
      response_json(&client.append(&resource, parse_rows(&rows)?).await)
    }
    Command::Update { resource, rows } => {
      response_json(&client.update(&resource, parse_rows(&rows)?).await)
    }
    Command::Clear { resource } => response_json(&client.clear(&resource).await),
    Command::Pending => {
      let pending: Vec<Value> = client.pending_mutations().iter().map(mutation_json).collect();
      Value::Array(pending)
    }
    Command::Discard { id } => json!({ "id": id, "discarded": client.discard_mutation(&id) }),
    Command::Replay => {
      let report = client.replay_pending().await;
      json!({
        "attempted": report.attempted,
        "succeeded": report.succeeded,
        "failed": report.failed,
        "deferred": report.deferred,
      })
    }
    Command::Status => {
      let status = client.status();
      json!({
        "online": status.online,
        "pending": status.pending,
        "in_flight": status.in_flight,
      })
    }
    Command::Watch => return watch(&config, monitor, client).await,
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn watch(config: &Config, monitor: ConnectivityMonitor, client: SyncClient) -> Result<()> {
  let interval = config
    .probe_interval()
    .ok_or_else(|| eyre!("watch needs remote.probe_interval_secs greater than 0"))?;

  let probe = connectivity::spawn_probe(monitor, config.remote.base_url.clone(), interval);
  let replay = client.spawn_replay_on_reconnect();
  info!("Watching {} every {:?}", config.remote.base_url, interval);

  tokio::signal::ctrl_c().await?;

  probe.abort();
  replay.abort();
  info!("Stopped with {} mutations pending", client.pending_mutations().len());
  Ok(())
}

fn parse_rows(raw: &str) -> Result<Rows> {
  serde_json::from_str(raw).map_err(|e| eyre!("Rows must be a JSON array of arrays: {}", e))
}

fn response_json(response: &ApiResponse) -> Value {
  json!({
    "success": response.success,
    "source": response.source,
    "from_cache": response.from_cache(),
    "cached_at": response.cached_at.map(|t| t.to_rfc3339()),
    "data": response.data,
    "error": response.error.as_ref().map(|e| e.to_string()),
  })
}

fn mutation_json(mutation: &PendingMutation) -> Value {
  json!({
    "id": mutation.id,
    "timestamp": mutation.timestamp.to_rfc3339(),
    "verb": mutation.request.verb,
    "resource": mutation.request.resource,
    "body": mutation.request.body,
  })
}
