mod config;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use habit_sync::cache::{persist_snapshot, restore_snapshot, MemoryCache, OptimisticPatcher, ReadCache};
use habit_sync::connectivity::ConnectivityMonitor;
use habit_sync::error::SyncError;
use habit_sync::habit::{HabitLog, NewHabitLog};
use habit_sync::remote::HttpRemote;
use habit_sync::store::SqliteStore;
use habit_sync::sync::{FailureNotice, Mutation, SyncEngine, SyncSummary, SyncTrigger};

#[derive(Parser, Debug)]
#[command(name = "habit-sync")]
#[command(about = "Log habits offline and sync them when the backend is reachable")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/habit-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Record a habit completion
  Log {
    /// Habit id
    #[arg(long)]
    habit: String,
    #[arg(long)]
    value: Option<i64>,
    #[arg(long)]
    notes: Option<String>,
  },
  /// Send pending writes now
  Sync,
  /// Show pending writes and the last sync time
  Status,
  /// Drop all pending writes
  Clear,
  /// Sync whenever the backend becomes reachable, until Ctrl-C
  Watch,
}

type Engine = SyncEngine<NewHabitLog, Arc<SqliteStore>, HttpRemote>;

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("habit-sync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "habit-sync.log"));

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "habit_sync=info".into()),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let config = config::Config::load(args.config.as_deref())?;
  let api_key = config::Config::get_api_key()?;

  let remote = HttpRemote::new(&config.backend.url, &api_key, config.sync.request_timeout())
    .map_err(|e| eyre!("Failed to create backend client: {}", e))?;
  let store = Arc::new(
    SqliteStore::open().map_err(|e| eyre!("Failed to open local store: {}", e))?,
  );

  let cache: Arc<dyn ReadCache<HabitLog>> = Arc::new(MemoryCache::new());
  restore_snapshot(cache.as_ref(), store.as_ref(), config.cache.max_age()).await?;
  let patcher = Arc::new(OptimisticPatcher::new(Arc::clone(&cache)));

  let monitor = matches!(args.command, Command::Watch)
    .then(|| ConnectivityMonitor::spawn(remote.clone(), config.sync.probe_interval()));

  let engine = SyncEngine::new(
    Arc::clone(&store),
    remote,
    patcher,
    config.sync.engine_config(),
  );
  let engine = match &monitor {
    Some(monitor) => engine.with_connectivity(monitor.subscribe()),
    None => engine,
  };
  engine.restore().await?;
  let mut notices = engine
    .take_notifications()
    .ok_or_else(|| eyre!("Failure notices already taken"))?;

  match args.command {
    Command::Log { habit, value, notes } => {
      let payload = NewHabitLog {
        habit_id: habit,
        user_id: config.backend.user_id.clone(),
        logged_at: Utc::now(),
        value,
        notes,
      };
      let description = payload.describe();
      match engine.queue_mutation(payload).await {
        Ok(local_id) => println!("{} (queued as {})", description, local_id),
        Err(SyncError::NotDurable { local_id, reason }) => {
          eprintln!("Warning: {} could not be saved locally: {}", local_id, reason);
          // Nothing keeps it past this process, so try the backend now
          let summary = engine.trigger_sync(SyncTrigger::Manual).await;
          print_summary(&summary, &mut notices);
        }
        Err(err) => return Err(err.into()),
      }
    }
    Command::Sync => {
      let summary = engine.trigger_sync(SyncTrigger::Manual).await;
      print_summary(&summary, &mut notices);
    }
    Command::Status => print_status(&engine).await?,
    Command::Clear => {
      engine.clear().await?;
      println!("Cleared all pending writes");
    }
    Command::Watch => {
      let Some(monitor) = &monitor else {
        return Err(eyre!("Connectivity monitor not running"));
      };
      println!("Watching connectivity, press Ctrl-C to stop");
      let watcher = engine.watch_connectivity(monitor.subscribe());
      tokio::pin!(watcher);
      loop {
        tokio::select! {
          _ = &mut watcher => break,
          Some(notice) = notices.recv() => print_notice(&notice),
          _ = tokio::signal::ctrl_c() => {
            info!("interrupted, finishing the write in flight");
            engine.cancel();
            (&mut watcher).await;
            break;
          }
        }
      }
      while let Ok(notice) = notices.try_recv() {
        print_notice(&notice);
      }
    }
  }

  persist_snapshot(cache.as_ref(), store.as_ref(), config.cache.max_entries).await?;
  Ok(())
}

async fn print_status(engine: &Engine) -> Result<()> {
  let pending = engine.pending().await?;
  if pending.is_empty() {
    println!("No pending writes");
  }
  for mutation in &pending {
    print!(
      "{}  {:?}  attempts={}  {}",
      mutation.local_id,
      mutation.status,
      mutation.attempt_count,
      mutation.payload.describe()
    );
    match &mutation.last_error {
      Some(error) => println!("  (last error: {})", error),
      None => println!(),
    }
  }

  match engine.last_sync().await? {
    Some(at) => println!("Last sync: {}", at.to_rfc3339()),
    None => println!("Last sync: never"),
  }
  Ok(())
}

fn print_summary(summary: &SyncSummary, notices: &mut mpsc::UnboundedReceiver<FailureNotice>) {
  println!(
    "Committed {}, failed {}, reverted {}",
    summary.committed, summary.failed, summary.reverted
  );
  while let Ok(notice) = notices.try_recv() {
    print_notice(&notice);
  }
}

fn print_notice(notice: &FailureNotice) {
  eprintln!(
    "Reverted: {} ({}): {}",
    notice.description, notice.local_id, notice.reason
  );
}
