mod cache;
mod config;
mod connectivity;
mod error;
mod remote;
mod report;
mod subscription;
mod sync;
mod vehicle;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::{KeyValueStore, SqliteStorage};
use config::Config;
use connectivity::{Connectivity, ConnectivityProbe};
use remote::FirestoreStore;
use report::{ReportFilter, ReportRange, Summary};
use sync::{ReconnectWorker, SyncEngine};
use vehicle::{NewVehicle, Vehicle, VehiclePatch, VehicleStatus};

type Engine = SyncEngine<FirestoreStore>;

#[derive(Parser, Debug)]
#[command(name = "parkwatch")]
#[command(about = "Offline-first vehicle entry/exit tracking for parking facilities")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/parkwatch/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the remote store as unreachable for this run
  #[arg(long, global = true)]
  offline: bool,

  /// Keep local state in memory only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Register a vehicle entering the facility
  Enter {
    plate: String,
    #[arg(long, default_value = "")]
    model: String,
    #[arg(long, default_value = "")]
    color: String,
    #[arg(long, default_value = "")]
    owner: String,
    #[arg(long, conflicts_with = "auto_tag")]
    tag: Option<String>,
    /// Hand out the next free numeric tag
    #[arg(long)]
    auto_tag: bool,
    #[arg(long, default_value = "")]
    notes: String,
  },
  /// Record a vehicle leaving
  Exit { id: String },
  /// Change descriptive fields of a vehicle
  Edit {
    id: String,
    #[arg(long)]
    plate: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    notes: Option<String>,
  },
  /// Delete one vehicle record
  Delete { id: String },
  /// Delete every vehicle record
  Purge {
    #[arg(long)]
    yes: bool,
  },
  /// List known vehicles
  List {
    #[arg(long, conflicts_with = "exited")]
    inside: bool,
    #[arg(long)]
    exited: bool,
    /// Match tag, plate, model or owner
    #[arg(long)]
    search: Option<String>,
  },
  /// Follow the vehicle set and synchronize on reconnect until Ctrl-C
  Watch,
  /// Replay queued changes and migrate offline entries now
  Sync,
  /// Filtered listing with totals
  Report {
    #[arg(long, value_enum, default_value_t = RangeArg::Today)]
    range: RangeArg,
    /// First day of a period report (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last day of a period report (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long, value_parser = parse_status)]
    status: Option<VehicleStatus>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    plate: Option<String>,
  },
  /// Show connectivity and local queue state
  Status,
  /// Print the next free numeric tag
  NextTag,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RangeArg {
  Today,
  Period,
  All,
  Inside,
}

fn parse_status(s: &str) -> Result<VehicleStatus, String> {
  VehicleStatus::parse(s).ok_or_else(|| format!("unknown status {:?} (INSIDE or EXITED)", s))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let db_path = match &config.storage.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let log_dir = db_path
    .parent()
    .filter(|dir| !dir.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  let _log_guard = init_logging(log_dir)?;

  let storage: Arc<dyn KeyValueStore> = if args.ephemeral {
    Arc::new(SqliteStorage::open_in_memory()?)
  } else {
    Arc::new(SqliteStorage::open(&db_path)?)
  };

  let probe = ConnectivityProbe::new(
    config.connectivity.probe_address.clone(),
    config.connectivity.probe_interval(),
    config.connectivity.probe_timeout(),
  );
  let online = !args.offline && probe.check().await;
  info!(online, "Starting parkwatch");

  let remote = FirestoreStore::new(&config.remote, Config::get_api_key())?;
  let engine = Arc::new(
    SyncEngine::new(
      Arc::new(remote),
      storage,
      Connectivity::new(online),
      config.remote.collection.clone(),
    )
    .with_replay_policy(config.sync.replay_policy),
  );

  match args.command {
    Command::Enter {
      plate,
      model,
      color,
      owner,
      tag,
      auto_tag,
      notes,
    } => {
      let tag = match tag {
        Some(tag) => tag,
        None if auto_tag => report::next_tag_number(&current_vehicles(&engine).await),
        None => String::new(),
      };
      let id = engine
        .add(NewVehicle {
          model,
          color,
          owner,
          tag: tag.clone(),
          notes,
          ..NewVehicle::new(plate.trim().to_uppercase())
        })
        .await?;
      if tag.is_empty() {
        println!("{}", id);
      } else {
        println!("{} (tag {})", id, tag);
      }
    }
    Command::Exit { id } => {
      engine.update(&id, VehiclePatch::exit(Utc::now())).await?;
      println!("{} exited", id);
    }
    Command::Edit {
      id,
      plate,
      model,
      color,
      owner,
      tag,
      notes,
    } => {
      let patch = VehiclePatch {
        plate: plate.map(|p| p.trim().to_uppercase()),
        model,
        color,
        owner,
        tag,
        notes,
        ..Default::default()
      };
      engine.update(&id, patch).await?;
      println!("{} updated", id);
    }
    Command::Delete { id } => {
      engine.delete(&id).await?;
      println!("{} deleted", id);
    }
    Command::Purge { yes } => {
      if !yes {
        return Err(eyre!("Refusing to delete every record without --yes"));
      }
      engine.delete_all().await?;
      println!("All records deleted");
    }
    Command::List {
      inside,
      exited,
      search,
    } => {
      let vehicles = current_vehicles(&engine).await;
      let shown: Vec<&Vehicle> = report::search(&vehicles, search.as_deref().unwrap_or(""))
        .into_iter()
        .filter(|v| (!inside || v.is_inside()) && (!exited || !v.is_inside()))
        .collect();
      print_vehicles(&shown);
    }
    Command::Watch => watch(Arc::clone(&engine), probe, args.offline).await?,
    Command::Sync => {
      let report = engine.sync_pass().await;
      println!("Sync {}", report);
    }
    Command::Report {
      range,
      from,
      to,
      status,
      model,
      owner,
      tag,
      plate,
    } => {
      let today = Local::now().date_naive();
      let range = match range {
        RangeArg::Today => ReportRange::Today,
        RangeArg::Period => {
          let (Some(from), Some(to)) = (from, to) else {
            return Err(eyre!("A period report needs both --from and --to"));
          };
          if from > to {
            return Err(eyre!("--from {} is after --to {}", from, to));
          }
          ReportRange::Period { from, to }
        }
        RangeArg::All => ReportRange::All,
        RangeArg::Inside => ReportRange::Inside,
      };

      let vehicles = match range {
        ReportRange::Today => vehicles_on_days(&engine, today, today).await?,
        ReportRange::Period { from, to } => vehicles_on_days(&engine, from, to).await?,
        ReportRange::All | ReportRange::Inside => current_vehicles(&engine).await,
      };

      let filter = ReportFilter {
        status,
        model,
        owner,
        tag,
        plate,
        ..ReportFilter::new(range)
      };
      let selected = filter.apply(&vehicles, today);
      print_vehicles(&selected);

      let summary = Summary::from_vehicles(selected.iter().copied(), today);
      println!();
      println!(
        "Total {}  Inside {}  Exited {}  Entered today {}  Average stay {}",
        summary.total,
        summary.inside,
        summary.exited,
        summary.entered_today,
        summary
          .average_stay
          .map_or_else(|| "n/a".to_string(), report::format_duration)
      );
    }
    Command::Status => {
      let status = engine.status();
      println!("Connectivity: {}", if status.online { "online" } else { "offline" });
      println!("Cached vehicles: {}", status.cached);
      println!("Awaiting migration: {}", status.local_only);
      println!("Pending changes: {}", status.pending);
    }
    Command::NextTag => {
      println!("{}", report::next_tag_number(&current_vehicles(&engine).await));
    }
  }

  Ok(())
}

fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "parkwatch.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "parkwatch=info".into()))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

/// First published vehicle set, together with any entries not yet migrated.
async fn current_vehicles(engine: &Engine) -> Vec<Vehicle> {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let subscription = engine.live_feed().subscribe(move |vehicles| {
    let _ = tx.send(vehicles);
  });
  let _ = rx.recv().await;
  drop(subscription);
  engine.cache().load()
}

async fn vehicles_on_days(engine: &Engine, from: NaiveDate, to: NaiveDate) -> Result<Vec<Vehicle>> {
  let start = local_midnight(from)?;
  let next_day = to
    .succ_opt()
    .ok_or_else(|| eyre!("Date {} is out of range", to))?;
  let end = local_midnight(next_day)? - chrono::Duration::nanoseconds(1);
  Ok(engine.vehicles_between(start, end).await?)
}

fn local_midnight(day: NaiveDate) -> Result<DateTime<Utc>> {
  Local
    .from_local_datetime(&day.and_time(chrono::NaiveTime::MIN))
    .earliest()
    .map(|t| t.with_timezone(&Utc))
    .ok_or_else(|| eyre!("Midnight of {} does not exist in the local timezone", day))
}

async fn watch(engine: Arc<Engine>, probe: ConnectivityProbe, offline: bool) -> Result<()> {
  let probe_task = (!offline).then(|| probe.spawn(engine.connectivity().clone()));
  let mut worker: ReconnectWorker = engine.attach();
  let feed = engine.live_feed();
  let mut subscription = feed.subscribe(print_snapshot);

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      report = worker.next_report() => match report {
        Some(report) => {
          println!("Sync {}", report);
          // The feed picks its source at subscription time.
          subscription = feed.subscribe(print_snapshot);
        }
        None => break,
      },
    }
  }

  subscription.unsubscribe();
  if let Some(task) = probe_task {
    task.abort();
  }
  Ok(())
}

fn print_snapshot(vehicles: Vec<Vehicle>) {
  println!();
  println!("{}", Local::now().format("%H:%M:%S"));
  print_vehicles(&vehicles.iter().collect::<Vec<_>>());
}

fn print_vehicles(vehicles: &[&Vehicle]) {
  if vehicles.is_empty() {
    println!("No vehicles");
    return;
  }

  println!(
    "{:<32} {:<10} {:<14} {:<5} {:<7} {:<16} STAY",
    "ID", "PLATE", "MODEL", "TAG", "STATUS", "ENTERED"
  );
  for v in vehicles {
    println!(
      "{:<32} {:<10} {:<14} {:<5} {:<7} {:<16} {}",
      v.id().unwrap_or("-"),
      v.plate,
      v.model,
      v.tag,
      v.status.as_str(),
      v.entered_at.with_timezone(&Local).format("%d/%m/%Y %H:%M").to_string(),
      report::format_stay(v)
    );
  }
}
