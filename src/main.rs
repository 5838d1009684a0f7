mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use incstore::{
  CacheResult, CacheSource, ChangeSet, Context, FetchRequest, Freshness, IncrementalStore,
  MemoryStorage, ObjectIdentity, PendingMutation, Predicate, RestTransport, RowStorage, SaveReport,
  SortDescriptor, SqliteStorage,
};
use serde_json::Value;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "incstore")]
#[command(about = "Mirror a REST service into a local cache and sync changes back")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/incstore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  /// Never contact the remote service
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch rows of an entity
  Fetch {
    entity: String,
    /// attribute=value filters, all of which must match
    #[arg(short = 'w', long = "where")]
    filters: Vec<String>,
    #[arg(short, long)]
    sort: Option<String>,
    #[arg(long)]
    desc: bool,
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// Show one row
  Show { entity: String, id: String },
  /// Follow a relationship of one row
  Related {
    entity: String,
    id: String,
    relationship: String,
  },
  /// Create an object remotely
  Insert {
    entity: String,
    /// attribute=value pairs; values are parsed as JSON when possible
    #[arg(short, long = "set")]
    values: Vec<String>,
  },
  /// Change attributes of an object
  Update {
    entity: String,
    id: String,
    #[arg(short, long = "set")]
    values: Vec<String>,
  },
  /// Delete an object
  Delete { entity: String, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  let config = config::Config::load(args.config.as_deref())?;
  let store = open_store(config, args.offline)?;
  let context = store.context();

  match args.command {
    Command::Fetch {
      entity,
      filters,
      sort,
      desc,
      limit,
    } => {
      let mut request = FetchRequest::new(entity);
      for filter in &filters {
        let (attribute, value) = parse_pair(filter)?;
        request = request.filter(Predicate::Eq(attribute, value));
      }
      if let Some(attribute) = sort {
        request = request.sort_by(if desc {
          SortDescriptor::desc(attribute)
        } else {
          SortDescriptor::asc(attribute)
        });
      }
      if let Some(limit) = limit {
        request = request.limit(limit);
      }

      let result = context.fetch(request).await?;
      report_source(&result);
      print_rows(&context, &result.data)?;
    }
    Command::Show { entity, id } => {
      let identity = find(&context, &entity, &id).await?;
      print_rows(&context, &[identity])?;
    }
    Command::Related {
      entity,
      id,
      relationship,
    } => {
      let identity = find(&context, &entity, &id).await?;
      let result = context.relationship_value(identity, &relationship).await?;
      report_source(&result);
      print_rows(&context, &result.data.identities())?;
    }
    Command::Insert { entity, values } => {
      let mutation = context.insert(&entity, change_set(&values)?).await?;
      let identity = mutation.identity();
      finish_save(context.save(vec![mutation]).await?)?;
      print_rows(&context, &[identity])?;
    }
    Command::Update { entity, id, values } => {
      let identity = find(&context, &entity, &id).await?;
      let mutation = PendingMutation::update(identity, change_set(&values)?);
      finish_save(context.save(vec![mutation]).await?)?;
      print_rows(&context, &[identity])?;
    }
    Command::Delete { entity, id } => {
      let identity = find(&context, &entity, &id).await?;
      finish_save(context.save(vec![PendingMutation::delete(identity)]).await?)?;
      eprintln!("deleted {}/{}", entity, id);
    }
  }

  Ok(())
}

fn init_logging(verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("INCSTORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if verbose {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("incstore")
    .join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "incstore.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
    .init();
  Ok(Some(guard))
}

fn open_store(config: config::Config, offline: bool) -> Result<IncrementalStore> {
  let storage: Arc<dyn RowStorage> = if config.cache.in_memory {
    Arc::new(MemoryStorage::new())
  } else {
    match &config.cache.path {
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open()?),
    }
  };

  let schema = Arc::new(config.schema.clone());
  let mut transport =
    RestTransport::new(config.remote.url.clone(), schema, config.remote.timeout())?;
  if let Some(token) = config::Config::api_token() {
    transport = transport.with_token(token);
  }

  let mut builder =
    IncrementalStore::builder(config.schema, storage, Arc::new(transport), config.store);
  if offline {
    builder = builder.policy(Freshness::LocalOnly);
  }
  Ok(builder.build()?)
}

/// Identity of `entity/id`, fetching the row when it is not cached yet.
async fn find(context: &Context, entity: &str, id: &str) -> Result<ObjectIdentity> {
  let request = FetchRequest::new(entity).filter(Predicate::IdentifierIn(vec![id.into()]));
  let result = context.fetch(request).await?;
  report_source(&result);
  result
    .data
    .first()
    .copied()
    .ok_or_else(|| eyre!("{}/{} not found", entity, id))
}

fn parse_pair(pair: &str) -> Result<(String, Value)> {
  let (key, raw) = pair
    .split_once('=')
    .ok_or_else(|| eyre!("expected attribute=value, got {:?}", pair))?;
  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Ok((key.to_string(), value))
}

fn change_set(values: &[String]) -> Result<ChangeSet> {
  values.iter().try_fold(ChangeSet::new(), |changes, pair| {
    let (attribute, value) = parse_pair(pair)?;
    Ok(changes.set(attribute, value))
  })
}

fn report_source<T>(result: &CacheResult<T>) {
  match (&result.source, &result.notice) {
    (CacheSource::Offline, Some(notice)) => eprintln!("offline, showing cached data: {}", notice),
    (CacheSource::Cache, _) => eprintln!("(from cache)"),
    _ => {}
  }
}

fn finish_save(report: SaveReport) -> Result<()> {
  report.into_result()?;
  Ok(())
}

fn print_rows(context: &Context, identities: &[ObjectIdentity]) -> Result<()> {
  for identity in identities {
    let row = context.read_row(*identity)?;
    println!("{}", serde_json::to_string_pretty(&row)?);
  }
  Ok(())
}
