//! akh-batchgraph CLI: batch loading and repair for the graph store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

use akh_batchgraph::commit_log::{CommitLogSink, DiscardSink, JsonLinesSink};
use akh_batchgraph::concept::{ConceptId, DataType, ResourceValue, TypeLabel};
use akh_batchgraph::config::GraphConfig;
use akh_batchgraph::registry::MetaKind;
use akh_batchgraph::repair::{RepairDriver, RepairQueue, RepairTask};
use akh_batchgraph::session::Session;

#[derive(Parser)]
#[command(name = "akh-batchgraph", version, about = "Batch graph loading and repair")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Graph configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory with the root types.
    Init,

    /// Load types and instances from a JSON file.
    Load {
        /// Path to the JSON file.
        #[arg(long)]
        file: PathBuf,

        /// Skip inline checks and write commit logs for the repair pass.
        #[arg(long)]
        batch: bool,

        /// Where to append commit logs (default: <data-dir>/commit-logs.jsonl).
        #[arg(long)]
        log_out: Option<PathBuf>,
    },

    /// Replay commit logs through the repair pass.
    Repair {
        /// JSON-lines file of commit logs (default: <data-dir>/commit-logs.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Show graph statistics: types, instance counts and shards.
    Stats,

    /// List the shards of a type.
    Shards {
        /// Type label.
        label: String,
    },
}

/// Input format of `load`.
#[derive(Debug, Default, Deserialize)]
struct LoadFile {
    #[serde(default)]
    types: Vec<TypeDef>,
    #[serde(default)]
    entities: Vec<EntityDef>,
    #[serde(default)]
    resources: Vec<ResourceDef>,
    #[serde(default)]
    relations: Vec<RelationDef>,
}

#[derive(Debug, Deserialize)]
struct TypeDef {
    label: String,
    kind: String,
    #[serde(default)]
    data_type: Option<DataType>,
    #[serde(default)]
    relates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EntityDef {
    #[serde(rename = "type")]
    type_label: String,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceDef {
    #[serde(rename = "type")]
    type_label: String,
    value: serde_json::Value,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelationDef {
    #[serde(rename = "type")]
    type_label: String,
    players: Vec<PlayerDef>,
}

#[derive(Debug, Deserialize)]
struct PlayerDef {
    role: String,
    player: String,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GraphConfig::load(path)?,
        None => GraphConfig::default(),
    };
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(".akh-batchgraph"));
    config.data_dir = Some(data_dir.clone());
    let default_log = data_dir.join("commit-logs.jsonl");

    match cli.command {
        Commands::Init => {
            let session = Session::open(config, Arc::new(DiscardSink))?;
            println!("Initialized akh-batchgraph at {}", data_dir.display());
            print_stats(&session)?;
        }

        Commands::Load {
            file,
            batch,
            log_out,
        } => {
            config.batch = config.batch || batch;
            let log_path = log_out.unwrap_or(default_log);
            std::fs::create_dir_all(&data_dir).into_diagnostic()?;
            let sink: Arc<dyn CommitLogSink> = Arc::new(JsonLinesSink::open(&log_path)?);
            let session = Session::open(config, sink)?;

            let content = std::fs::read_to_string(&file).into_diagnostic()?;
            let input: LoadFile = serde_json::from_str(&content).into_diagnostic()?;
            let loaded = load(&session, input)?;

            println!(
                "Loaded {loaded} instances from {} ({} mode)",
                file.display(),
                if session.is_batch() { "batch" } else { "normal" }
            );
            println!("Commit logs appended to {}", log_path.display());
        }

        Commands::Repair { log } => {
            let log_path = log.unwrap_or(default_log);
            let backlog_path = data_dir.join("repair-backlog.json");
            let logs = JsonLinesSink::read_all(&log_path)?;
            let queue = Arc::new(RepairQueue::new());
            let session = Session::open(config, Arc::new(DiscardSink))?;
            queue.requeue(session.keyspace(), read_backlog(&backlog_path)?)?;
            let driver = RepairDriver::new(session.clone(), queue.clone());
            for log in logs {
                driver.submit(log)?;
            }

            // Every log is now either repaired or part of the backlog.
            let result = driver.run_once();
            truncate(&log_path)?;
            write_backlog(&backlog_path, &queue.unfinished()?)?;
            let stats = result?;
            println!("Repair finished: {stats}");
            print_stats(&session)?;
        }

        Commands::Stats => {
            let session = Session::open(config, Arc::new(DiscardSink))?;
            print_stats(&session)?;
        }

        Commands::Shards { label } => {
            let session = Session::open(config, Arc::new(DiscardSink))?;
            let handle = session
                .registry()
                .get(&TypeLabel::new(label.as_str()))
                .ok_or_else(|| miette::miette!("no type labelled \"{label}\""))?;
            let shards = session.sharding().shards(handle.concept_id())?;
            let current = session
                .store()
                .get_vertex(handle.concept_id())?
                .and_then(|v| v.current_shard());
            println!(
                "\"{label}\" has {} shard(s), {} instance(s):",
                shards.len(),
                session.counts().count_of(&handle)?
            );
            for shard in shards {
                let marker = if Some(shard) == current { " (current)" } else { "" };
                println!("  {shard}{marker}");
            }
        }
    }

    Ok(())
}

/// Create the declared types in one transaction, then every instance in another.
fn load(session: &Session, input: LoadFile) -> Result<usize> {
    let mut graph = session.graph()?;
    for def in &input.types {
        let label = TypeLabel::new(def.label.as_str());
        match def.kind.as_str() {
            "entity" => {
                graph.put_entity_type(label)?;
            }
            "relation" => {
                graph.put_relation_type(label)?;
            }
            "role" => {
                graph.put_role_type(label)?;
            }
            "resource" => {
                let data_type = def.data_type.ok_or_else(|| {
                    miette::miette!("resource type \"{}\" needs a data_type", def.label)
                })?;
                graph.put_resource_type(label, data_type)?;
            }
            other => miette::bail!(
                "unknown kind \"{other}\" for type \"{}\" (expected {}, {}, {} or {})",
                def.label,
                MetaKind::Entity,
                MetaKind::Relation,
                MetaKind::Role,
                MetaKind::Resource
            ),
        }
    }
    for def in &input.types {
        for role in &def.relates {
            graph.relates(&TypeLabel::new(def.label.as_str()), &TypeLabel::new(role.as_str()))?;
        }
    }
    graph.commit()?;

    let mut graph = session.graph()?;
    let mut keys: HashMap<String, ConceptId> = HashMap::new();
    let mut loaded = 0;

    for def in &input.entities {
        let id = graph.add_entity(&TypeLabel::new(def.type_label.as_str()))?;
        if let Some(key) = &def.key {
            keys.insert(key.clone(), id);
        }
        loaded += 1;
    }
    for def in &input.resources {
        let label = TypeLabel::new(def.type_label.as_str());
        let data_type = graph
            .get_type(&label)
            .and_then(|h| h.data_type())
            .ok_or_else(|| miette::miette!("\"{label}\" is not a resource type"))?;
        let value = json_value(data_type, &def.value)?;
        let id = graph.put_resource(&label, value)?;
        if let Some(key) = &def.key {
            keys.insert(key.clone(), id);
        }
        loaded += 1;
    }
    for def in &input.relations {
        let mut players = Vec::with_capacity(def.players.len());
        for p in &def.players {
            let id = *keys
                .get(&p.player)
                .ok_or_else(|| miette::miette!("unknown player key \"{}\"", p.player))?;
            players.push((TypeLabel::new(p.role.as_str()), id));
        }
        graph.add_relation(&TypeLabel::new(def.type_label.as_str()), &players)?;
        loaded += 1;
    }
    graph.commit()?;
    Ok(loaded)
}

fn json_value(data_type: DataType, value: &serde_json::Value) -> Result<ResourceValue> {
    let converted = match data_type {
        DataType::String => value.as_str().map(ResourceValue::from),
        DataType::Long => value.as_i64().map(ResourceValue::from),
        DataType::Double => value.as_f64().map(ResourceValue::from),
        DataType::Boolean => value.as_bool().map(ResourceValue::from),
    };
    converted.ok_or_else(|| miette::miette!("value {value} is not a {data_type}"))
}

fn truncate(path: &Path) -> Result<()> {
    std::fs::write(path, "").into_diagnostic()
}

fn read_backlog(path: &Path) -> Result<Vec<RepairTask>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).into_diagnostic()?;
    serde_json::from_str(&content).into_diagnostic()
}

/// Persist tasks an interrupted run handed back; an empty backlog removes the file.
fn write_backlog(path: &Path, tasks: &[RepairTask]) -> Result<()> {
    if tasks.is_empty() {
        if path.exists() {
            std::fs::remove_file(path).into_diagnostic()?;
        }
        return Ok(());
    }
    let json = serde_json::to_string_pretty(tasks).into_diagnostic()?;
    std::fs::write(path, json).into_diagnostic()?;
    eprintln!("{} unfinished repair task(s) saved to {}", tasks.len(), path.display());
    Ok(())
}

fn print_stats(session: &Session) -> Result<()> {
    let store = session.store();
    let counts = session.counts();
    let sharding = session.sharding();
    println!("Keyspace:  {}", session.keyspace());
    println!("Vertices:  {}", store.vertex_count()?);
    println!("Threshold: {}", sharding.threshold());
    println!("Types:");
    for handle in session.registry().all() {
        let shards = sharding.shards(handle.concept_id())?.len();
        println!(
            "  {:>3}  {:<20} {:<16} instances={:<8} shards={}",
            handle.type_id().get(),
            handle.label().as_str(),
            handle.kind().label(),
            counts.count_of(&handle)?,
            shards
        );
    }
    Ok(())
}
