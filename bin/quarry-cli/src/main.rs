//! Quarry CLI - Admin Command Line Interface
//!
//! Manages the persisted cluster state of a node, drives the batch indexing
//! pipeline with generated entities, and inspects the segments it writes.

mod synthetic;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quarry_cluster::{
    BalancedAllocator, ClusterState, ClusterStatePersister, ClusterStateStore, DiscoveryNode,
    DiscoveryNodes, IndexMetadata, ShardState,
};
use quarry_common::Error;
use quarry_common::config::Config;
use quarry_index::{NormsReader, SegmentMeta, decode_norm};
use quarry_indexer::{MassIndexer, ShardSegmentBackend};
use quarry_store::DirectoryService;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use synthetic::SyntheticSource;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STATE_DIR: &str = "_state";
const INDICES_DIR: &str = "indices";

#[derive(Parser, Debug)]
#[command(name = "quarry-cli")]
#[command(about = "Quarry Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "QUARRY_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides node.data_dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster state operations
    Cluster {
        #[command(subcommand)]
        action: ClusterCommands,
    },
    /// Index generated entities into the shards of an index
    Index {
        /// Target index
        index: String,
        /// Number of entities to generate
        #[arg(long, default_value = "1000")]
        count: u64,
        /// Entity type name
        #[arg(long, default_value = "sample")]
        entity_type: String,
        /// Stop after this many entities
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Segment operations
    Segment {
        #[command(subcommand)]
        action: SegmentCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ClusterCommands {
    /// Create and persist the first cluster state
    Init {
        /// Number of local data nodes
        #[arg(long, default_value = "3")]
        nodes: u16,
        /// Cluster name (overrides cluster.name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the current cluster state
    Show,
    /// Create an index
    CreateIndex {
        /// Index name
        name: String,
        /// Primary shards (defaults to cluster.default_number_of_shards)
        #[arg(long)]
        shards: Option<u32>,
        /// Replicas per shard (defaults to cluster.default_number_of_replicas)
        #[arg(long)]
        replicas: Option<u32>,
    },
    /// Remove a node from the cluster
    RemoveNode {
        /// Node name, id, or id prefix
        node: String,
    },
    /// Allocate unassigned shard copies
    Reroute {
        /// Also mark initializing copies as started
        #[arg(long)]
        start: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SegmentCommands {
    /// List the segments of a shard with their norms
    Inspect {
        /// Index name
        index: String,
        /// Shard number
        shard: u32,
    },
}

/// Configuration plus the services built from it
struct Node {
    config: Config,
    service: DirectoryService,
    json: bool,
}

impl Node {
    fn new(config: Config, json: bool) -> quarry_common::Result<Self> {
        let service = DirectoryService::new(config.store.clone())?;
        Ok(Self {
            config,
            service,
            json,
        })
    }

    fn data_dir(&self) -> &Path {
        &self.config.node.data_dir
    }

    fn persister(&self) -> quarry_common::Result<ClusterStatePersister> {
        let directory = self.service.new_directory(self.data_dir().join(STATE_DIR))?;
        Ok(ClusterStatePersister::new(
            Box::new(directory),
            self.config.cluster.state_generations_to_keep,
        ))
    }

    fn open_store(&self) -> quarry_common::Result<ClusterStateStore> {
        let persister = self.persister()?;
        let Some(state) = persister.load_latest()? else {
            return Err(Error::configuration(format!(
                "no cluster state under {}, run `quarry-cli cluster init` first",
                self.data_dir().display()
            )));
        };
        ClusterStateStore::with_persister(state, persister)
    }

    fn print_state(&self, state: &ClusterState) {
        if self.json {
            println!("{:#}", state_json(state));
            return;
        }
        print!("{state}");
        let view = state.read_only_routing_nodes();
        println!("copies per node:");
        for node in view.iter() {
            let name = state
                .nodes()
                .get(&node.node_id)
                .map_or("?", |n| n.name.as_str());
            println!("  {} {}: {}", node.node_id.short(), name, node.len());
        }
    }
}

fn state_json(state: &ClusterState) -> serde_json::Value {
    let view = state.read_only_routing_nodes();
    let nodes: Vec<_> = state
        .nodes()
        .iter()
        .map(|n| {
            json!({
                "id": n.id.to_string(),
                "name": n.name,
                "address": n.address.to_string(),
                "master": state.nodes().master_node_id() == Some(n.id),
                "copies": view.node_shard_count(&n.id),
            })
        })
        .collect();
    let indices: Vec<_> = state
        .metadata()
        .indices
        .values()
        .map(|i| {
            json!({
                "name": i.name,
                "uuid": i.uuid.to_string(),
                "shards": i.number_of_shards,
                "replicas": i.number_of_replicas,
                "open": i.is_open(),
            })
        })
        .collect();
    let routing = state.routing_table();
    json!({
        "cluster_name": state.cluster_name(),
        "version": state.version(),
        "state_uuid": state.state_uuid().to_string(),
        "nodes": nodes,
        "indices": indices,
        "routing": {
            "version": routing.version,
            "unassigned": routing.count_with_state(ShardState::Unassigned),
            "initializing": routing.count_with_state(ShardState::Initializing),
            "started": routing.count_with_state(ShardState::Started),
            "relocating": routing.count_with_state(ShardState::Relocating),
        },
    })
}

fn load_config(args: &Args) -> quarry_common::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn cluster_init(node: &Node, count: u16, name: Option<String>) -> Result<()> {
    let persister = node.persister()?;
    if let Some(existing) = persister.load_latest()? {
        return Err(Error::configuration(format!(
            "cluster [{}] already initialised at version {}",
            existing.cluster_name(),
            existing.version()
        ))
        .into());
    }
    if count == 0 {
        return Err(Error::configuration("a cluster needs at least one node").into());
    }

    let mut nodes = DiscoveryNodes::new();
    let mut first = None;
    for i in 0..count {
        let address = SocketAddr::from(([127, 0, 0, 1], 9300u16.saturating_add(i)));
        let discovered = DiscoveryNode::new(format!("node-{i}"), address);
        first.get_or_insert(discovered.id);
        nodes.add(discovered);
    }
    if let Some(id) = first {
        nodes.set_master(id)?;
        nodes.set_local(id)?;
    }

    let name = name.unwrap_or_else(|| node.config.cluster.name.clone());
    let state = ClusterState::builder(name)
        .nodes(nodes)
        .increment_version()
        .build();
    let store = ClusterStateStore::with_persister(state, persister)?;
    node.print_state(&store.current());
    Ok(())
}

fn cluster_create_index(
    node: &Node,
    name: String,
    shards: Option<u32>,
    replicas: Option<u32>,
) -> Result<()> {
    let store = node.open_store()?;
    let index = IndexMetadata::new(
        name,
        shards.unwrap_or(node.config.cluster.default_number_of_shards),
        replicas.unwrap_or(node.config.cluster.default_number_of_replicas),
    )?;
    let state = store.update("create-index", |current| {
        Ok(ClusterState::builder_from(current)
            .put_index(index)?
            .increment_version()
            .build())
    })?;
    node.print_state(&state);
    Ok(())
}

fn cluster_remove_node(node: &Node, target: &str) -> Result<()> {
    let store = node.open_store()?;
    let state = store.update("remove-node", |current| {
        let id = current
            .nodes()
            .iter()
            .find(|n| n.name == target || n.id.to_string().starts_with(target))
            .map(|n| n.id)
            .ok_or_else(|| Error::NodeNotFound(target.to_string()))?;
        let mut nodes = current.nodes().clone();
        nodes.remove(&id);
        Ok(ClusterState::builder_from(current)
            .nodes(nodes)
            .increment_version()
            .build())
    })?;
    node.print_state(&state);
    Ok(())
}

fn cluster_reroute(node: &Node, start: bool) -> Result<()> {
    let store = node.open_store()?;
    let state = store.update("reroute", |current| {
        let allocator = BalancedAllocator;
        let routing = allocator.reroute(current)?;
        let next = ClusterState::builder_from(current)
            .routing_table(routing)
            .increment_version()
            .build();
        if !start {
            return Ok(next);
        }
        let started = allocator.start_initializing(&next);
        Ok(ClusterState::builder_from(&next).routing_table(started).build())
    })?;
    node.print_state(&state);
    Ok(())
}

fn index(
    node: &Node,
    index: &str,
    count: u64,
    entity_type: String,
    limit: Option<u64>,
) -> Result<()> {
    let store = node.open_store()?;
    let state = store.current();
    let mut config = node.config.indexing.clone();
    if limit.is_some() {
        config.limit_indexed_objects_to = limit;
    }

    let backend = Arc::new(ShardSegmentBackend::new(
        &state,
        index,
        &node.service,
        &node.data_dir().join(INDICES_DIR),
        config.threads_for_document_building,
    )?);
    let report = MassIndexer::new(config, backend.clone())
        .type_to_index(SyntheticSource::new(entity_type, count))
        .start_and_wait()?;

    let segments = backend.flushed_segments();
    if node.json {
        let results: Vec<_> = report
            .results
            .iter()
            .map(|(entity_type, result)| match result {
                Ok(r) => json!({
                    "entity_type": entity_type,
                    "documents_added": r.documents_added,
                    "elapsed_ms": r.elapsed.as_millis(),
                }),
                Err(e) => json!({
                    "entity_type": entity_type,
                    "error": e.to_string(),
                    "category": e.category(),
                }),
            })
            .collect();
        let segments: Vec<_> = segments
            .iter()
            .map(|s| {
                json!({
                    "entity_type": s.entity_type,
                    "shard": s.shard_id.to_string(),
                    "segment": s.segment,
                    "max_doc": s.max_doc,
                    "norms_bytes": s.norms.bytes,
                })
            })
            .collect();
        println!("{:#}", json!({ "results": results, "segments": segments }));
    } else {
        println!(
            "indexed {} documents into {} in {:.1?}",
            report.documents_added(),
            index,
            report.elapsed
        );
        for segment in &segments {
            println!(
                "  {} segment {} ({}) max_doc={} norms={} bytes",
                segment.shard_id,
                segment.segment,
                segment.entity_type,
                segment.max_doc,
                segment.norms.bytes
            );
        }
    }

    // The first failure decides the exit status
    if let Some((entity_type, e)) = report.results.into_iter().find_map(|(t, r)| r.err().map(|e| (t, e))) {
        debug!("indexing of {} failed", entity_type);
        return Err(e.into());
    }
    Ok(())
}

fn segment_inspect(node: &Node, index: &str, shard: u32) -> Result<()> {
    let shard_id = quarry_common::ShardId::new(index, shard);
    let path = node.data_dir().join(INDICES_DIR).join(shard_id.dir_name());
    if !path.is_dir() {
        return Err(Error::ShardNotFound(format!("{shard_id} has no store at {}", path.display())).into());
    }
    let directory = node.service.new_directory(&path)?;

    let mut segments = Vec::new();
    for name in SegmentMeta::list(&directory)? {
        let meta = SegmentMeta::read(&directory, &name)?;
        let infos = meta.field_infos()?;
        let reader = NormsReader::open(&directory, &name, &infos, meta.max_doc)?;
        let fields: Vec<_> = reader
            .fields()
            .iter()
            .filter_map(|field| {
                let norms = reader.norms(field)?;
                let mean = norms.iter().map(|b| f64::from(decode_norm(*b))).sum::<f64>()
                    / norms.len().max(1) as f64;
                Some((field.clone(), mean))
            })
            .collect();
        segments.push((meta, fields));
    }

    if node.json {
        let out: Vec<_> = segments
            .iter()
            .map(|(meta, fields)| {
                json!({
                    "segment": meta.name,
                    "max_doc": meta.max_doc,
                    "files": meta.files,
                    "norms": fields
                        .iter()
                        .map(|(f, mean)| json!({ "field": f, "mean": mean }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{:#}", json!({ "shard": shard_id.to_string(), "segments": out }));
    } else {
        println!("shard {} ({} segments)", shard_id, segments.len());
        for (meta, fields) in &segments {
            println!("  {} max_doc={} files={:?}", meta.name, meta.max_doc, meta.files);
            for (field, mean) in fields {
                println!("    {field}: mean norm {mean:.4}");
            }
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    init_logging(&config.logging.level, args.log_json);
    info!("data directory: {}", config.node.data_dir.display());

    let node = Node::new(config, args.json)?;
    match args.command {
        Commands::Cluster { action } => match action {
            ClusterCommands::Init { nodes, name } => cluster_init(&node, nodes, name),
            ClusterCommands::Show => {
                let store = node.open_store()?;
                node.print_state(&store.current());
                Ok(())
            }
            ClusterCommands::CreateIndex {
                name,
                shards,
                replicas,
            } => cluster_create_index(&node, name, shards, replicas),
            ClusterCommands::RemoveNode { node: target } => cluster_remove_node(&node, &target),
            ClusterCommands::Reroute { start } => cluster_reroute(&node, start),
        },
        Commands::Index {
            index: name,
            count,
            entity_type,
            limit,
        } => index(&node, &name, count, entity_type, limit),
        Commands::Segment { action } => match action {
            SegmentCommands::Inspect { index, shard } => segment_inspect(&node, &index, shard),
        },
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let (category, code) = e
                .downcast_ref::<Error>()
                .map_or(("Error", 1), |e| (e.category(), e.exit_code()));
            eprintln!("error [{category}]: {e:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
