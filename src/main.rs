use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rustoverseer::cluster::register_live_node;
use rustoverseer::store::paths::OVERSEER_QUEUE_PATH;
use rustoverseer::{
    ClusterEventBus, ClusterState, ClusterStateReader, CoordinationStore,
    InMemoryCoordinationStore, Overseer, OverseerConfig, ReplicaState, ShardLeaderElection,
    StateChangeMessage, WorkQueue,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, event};

#[derive(Parser)]
#[command(name = "rustoverseer")]
#[command(about = "Runs an in-process simulated cluster and prints the converged state")]
struct Cli {
    /// Number of simulated nodes
    #[arg(long, default_value_t = 3)]
    nodes: usize,
    #[arg(long, default_value = "demo")]
    collection: String,
    #[arg(long, default_value_t = 2)]
    shards: u32,
    #[arg(long, default_value_t = 2)]
    replication_factor: u32,
    /// JSON overseer configuration applied to every node
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

struct SimulatedNode {
    name: String,
    overseer: Arc<Overseer>,
    reader: Arc<ClusterStateReader>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatedNode {
    async fn start(
        store: Arc<InMemoryCoordinationStore>,
        template: &OverseerConfig,
        name: String,
    ) -> Result<Self> {
        let session = store.open_session().await?;
        register_live_node(&*store, session, &name).await?;

        let mut config = template.clone();
        config.node_name = name.clone();
        let bus = ClusterEventBus::new(&config.events);
        let overseer = Overseer::new(store.clone(), session, config.clone(), bus).await?;
        overseer.start()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = Arc::new(ClusterStateReader::new(store.clone()).with_retry(config.retry.clone()));
        let queue = Arc::new(WorkQueue::open(store.clone(), session, OVERSEER_QUEUE_PATH).await?);
        let elections = Arc::new(
            ShardLeaderElection::new(store.clone(), session, name.clone(), queue)
                .with_retry(config.retry.clone()),
        );
        let tasks = vec![
            reader.clone().start_watching(shutdown_rx.clone()),
            elections.run(reader.clone(), shutdown_rx),
        ];
        Ok(Self {
            name,
            overseer,
            reader,
            shutdown,
            tasks,
        })
    }

    async fn stop(self) -> Result<()> {
        self.overseer.shutdown().await?;
        self.shutdown.send_replace(true);
        for task in self.tasks {
            task.await.context("node task failed")?;
        }
        Ok(())
    }
}

fn converged(state: &ClusterState, collection: &str) -> bool {
    state.collection(collection).is_some_and(|c| {
        c.shards.values().all(|shard| {
            shard.leader_replica().is_some()
                && shard
                    .replicas
                    .values()
                    .all(|replica| replica.state == ReplicaState::Active)
        })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.nodes == 0 {
        return Err(anyhow!("--nodes must be at least 1"));
    }
    let template = match &cli.config {
        Some(path) => OverseerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OverseerConfig::default(),
    };
    let deadline = Duration::from_secs(cli.timeout_secs);

    let store = Arc::new(InMemoryCoordinationStore::new());
    let mut nodes = Vec::with_capacity(cli.nodes);
    for index in 1..=cli.nodes {
        nodes.push(SimulatedNode::start(store.clone(), &template, format!("node{}", index)).await?);
    }
    let observer = &nodes[0];

    observer
        .overseer
        .enqueue(&StateChangeMessage::create_collection(
            &cli.collection,
            cli.shards,
            cli.replication_factor,
        ))
        .await?;
    let created = observer
        .reader
        .wait_for(deadline, |state| state.has_collection(&cli.collection))
        .await?
        .ok_or_else(|| anyhow!("collection '{}' was not created in time", cli.collection))?;

    // Every node brings its replicas up, as a core would after recovery.
    if let Some(collection) = created.collection(&cli.collection) {
        for shard in collection.shards.values() {
            for replica in shard.replicas.values() {
                let host = nodes
                    .iter()
                    .find(|node| node.name == replica.node_name)
                    .unwrap_or(observer);
                host.overseer
                    .enqueue(&StateChangeMessage::set_replica_state(
                        &collection.name,
                        &replica.name,
                        ReplicaState::Active.as_str(),
                    ))
                    .await?;
            }
        }
    }

    let state = observer
        .reader
        .wait_for(deadline, |state| converged(state, &cli.collection))
        .await?
        .ok_or_else(|| anyhow!("cluster did not converge within {:?}", deadline))?;
    let collection = state
        .collection(&cli.collection)
        .ok_or_else(|| anyhow!("collection '{}' vanished", cli.collection))?;
    event!(Level::INFO, version = collection.version, "cluster converged");
    println!("{}", serde_json::to_string_pretty(collection)?);

    for node in nodes {
        let name = node.name.clone();
        node.stop().await.with_context(|| format!("stopping {}", name))?;
    }
    let remaining = store.node_count()?;
    event!(Level::DEBUG, remaining, "simulation finished");
    Ok(())
}
