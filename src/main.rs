use std::sync::Arc;
use std::time::Duration;

use bitdb::antientropy::AntiEntropy;
use bitdb::{
    create_router, AppState, BuildInfo, Cluster, Config, Engine, Executor, HttpBroadcaster, Node,
    NopStats,
};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bitdb")]
#[command(about = "A distributed bitmap-index database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a node.
    Server(ServerArgs),
    /// Benchmark drivers against a running node.
    Bench {
        #[command(subcommand)]
        command: BenchCommand,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:10101")]
    bind: String,

    /// This node's advertised host:port
    #[arg(long, default_value = "localhost:10101")]
    host: String,

    /// Data directory path
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Cluster members including this node (e.g. --cluster-host a:10101)
    #[arg(long = "cluster-host")]
    cluster_hosts: Vec<String>,

    /// Replicas per shard
    #[arg(long, default_value_t = 1)]
    replicas: usize,

    /// Partitions in the consistent-hash ring
    #[arg(long, default_value_t = bitdb::cluster::DEFAULT_PARTITION_N)]
    partitions: u32,

    /// Seconds between anti-entropy sweeps (0 disables)
    #[arg(long, default_value_t = 600)]
    anti_entropy_interval: u64,

    /// Per-query deadline in seconds
    #[arg(long, default_value_t = 30)]
    query_timeout: u64,

    /// Timestamped writes go only to time views, not the standard view
    #[arg(long, default_value_t = false)]
    time_views_only: bool,
}

#[derive(Subcommand, Debug)]
enum BenchCommand {
    /// Drive random setBit traffic.
    SetBit(BenchSetBitArgs),
}

#[derive(Parser, Debug)]
struct BenchSetBitArgs {
    /// Target node
    #[arg(long, default_value = "localhost:10101")]
    host: String,

    /// Index to write into
    #[arg(long)]
    index: String,

    /// Field to write into
    #[arg(long)]
    field: String,

    /// Number of bits to set
    #[arg(short, long, default_value_t = 1000)]
    n: u64,

    /// Row id range
    #[arg(long, default_value_t = 1000)]
    max_row: u64,

    /// Column id range
    #[arg(long, default_value_t = 1 << 20)]
    max_col: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bitdb=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Bench {
            command: BenchCommand::SetBit(args),
        } => run_bench_set_bit(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = Config {
        data_dir: args.data_dir,
        host: args.host,
        cluster_hosts: args.cluster_hosts,
        replica_n: args.replicas,
        partition_n: args.partitions,
        anti_entropy_interval_secs: args.anti_entropy_interval,
        time_views_only: args.time_views_only,
        query_timeout_secs: args.query_timeout,
    };

    let mut engine = Engine::new(&config.data_dir);
    engine.time_views_only = config.time_views_only;
    let engine = Arc::new(engine);
    engine.open()?;

    let nodes: Vec<Node> = config.hosts().iter().map(|h| Node::new(h)).collect();
    let mut cluster = Cluster::new(nodes, config.replica_n);
    cluster.partition_n = config.partition_n;
    let cluster = Arc::new(cluster);
    tracing::info!(host = %config.host, nodes = cluster.nodes.len(), replicas = cluster.replica_n, "cluster configured");

    let broadcaster = Arc::new(HttpBroadcaster::new(reqwest::Client::new()));
    let executor = Arc::new(Executor::new(
        engine.clone(),
        cluster.clone(),
        &config.host,
        broadcaster,
        Arc::new(NopStats),
    ));

    let shutdown = tokio_util::sync::CancellationToken::new();
    if config.anti_entropy_interval_secs > 0 {
        let loop_task = AntiEntropy::new(
            engine.clone(),
            cluster.clone(),
            &config.host,
            Duration::from_secs(config.anti_entropy_interval_secs),
        );
        tokio::spawn(loop_task.run(shutdown.clone()));
    }

    let state = AppState {
        engine: engine.clone(),
        cluster,
        executor,
        config: Arc::new(config.clone()),
        build: Arc::new(BuildInfo::default()),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(bind = %args.bind, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown, engine))
        .await?;
    Ok(())
}

async fn shutdown_signal(
    background: tokio_util::sync::CancellationToken,
    engine: Arc<Engine>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, closing fragments...");
    background.cancel();
    if let Err(e) = engine.close() {
        tracing::error!(error = %e, "engine close failed");
    }
    tracing::info!("shutdown complete");
}

async fn run_bench_set_bit(args: BenchSetBitArgs) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{}/index/{}/query", args.host, args.index);

    // The index is created implicitly if missing.
    let _ = client
        .post(format!("http://{}/index/{}", args.host, args.index))
        .send()
        .await;

    let start = std::time::Instant::now();
    let mut rng = rand::thread_rng();
    for i in 0..args.n {
        let row = rng.gen_range(0..args.max_row);
        let col = rng.gen_range(0..args.max_col);
        let body = bitdb::QueryRequest {
            query: format!("setBit(row={}, field=\"{}\", col={})", row, args.field, col),
            slices: None,
            remote: false,
        };
        let resp = client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("setBit {} failed: {}", i, resp.status());
        }
    }
    let elapsed = start.elapsed();
    println!(
        "{} bits in {:.2}s ({:.0} bits/sec)",
        args.n,
        elapsed.as_secs_f64(),
        args.n as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
