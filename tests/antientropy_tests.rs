use std::sync::Arc;
use std::time::Duration;

use bitdb::antientropy::AntiEntropy;
use bitdb::{
    create_router, AppState, BuildInfo, Cluster, Config, Engine, Executor, Fragment,
    HttpBroadcaster, IndexOptions, Node, NopStats, QueryRequest, QueryResponse, QueryResult,
    VIEW_STANDARD,
};
use tokio_util::sync::CancellationToken;

struct TestNode {
    addr: String,
    engine: Arc<Engine>,
    cluster: Arc<Cluster>,
    _dir: tempfile::TempDir,
}

impl TestNode {
    /// The standard-view fragment of d/f for one slice.
    fn fragment(&self, slice: u64) -> Arc<Fragment> {
        self.engine
            .index("d")
            .unwrap()
            .field("f")
            .unwrap()
            .view(VIEW_STANDARD)
            .unwrap()
            .fragment(slice)
            .unwrap()
    }

    fn anti_entropy(&self) -> AntiEntropy {
        AntiEntropy::new(
            self.engine.clone(),
            self.cluster.clone(),
            &self.addr,
            Duration::from_secs(3600),
        )
    }
}

fn spawn_node(nodes: Vec<Node>, listener: tokio::net::TcpListener, replicas: usize) -> TestNode {
    let addr = listener.local_addr().unwrap().to_string();
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::new(dir.path()));
    engine.open().unwrap();

    let cluster = Arc::new(Cluster::new(nodes, replicas));
    let executor = Arc::new(Executor::new(
        engine.clone(),
        cluster.clone(),
        &addr,
        Arc::new(HttpBroadcaster::new(reqwest::Client::new())),
        Arc::new(NopStats),
    ));

    let state = AppState {
        engine: engine.clone(),
        cluster: cluster.clone(),
        executor,
        config: Arc::new(Config::default()),
        build: Arc::new(BuildInfo::default()),
    };
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });

    TestNode {
        addr,
        engine,
        cluster,
        _dir: dir,
    }
}

/// Two nodes with two replicas: every shard lives on both, so any
/// single-node write is a divergence anti-entropy must repair.
async fn two_replica_cluster() -> (TestNode, TestNode) {
    let l1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let a = l1.local_addr().unwrap().to_string();
    let b = l2.local_addr().unwrap().to_string();

    let nodes = vec![Node::new(&a), Node::new(&b)];
    let node_a = spawn_node(nodes.clone(), l1, 2);
    let node_b = spawn_node(nodes, l2, 2);

    for node in [&node_a, &node_b] {
        node.engine
            .create_index("d", &IndexOptions::default())
            .unwrap();
    }
    (node_a, node_b)
}

async fn query(client: &reqwest::Client, addr: &str, pql: &str) -> QueryResult {
    let resp = client
        .post(format!("http://{}/index/d/query", addr))
        .json(&QueryRequest {
            query: pql.to_string(),
            slices: None,
            remote: false,
        })
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "query failed: {}", resp.status());
    let body: QueryResponse = resp.json().await.unwrap();
    body.results.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_sweep_repairs_diverged_replica() {
    let (node_a, node_b) = two_replica_cluster().await;
    let client = reqwest::Client::new();

    // A replicated write gives both nodes the slice-0 fragment.
    let result = query(&client, &node_a.addr, "setBit(row=10, field=f, col=2)").await;
    assert_eq!(result, QueryResult::Changed(true));

    // Diverge: extra bits land only on B, in two different blocks.
    let b_fragment = node_b.fragment(0);
    b_fragment.set_bit(11, 5).unwrap();
    b_fragment.set_bit(70000, 3).unwrap();

    let a_fragment = node_a.fragment(0);
    assert_ne!(a_fragment.block_checksums(), b_fragment.block_checksums());

    // One sweep on A pulls the missing bits over.
    node_a
        .anti_entropy()
        .sweep(&CancellationToken::new())
        .await
        .unwrap();

    assert!(a_fragment.contains(11, 5));
    assert!(a_fragment.contains(70000, 3));
    assert_eq!(a_fragment.block_checksums(), b_fragment.block_checksums());

    // The repaired bits are queryable through the executor.
    let result = query(&client, &node_a.addr, "count(row(id=11, field=f))").await;
    assert_eq!(result, QueryResult::Count(1));
}

#[tokio::test]
async fn test_sweep_converges_both_directions() {
    let (node_a, node_b) = two_replica_cluster().await;
    let client = reqwest::Client::new();

    query(&client, &node_a.addr, "setBit(row=1, field=f, col=0)").await;

    // Each side gains a bit the other lacks.
    node_a.fragment(0).set_bit(2, 7).unwrap();
    node_b.fragment(0).set_bit(3, 9).unwrap();

    node_a
        .anti_entropy()
        .sweep(&CancellationToken::new())
        .await
        .unwrap();
    node_b
        .anti_entropy()
        .sweep(&CancellationToken::new())
        .await
        .unwrap();

    for node in [&node_a, &node_b] {
        let fragment = node.fragment(0);
        assert!(fragment.contains(2, 7), "bit missing on {}", node.addr);
        assert!(fragment.contains(3, 9), "bit missing on {}", node.addr);
    }
    assert_eq!(
        node_a.fragment(0).block_checksums(),
        node_b.fragment(0).block_checksums()
    );
}

#[tokio::test]
async fn test_sweep_is_a_noop_for_matching_replicas() {
    let (node_a, node_b) = two_replica_cluster().await;
    let client = reqwest::Client::new();

    query(&client, &node_a.addr, "setBit(row=10, field=f, col=2)").await;
    query(&client, &node_a.addr, "setBit(row=11, field=f, col=3)").await;

    let before = node_a.fragment(0).block_checksums();
    assert_eq!(before, node_b.fragment(0).block_checksums());

    node_a
        .anti_entropy()
        .sweep(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(node_a.fragment(0).block_checksums(), before);
    assert_eq!(node_a.fragment(0).row_count(10), 1);
    assert_eq!(node_a.fragment(0).row_count(11), 1);
}

#[tokio::test]
async fn test_cancelled_sweep_short_circuits() {
    let (node_a, node_b) = two_replica_cluster().await;
    let client = reqwest::Client::new();

    query(&client, &node_a.addr, "setBit(row=10, field=f, col=2)").await;
    node_b.fragment(0).set_bit(11, 5).unwrap();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    node_a.anti_entropy().sweep(&shutdown).await.unwrap();

    // A cancelled sweep repairs nothing.
    assert!(!node_a.fragment(0).contains(11, 5));
}
