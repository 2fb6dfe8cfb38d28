use std::sync::Arc;

use bitdb::{
    create_router, AppState, BuildInfo, Cluster, Config, Engine, Executor, HttpBroadcaster,
    IndexOptions, Node, NopStats, QueryRequest, QueryResponse, QueryResult, SLICE_WIDTH,
};

struct TestNode {
    addr: String,
    engine: Arc<Engine>,
    _dir: tempfile::TempDir,
}

/// Serve a full node on an already-bound listener.
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
        cluster,
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
        _dir: dir,
    }
}

async fn two_node_cluster(replicas: usize) -> (TestNode, TestNode) {
    // Bind both ports first so each node starts knowing the full list and
    // their partitioners agree.
    let l1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let a = l1.local_addr().unwrap().to_string();
    let b = l2.local_addr().unwrap().to_string();

    let nodes = vec![Node::new(&a), Node::new(&b)];
    let node_a = spawn_node(nodes.clone(), l1, replicas);
    let node_b = spawn_node(nodes, l2, replicas);

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
async fn test_remote_count_fans_out() {
    let (node_a, node_b) = two_node_cluster(1).await;
    let client = reqwest::Client::new();

    // Bits across several shards; with one replica each shard lives on
    // exactly one of the two nodes.
    let cols = [3, SLICE_WIDTH + 1, 2 * SLICE_WIDTH + 9, 5 * SLICE_WIDTH];
    for col in cols {
        let result = query(
            &client,
            &node_a.addr,
            &format!("setBit(row=10, field=f, col={})", col),
        )
        .await;
        assert_eq!(result, QueryResult::Changed(true));
    }

    // Either node answers with the global count, fanning out for the
    // shards it does not own.
    for node in [&node_a, &node_b] {
        let result = query(&client, &node.addr, "count(row(id=10, field=f))").await;
        assert_eq!(result, QueryResult::Count(cols.len() as u64), "on {}", node.addr);
    }

    // The reassembled row bitmap is identical everywhere.
    for node in [&node_a, &node_b] {
        let result = query(&client, &node.addr, "row(id=10, field=f)").await;
        let QueryResult::Bitmap(bm) = result else {
            panic!("expected bitmap");
        };
        assert_eq!(bm.columns(), cols.to_vec());
    }
}

#[tokio::test]
async fn test_replicated_write_lands_on_both_nodes() {
    let (node_a, node_b) = two_node_cluster(2).await;
    let client = reqwest::Client::new();

    let result = query(&client, &node_a.addr, "setBit(row=10, field=f, col=2)").await;
    assert_eq!(result, QueryResult::Changed(true));

    // With two replicas on two nodes, both hold the bit locally.
    for node in [&node_a, &node_b] {
        let idx = node.engine.index("d").unwrap();
        let field = idx.field("f").expect("field replicated");
        let view = field.view(bitdb::VIEW_STANDARD).unwrap();
        let fragment = view.fragment(0).expect("fragment replicated");
        assert!(fragment.contains(10, 2), "bit missing on {}", node.addr);
    }

    for node in [&node_a, &node_b] {
        let result = query(&client, &node.addr, "count(row(id=10, field=f))").await;
        assert_eq!(result, QueryResult::Count(1));
    }
}

#[tokio::test]
async fn test_distributed_top_n() {
    let (node_a, _node_b) = two_node_cluster(1).await;
    let client = reqwest::Client::new();

    // Row cardinalities spread over shards owned by different nodes.
    for (row, bits) in [(1u64, 5u64), (2, 9), (3, 7)] {
        for i in 0..bits {
            let col = i * SLICE_WIDTH + row; // scatter across shards
            query(
                &client,
                &node_a.addr,
                &format!("setBit(row={}, field=f, col={})", row, col),
            )
            .await;
        }
    }

    let result = query(&client, &node_a.addr, "topN(field=f, n=2)").await;
    let QueryResult::Pairs(pairs) = result else {
        panic!("expected pairs");
    };
    assert_eq!(pairs.len(), 2);
    assert_eq!((pairs[0].id, pairs[0].count), (2, 9));
    assert_eq!((pairs[1].id, pairs[1].count), (3, 7));
}

#[tokio::test]
async fn test_schema_broadcast_on_create() {
    let (node_a, node_b) = two_node_cluster(1).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/index/events", node_a.addr))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    // The peer learned the index through the broadcast message.
    assert!(node_b.engine.index("events").is_some());
}
