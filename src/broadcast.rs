use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cluster::Node;
use crate::error::{DbError, DbResult};
use crate::field::FieldOptions;
use crate::index::IndexOptions;

/// Cluster-internal announcements: schema changes and max-slice updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClusterMessage {
    CreateIndex {
        index: String,
        options: IndexOptions,
    },
    DeleteIndex {
        index: String,
    },
    CreateField {
        index: String,
        field: String,
        options: FieldOptions,
    },
    DeleteField {
        index: String,
        field: String,
    },
    MaxSlice {
        index: String,
        slice: u64,
    },
}

/// Mutation/announcement fan-out capability. The core never names a
/// concrete transport; construction decides.
pub trait Broadcaster: Send + Sync {
    fn send_to(&self, node: &Node, msg: &ClusterMessage) -> BoxFuture<'static, DbResult<()>>;
}

/// Broadcaster for standalone mode and tests.
#[derive(Debug, Default)]
pub struct NopBroadcaster;

impl Broadcaster for NopBroadcaster {
    fn send_to(&self, _node: &Node, _msg: &ClusterMessage) -> BoxFuture<'static, DbResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Posts messages to each peer's internal message endpoint.
pub struct HttpBroadcaster {
    client: reqwest::Client,
}

impl HttpBroadcaster {
    pub fn new(client: reqwest::Client) -> HttpBroadcaster {
        HttpBroadcaster { client }
    }
}

impl Broadcaster for HttpBroadcaster {
    fn send_to(&self, node: &Node, msg: &ClusterMessage) -> BoxFuture<'static, DbResult<()>> {
        let url = format!("http://{}/internal/message", node.host);
        let client = self.client.clone();
        let msg = msg.clone();
        Box::pin(async move {
            let resp = client
                .post(&url)
                .json(&msg)
                .send()
                .await
                .map_err(|e| DbError::NetworkError(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(DbError::NetworkError(format!(
                    "{} returned {}",
                    url,
                    resp.status()
                )));
            }
            Ok(())
        })
    }
}

/// Best-effort fan-out of a message to every peer. Failures are logged,
/// not returned: announcements are repaired by anti-entropy.
pub async fn broadcast(
    broadcaster: &dyn Broadcaster,
    nodes: &[Node],
    self_host: &str,
    msg: &ClusterMessage,
) {
    let sends = nodes
        .iter()
        .filter(|n| n.host != self_host)
        .map(|n| {
            let fut = broadcaster.send_to(n, msg);
            let host = n.host.clone();
            async move { (host, fut.await) }
        })
        .collect::<Vec<_>>();
    for (host, result) in futures::future::join_all(sends).await {
        if let Err(e) = result {
            tracing::warn!(peer = %host, error = %e, "broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization_round_trip() {
        let msg = ClusterMessage::MaxSlice {
            index: "i".to_string(),
            slice: 4,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClusterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[tokio::test]
    async fn test_nop_broadcaster() {
        let b = NopBroadcaster;
        let node = Node::new("host:1");
        let msg = ClusterMessage::DeleteIndex {
            index: "i".to_string(),
        };
        assert!(b.send_to(&node, &msg).await.is_ok());
    }
}
