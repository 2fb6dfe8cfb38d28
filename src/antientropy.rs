use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::engine::Engine;
use crate::error::{DbError, DbResult};

/// Wire shapes of the fragment reconciliation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksResponse {
    pub blocks: Vec<(u64, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPairsRequest {
    pub index: String,
    pub field: String,
    pub view: String,
    pub slice: u64,
    pub block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPairsResponse {
    pub pairs: Vec<(u64, u64)>,
}

/// Background replica reconciliation: compare per-block checksums with the
/// peers owning each local fragment's shard, pull the pairs of differing
/// blocks, and OR the missing bits in. Divergence is expected after
/// partial replica writes; this loop closes the gap.
pub struct AntiEntropy {
    engine: Arc<Engine>,
    cluster: Arc<Cluster>,
    host: String,
    client: reqwest::Client,
    interval: Duration,
}

impl AntiEntropy {
    pub fn new(
        engine: Arc<Engine>,
        cluster: Arc<Cluster>,
        host: &str,
        interval: Duration,
    ) -> AntiEntropy {
        AntiEntropy {
            engine,
            cluster,
            host: host.to_string(),
            client: reqwest::Client::new(),
            interval,
        }
    }

    /// Run until shutdown. Never blocks foreground queries: each sweep
    /// takes only read locks and applies repairs bit by bit.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("anti-entropy loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(&shutdown).await {
                        tracing::warn!(error = %e, "anti-entropy sweep failed");
                    }
                }
            }
        }
    }

    /// One pass over every local fragment.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> DbResult<()> {
        for index in self.engine.indexes() {
            for field in index.fields() {
                for view in field.views() {
                    for fragment in view.fragments() {
                        if shutdown.is_cancelled() {
                            return Ok(());
                        }
                        let peers = self
                            .cluster
                            .owners(&index.name, fragment.slice)
                            .into_iter()
                            .filter(|n| n.host != self.host);
                        for peer in peers {
                            if let Err(e) = self
                                .sync_fragment(&peer.host, &index.name, &field.name, &view.name, fragment.slice)
                                .await
                            {
                                tracing::warn!(
                                    peer = %peer.host,
                                    index = %index.name,
                                    field = %field.name,
                                    slice = fragment.slice,
                                    error = %e,
                                    "fragment sync failed"
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn sync_fragment(
        &self,
        peer: &str,
        index: &str,
        field: &str,
        view: &str,
        slice: u64,
    ) -> DbResult<()> {
        let idx = self.engine.index_required(index)?;
        let fragment = idx
            .field(field)
            .and_then(|f| f.view(view))
            .and_then(|v| v.fragment(slice))
            .ok_or_else(|| DbError::Unavailable("fragment gone".to_string()))?;

        let local: HashMap<u64, String> = fragment.block_checksums().into_iter().collect();
        let remote = self.fetch_blocks(peer, index, field, view, slice).await?;

        for (block, checksum) in remote.blocks {
            if local.get(&block).map(|c| c == &checksum).unwrap_or(false) {
                continue;
            }
            tracing::warn!(
                peer,
                index,
                field,
                view,
                slice,
                block,
                "replica mismatch, repairing block"
            );
            let pairs = self.fetch_block_pairs(peer, index, field, view, slice, block).await?;
            for (row, col) in pairs.pairs {
                if !fragment.contains(row, col) {
                    fragment.set_bit(row, col).map_err(|e| {
                        DbError::ReplicaMismatch(format!(
                            "block {} of {}/{}/{}/{} diverged and repair failed: {}",
                            block, index, field, view, slice, e
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_blocks(
        &self,
        peer: &str,
        index: &str,
        field: &str,
        view: &str,
        slice: u64,
    ) -> DbResult<BlocksResponse> {
        let url = format!(
            "http://{}/internal/fragment/blocks?index={}&field={}&view={}&slice={}",
            peer, index, field, view, slice
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DbError::NetworkError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DbError::NetworkError(format!("{} returned {}", url, resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| DbError::NetworkError(e.to_string()))
    }

    async fn fetch_block_pairs(
        &self,
        peer: &str,
        index: &str,
        field: &str,
        view: &str,
        slice: u64,
        block: u64,
    ) -> DbResult<BlockPairsResponse> {
        let url = format!("http://{}/internal/fragment/block-pairs", peer);
        let body = BlockPairsRequest {
            index: index.to_string(),
            field: field.to_string(),
            view: view.to_string(),
            slice,
            block,
        };
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DbError::NetworkError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DbError::NetworkError(format!("{} returned {}", url, resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| DbError::NetworkError(e.to_string()))
    }
}
