use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::attrs::{AttrMap, AttrValue};
use crate::bitmap::Bitmap;
use crate::broadcast::{broadcast, Broadcaster, ClusterMessage};
use crate::cluster::{Cluster, Node};
use crate::engine::Engine;
use crate::error::{DbError, DbResult};
use crate::field::{FieldOptions, VIEW_STANDARD};
use crate::fragment::{sort_pairs, Pair, SLICE_WIDTH};
use crate::pql::{ArgValue, Call, Query};
use crate::quantum::{parse_timestamp, views_by_time_range};
use crate::stats::Stats;

/// Attempts per replica for transient remote write failures.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// The wire body of the Query RPC. The in-cluster variant sets `remote` to
/// suppress secondary fan-out on the receiving node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub slices: Option<Vec<u64>>,
    #[serde(default)]
    pub remote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResult>,
}

/// One result per top-level call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum QueryResult {
    Bitmap(Bitmap),
    Count(u64),
    Pairs(Vec<Pair>),
    Changed(bool),
    None,
}

/// The scatter/gather planner: decomposes each call into per-shard local
/// evaluations and remote RPCs, then reduces by call kind.
pub struct Executor {
    engine: Arc<Engine>,
    cluster: Arc<Cluster>,
    host: String,
    client: reqwest::Client,
    broadcaster: Arc<dyn Broadcaster>,
    stats: Arc<dyn Stats>,
}

impl Executor {
    pub fn new(
        engine: Arc<Engine>,
        cluster: Arc<Cluster>,
        host: &str,
        broadcaster: Arc<dyn Broadcaster>,
        stats: Arc<dyn Stats>,
    ) -> Executor {
        Executor {
            engine,
            cluster,
            host: host.to_string(),
            client: reqwest::Client::new(),
            broadcaster,
            stats,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn broadcaster(&self) -> &dyn Broadcaster {
        self.broadcaster.as_ref()
    }

    /// Execute a parsed query. `slices` restricts the target shard set and
    /// is set on remote sub-calls; `remote` marks this node as a fan-out
    /// target that must not fan out again.
    pub async fn execute(
        &self,
        index: &str,
        query: &Query,
        slices: Option<Vec<u64>>,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<Vec<QueryResult>> {
        let start = std::time::Instant::now();
        let mut results = Vec::with_capacity(query.calls.len());
        for call in &query.calls {
            if ctx.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            results.push(self.execute_call(index, call, &slices, remote, ctx).await?);
        }
        self.stats.timing("executor.query", start.elapsed());
        Ok(results)
    }

    async fn execute_call(
        &self,
        index: &str,
        call: &Call,
        slices: &Option<Vec<u64>>,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        match call.name.as_str() {
            "setBit" => self.execute_set_bit(index, call, remote, ctx, false).await,
            "clearBit" => self.execute_set_bit(index, call, remote, ctx, true).await,
            "setRowAttrs" => self.execute_set_row_attrs(index, call, remote, ctx).await,
            "setColumnAttrs" => self.execute_set_column_attrs(index, call, remote, ctx).await,
            "count" => self.execute_count(index, call, slices, remote, ctx).await,
            "topN" => self.execute_top_n(index, call, slices, remote, ctx).await,
            _ if call.returns_bitmap() => {
                self.execute_bitmap_call(index, call, slices, remote, ctx).await
            }
            name => Err(DbError::InvalidQuery(format!("unknown call '{}'", name))),
        }
    }

    /// The target shard set: explicit when provided, otherwise every shard
    /// up to the index max (local and remotely advertised).
    fn target_slices(&self, index: &str, slices: &Option<Vec<u64>>) -> DbResult<Vec<u64>> {
        if let Some(s) = slices {
            return Ok(s.clone());
        }
        let idx = self.engine.index_required(index)?;
        Ok((0..=idx.max_slice()).collect())
    }

    /// Group shards by the node that will evaluate them, preferring this
    /// node whenever it is an owner. A remote sub-call never re-groups:
    /// everything it was sent is evaluated locally.
    fn group_by_node(
        &self,
        index: &str,
        slices: &[u64],
        remote: bool,
    ) -> (Vec<u64>, HashMap<String, Vec<u64>>) {
        let mut local = Vec::new();
        let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
        for &slice in slices {
            if remote {
                local.push(slice);
                continue;
            }
            let owners = self.cluster.owners(index, slice);
            if owners.is_empty() || owners.iter().any(|n| n.host == self.host) {
                local.push(slice);
            } else {
                groups.entry(owners[0].host.clone()).or_default().push(slice);
            }
        }
        (local, groups)
    }

    /// Send one call to a peer for a group of shards and return its single
    /// result. Aborts promptly on cancellation.
    async fn send_remote(
        &self,
        host: &str,
        index: &str,
        query: String,
        slices: Vec<u64>,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let url = format!("http://{}/index/{}/query", host, index);
        let req = QueryRequest {
            query,
            slices: Some(slices),
            remote: true,
        };
        let send = async {
            let resp = self
                .client
                .post(&url)
                .json(&req)
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
            let body: QueryResponse = resp
                .json()
                .await
                .map_err(|e| DbError::NetworkError(e.to_string()))?;
            body.results
                .into_iter()
                .next()
                .ok_or_else(|| DbError::NetworkError(format!("{} returned no result", url)))
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(DbError::Cancelled),
            result = send => result,
        }
    }

    async fn dispatch_groups(
        &self,
        index: &str,
        call: &Call,
        groups: HashMap<String, Vec<u64>>,
        ctx: &CancellationToken,
    ) -> DbResult<Vec<QueryResult>> {
        let query = call.to_string();
        let sends = groups
            .into_iter()
            .map(|(host, slices)| self.send_remote_owned(host, index, query.clone(), slices, ctx));
        futures::future::join_all(sends)
            .await
            .into_iter()
            .collect()
    }

    async fn send_remote_owned(
        &self,
        host: String,
        index: &str,
        query: String,
        slices: Vec<u64>,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        self.send_remote(&host, index, query, slices, ctx).await
    }

    // ---- read path ----------------------------------------------------

    async fn execute_bitmap_call(
        &self,
        index: &str,
        call: &Call,
        slices: &Option<Vec<u64>>,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let slices = self.target_slices(index, slices)?;
        let (local, groups) = self.group_by_node(index, &slices, remote);

        // Shards cover disjoint column ranges, so the union reduce is a
        // concat of chunks with no key collisions.
        let mut result = Bitmap::new();
        for slice in local {
            if ctx.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            let bm = self.bitmap_on_slice(index, call, slice)?;
            for (key, container) in bm.chunks() {
                result.insert_chunk(*key, container.clone());
            }
        }
        for r in self.dispatch_groups(index, call, groups, ctx).await? {
            match r {
                QueryResult::Bitmap(bm) => {
                    for (key, container) in bm.chunks() {
                        result.insert_chunk(*key, container.clone());
                    }
                }
                other => {
                    return Err(DbError::InternalError(format!(
                        "remote returned {:?} for a bitmap call",
                        other
                    )))
                }
            }
        }
        Ok(QueryResult::Bitmap(result))
    }

    async fn execute_count(
        &self,
        index: &str,
        call: &Call,
        slices: &Option<Vec<u64>>,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let child = call
            .children
            .first()
            .ok_or_else(|| DbError::InvalidQuery("count() requires a call".to_string()))?;
        let slices = self.target_slices(index, slices)?;
        let (local, groups) = self.group_by_node(index, &slices, remote);

        let mut total: u64 = 0;
        for slice in local {
            if ctx.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            total += self.bitmap_on_slice(index, child, slice)?.count();
        }
        for r in self.dispatch_groups(index, call, groups, ctx).await? {
            match r {
                QueryResult::Count(n) => total += n,
                other => {
                    return Err(DbError::InternalError(format!(
                        "remote returned {:?} for count",
                        other
                    )))
                }
            }
        }
        Ok(QueryResult::Count(total))
    }

    /// Recursive local evaluation of a bitmap-returning call on one shard.
    fn bitmap_on_slice(&self, index: &str, call: &Call, slice: u64) -> DbResult<Bitmap> {
        match call.name.as_str() {
            "row" => self.row_on_slice(index, call, slice),
            "union" => {
                let mut acc = Bitmap::new();
                for child in &call.children {
                    acc = acc.union(&self.bitmap_on_slice(index, child, slice)?);
                }
                Ok(acc)
            }
            "intersect" => {
                let mut children = call.children.iter();
                let first = children.next().ok_or_else(|| {
                    DbError::InvalidQuery("intersect() requires at least one call".to_string())
                })?;
                let mut acc = self.bitmap_on_slice(index, first, slice)?;
                for child in children {
                    acc = acc.intersect(&self.bitmap_on_slice(index, child, slice)?);
                }
                Ok(acc)
            }
            "difference" => {
                let mut children = call.children.iter();
                let first = children.next().ok_or_else(|| {
                    DbError::InvalidQuery("difference() requires at least one call".to_string())
                })?;
                let mut acc = self.bitmap_on_slice(index, first, slice)?;
                for child in children {
                    acc = acc.difference(&self.bitmap_on_slice(index, child, slice)?);
                }
                Ok(acc)
            }
            name => Err(DbError::InvalidQuery(format!(
                "'{}' does not return a bitmap",
                name
            ))),
        }
    }

    fn row_on_slice(&self, index: &str, call: &Call, slice: u64) -> DbResult<Bitmap> {
        let row = call.required_u64("id")?;
        let field_name = call.required_str("field")?;
        let idx = self.engine.index_required(index)?;
        let field = idx
            .field(field_name)
            .ok_or_else(|| DbError::FieldNotFound(field_name.to_string()))?;

        // A time range reads the minimal covering set of time views.
        let views = match (call.arg_str("from"), call.arg_str("to")) {
            (Some(from), Some(to)) => views_by_time_range(
                VIEW_STANDARD,
                parse_timestamp(from)?,
                parse_timestamp(to)?,
                &field.time_quantum(),
            ),
            (None, None) => vec![VIEW_STANDARD.to_string()],
            _ => {
                return Err(DbError::InvalidQuery(
                    "row() requires both from and to".to_string(),
                ))
            }
        };

        let mut acc = Bitmap::new();
        for name in views {
            let Some(view) = field.view(&name) else {
                continue;
            };
            let Some(fragment) = view.fragment(slice) else {
                continue;
            };
            acc = acc.union(&fragment.row(row)?);
        }
        Ok(acc)
    }

    // ---- top-N ---------------------------------------------------------

    async fn execute_top_n(
        &self,
        index: &str,
        call: &Call,
        slices: &Option<Vec<u64>>,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let n = call.arg_u64("n").unwrap_or(0) as usize;
        let slices = self.target_slices(index, slices)?;

        // A remote sub-call (or an explicit id list) evaluates directly on
        // its shard set; only the coordinating node runs two phases.
        if remote {
            let pairs = self.top_n_on_slices(index, call, &slices, ctx)?;
            return Ok(QueryResult::Pairs(pairs));
        }

        // Phase A: over-fetch candidates per shard to bound the error of
        // merging local rankings.
        let k = phase_one_n(n, slices.len());
        let mut phase_one = call.clone();
        if k > 0 {
            phase_one.args.insert("n".to_string(), ArgValue::Uint(k as u64));
        }

        let (local, groups) = self.group_by_node(index, &slices, remote);
        let mut candidates: HashSet<u64> = HashSet::new();
        for p in self.top_n_on_slices(index, &phase_one, &local, ctx)? {
            candidates.insert(p.id);
        }
        for r in self.dispatch_groups(index, &phase_one, groups.clone(), ctx).await? {
            match r {
                QueryResult::Pairs(pairs) => candidates.extend(pairs.iter().map(|p| p.id)),
                other => {
                    return Err(DbError::InternalError(format!(
                        "remote returned {:?} for topN",
                        other
                    )))
                }
            }
        }

        // Phase B: exact counts for every candidate row on every shard.
        let mut ids: Vec<u64> = candidates.into_iter().collect();
        ids.sort_unstable();
        let mut phase_two = Call::new("topN");
        phase_two.children = call.children.clone();
        if let Some(field) = call.arg_str("field") {
            phase_two
                .args
                .insert("field".to_string(), ArgValue::Str(field.to_string()));
        }
        phase_two
            .args
            .insert("ids".to_string(), ArgValue::UintList(ids));

        let mut totals: HashMap<u64, u64> = HashMap::new();
        for p in self.top_n_on_slices(index, &phase_two, &local, ctx)? {
            *totals.entry(p.id).or_default() += p.count;
        }
        for r in self.dispatch_groups(index, &phase_two, groups, ctx).await? {
            match r {
                QueryResult::Pairs(pairs) => {
                    for p in pairs {
                        *totals.entry(p.id).or_default() += p.count;
                    }
                }
                other => {
                    return Err(DbError::InternalError(format!(
                        "remote returned {:?} for topN",
                        other
                    )))
                }
            }
        }

        let mut pairs: Vec<Pair> = totals
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, count)| Pair { id, count })
            .collect();
        sort_pairs(&mut pairs);
        if n > 0 {
            pairs.truncate(n);
        }
        Ok(QueryResult::Pairs(pairs))
    }

    /// Evaluate a topN call over a set of local shards, merging per-shard
    /// pairs by summing counts.
    fn top_n_on_slices(
        &self,
        index: &str,
        call: &Call,
        slices: &[u64],
        ctx: &CancellationToken,
    ) -> DbResult<Vec<Pair>> {
        let field_name = call.required_str("field")?;
        let n = call.arg_u64("n").unwrap_or(0) as usize;
        let ids = call.arg_uint_list("ids");
        let idx = self.engine.index_required(index)?;
        let field = idx
            .field(field_name)
            .ok_or_else(|| DbError::FieldNotFound(field_name.to_string()))?;

        // Attribute filter restricts the candidate rows.
        let allowed: Option<HashSet<u64>> = match (call.arg_str("attrName"), call.arg_str_list("attrValues")) {
            (Some(name), Some(values)) => {
                let values: Vec<AttrValue> =
                    values.iter().map(|v| AttrValue::Str(v.clone())).collect();
                Some(field.row_attrs().ids_matching(name, &values))
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(DbError::InvalidQuery(
                    "topN() requires both attrName and attrValues".to_string(),
                ))
            }
            (None, None) => None,
        };

        let mut totals: HashMap<u64, u64> = HashMap::new();
        for &slice in slices {
            if ctx.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            let Some(view) = field.view(VIEW_STANDARD) else {
                continue;
            };
            let Some(fragment) = view.fragment(slice) else {
                continue;
            };
            let filter = match call.children.first() {
                Some(child) => Some(self.bitmap_on_slice(index, child, slice)?),
                None => None,
            };
            let pairs = match ids {
                Some(ids) => fragment.row_counts(ids, filter.as_ref()),
                None => fragment.top_n(n, filter.as_ref(), allowed.as_ref())?,
            };
            for p in pairs {
                *totals.entry(p.id).or_default() += p.count;
            }
        }

        let mut pairs: Vec<Pair> = totals
            .into_iter()
            .map(|(id, count)| Pair { id, count })
            .collect();
        // Exact-count responses keep zero-count ids so the coordinator can
        // still sum them; ranked responses drop them.
        if ids.is_none() {
            pairs.retain(|p| p.count > 0);
        }
        sort_pairs(&mut pairs);
        if ids.is_none() && n > 0 {
            pairs.truncate(n);
        }
        Ok(pairs)
    }

    // ---- write path ----------------------------------------------------

    async fn execute_set_bit(
        &self,
        index: &str,
        call: &Call,
        remote: bool,
        ctx: &CancellationToken,
        clear: bool,
    ) -> DbResult<QueryResult> {
        let row = call.required_u64("row")?;
        let col = call.required_u64("col")?;
        let field_name = call.required_str("field")?;
        let at = match call.arg_str("at") {
            Some(s) if !clear => Some(parse_timestamp(s)?),
            _ => None,
        };
        let slice = col / SLICE_WIDTH;

        let apply_local = |executor: &Executor| -> DbResult<bool> {
            let idx = executor.engine.index_required(index)?;
            let field = idx.create_field_if_not_exists(field_name, &FieldOptions::default())?;
            if clear {
                field.clear_bit(row, col)
            } else {
                field.set_bit(row, col, at, executor.engine.time_views_only)
            }
        };

        if remote {
            return Ok(QueryResult::Changed(apply_local(self)?));
        }

        let idx = self.engine.index_required(index)?;
        let max_before = idx.max_slice();

        // A first write creates the field everywhere, so later reads can
        // evaluate empty shards on any node.
        if idx.field(field_name).is_none() {
            idx.create_field_if_not_exists(field_name, &FieldOptions::default())?;
            let msg = ClusterMessage::CreateField {
                index: index.to_string(),
                field: field_name.to_string(),
                options: FieldOptions::default(),
            };
            broadcast(self.broadcaster.as_ref(), &self.cluster.nodes, &self.host, &msg).await;
        }

        let owners = self.cluster.owners(index, slice);
        let mut changed = false;
        let mut applied = 0usize;
        let mut last_err: Option<DbError> = None;

        for node in &owners {
            if ctx.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            if node.host == self.host {
                changed |= apply_local(self)?;
                applied += 1;
            } else {
                match self.send_write(node, index, call, slice, ctx).await {
                    Ok(QueryResult::Changed(c)) => {
                        changed |= c;
                        applied += 1;
                    }
                    Ok(_) => applied += 1,
                    Err(DbError::Cancelled) => return Err(DbError::Cancelled),
                    Err(e) => {
                        tracing::warn!(peer = %node.host, error = %e, "replica write failed");
                        last_err = Some(e);
                    }
                }
            }
        }

        if applied == 0 {
            return Err(last_err
                .unwrap_or_else(|| DbError::Unavailable("no replica reachable".to_string())));
        }
        if last_err.is_some() {
            // Fewer than R replicas applied; anti-entropy closes the gap.
            self.stats.count("executor.write_partial_replica", 1);
        }

        if !clear && slice > max_before {
            // Track shards applied only on other nodes too, so this node
            // enumerates them when planning reads.
            idx.set_remote_max_slice(slice);
            let msg = ClusterMessage::MaxSlice {
                index: index.to_string(),
                slice: idx.max_slice(),
            };
            broadcast(self.broadcaster.as_ref(), &self.cluster.nodes, &self.host, &msg).await;
        }

        Ok(QueryResult::Changed(changed))
    }

    /// One replica write with bounded retries and jittered backoff.
    async fn send_write(
        &self,
        node: &Node,
        index: &str,
        call: &Call,
        slice: u64,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .send_remote(&node.host, index, call.to_string(), vec![slice], ctx)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < MAX_WRITE_ATTEMPTS => {
                    let jitter = rand::thread_rng().gen_range(0..50);
                    let backoff = Duration::from_millis(50 * attempt as u64 + jitter);
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(DbError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_set_row_attrs(
        &self,
        index: &str,
        call: &Call,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let field_name = call.required_str("field")?;
        let row = call.required_u64("row")?;
        let attrs = attr_map(call, &["field", "row"])?;

        let idx = self.engine.index_required(index)?;
        let field = idx.create_field_if_not_exists(field_name, &FieldOptions::default())?;
        field.row_attrs().set_attrs(row, attrs)?;

        if !remote {
            self.fan_out_to_peers(index, call, ctx).await?;
        }
        Ok(QueryResult::None)
    }

    async fn execute_set_column_attrs(
        &self,
        index: &str,
        call: &Call,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<QueryResult> {
        let col = call.required_u64("col")?;
        let attrs = attr_map(call, &["col"])?;

        let idx = self.engine.index_required(index)?;
        idx.column_attrs().set_attrs(col, attrs)?;

        if !remote {
            self.fan_out_to_peers(index, call, ctx).await?;
        }
        Ok(QueryResult::None)
    }

    /// Attribute writes land on every node: the sidecars are consulted
    /// locally during top-N on each of them.
    async fn fan_out_to_peers(
        &self,
        index: &str,
        call: &Call,
        ctx: &CancellationToken,
    ) -> DbResult<()> {
        for node in &self.cluster.nodes {
            if node.host == self.host {
                continue;
            }
            if let Err(e) = self.send_write(node, index, call, 0, ctx).await {
                if matches!(e, DbError::Cancelled) {
                    return Err(e);
                }
                tracing::warn!(peer = %node.host, error = %e, "attribute fan-out failed");
            }
        }
        Ok(())
    }

    /// Sorted bulk load: pairs are grouped per shard and dispatched to
    /// the owning fragments, locally or via the import endpoint.
    pub async fn import(
        &self,
        index: &str,
        field: &str,
        rows: Vec<u64>,
        cols: Vec<u64>,
        remote: bool,
        ctx: &CancellationToken,
    ) -> DbResult<()> {
        if rows.len() != cols.len() {
            return Err(DbError::InvalidQuery(
                "import rows/cols length mismatch".to_string(),
            ));
        }

        let mut by_slice: HashMap<u64, (Vec<u64>, Vec<u64>)> = HashMap::new();
        for (row, col) in rows.into_iter().zip(cols) {
            let entry = by_slice.entry(col / SLICE_WIDTH).or_default();
            entry.0.push(row);
            entry.1.push(col);
        }

        for (slice, (rows, cols)) in by_slice {
            if ctx.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            let owners = if remote {
                vec![Node::new(&self.host)]
            } else {
                self.cluster.owners(index, slice)
            };
            for node in owners {
                if node.host == self.host {
                    let idx = self.engine.index_required(index)?;
                    let f = idx.create_field_if_not_exists(field, &FieldOptions::default())?;
                    let view = f.view_or_create(VIEW_STANDARD)?;
                    view.fragment_or_create(slice)?.import(&rows, &cols)?;
                } else {
                    self.send_import(&node, index, field, &rows, &cols, ctx).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_import(
        &self,
        node: &Node,
        index: &str,
        field: &str,
        rows: &[u64],
        cols: &[u64],
        ctx: &CancellationToken,
    ) -> DbResult<()> {
        let url = format!("http://{}/index/{}/field/{}/import", node.host, index, field);
        let body = ImportRequest {
            rows: rows.to_vec(),
            cols: cols.to_vec(),
            remote: true,
        };
        let send = async {
            let resp = self
                .client
                .post(&url)
                .json(&body)
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
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(DbError::Cancelled),
            result = send => result,
        }
    }
}

/// The import endpoint body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub rows: Vec<u64>,
    pub cols: Vec<u64>,
    #[serde(default)]
    pub remote: bool,
}

/// Phase-A over-fetch per shard: `max(n, 2n⌈log₂ shards⌉)`.
fn phase_one_n(n: usize, shard_count: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let log = if shard_count <= 1 {
        0
    } else {
        (usize::BITS - (shard_count - 1).leading_zeros()) as usize
    };
    n.max(2 * n * log)
}

/// Convert the free-form arguments of an attrs call, skipping the
/// addressing keys.
fn attr_map(call: &Call, skip: &[&str]) -> DbResult<AttrMap> {
    let mut attrs = AttrMap::new();
    for (key, value) in &call.args {
        if skip.contains(&key.as_str()) {
            continue;
        }
        let value = match value {
            ArgValue::Uint(v) => AttrValue::Int(*v as i64),
            ArgValue::Str(s) => AttrValue::Str(s.clone()),
            ArgValue::Bool(b) => AttrValue::Bool(*b),
            _ => {
                return Err(DbError::InvalidQuery(format!(
                    "attribute '{}' must be a scalar",
                    key
                )))
            }
        };
        attrs.insert(key.clone(), value);
    }
    Ok(attrs)
}
