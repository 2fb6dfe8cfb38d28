pub mod cache;
pub mod storage;

pub use cache::{sort_pairs, CacheType, Pair, RowCache, DEFAULT_CACHE_SIZE};
pub use storage::LogOp;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::bitmap::Bitmap;
use crate::error::{DbError, DbResult};
use storage::OpLog;

/// Width of one shard in columns. A column `c` belongs to shard `c / SLICE_WIDTH`.
pub const SLICE_WIDTH: u64 = 1 << 20;

/// Rows per anti-entropy block.
pub const BLOCK_ROWS: u64 = 1 << 16;

/// Op-log entries tolerated before a snapshot is forced.
const MAX_OP_LOG_ENTRIES: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    Closed,
    Opening,
    Open,
    Closing,
    /// Mutation I/O failed; reads still work, writes need a reopen.
    Degraded,
}

/// The persistent unit of bitmap storage: all bits of one
/// (index, field, view, slice).
///
/// Bits are held in memory as `row -> Bitmap` (column positions are global,
/// so per-shard results from different fragments never share container
/// keys). Durability comes from a snapshot file plus a bounded op log; see
/// the storage module.
pub struct Fragment {
    pub index: String,
    pub field: String,
    pub view: String,
    pub slice: u64,
    path: PathBuf,
    cache_type: CacheType,
    cache_size: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    state: FragmentState,
    rows: BTreeMap<u64, Bitmap>,
    cache: RowCache,
    log: Option<OpLog>,
}

impl Fragment {
    pub fn new(
        path: PathBuf,
        index: &str,
        field: &str,
        view: &str,
        slice: u64,
        cache_type: CacheType,
        cache_size: usize,
    ) -> Fragment {
        Fragment {
            index: index.to_string(),
            field: field.to_string(),
            view: view.to_string(),
            slice,
            path,
            cache_type,
            cache_size,
            inner: RwLock::new(Inner {
                state: FragmentState::Closed,
                rows: BTreeMap::new(),
                cache: RowCache::new(cache_type, cache_size),
                log: None,
            }),
        }
    }

    fn op_log_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        name.push_str(".op");
        self.path.with_file_name(name)
    }

    /// Load the snapshot, replay the op-log tail, rebuild the cache.
    pub fn open(&self) -> DbResult<()> {
        let mut inner = self.inner.write();
        if inner.state == FragmentState::Open {
            return Ok(());
        }
        inner.state = FragmentState::Opening;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let rows = match storage::read_snapshot(&self.path) {
            Ok(rows) => rows,
            Err(e) => {
                inner.state = FragmentState::Closed;
                return Err(e);
            }
        };
        inner.rows = rows;

        let (log, ops) = match OpLog::open(&self.op_log_path()) {
            Ok(v) => v,
            Err(e) => {
                inner.state = FragmentState::Closed;
                return Err(e);
            }
        };
        for op in ops {
            let (row, col) = match op {
                LogOp::Set { row, col } | LogOp::Clear { row, col } => (row, col),
            };
            let Ok(pos) = self.position(col) else {
                tracing::warn!(row, col, slice = self.slice, "op log entry outside shard, skipping");
                continue;
            };
            match op {
                LogOp::Set { .. } => {
                    inner.rows.entry(row).or_default().set(pos)?;
                }
                LogOp::Clear { .. } => {
                    if let Some(bm) = inner.rows.get_mut(&row) {
                        bm.clear(pos)?;
                        if bm.is_empty() {
                            inner.rows.remove(&row);
                        }
                    }
                }
            }
        }
        inner.log = Some(log);

        // Rebuild the popularity cache from scratch.
        inner.cache = RowCache::new(self.cache_type, self.cache_size);
        let counts: Vec<(u64, u64)> = inner.rows.iter().map(|(r, bm)| (*r, bm.count())).collect();
        for (row, count) in counts {
            inner.cache.update(row, count);
        }

        inner.state = FragmentState::Open;
        tracing::debug!(
            index = %self.index,
            field = %self.field,
            view = %self.view,
            slice = self.slice,
            rows = inner.rows.len(),
            "fragment opened"
        );
        Ok(())
    }

    /// Snapshot and release. Afterwards all operations fail `Unavailable`.
    pub fn close(&self) -> DbResult<()> {
        let mut inner = self.inner.write();
        if inner.state == FragmentState::Closed {
            return Ok(());
        }
        inner.state = FragmentState::Closing;
        storage::write_snapshot(&self.path, &inner.rows)?;
        if let Some(log) = inner.log.as_mut() {
            log.truncate()?;
        }
        inner.log = None;
        inner.rows = BTreeMap::new();
        inner.cache = RowCache::new(self.cache_type, self.cache_size);
        inner.state = FragmentState::Closed;
        Ok(())
    }

    pub fn state(&self) -> FragmentState {
        self.inner.read().state
    }

    /// Column position check against this fragment's shard range. The bit
    /// is stored at its global position.
    fn position(&self, col: u64) -> DbResult<u64> {
        if col / SLICE_WIDTH != self.slice {
            return Err(DbError::InvalidPosition(col));
        }
        Ok(col)
    }

    fn check_writable(inner: &Inner, col: u64) -> DbResult<()> {
        match inner.state {
            FragmentState::Open => Ok(()),
            FragmentState::Degraded => Err(DbError::Unavailable(format!(
                "fragment degraded, writes rejected (col={})",
                col
            ))),
            _ => Err(DbError::Unavailable("fragment not open".to_string())),
        }
    }

    /// Set a bit. Logged before it is applied so a crash replays it.
    pub fn set_bit(&self, row: u64, col: u64) -> DbResult<bool> {
        let pos = self.position(col)?;
        let mut inner = self.inner.write();
        Self::check_writable(&inner, col)?;

        if inner
            .rows
            .get(&row)
            .map(|bm| bm.contains(pos))
            .unwrap_or(false)
        {
            return Ok(false);
        }

        let Some(log) = inner.log.as_mut() else {
            return Err(DbError::Unavailable("fragment log not open".to_string()));
        };
        if let Err(e) = log.append(&LogOp::Set { row, col }) {
            inner.state = FragmentState::Degraded;
            tracing::error!(slice = self.slice, error = %e, "op log append failed, fragment degraded");
            return Err(e);
        }

        inner.rows.entry(row).or_default().set(pos)?;
        let count = inner.rows.get(&row).map(|bm| bm.count()).unwrap_or(0);
        inner.cache.update(row, count);

        self.maybe_snapshot(&mut inner);
        Ok(true)
    }

    /// Clear a bit.
    pub fn clear_bit(&self, row: u64, col: u64) -> DbResult<bool> {
        let pos = self.position(col)?;
        let mut inner = self.inner.write();
        Self::check_writable(&inner, col)?;

        if !inner
            .rows
            .get(&row)
            .map(|bm| bm.contains(pos))
            .unwrap_or(false)
        {
            return Ok(false);
        }

        let Some(log) = inner.log.as_mut() else {
            return Err(DbError::Unavailable("fragment log not open".to_string()));
        };
        if let Err(e) = log.append(&LogOp::Clear { row, col }) {
            inner.state = FragmentState::Degraded;
            tracing::error!(slice = self.slice, error = %e, "op log append failed, fragment degraded");
            return Err(e);
        }

        let mut count = 0;
        if let Some(bm) = inner.rows.get_mut(&row) {
            bm.clear(pos)?;
            count = bm.count();
            if bm.is_empty() {
                inner.rows.remove(&row);
            }
        }
        inner.cache.update(row, count);

        self.maybe_snapshot(&mut inner);
        Ok(true)
    }

    fn maybe_snapshot(&self, inner: &mut Inner) {
        let needs = inner.log.as_ref().map(|l| l.len() >= MAX_OP_LOG_ENTRIES).unwrap_or(false);
        if !needs {
            return;
        }
        if let Err(e) = self.snapshot_locked(inner) {
            // Reads remain valid; only durability compaction failed.
            tracing::error!(slice = self.slice, error = %e, "snapshot failed");
        }
    }

    fn snapshot_locked(&self, inner: &mut Inner) -> DbResult<()> {
        storage::write_snapshot(&self.path, &inner.rows)?;
        if let Some(log) = inner.log.as_mut() {
            log.truncate()?;
        }
        Ok(())
    }

    /// Rewrite the snapshot and truncate the op log.
    pub fn snapshot(&self) -> DbResult<()> {
        let mut inner = self.inner.write();
        if inner.state != FragmentState::Open && inner.state != FragmentState::Degraded {
            return Err(DbError::Unavailable("fragment not open".to_string()));
        }
        self.snapshot_locked(&mut inner)
    }

    pub fn contains(&self, row: u64, col: u64) -> bool {
        let inner = self.inner.read();
        inner.rows.get(&row).map(|bm| bm.contains(col)).unwrap_or(false)
    }

    /// The logical row restricted to this shard.
    pub fn row(&self, row: u64) -> DbResult<Bitmap> {
        let inner = self.inner.read();
        if inner.state != FragmentState::Open && inner.state != FragmentState::Degraded {
            return Err(DbError::Unavailable("fragment not open".to_string()));
        }
        Ok(inner.rows.get(&row).cloned().unwrap_or_default())
    }

    pub fn row_count(&self, row: u64) -> u64 {
        self.inner
            .read()
            .rows
            .get(&row)
            .map(|bm| bm.count())
            .unwrap_or(0)
    }

    /// Exact counts for explicit rows, optionally restricted by a filter.
    /// Used by the second phase of distributed top-N.
    pub fn row_counts(&self, rows: &[u64], filter: Option<&Bitmap>) -> Vec<Pair> {
        let inner = self.inner.read();
        rows.iter()
            .map(|&row| {
                let count = match (inner.rows.get(&row), filter) {
                    (Some(bm), Some(f)) => bm.intersect(f).count(),
                    (Some(bm), None) => bm.count(),
                    (None, _) => 0,
                };
                Pair { id: row, count }
            })
            .collect()
    }

    /// Approximate top-N over the popularity cache.
    ///
    /// Without a filter this is the head of the rank order. With a filter
    /// every cached candidate is re-counted against `filter ∧ row`, which
    /// stays cheap because the candidate set is bounded by the cache size.
    pub fn top_n(
        &self,
        n: usize,
        filter: Option<&Bitmap>,
        allowed_rows: Option<&HashSet<u64>>,
    ) -> DbResult<Vec<Pair>> {
        let mut inner = self.inner.write();
        if inner.state != FragmentState::Open && inner.state != FragmentState::Degraded {
            return Err(DbError::Unavailable("fragment not open".to_string()));
        }
        let inner = &mut *inner;

        let mut pairs = match filter {
            None => inner.cache.top(0),
            Some(f) => {
                let mut pairs: Vec<Pair> = inner
                    .cache
                    .ids()
                    .into_iter()
                    .map(|row| {
                        let count = inner
                            .rows
                            .get(&row)
                            .map(|bm| bm.intersect(f).count())
                            .unwrap_or(0);
                        Pair { id: row, count }
                    })
                    .filter(|p| p.count > 0)
                    .collect();
                sort_pairs(&mut pairs);
                pairs
            }
        };

        if let Some(allowed) = allowed_rows {
            pairs.retain(|p| allowed.contains(&p.id));
        }
        if n > 0 {
            pairs.truncate(n);
        }
        Ok(pairs)
    }

    /// Sorted bulk load. Groups by row and builds bitmaps directly,
    /// avoiding per-bit op-log overhead; durability comes from the
    /// snapshot written at the end.
    pub fn import(&self, rows: &[u64], cols: &[u64]) -> DbResult<()> {
        if rows.len() != cols.len() {
            return Err(DbError::InternalError(
                "import rows/cols length mismatch".to_string(),
            ));
        }
        for &col in cols {
            self.position(col)?;
        }

        let mut inner = self.inner.write();
        Self::check_writable(&inner, 0)?;

        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_unstable_by_key(|&i| (rows[i], cols[i]));

        for i in order {
            let (row, col) = (rows[i], cols[i]);
            inner.rows.entry(row).or_default().set(col)?;
        }

        let counts: Vec<(u64, u64)> = inner.rows.iter().map(|(r, bm)| (*r, bm.count())).collect();
        for (row, count) in counts {
            inner.cache.update(row, count);
        }

        self.snapshot_locked(&mut inner)
    }

    pub fn max_row(&self) -> u64 {
        self.inner
            .read()
            .rows
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Checksums of every non-empty anti-entropy block. A block covers
    /// `BLOCK_ROWS` consecutive rows.
    pub fn block_checksums(&self) -> Vec<(u64, String)> {
        let inner = self.inner.read();
        let mut out: Vec<(u64, String)> = Vec::new();
        let mut current: Option<(u64, Sha256)> = None;

        for (row, bitmap) in &inner.rows {
            let block = row / BLOCK_ROWS;
            if current.as_ref().map(|(b, _)| *b) != Some(block) {
                if let Some((b, digest)) = current.take() {
                    out.push((b, hex_digest(digest)));
                }
                current = Some((block, Sha256::new()));
            }
            let (_, digest) = current.as_mut().unwrap();
            digest.update(row.to_le_bytes());
            for (key, container) in bitmap.chunks() {
                digest.update(key.to_le_bytes());
                digest.update([container.kind()]);
                digest.update(container.slot_bytes());
            }
        }
        if let Some((b, digest)) = current.take() {
            out.push((b, hex_digest(digest)));
        }
        out
    }

    /// All (row, col) pairs of one block, for replica repair.
    pub fn block_pairs(&self, block: u64) -> Vec<(u64, u64)> {
        let inner = self.inner.read();
        let start = block * BLOCK_ROWS;
        let mut out = Vec::new();
        for (row, bitmap) in inner.rows.range(start..start + BLOCK_ROWS) {
            for col in bitmap.iter() {
                out.push((*row, col));
            }
        }
        out
    }
}

fn hex_digest(digest: Sha256) -> String {
    digest
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
