use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::attrs::AttrStore;
use crate::error::{DbError, DbResult};
use crate::fragment::{CacheType, Fragment, DEFAULT_CACHE_SIZE, SLICE_WIDTH};
use crate::quantum::{views_by_time, TimeQuantum};

/// The default view every write lands in.
pub const VIEW_STANDARD: &str = "standard";

pub const DEFAULT_ROW_LABEL: &str = "rowID";

const ROW_ATTR_DIR: &str = ".rowdata";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(default)]
    pub row_label: Option<String>,
    #[serde(default)]
    pub cache_type: Option<CacheType>,
    #[serde(default)]
    pub cache_size: Option<usize>,
    #[serde(default)]
    pub time_quantum: Option<TimeQuantum>,
}

/// Persisted field metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldMeta {
    row_label: String,
    cache_type: CacheType,
    cache_size: usize,
    time_quantum: TimeQuantum,
}

impl Default for FieldMeta {
    fn default() -> Self {
        FieldMeta {
            row_label: DEFAULT_ROW_LABEL.to_string(),
            cache_type: CacheType::default(),
            cache_size: DEFAULT_CACHE_SIZE,
            time_quantum: TimeQuantum::default(),
        }
    }
}

/// A named projection of a field. The standard view holds every write;
/// time quanta add views per granularity, each with its own fragments.
pub struct View {
    pub name: String,
    path: PathBuf,
    index: String,
    field: String,
    cache_type: CacheType,
    cache_size: usize,
    fragments: RwLock<HashMap<u64, Arc<Fragment>>>,
}

impl View {
    fn new(
        path: PathBuf,
        index: &str,
        field: &str,
        name: &str,
        cache_type: CacheType,
        cache_size: usize,
    ) -> View {
        View {
            name: name.to_string(),
            path,
            index: index.to_string(),
            field: field.to_string(),
            cache_type,
            cache_size,
            fragments: RwLock::new(HashMap::new()),
        }
    }

    /// Open fragments already on disk. A shard may exist as a snapshot
    /// file, an op log, or both; a crash before the first snapshot leaves
    /// only the log behind.
    fn open(&self) -> DbResult<()> {
        std::fs::create_dir_all(&self.path)?;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let base = name.strip_suffix(".op").unwrap_or(&name);
            let Ok(slice) = base.parse::<u64>() else {
                continue;
            };
            self.fragment_or_create(slice)?;
        }
        Ok(())
    }

    pub fn fragment(&self, slice: u64) -> Option<Arc<Fragment>> {
        self.fragments.read().get(&slice).cloned()
    }

    /// Fragments are created lazily on the first write touching a shard.
    pub fn fragment_or_create(&self, slice: u64) -> DbResult<Arc<Fragment>> {
        if let Some(f) = self.fragments.read().get(&slice) {
            return Ok(f.clone());
        }
        let mut fragments = self.fragments.write();
        if let Some(f) = fragments.get(&slice) {
            return Ok(f.clone());
        }
        let fragment = Arc::new(Fragment::new(
            self.path.join(slice.to_string()),
            &self.index,
            &self.field,
            &self.name,
            slice,
            self.cache_type,
            self.cache_size,
        ));
        fragment.open()?;
        fragments.insert(slice, fragment.clone());
        Ok(fragment)
    }

    pub fn fragments(&self) -> Vec<Arc<Fragment>> {
        self.fragments.read().values().cloned().collect()
    }

    pub fn max_slice(&self) -> u64 {
        self.fragments.read().keys().max().copied().unwrap_or(0)
    }

    fn close(&self) -> DbResult<()> {
        for fragment in self.fragments.write().values() {
            fragment.close()?;
        }
        Ok(())
    }
}

/// A named group of rows within an index. Owns its views, their fragments,
/// and the row-attribute sidecar.
pub struct Field {
    pub index: String,
    pub name: String,
    path: PathBuf,
    meta: RwLock<FieldMeta>,
    views: RwLock<HashMap<String, Arc<View>>>,
    row_attrs: AttrStore,
}

impl Field {
    pub fn new(path: PathBuf, index: &str, name: &str) -> DbResult<Field> {
        validate_name(name)?;
        let row_attrs = AttrStore::new(path.join(ROW_ATTR_DIR));
        Ok(Field {
            index: index.to_string(),
            name: name.to_string(),
            path,
            meta: RwLock::new(FieldMeta::default()),
            views: RwLock::new(HashMap::new()),
            row_attrs,
        })
    }

    pub fn open(&self) -> DbResult<()> {
        std::fs::create_dir_all(&self.path)?;
        self.load_meta()?;
        self.row_attrs.open()?;

        // Open views present on disk.
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ROW_ATTR_DIR {
                continue;
            }
            self.view_or_create(&name)?;
        }
        Ok(())
    }

    pub fn close(&self) -> DbResult<()> {
        for view in self.views.write().values() {
            view.close()?;
        }
        Ok(())
    }

    fn meta_path(&self) -> PathBuf {
        self.path.join(".meta")
    }

    fn load_meta(&self) -> DbResult<()> {
        let bytes = match std::fs::read(self.meta_path()) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        *self.meta.write() = serde_json::from_slice(&bytes)?;
        Ok(())
    }

    fn save_meta(&self) -> DbResult<()> {
        let bytes = serde_json::to_vec(&*self.meta.read())?;
        std::fs::write(self.meta_path(), bytes)?;
        Ok(())
    }

    /// Apply creation options and persist them.
    pub fn apply_options(&self, opt: &FieldOptions) -> DbResult<()> {
        {
            let mut meta = self.meta.write();
            if let Some(label) = &opt.row_label {
                validate_label(label)?;
                meta.row_label = label.clone();
            }
            if let Some(ct) = opt.cache_type {
                meta.cache_type = ct;
            }
            if let Some(size) = opt.cache_size {
                meta.cache_size = size;
            }
            if let Some(q) = &opt.time_quantum {
                meta.time_quantum = q.clone();
            }
        }
        self.save_meta()
    }

    pub fn row_label(&self) -> String {
        self.meta.read().row_label.clone()
    }

    pub fn time_quantum(&self) -> TimeQuantum {
        self.meta.read().time_quantum.clone()
    }

    pub fn row_attrs(&self) -> &AttrStore {
        &self.row_attrs
    }

    pub fn view(&self, name: &str) -> Option<Arc<View>> {
        self.views.read().get(name).cloned()
    }

    pub fn view_or_create(&self, name: &str) -> DbResult<Arc<View>> {
        if let Some(v) = self.views.read().get(name) {
            return Ok(v.clone());
        }
        let mut views = self.views.write();
        if let Some(v) = views.get(name) {
            return Ok(v.clone());
        }
        let meta = self.meta.read().clone();
        let view = Arc::new(View::new(
            self.path.join(name),
            &self.index,
            &self.name,
            name,
            meta.cache_type,
            meta.cache_size,
        ));
        view.open()?;
        views.insert(name.to_string(), view.clone());
        Ok(view)
    }

    pub fn views(&self) -> Vec<Arc<View>> {
        self.views.read().values().cloned().collect()
    }

    /// Set a bit in the standard view and, for timestamped writes on a
    /// time-quantum field, in each time-sliced view. With
    /// `time_views_only`, a timestamped write skips the standard view.
    pub fn set_bit(
        &self,
        row: u64,
        col: u64,
        at: Option<DateTime<Utc>>,
        time_views_only: bool,
    ) -> DbResult<bool> {
        let slice = col / SLICE_WIDTH;
        let quantum = self.time_quantum();

        let mut names: Vec<String> = Vec::new();
        match at {
            Some(t) if !quantum.is_empty() => {
                if !time_views_only {
                    names.push(VIEW_STANDARD.to_string());
                }
                names.extend(views_by_time(VIEW_STANDARD, t, &quantum));
            }
            _ => names.push(VIEW_STANDARD.to_string()),
        }

        let mut changed = false;
        for name in names {
            let view = self.view_or_create(&name)?;
            let fragment = view.fragment_or_create(slice)?;
            if fragment.set_bit(row, col)? {
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Clear a bit from the standard view.
    pub fn clear_bit(&self, row: u64, col: u64) -> DbResult<bool> {
        let slice = col / SLICE_WIDTH;
        let view = self.view_or_create(VIEW_STANDARD)?;
        let fragment = view.fragment_or_create(slice)?;
        fragment.clear_bit(row, col)
    }

    /// Max slice across the standard view's fragments.
    pub fn max_slice(&self) -> u64 {
        self.view(VIEW_STANDARD).map(|v| v.max_slice()).unwrap_or(0)
    }
}

/// Index, field, and view names: lowercase, digits, dash, underscore,
/// starting with a letter, at most 64 characters.
pub fn validate_name(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidName(name.to_string()))
    }
}

/// Labels additionally allow uppercase.
pub fn validate_label(label: &str) -> DbResult<()> {
    let valid = !label.is_empty()
        && label.len() <= 64
        && label.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidName(label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantum::parse_timestamp;
    use std::path::Path;

    fn open_field(dir: &Path) -> Field {
        let f = Field::new(dir.join("f"), "i", "f").unwrap();
        f.open().unwrap();
        f
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("events").is_ok());
        assert!(validate_name("a1-b_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1abc").is_err());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_set_bit_creates_fragment_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let field = open_field(dir.path());
        assert!(field.view(VIEW_STANDARD).is_none() || field.max_slice() == 0);

        assert!(field.set_bit(10, 3, None, false).unwrap());
        assert!(field.set_bit(10, SLICE_WIDTH + 1, None, false).unwrap());

        let view = field.view(VIEW_STANDARD).unwrap();
        assert!(view.fragment(0).is_some());
        assert!(view.fragment(1).is_some());
        assert_eq!(field.max_slice(), 1);
    }

    #[test]
    fn test_time_quantum_writes_standard_and_time_views() {
        let dir = tempfile::tempdir().unwrap();
        let field = open_field(dir.path());
        field
            .apply_options(&FieldOptions {
                time_quantum: Some(TimeQuantum::parse("YM").unwrap()),
                ..Default::default()
            })
            .unwrap();

        let at = parse_timestamp("2016-01-02T03:00").unwrap();
        field.set_bit(10, 3, Some(at), false).unwrap();

        for name in [VIEW_STANDARD, "standard_2016", "standard_201601"] {
            let view = field.view(name).unwrap_or_else(|| panic!("missing view {}", name));
            let fragment = view.fragment(0).unwrap();
            assert!(fragment.contains(10, 3), "bit missing in view {}", name);
        }
    }

    #[test]
    fn test_time_views_only_skips_standard() {
        let dir = tempfile::tempdir().unwrap();
        let field = open_field(dir.path());
        field
            .apply_options(&FieldOptions {
                time_quantum: Some(TimeQuantum::parse("Y").unwrap()),
                ..Default::default()
            })
            .unwrap();

        let at = parse_timestamp("2016-01-02T03:00").unwrap();
        field.set_bit(10, 3, Some(at), true).unwrap();

        assert!(field.view(VIEW_STANDARD).is_none());
        assert!(field.view("standard_2016").is_some());
    }

    #[test]
    fn test_field_reopen_restores_views() {
        let dir = tempfile::tempdir().unwrap();
        {
            let field = open_field(dir.path());
            field.set_bit(10, 3, None, false).unwrap();
            field.close().unwrap();
        }

        let field = open_field(dir.path());
        let view = field.view(VIEW_STANDARD).unwrap();
        let fragment = view.fragment(0).unwrap();
        assert!(fragment.contains(10, 3));
    }

    #[test]
    fn test_reopen_after_crash_replays_op_logs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let field = open_field(dir.path());
            field.set_bit(10, 3, None, false).unwrap();
            // No close: the bit lives only in the fragment op log.
        }

        let field = open_field(dir.path());
        let view = field.view(VIEW_STANDARD).unwrap();
        assert!(view.fragment(0).unwrap().contains(10, 3));
    }

    #[test]
    fn test_meta_persistence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let field = open_field(dir.path());
            field
                .apply_options(&FieldOptions {
                    row_label: Some("user".to_string()),
                    cache_type: Some(CacheType::Lru),
                    cache_size: Some(10),
                    time_quantum: None,
                })
                .unwrap();
        }

        let field = open_field(dir.path());
        assert_eq!(field.row_label(), "user");
        assert_eq!(field.time_quantum(), TimeQuantum::default());
    }
}
