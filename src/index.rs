use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::attrs::AttrStore;
use crate::error::{DbError, DbResult};
use crate::field::{validate_label, validate_name, Field, FieldOptions};
use crate::quantum::TimeQuantum;

pub const DEFAULT_COLUMN_LABEL: &str = "columnID";

const COLUMN_ATTR_DIR: &str = ".data";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default)]
    pub column_label: Option<String>,
    #[serde(default)]
    pub time_quantum: Option<TimeQuantum>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexMeta {
    column_label: String,
    time_quantum: TimeQuantum,
}

impl Default for IndexMeta {
    fn default() -> Self {
        IndexMeta {
            column_label: DEFAULT_COLUMN_LABEL.to_string(),
            time_quantum: TimeQuantum::default(),
        }
    }
}

/// A named container of fields plus the column-attribute sidecar.
pub struct Index {
    pub name: String,
    path: PathBuf,
    meta: RwLock<IndexMeta>,
    fields: RwLock<HashMap<String, Arc<Field>>>,
    column_attrs: AttrStore,
    /// Max slice advertised by other nodes; merged into `max_slice`.
    remote_max_slice: AtomicU64,
}

impl Index {
    pub fn new(path: PathBuf, name: &str) -> DbResult<Index> {
        validate_name(name)?;
        let column_attrs = AttrStore::new(path.join(COLUMN_ATTR_DIR));
        Ok(Index {
            name: name.to_string(),
            path,
            meta: RwLock::new(IndexMeta::default()),
            fields: RwLock::new(HashMap::new()),
            column_attrs,
            remote_max_slice: AtomicU64::new(0),
        })
    }

    pub fn open(&self) -> DbResult<()> {
        std::fs::create_dir_all(&self.path)?;
        self.load_meta()?;
        self.column_attrs.open()?;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == COLUMN_ATTR_DIR {
                continue;
            }
            let field = Arc::new(Field::new(self.field_path(&name), &self.name, &name)?);
            field.open()?;
            self.fields.write().insert(name, field);
        }
        Ok(())
    }

    pub fn close(&self) -> DbResult<()> {
        for field in self.fields.write().values() {
            field.close()?;
        }
        Ok(())
    }

    fn meta_path(&self) -> PathBuf {
        self.path.join(".meta")
    }

    fn field_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
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

    pub fn apply_options(&self, opt: &IndexOptions) -> DbResult<()> {
        {
            let mut meta = self.meta.write();
            if let Some(label) = &opt.column_label {
                validate_label(label)?;
                meta.column_label = label.clone();
            }
            if let Some(q) = &opt.time_quantum {
                meta.time_quantum = q.clone();
            }
        }
        self.save_meta()
    }

    pub fn column_label(&self) -> String {
        self.meta.read().column_label.clone()
    }

    pub fn time_quantum(&self) -> TimeQuantum {
        self.meta.read().time_quantum.clone()
    }

    pub fn column_attrs(&self) -> &AttrStore {
        &self.column_attrs
    }

    pub fn field(&self, name: &str) -> Option<Arc<Field>> {
        self.fields.read().get(name).cloned()
    }

    pub fn fields(&self) -> Vec<Arc<Field>> {
        let mut fields: Vec<Arc<Field>> = self.fields.read().values().cloned().collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        fields
    }

    pub fn create_field(&self, name: &str, opt: &FieldOptions) -> DbResult<Arc<Field>> {
        let mut fields = self.fields.write();
        if fields.contains_key(name) {
            return Err(DbError::FieldAlreadyExists(name.to_string()));
        }
        let field = Arc::new(Field::new(self.field_path(name), &self.name, name)?);
        field.open()?;

        // Fields inherit the index time quantum unless they set their own.
        let mut opt = opt.clone();
        if opt.time_quantum.is_none() {
            let q = self.time_quantum();
            if !q.is_empty() {
                opt.time_quantum = Some(q);
            }
        }
        field.apply_options(&opt)?;
        fields.insert(name.to_string(), field.clone());
        Ok(field)
    }

    pub fn create_field_if_not_exists(&self, name: &str, opt: &FieldOptions) -> DbResult<Arc<Field>> {
        if let Some(f) = self.field(name) {
            return Ok(f);
        }
        match self.create_field(name, opt) {
            Err(DbError::FieldAlreadyExists(_)) => self
                .field(name)
                .ok_or_else(|| DbError::FieldNotFound(name.to_string())),
            other => other,
        }
    }

    pub fn delete_field(&self, name: &str) -> DbResult<()> {
        let mut fields = self.fields.write();
        let Some(field) = fields.remove(name) else {
            return Ok(());
        };
        field.close()?;
        std::fs::remove_dir_all(self.field_path(name))?;
        Ok(())
    }

    /// Max slice in this index according to this node: the larger of local
    /// fragment maxima and the remotely advertised value.
    pub fn max_slice(&self) -> u64 {
        let local = self
            .fields
            .read()
            .values()
            .map(|f| f.max_slice())
            .max()
            .unwrap_or(0);
        local.max(self.remote_max_slice.load(Ordering::Relaxed))
    }

    pub fn set_remote_max_slice(&self, slice: u64) {
        self.remote_max_slice.fetch_max(slice, Ordering::Relaxed);
    }
}
