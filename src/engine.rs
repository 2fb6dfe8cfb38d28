use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::broadcast::ClusterMessage;
use crate::error::{DbError, DbResult};
use crate::index::{Index, IndexOptions};

/// Schema description returned by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub views: Vec<String>,
}

/// The data-directory root: owns every index on this node.
pub struct Engine {
    path: PathBuf,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    /// When set, timestamped writes skip the standard view.
    pub time_views_only: bool,
}

impl Engine {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Engine {
        Engine {
            path: data_dir.as_ref().to_path_buf(),
            indexes: RwLock::new(HashMap::new()),
            time_views_only: false,
        }
    }

    /// Scan the data directory and open every index found.
    pub fn open(&self) -> DbResult<()> {
        std::fs::create_dir_all(&self.path)?;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let index = Arc::new(Index::new(self.index_path(&name), &name)?);
            index.open()?;
            self.indexes.write().insert(name, index);
        }
        tracing::info!(path = %self.path.display(), indexes = self.indexes.read().len(), "engine opened");
        Ok(())
    }

    pub fn close(&self) -> DbResult<()> {
        for index in self.indexes.write().values() {
            index.close()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(name).cloned()
    }

    /// Lookup that maps absence to the error taxonomy.
    pub fn index_required(&self, name: &str) -> DbResult<Arc<Index>> {
        self.index(name)
            .ok_or_else(|| DbError::IndexNotFound(name.to_string()))
    }

    pub fn indexes(&self) -> Vec<Arc<Index>> {
        let mut indexes: Vec<Arc<Index>> = self.indexes.read().values().cloned().collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        indexes
    }

    pub fn create_index(&self, name: &str, opt: &IndexOptions) -> DbResult<Arc<Index>> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            return Err(DbError::IndexAlreadyExists(name.to_string()));
        }
        let index = Arc::new(Index::new(self.index_path(name), name)?);
        index.open()?;
        index.apply_options(opt)?;
        indexes.insert(name.to_string(), index.clone());
        Ok(index)
    }

    pub fn create_index_if_not_exists(&self, name: &str, opt: &IndexOptions) -> DbResult<Arc<Index>> {
        if let Some(idx) = self.index(name) {
            return Ok(idx);
        }
        match self.create_index(name, opt) {
            Err(DbError::IndexAlreadyExists(_)) => self.index_required(name),
            other => other,
        }
    }

    pub fn delete_index(&self, name: &str) -> DbResult<()> {
        let mut indexes = self.indexes.write();
        let Some(index) = indexes.remove(name) else {
            return Ok(());
        };
        index.close()?;
        std::fs::remove_dir_all(self.index_path(name))?;
        Ok(())
    }

    pub fn schema(&self) -> Vec<IndexInfo> {
        self.indexes()
            .iter()
            .map(|idx| IndexInfo {
                name: idx.name.clone(),
                fields: idx
                    .fields()
                    .iter()
                    .map(|f| {
                        let mut views: Vec<String> =
                            f.views().iter().map(|v| v.name.clone()).collect();
                        views.sort();
                        FieldInfo {
                            name: f.name.clone(),
                            views,
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Apply a peer's broadcast message to local state.
    pub fn apply_message(&self, msg: &ClusterMessage) -> DbResult<()> {
        match msg {
            ClusterMessage::CreateIndex { index, options } => {
                self.create_index_if_not_exists(index, options)?;
            }
            ClusterMessage::DeleteIndex { index } => {
                self.delete_index(index)?;
            }
            ClusterMessage::CreateField {
                index,
                field,
                options,
            } => {
                let idx = self.index_required(index)?;
                idx.create_field_if_not_exists(field, options)?;
            }
            ClusterMessage::DeleteField { index, field } => {
                let idx = self.index_required(index)?;
                idx.delete_field(field)?;
            }
            ClusterMessage::MaxSlice { index, slice } => {
                let idx = self.index_required(index)?;
                idx.set_remote_max_slice(*slice);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldOptions;

    #[test]
    fn test_create_get_delete_index() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());
        engine.open().unwrap();

        engine.create_index("i", &IndexOptions::default()).unwrap();
        assert!(engine.index("i").is_some());
        assert!(matches!(
            engine.create_index("i", &IndexOptions::default()),
            Err(DbError::IndexAlreadyExists(_))
        ));

        engine.delete_index("i").unwrap();
        assert!(engine.index("i").is_none());
        assert!(matches!(
            engine.index_required("i"),
            Err(DbError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_scans_directories() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::new(dir.path());
            engine.open().unwrap();
            let idx = engine.create_index("i", &IndexOptions::default()).unwrap();
            idx.create_field("f", &FieldOptions::default()).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::new(dir.path());
        engine.open().unwrap();
        let idx = engine.index("i").unwrap();
        assert!(idx.field("f").is_some());
    }

    #[test]
    fn test_schema_listing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());
        engine.open().unwrap();

        let idx = engine.create_index("i", &IndexOptions::default()).unwrap();
        let field = idx.create_field("f", &FieldOptions::default()).unwrap();
        field.set_bit(1, 1, None, false).unwrap();

        let schema = engine.schema();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].name, "i");
        assert_eq!(schema[0].fields[0].name, "f");
        assert_eq!(schema[0].fields[0].views, vec!["standard"]);
    }

    #[test]
    fn test_apply_broadcast_messages() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());
        engine.open().unwrap();

        engine
            .apply_message(&ClusterMessage::CreateIndex {
                index: "i".to_string(),
                options: IndexOptions::default(),
            })
            .unwrap();
        engine
            .apply_message(&ClusterMessage::CreateField {
                index: "i".to_string(),
                field: "f".to_string(),
                options: FieldOptions::default(),
            })
            .unwrap();
        engine
            .apply_message(&ClusterMessage::MaxSlice {
                index: "i".to_string(),
                slice: 5,
            })
            .unwrap();

        let idx = engine.index("i").unwrap();
        assert!(idx.field("f").is_some());
        assert_eq!(idx.max_slice(), 5);
    }
}
