use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::DbResult;

/// An opaque attribute value attached to a row or column id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

pub type AttrMap = HashMap<String, AttrValue>;

/// Key → attribute-map sidecar store, used for both the index's column
/// attributes and each field's row attributes.
///
/// Orthogonal to the bitmap hot path: it has its own lock and its own
/// file. Persistence is a whole-file rewrite, which is fine at attribute
/// scale.
pub struct AttrStore {
    path: PathBuf,
    attrs: RwLock<HashMap<u64, AttrMap>>,
}

impl AttrStore {
    pub fn new(path: PathBuf) -> AttrStore {
        AttrStore {
            path,
            attrs: RwLock::new(HashMap::new()),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.path.join("attrs")
    }

    pub fn open(&self) -> DbResult<()> {
        std::fs::create_dir_all(&self.path)?;
        let bytes = match std::fs::read(self.file_path()) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<HashMap<u64, AttrMap>>(&bytes) {
            Ok(map) => *self.attrs.write() = map,
            Err(e) => {
                tracing::warn!(path = %self.file_path().display(), error = %e, "unreadable attribute store, starting empty");
            }
        }
        Ok(())
    }

    fn save(&self, attrs: &HashMap<u64, AttrMap>) -> DbResult<()> {
        let bytes = serde_json::to_vec(attrs)?;
        let tmp = self.file_path().with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, self.file_path())?;
        Ok(())
    }

    /// Merge attributes into the entry for `id`.
    pub fn set_attrs(&self, id: u64, new_attrs: AttrMap) -> DbResult<()> {
        let mut attrs = self.attrs.write();
        attrs.entry(id).or_default().extend(new_attrs);
        self.save(&attrs)
    }

    pub fn attrs(&self, id: u64) -> Option<AttrMap> {
        self.attrs.read().get(&id).cloned()
    }

    /// Ids whose attribute `name` equals any of `values`. Backs the
    /// attribute filter of top-N.
    pub fn ids_matching(&self, name: &str, values: &[AttrValue]) -> HashSet<u64> {
        self.attrs
            .read()
            .iter()
            .filter(|(_, m)| m.get(name).map(|v| values.contains(v)).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect()
    }
}
