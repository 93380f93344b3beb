//! Engine managing every index under one directory

use super::{IndexConfig, IndexStats, LsmIndex};
use crate::dict::DICT_FILE_NAME;
use crate::{HeapSource, LsmError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Collection of LSM indexes, one subdirectory each
pub struct IndexEngine {
    base_dir: PathBuf,
    template: IndexConfig,
    indexes: RwLock<HashMap<String, Arc<LsmIndex>>>,
}

impl IndexEngine {
    /// Open the engine, loading every index found under `base_dir`
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(base_dir, IndexConfig::default())
    }

    /// Open with a config template applied to every index
    pub fn with_config(base_dir: impl Into<PathBuf>, template: IndexConfig) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let engine = Self {
            base_dir,
            template,
            indexes: RwLock::new(HashMap::new()),
        };
        engine.load_existing()?;
        Ok(engine)
    }

    fn load_existing(&self) -> Result<()> {
        let mut indexes = self.indexes.write();

        for dir_entry in fs::read_dir(&self.base_dir)? {
            let path = dir_entry?.path();
            if !path.is_dir() || !path.join(DICT_FILE_NAME).exists() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            match LsmIndex::open(self.config_for(&name)) {
                Ok(index) => {
                    indexes.insert(name, Arc::new(index));
                }
                Err(e) => {
                    warn!("Failed to open index {:?}: {}", name, e);
                    return Err(e);
                }
            }
        }

        info!(
            "Engine loaded {} index(es) from {:?}",
            indexes.len(),
            self.base_dir
        );
        Ok(())
    }

    fn config_for(&self, name: &str) -> IndexConfig {
        IndexConfig {
            data_dir: self.base_dir.join(name),
            ..self.template.clone()
        }
    }

    /// Build a new index over a heap
    pub fn create_index(&self, name: &str, heap: &dyn HeapSource) -> Result<Arc<LsmIndex>> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            return Err(LsmError::IndexAlreadyExists(name.to_string()));
        }

        let index = Arc::new(LsmIndex::build(self.config_for(name), heap)?);
        indexes.insert(name.to_string(), Arc::clone(&index));
        info!("Created index {:?}", name);
        Ok(index)
    }

    /// Look up an index by name
    pub fn get_index(&self, name: &str) -> Result<Arc<LsmIndex>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LsmError::IndexNotFound(name.to_string()))
    }

    /// Drop an index and delete its files
    ///
    /// Fails with `IndexInUse` while a handle from [`get_index`] or
    /// [`create_index`] is still alive, so files are never unlinked
    /// under a live index.
    ///
    /// [`get_index`]: IndexEngine::get_index
    /// [`create_index`]: IndexEngine::create_index
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut indexes = self.indexes.write();
        match indexes.get(name) {
            None => return Err(LsmError::IndexNotFound(name.to_string())),
            Some(index) if Arc::strong_count(index) > 1 => {
                return Err(LsmError::IndexInUse(name.to_string()));
            }
            Some(_) => {}
        }
        // Last reference; dropping it joins the merge worker
        drop(indexes.remove(name));
        drop(indexes);

        let dir = self.base_dir.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!("Dropped index {:?}", name);
        Ok(())
    }

    /// Names of all loaded indexes
    pub fn list_indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a merge for one index on the calling thread
    pub fn merge_index(&self, name: &str) -> Result<bool> {
        self.get_index(name)?.merge_now()
    }

    /// Stats for one index
    pub fn index_stats(&self, name: &str) -> Result<IndexStats> {
        Ok(self.get_index(name)?.stats())
    }
}
