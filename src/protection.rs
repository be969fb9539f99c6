use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::paths::RelPath;
use crate::store::{Document, JsonStore};

/// Folder keys, keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct ProtectionTable {
    entries: BTreeMap<RelPath, String>,
}

#[derive(Serialize, Deserialize)]
struct ProtectionFile {
    #[serde(default)]
    protected_paths: Vec<RawEntry>,
}

#[derive(Serialize, Deserialize)]
struct RawEntry {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

impl Document for ProtectionTable {
    fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        let file: ProtectionFile = serde_json::from_slice(raw)?;
        let mut entries = BTreeMap::new();
        for item in file.protected_paths {
            let (Some(path), Some(key)) = (item.path, item.key) else {
                warn!("Skipping protected path entry without path or key");
                continue;
            };
            match RelPath::parse(&path) {
                Ok(rel) if !rel.is_root() && !key.is_empty() => {
                    entries.insert(rel, key);
                }
                _ => warn!(path = %path, "Skipping invalid protected path entry"),
            }
        }
        Ok(Self { entries })
    }

    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut protected_paths: Vec<RawEntry> = self
            .entries
            .iter()
            .map(|(path, key)| RawEntry {
                path: Some(path.to_string()),
                key: Some(key.clone()),
            })
            .collect();
        protected_paths.sort_by_key(|e| std::cmp::Reverse(e.path.as_ref().map_or(0, String::len)));
        serde_json::to_vec_pretty(&ProtectionFile { protected_paths })
    }
}

impl ProtectionTable {
    fn governing(&self, path: &RelPath) -> Option<(RelPath, &str)> {
        path.ancestors().find_map(|candidate| {
            self.entries
                .get_key_value(candidate)
                .map(|(p, key)| (p.clone(), key.as_str()))
        })
    }
}

/// Maps paths to the key required to open them. A path is protected when it
/// or any ancestor has an entry; the nearest entry wins.
pub struct ProtectionRegistry {
    store: JsonStore<ProtectionTable>,
}

impl ProtectionRegistry {
    pub async fn open(file: PathBuf) -> Self {
        let store = JsonStore::<ProtectionTable>::open(file).await;
        let count = store.read(|t| t.entries.len());
        info!(count, file = %store.file().display(), "Loaded protected folder configurations");
        Self { store }
    }

    /// Key of the nearest protected ancestor (inclusive), if any.
    pub fn required_key(&self, path: &RelPath) -> Option<String> {
        self.store
            .read(|t| t.governing(path).map(|(_, key)| key.to_string()))
    }

    /// The entry that governs `path`: its own path and key.
    pub fn governing(&self, path: &RelPath) -> Option<(RelPath, String)> {
        self.store
            .read(|t| t.governing(path).map(|(p, key)| (p, key.to_string())))
    }

    pub fn is_protected(&self, path: &RelPath) -> bool {
        self.store.read(|t| t.governing(path).is_some())
    }

    pub fn len(&self) -> usize {
        self.store.read(|t| t.entries.len())
    }

    pub async fn set_protection(&self, path: &RelPath, key: &str) -> AppResult<()> {
        if path.is_root() {
            return Err(AppError::InvalidPath("Cannot protect root.".into()));
        }
        if key.is_empty() {
            return Err(AppError::BadRequest("Protection password required.".into()));
        }
        self.store
            .update(|t| {
                let changed = t.entries.get(path).map(String::as_str) != Some(key);
                t.entries.insert(path.clone(), key.to_string());
                (changed, ())
            })
            .await?;
        info!(path = %path, "Path protection set");
        Ok(())
    }

    /// Returns whether an entry existed.
    pub async fn remove_protection(&self, path: &RelPath) -> AppResult<bool> {
        self.store
            .update(|t| {
                let removed = t.entries.remove(path).is_some();
                (removed, removed)
            })
            .await
    }

    /// Drop every entry at or below `path`. Returns how many were removed.
    pub async fn remove_subtree(&self, path: &RelPath) -> AppResult<usize> {
        self.store
            .update(|t| {
                let before = t.entries.len();
                t.entries.retain(|p, _| !path.contains(p));
                let removed = before - t.entries.len();
                (removed > 0, removed)
            })
            .await
    }
}
