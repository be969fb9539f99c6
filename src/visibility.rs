use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::paths::RelPath;
use crate::store::{Document, JsonStore};

#[derive(Debug, Default, Clone)]
pub struct HiddenSet {
    paths: BTreeSet<RelPath>,
}

#[derive(Serialize, Deserialize)]
struct VisibilityFile {
    #[serde(default)]
    hidden_paths: Vec<String>,
}

impl Document for HiddenSet {
    fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        let file: VisibilityFile = serde_json::from_slice(raw)?;
        let mut paths = BTreeSet::new();
        for raw_path in file.hidden_paths {
            match RelPath::parse(&raw_path) {
                Ok(rel) if !rel.is_root() => {
                    paths.insert(rel);
                }
                _ => warn!(path = %raw_path, "Skipping invalid hidden path entry"),
            }
        }
        Ok(Self { paths })
    }

    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let hidden_paths = self.paths.iter().map(RelPath::to_string).collect();
        serde_json::to_vec_pretty(&VisibilityFile { hidden_paths })
    }
}

/// Paths excluded from listings. Hiding a folder hides everything below it.
pub struct VisibilityRegistry {
    store: JsonStore<HiddenSet>,
}

impl VisibilityRegistry {
    pub async fn open(file: PathBuf) -> Self {
        let store = JsonStore::<HiddenSet>::open(file).await;
        let count = store.read(|s| s.paths.len());
        info!(count, file = %store.file().display(), "Loaded hidden folder paths");
        Self { store }
    }

    pub fn is_hidden(&self, path: &RelPath) -> bool {
        self.store
            .read(|s| path.ancestors().any(|candidate| s.paths.contains(candidate)))
    }

    pub fn len(&self) -> usize {
        self.store.read(|s| s.paths.len())
    }

    pub async fn set_hidden(&self, path: &RelPath, hidden: bool) -> AppResult<()> {
        if path.is_root() {
            return Err(AppError::InvalidPath("Cannot hide root directory.".into()));
        }
        self.store
            .update(|s| {
                let changed = if hidden {
                    s.paths.insert(path.clone())
                } else {
                    s.paths.remove(path)
                };
                (changed, ())
            })
            .await?;
        info!(path = %path, hidden, "Visibility updated");
        Ok(())
    }

    pub async fn remove_subtree(&self, path: &RelPath) -> AppResult<usize> {
        self.store
            .update(|s| {
                let before = s.paths.len();
                s.paths.retain(|p| !path.contains(p));
                let removed = before - s.paths.len();
                (removed > 0, removed)
            })
            .await
    }
}
