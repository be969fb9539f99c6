use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// A document persisted as a single JSON file.
pub trait Document: Default + Clone + Send + Sync {
    fn decode(raw: &[u8]) -> serde_json::Result<Self>;
    fn encode(&self) -> serde_json::Result<Vec<u8>>;
}

/// Process-wide persisted document.
///
/// Readers take a short read lock on the in-memory copy. Writers are
/// serialized on `write_gate`, apply their change to a clone, persist the
/// whole document through a temp file + rename, and only then swap the clone
/// in. A failed write leaves both the file and the in-memory copy untouched.
pub struct JsonStore<D: Document> {
    file: PathBuf,
    current: RwLock<D>,
    write_gate: Mutex<()>,
}

impl<D: Document> JsonStore<D> {
    pub async fn open(file: PathBuf) -> Self {
        let doc = match tokio::fs::read(&file).await {
            Ok(raw) => match D::decode(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Could not parse config, starting empty");
                    D::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %file.display(), "Config not found, starting empty");
                D::default()
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Could not read config, starting empty");
                D::default()
            }
        };
        Self {
            file,
            current: RwLock::new(doc),
            write_gate: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Read-modify-write. `mutate` returns `false` when nothing changed, in
    /// which case no write happens.
    pub async fn update<R>(&self, mutate: impl FnOnce(&mut D) -> (bool, R)) -> AppResult<R> {
        let _gate = self.write_gate.lock().await;
        let mut next = self.read(Clone::clone);
        let (changed, result) = mutate(&mut next);
        if !changed {
            return Ok(result);
        }
        let bytes = next.encode().map_err(|e| AppError::Persist {
            file: self.file.clone(),
            source: std::io::Error::other(e),
        })?;
        write_atomic(&self.file, &bytes)
            .await
            .map_err(|source| AppError::Persist {
                file: self.file.clone(),
                source,
            })?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(result)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", nanoid::nanoid!(8)));
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
