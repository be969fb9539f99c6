use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::paths::{RelPath, secure_segment};

/// Filesystem operations the orchestrators need.
pub trait Storage: Send + Sync {
    fn exists(&self, path: &RelPath) -> impl Future<Output = bool> + Send;

    fn write_file<S>(&self, path: &RelPath, body: S) -> impl Future<Output = io::Result<u64>> + Send
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin;

    fn remove_recursive(&self, path: &RelPath) -> impl Future<Output = io::Result<()>> + Send;

    fn create_directory(&self, parent: &RelPath, name: &str) -> impl Future<Output = AppResult<RelPath>> + Send;

    /// Fails with `Forbidden` when `path` resolves outside the storage root.
    fn check_confined(&self, path: &RelPath) -> AppResult<()>;

    /// Removal unlinks the final component, so only its parent has to stay
    /// inside the root.
    fn check_removable(&self, path: &RelPath) -> AppResult<()> {
        self.check_confined(&path.parent().unwrap_or_default())
    }
}

/// Storage rooted at a local directory.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative path to disk, refusing anything that resolves (through
    /// symlinks) outside the root.
    pub fn confine(&self, path: &RelPath) -> AppResult<PathBuf> {
        let full = path.resolve(&self.root);
        let existing = full
            .ancestors()
            .find(|p| p.symlink_metadata().is_ok())
            .unwrap_or(&self.root);
        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(AppError::Forbidden("Access forbidden".into()));
        }
        Ok(full)
    }
}

impl Storage for LocalStorage {
    async fn exists(&self, path: &RelPath) -> bool {
        tokio::fs::symlink_metadata(path.resolve(&self.root)).await.is_ok()
    }

    async fn write_file<S>(&self, path: &RelPath, mut body: S) -> io::Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        if path.is_root() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot write to root"));
        }
        let dest = path.resolve(&self.root);
        let parent = dest
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot write to root"))?;
        if let Some(blocker) = parent.ancestors().find(|p| p.is_file()) {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is a file", blocker.display()),
            ));
        }
        tokio::fs::create_dir_all(parent).await?;

        let name = path.file_name().unwrap_or("upload");
        let tmp = parent.join(format!(".{name}.{}.part", nanoid::nanoid!(8)));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, &dest).await?;
            Ok::<u64, io::Error>(written)
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        } else {
            info!(path = %path, "File uploaded");
        }
        result
    }

    async fn remove_recursive(&self, path: &RelPath) -> io::Result<()> {
        let target = path.resolve(&self.root);
        let meta = tokio::fs::symlink_metadata(&target).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        }
    }

    async fn create_directory(&self, parent: &RelPath, name: &str) -> AppResult<RelPath> {
        let safe = secure_segment(name).ok_or_else(|| AppError::BadRequest("Invalid folder name.".into()))?;
        let rel = parent.join(&safe)?;
        let target = self.confine(&rel)?;
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(AppError::BadRequest("Folder already exists.".into()));
        }
        tokio::fs::create_dir_all(&target).await?;
        info!(path = %rel, "Created folder");
        Ok(rel)
    }

    fn check_confined(&self, path: &RelPath) -> AppResult<()> {
        self.confine(path).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tempfile::TempDir;

    fn rel(raw: &str) -> RelPath {
        RelPath::parse(raw).unwrap()
    }

    fn body(parts: &[&'static str]) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static((*p).as_bytes()))).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn write_creates_parents_and_leaves_no_part_files() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path().to_path_buf()).unwrap();
        let written = storage
            .write_file(&rel("a/b/c.txt"), body(&["hello ", "world"]))
            .await
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(std::fs::read_to_string(temp.path().join("a/b/c.txt")).unwrap(), "hello world");
        let names: Vec<_> = std::fs::read_dir(temp.path().join("a/b"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn write_under_a_file_fails() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path().to_path_buf()).unwrap();
        std::fs::write(temp.path().join("plain"), "x").unwrap();
        let err = storage
            .write_file(&rel("plain/child.txt"), body(&["x"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotADirectory);
    }

    #[tokio::test]
    async fn remove_recursive_handles_files_and_trees() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(temp.path().join("tree/deep")).unwrap();
        std::fs::write(temp.path().join("tree/deep/f"), "x").unwrap();
        std::fs::write(temp.path().join("single"), "x").unwrap();

        storage.remove_recursive(&rel("tree")).await.unwrap();
        storage.remove_recursive(&rel("single")).await.unwrap();
        assert!(!storage.exists(&rel("tree")).await);
        assert!(!storage.exists(&rel("single")).await);
        assert!(storage.remove_recursive(&rel("single")).await.is_err());
    }

    #[tokio::test]
    async fn create_directory_sanitizes_and_rejects_duplicates() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path().to_path_buf()).unwrap();
        let created = storage.create_directory(&rel("x"), "New Folder").await.unwrap();
        assert_eq!(created.as_str(), "x/New_Folder");
        assert!(temp.path().join("x/New_Folder").is_dir());

        assert!(matches!(
            storage.create_directory(&rel("x"), "New Folder").await,
            Err(AppError::BadRequest(m)) if m == "Folder already exists."
        ));
        assert!(matches!(
            storage.create_directory(&RelPath::root(), "..").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_root_is_forbidden() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("escape")).unwrap();
        let storage = LocalStorage::new(root).unwrap();

        assert!(matches!(storage.confine(&rel("escape/file")), Err(AppError::Forbidden(_))));
        assert!(storage.confine(&rel("inside/new.txt")).is_ok());
    }
}
