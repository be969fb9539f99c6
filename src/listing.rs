use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{AppError, AppResult};
use crate::paths::RelPath;
use crate::protection::ProtectionRegistry;
use crate::session::Viewer;
use crate::visibility::VisibilityRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    pub rel_path: String,
    pub rel_path_encoded: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub modified: Option<u64>,
    pub is_protected: bool,
    pub is_hidden: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubdirInfo {
    pub name: String,
    pub is_protected: bool,
}

/// Directory listings and name search, annotated from the registries.
///
/// Everything here touches the disk synchronously; handlers run it on the
/// blocking pool.
#[derive(Clone)]
pub struct Listing {
    root: PathBuf,
    protection: Arc<ProtectionRegistry>,
    visibility: Arc<VisibilityRegistry>,
}

impl Listing {
    pub fn new(root: PathBuf, protection: Arc<ProtectionRegistry>, visibility: Arc<VisibilityRegistry>) -> Self {
        Self {
            root,
            protection,
            visibility,
        }
    }

    pub fn list_directory(&self, dir: &RelPath, viewer: &Viewer) -> AppResult<Vec<EntryInfo>> {
        let abs = dir.resolve(&self.root);
        if !abs.is_dir() {
            return Err(AppError::NotFound("Path not found or not a directory.".into()));
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&abs)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(rel) = dir.join(&name) else {
                continue;
            };
            let is_hidden = self.visibility.is_hidden(&rel);
            if is_hidden && !viewer.view_hidden {
                continue;
            }
            if let Some(info) = self.describe(&entry.path(), rel, name, is_hidden) {
                entries.push(info);
            }
        }
        entries.sort_by_key(|e| e.name.to_lowercase());
        Ok(entries)
    }

    /// Case-insensitive substring match on entry names below `start`.
    /// Protected folders the viewer cannot open are reported but not entered.
    pub fn find_by_name(
        &self,
        query: &str,
        start: &RelPath,
        recursive: bool,
        viewer: &Viewer,
    ) -> AppResult<Vec<EntryInfo>> {
        let start_abs = start.resolve(&self.root);
        if !start_abs.is_dir() {
            return Err(AppError::NotFound("Path not found or not a directory.".into()));
        }
        let needle = query.to_lowercase();
        let mut results = Vec::new();
        let mut walker = WalkDir::new(&start_abs)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .sort_by(|a, b| {
                a.file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .cmp(&b.file_name().to_string_lossy().to_lowercase())
            })
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping entry during search");
                    continue;
                }
            };
            let Some(rel) = self.relative(entry.path()) else {
                continue;
            };
            let is_dir = entry.file_type().is_dir();
            let is_hidden = self.visibility.is_hidden(&rel);
            if is_hidden && !viewer.view_hidden {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_lowercase().contains(&needle)
                && let Some(info) = self.describe(entry.path(), rel.clone(), name, is_hidden)
            {
                results.push(info);
            }
            if is_dir && !viewer.can_open(&self.protection, &rel) {
                walker.skip_current_dir();
            }
        }
        Ok(results)
    }

    /// Immediate subdirectories of `dir` the viewer may see.
    pub fn subdirectories(&self, dir: &RelPath, viewer: &Viewer) -> AppResult<Vec<SubdirInfo>> {
        Ok(self
            .list_directory(dir, viewer)?
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| SubdirInfo {
                name: e.name,
                is_protected: e.is_protected,
            })
            .collect())
    }

    /// Every visible directory below the root, sorted.
    pub fn all_directories(&self, viewer: &Viewer) -> Vec<String> {
        let mut dirs = Vec::new();
        let mut walker = WalkDir::new(&self.root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(rel) = self.relative(entry.path()) else {
                walker.skip_current_dir();
                continue;
            };
            if !viewer.view_hidden && self.visibility.is_hidden(&rel) {
                walker.skip_current_dir();
                continue;
            }
            if !viewer.can_open(&self.protection, &rel) {
                walker.skip_current_dir();
            }
            dirs.push(rel.to_string());
        }
        dirs.sort();
        dirs
    }

    fn relative(&self, abs: &Path) -> Option<RelPath> {
        let stripped = abs.strip_prefix(&self.root).ok()?;
        RelPath::parse(stripped.to_str()?).ok()
    }

    fn describe(&self, abs: &Path, rel: RelPath, name: String, is_hidden: bool) -> Option<EntryInfo> {
        let meta = match std::fs::metadata(abs).or_else(|_| std::fs::symlink_metadata(abs)) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %rel, error = %e, "Could not stat entry");
                return None;
            }
        };
        let is_dir = meta.is_dir();
        Some(EntryInfo {
            name,
            rel_path_encoded: encode_path(&rel),
            is_protected: self.protection.is_protected(&rel),
            rel_path: rel.to_string(),
            is_dir,
            size: (!is_dir).then(|| meta.len()),
            modified: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            is_hidden,
        })
    }
}

/// Percent-encode each segment, keeping the separators.
pub fn encode_path(rel: &RelPath) -> String {
    rel.as_str()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
