//! Client-side batch upload.
//!
//! Files go out strictly one at a time. Progress is reported as a percentage
//! of the whole batch, and a folder upload that asked for protection gets a
//! single protection call once every file has been attempted.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::AppError;
use crate::paths::{RelPath, sanitize_upload_path};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("server answered {0}")]
    Rejected(u16),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct UploadItem {
    pub source: PathBuf,
    /// Path below the batch's target root, as declared by the selection.
    pub relative: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProtection {
    pub path: RelPath,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub target_root: RelPath,
    pub items: Vec<UploadItem>,
    pub protection: Option<PendingProtection>,
}

impl UploadPlan {
    pub fn new(target_root: RelPath, items: Vec<UploadItem>, protection: Option<PendingProtection>) -> Self {
        Self {
            target_root,
            items,
            protection,
        }
    }

    /// Individual files land directly in `target_root` under their own names.
    pub fn files(target_root: RelPath, paths: &[PathBuf]) -> Result<Self, TransferError> {
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let meta = std::fs::metadata(path)?;
            if !meta.is_file() {
                return Err(TransferError::InvalidTarget(format!("{} is not a file", path.display())));
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| TransferError::InvalidTarget(path.display().to_string()))?;
            items.push(UploadItem {
                source: path.clone(),
                relative: name.to_string(),
                size: meta.len(),
            });
        }
        Ok(Self::new(target_root, items, None))
    }

    /// Every file below `dir`, keeping the folder's own name as the first
    /// segment so the tree is recreated under `target_root`. A password
    /// protects `target_root/<folder name>` after the upload.
    pub fn folder(target_root: RelPath, dir: &Path, password: Option<String>) -> Result<Self, TransferError> {
        let top = dir
            .canonicalize()?
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| TransferError::InvalidTarget(dir.display().to_string()))?;

        let mut items = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| TransferError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(inner) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let Some(inner) = inner.to_str() else {
                warn!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
                continue;
            };
            items.push(UploadItem {
                source: entry.path().to_path_buf(),
                relative: format!("{top}/{}", inner.replace('\\', "/")),
                size: entry.metadata().map_err(|e| TransferError::Io(io::Error::other(e)))?.len(),
            });
        }

        let protection = match password.filter(|p| !p.is_empty()) {
            Some(password) => {
                // The server stores uploads under sanitized names.
                let path = sanitize_upload_path(&format!("{target_root}/{top}"))
                    .map_err(|e| TransferError::InvalidTarget(e.to_string()))?;
                Some(PendingProtection { path, password })
            }
            None => None,
        };
        Ok(Self::new(target_root, items, protection))
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|i| i.size).sum()
    }
}

/// Moves one file, or sets one protection entry, on the server.
pub trait Transport {
    /// Send a file, reporting cumulative bytes sent on `progress`. Returns
    /// the HTTP status; transport failures are errors.
    fn send_file(
        &self,
        item: &UploadItem,
        target: &RelPath,
        key: &str,
        progress: mpsc::UnboundedSender<u64>,
    ) -> impl Future<Output = Result<u16, TransferError>>;

    fn set_protection(
        &self,
        path: &RelPath,
        password: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), TransferError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub file_index: usize,
    pub file_count: usize,
    pub target: String,
    pub file_loaded: u64,
    pub file_total: u64,
    pub overall_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProtectionOutcome {
    #[default]
    NotRequested,
    /// Requested, but no file made it.
    Skipped,
    Applied,
    Failed(String),
}

/// What the caller should do once a batch is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    RefreshListing,
    CloseAfterDelay,
    KeepOpenForRetry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub success_count: usize,
    pub fail_count: usize,
    pub skipped_count: usize,
    pub failures: Vec<FileFailure>,
    pub protection: ProtectionOutcome,
}

impl UploadReport {
    pub fn total(&self) -> usize {
        self.success_count + self.fail_count + self.skipped_count
    }

    /// `viewing` is the folder the user has open, if any.
    pub fn follow_up(&self, viewing: Option<&RelPath>, target_root: &RelPath) -> FollowUp {
        if self.fail_count > 0 || self.skipped_count > 0 {
            FollowUp::KeepOpenForRetry
        } else if viewing == Some(target_root) {
            FollowUp::RefreshListing
        } else {
            FollowUp::CloseAfterDelay
        }
    }

    pub fn partial_failure(&self) -> Option<AppError> {
        let failed = self.fail_count + self.skipped_count;
        (failed > 0).then(|| AppError::PartialBatchFailure {
            failed,
            total: self.total(),
        })
    }
}

enum FileOutcome {
    Uploaded,
    Failed(String),
    Skipped,
}

pub struct UploadOrchestrator<T: Transport> {
    transport: T,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<T: Transport> UploadOrchestrator<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling aborts the in-flight file and skips the rest.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run(&self, plan: &UploadPlan, key: &str, mut on_progress: impl FnMut(&Progress)) -> UploadReport {
        let grand_total = plan.total_bytes();
        let file_count = plan.items.len();
        let mut report = UploadReport::default();
        let mut base = 0u64;

        for (file_index, item) in plan.items.iter().enumerate() {
            let target = plan.target_root.join(&item.relative);
            let label = target
                .as_ref()
                .map(RelPath::to_string)
                .unwrap_or_else(|_| item.relative.clone());
            let mut emit = |loaded: u64| {
                on_progress(&Progress {
                    file_index,
                    file_count,
                    target: label.clone(),
                    file_loaded: loaded,
                    file_total: item.size,
                    overall_percent: percent(base + loaded, grand_total),
                })
            };

            let outcome = if self.cancel.is_cancelled() {
                FileOutcome::Skipped
            } else {
                match &target {
                    Ok(target) => self.transfer(item, target, key, &mut emit).await,
                    Err(e) => FileOutcome::Failed(e.to_string()),
                }
            };

            match outcome {
                FileOutcome::Uploaded => {
                    emit(item.size);
                    report.success_count += 1;
                }
                FileOutcome::Failed(reason) => {
                    warn!(target = %label, reason = %reason, "Upload failed");
                    report.fail_count += 1;
                    report.failures.push(FileFailure {
                        target: label.clone(),
                        reason,
                    });
                }
                FileOutcome::Skipped => report.skipped_count += 1,
            }
            base += item.size;
        }

        report.protection = self.apply_protection(plan, key, report.success_count).await;
        info!(
            succeeded = report.success_count,
            failed = report.fail_count,
            skipped = report.skipped_count,
            "Upload batch finished"
        );
        report
    }

    async fn transfer(
        &self,
        item: &UploadItem,
        target: &RelPath,
        key: &str,
        emit: &mut impl FnMut(u64),
    ) -> FileOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transfer = self.transport.send_file(item, target, key, tx);
        tokio::pin!(transfer);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut loaded = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FileOutcome::Skipped,
                Some(sent) = rx.recv() => {
                    // Never let a file's contribution shrink or exceed its size.
                    let sent = sent.min(item.size);
                    if sent > loaded {
                        loaded = sent;
                        emit(loaded);
                    }
                }
                result = &mut transfer => {
                    return match result {
                        Ok(status) if (200..300).contains(&status) => FileOutcome::Uploaded,
                        Ok(status) => FileOutcome::Failed(TransferError::Rejected(status).to_string()),
                        Err(e) => FileOutcome::Failed(e.to_string()),
                    };
                }
                _ = &mut deadline => return FileOutcome::Failed(TransferError::Timeout(self.timeout).to_string()),
            }
        }
    }

    async fn apply_protection(&self, plan: &UploadPlan, key: &str, succeeded: usize) -> ProtectionOutcome {
        let Some(pending) = &plan.protection else {
            return ProtectionOutcome::NotRequested;
        };
        if succeeded == 0 {
            return ProtectionOutcome::Skipped;
        }
        let call = self.transport.set_protection(&pending.path, &pending.password, key);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(self.timeout)),
        };
        match result {
            Ok(()) => {
                info!(path = %pending.path, "Folder protected after upload");
                ProtectionOutcome::Applied
            }
            Err(e) => {
                warn!(path = %pending.path, error = %e, "Could not protect folder after upload");
                ProtectionOutcome::Failed(e.to_string())
            }
        }
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 * 100.0 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}
