use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::access::require_global;
use crate::error::AppResult;
use crate::paths::RelPath;
use crate::protection::ProtectionRegistry;
use crate::storage::Storage;
use crate::visibility::VisibilityRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub success_count: usize,
    pub fail_count: usize,
    pub errors: Vec<ItemError>,
}

impl DeleteReport {
    fn fail(&mut self, path: impl Into<String>, error: impl Into<String>) {
        self.fail_count += 1;
        self.errors.push(ItemError {
            path: path.into(),
            error: error.into(),
        });
    }
}

pub struct DeleteOrchestrator<'a, S: Storage> {
    storage: &'a S,
    protection: &'a ProtectionRegistry,
    visibility: &'a VisibilityRegistry,
}

impl<'a, S: Storage> DeleteOrchestrator<'a, S> {
    pub fn new(storage: &'a S, protection: &'a ProtectionRegistry, visibility: &'a VisibilityRegistry) -> Self {
        Self {
            storage,
            protection,
            visibility,
        }
    }

    /// Check the delete key once, then remove each item independently.
    /// A bad key fails the whole batch before anything is touched.
    pub async fn delete_items(
        &self,
        configured_key: Option<&str>,
        supplied_key: Option<&str>,
        items: &[Value],
    ) -> AppResult<DeleteReport> {
        require_global(
            supplied_key,
            configured_key,
            "Deletion not configured.",
            "Invalid delete key.",
        )?;

        let mut report = DeleteReport::default();
        for item in items {
            let Some(raw) = item.as_str() else {
                report.fail("(invalid)", "Invalid item format");
                continue;
            };
            let path = match RelPath::parse(raw) {
                Ok(path) => path,
                Err(_) => {
                    report.fail(raw, "Access forbidden");
                    continue;
                }
            };
            if path.is_root() {
                report.fail("/", "Cannot delete root directory");
                continue;
            }
            if self.storage.check_removable(&path).is_err() {
                report.fail(path.as_str(), "Access forbidden");
                continue;
            }
            if !self.storage.exists(&path).await {
                report.fail(path.as_str(), "Item not found");
                continue;
            }
            match self.storage.remove_recursive(&path).await {
                Ok(()) => {
                    report.success_count += 1;
                    info!(path = %path, "Deleted");
                    self.forget(&path).await;
                }
                Err(e) => report.fail(path.as_str(), format!("OS error: {}", strerror(&e))),
            }
        }
        Ok(report)
    }

    async fn forget(&self, path: &RelPath) {
        if let Err(e) = self.protection.remove_subtree(path).await {
            warn!(path = %path, error = %e, "Could not drop protection entries of deleted path");
        }
        if let Err(e) = self.visibility.remove_subtree(path).await {
            warn!(path = %path, error = %e, "Could not drop hidden entries of deleted path");
        }
    }
}

/// The OS description without Rust's " (os error N)" suffix.
fn strerror(e: &io::Error) -> String {
    let text = e.to_string();
    match e.raw_os_error() {
        Some(code) => text.trim_end_matches(&format!(" (os error {code})")).to_string(),
        None => text,
    }
}
