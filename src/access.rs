use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};
use crate::paths::RelPath;
use crate::protection::ProtectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied,
}

pub fn keys_match(supplied: &str, expected: &str) -> bool {
    bool::from(supplied.as_bytes().ct_eq(expected.as_bytes()))
}

/// Decides whether a supplied key opens a path.
pub struct AccessValidator<'a> {
    protection: &'a ProtectionRegistry,
}

impl<'a> AccessValidator<'a> {
    pub fn new(protection: &'a ProtectionRegistry) -> Self {
        Self { protection }
    }

    /// Unprotected paths are granted for any key; protected paths need the
    /// nearest ancestor's key.
    pub fn validate(&self, path: &RelPath, supplied: &str) -> Access {
        match self.protection.required_key(path) {
            None => Access::Granted,
            Some(required) if keys_match(supplied, &required) => Access::Granted,
            Some(_) => Access::Denied,
        }
    }

    /// Credential for writing into `dir`: the folder's key when it is
    /// protected, otherwise the global upload key.
    pub fn authorize_write(
        &self,
        dir: &RelPath,
        supplied: Option<&str>,
        global: Option<&str>,
    ) -> AppResult<()> {
        let supplied = supplied.unwrap_or_default();
        let ok = match self.protection.required_key(dir) {
            Some(required) => keys_match(supplied, &required),
            None => {
                let global = global.ok_or(AppError::NotConfigured("Server upload key not configured."))?;
                keys_match(supplied, global)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(AppError::AuthDenied("Invalid key.".into()))
        }
    }
}

/// Check a supplied key against a configured global key. An unconfigured key
/// disables the feature rather than granting access.
pub fn require_global(
    supplied: Option<&str>,
    configured: Option<&str>,
    unconfigured: &'static str,
    denied: &str,
) -> AppResult<()> {
    let configured = configured.ok_or(AppError::NotConfigured(unconfigured))?;
    match supplied {
        Some(key) if keys_match(key, configured) => Ok(()),
        _ => Err(AppError::AuthDenied(denied.to_string())),
    }
}
