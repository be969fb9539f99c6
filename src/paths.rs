//! Relative path handling for everything served below the public root.
//!
//! A [`RelPath`] is slash-separated, never starts with `/`, and has no empty,
//! `.` or `..` segments. The empty path is the root itself.

use std::borrow::Borrow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Normalize a raw path. Backslashes count as separators, empty and `.`
    /// segments are dropped and `..` pops the previous segment. Climbing
    /// above the root or a NUL byte is an `InvalidPath`.
    pub fn parse(raw: &str) -> AppResult<Self> {
        if raw.contains('\0') {
            return Err(AppError::InvalidPath("path contains a NUL byte".into()));
        }
        let unified = raw.replace('\\', "/");
        let mut segments: Vec<&str> = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(AppError::InvalidPath(format!("'{raw}' escapes the root")));
                    }
                }
                other => segments.push(other),
            }
        }
        Ok(Self(segments.join("/")))
    }

    /// Percent-decode, then normalize. Undecodable input is normalized as-is.
    pub fn from_url(raw: &str) -> AppResult<Self> {
        match urlencoding::decode(raw) {
            Ok(decoded) => Self::parse(&decoded),
            Err(_) => Self::parse(raw),
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|name| !name.is_empty())
    }

    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        })
    }

    /// Append a relative path. `rel` is normalized on its own first, so it can
    /// never climb out of `self`.
    pub fn join(&self, rel: &str) -> AppResult<RelPath> {
        let rel = Self::parse(rel)?;
        Ok(match (self.is_root(), rel.is_root()) {
            (_, true) => self.clone(),
            (true, false) => rel,
            (false, false) => Self(format!("{}/{}", self.0, rel.0)),
        })
    }

    /// Self and every non-root ancestor, deepest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        let start = (!self.0.is_empty()).then_some(self.0.as_str());
        std::iter::successors(start, |cur| cur.rfind('/').map(|idx| &cur[..idx]))
    }

    /// True when `self` is `other` or one of its ancestors. The root contains
    /// every path.
    pub fn contains(&self, other: &RelPath) -> bool {
        self.is_root()
            || other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/'))
    }

    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.0.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RelPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RelPath {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RelPath> for String {
    fn from(value: RelPath) -> Self {
        value.0
    }
}

/// Reduce a single user supplied name to `[A-Za-z0-9._-]`. Whitespace turns
/// into `_`; leading and trailing dots and underscores are trimmed.
pub fn secure_segment(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_whitespace() {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Sanitize an upload destination segment by segment. `.` segments are
/// skipped; anything that sanitizes to nothing rejects the whole path.
pub fn sanitize_upload_path(raw: &str) -> AppResult<RelPath> {
    if raw.contains('\0') {
        return Err(AppError::InvalidPath("path contains a NUL byte".into()));
    }
    let mut parts = Vec::new();
    for part in raw.replace('\\', "/").split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        match secure_segment(part) {
            Some(clean) if clean != ".." => parts.push(clean),
            _ => return Err(AppError::InvalidPath(format!("unsafe segment '{part}'"))),
        }
    }
    if parts.is_empty() {
        return Err(AppError::InvalidPath("empty upload path".into()));
    }
    Ok(RelPath(parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(raw: &str) -> RelPath {
        RelPath::parse(raw).unwrap()
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["/a/b/", "a//b/./c", "a\\b\\c", "", "/", "x/../y/z/..", "docs/My File.pdf"] {
            let once = rel(raw);
            assert_eq!(rel(once.as_str()), once, "input {raw:?}");
        }
    }

    #[test]
    fn parent_segments_are_resolved() {
        assert_eq!(rel("a/../b"), rel("b"));
        assert_eq!(rel("a/b/../../c").as_str(), "c");
        assert_eq!(rel("/photos/2024/").as_str(), "photos/2024");
        assert_eq!(rel("a\\b").as_str(), "a/b");
    }

    #[test]
    fn escaping_the_root_is_rejected() {
        assert!(matches!(RelPath::parse("../a"), Err(AppError::InvalidPath(_))));
        assert!(matches!(RelPath::parse("a/../../b"), Err(AppError::InvalidPath(_))));
        assert!(matches!(RelPath::parse("a\0b"), Err(AppError::InvalidPath(_))));
    }

    #[test]
    fn url_form_is_decoded_once() {
        assert_eq!(RelPath::from_url("/docs/My%20File.pdf").unwrap().as_str(), "docs/My File.pdf");
        assert!(RelPath::from_url("%2E%2E/etc").is_err());
        assert!(RelPath::from_url("a%00b").is_err());
    }

    #[test]
    fn ancestors_run_deepest_first() {
        let path = rel("a/b/c");
        let ancestors: Vec<&str> = path.ancestors().collect();
        assert_eq!(ancestors, vec!["a/b/c", "a/b", "a"]);
        assert_eq!(RelPath::root().ancestors().count(), 0);
    }

    #[test]
    fn contains_respects_segment_boundaries() {
        assert!(rel("docs").contains(&rel("docs/internal/report.pdf")));
        assert!(rel("docs").contains(&rel("docs")));
        assert!(!rel("docs").contains(&rel("docs-old/a")));
        assert!(RelPath::root().contains(&rel("anything")));
        assert!(!rel("a/b").contains(&rel("a")));
    }

    #[test]
    fn join_cannot_climb_out() {
        assert_eq!(rel("photos").join("2024/a.jpg").unwrap().as_str(), "photos/2024/a.jpg");
        assert_eq!(RelPath::root().join("a").unwrap().as_str(), "a");
        assert!(rel("photos").join("../x").is_err());
    }

    #[test]
    fn parent_and_file_name() {
        let path = rel("a/b/c.txt");
        assert_eq!(path.file_name(), Some("c.txt"));
        assert_eq!(path.parent().unwrap().as_str(), "a/b");
        assert_eq!(rel("a").parent(), Some(RelPath::root()));
        assert_eq!(RelPath::root().parent(), None);
    }

    #[test]
    fn secure_segment_strips_unsafe_characters() {
        assert_eq!(secure_segment("My Report (v2).pdf").as_deref(), Some("My_Report_v2.pdf"));
        assert_eq!(secure_segment("..").as_deref(), None);
        assert_eq!(secure_segment("  ").as_deref(), None);
        assert_eq!(secure_segment(".bashrc").as_deref(), Some("bashrc"));
    }

    #[test]
    fn upload_paths_are_sanitized_per_segment() {
        assert_eq!(sanitize_upload_path("/a/./b c/d.txt").unwrap().as_str(), "a/b_c/d.txt");
        assert!(sanitize_upload_path("a/../b").is_err());
        assert!(sanitize_upload_path("/./").is_err());
    }

    #[test]
    fn deserialization_normalizes() {
        let path: RelPath = serde_json::from_str("\"/a//b/\"").unwrap();
        assert_eq!(path.as_str(), "a/b");
        assert!(serde_json::from_str::<RelPath>("\"../x\"").is_err());
    }
}
