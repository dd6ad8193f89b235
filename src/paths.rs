//! Lexical path normalization for request paths and policy keys.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Canonical absolute POSIX-style path: no `.`/`..` segments, single
/// separators, no trailing slash except for the root itself.
///
/// Every client-supplied path is converted to this form before any policy
/// lookup or filesystem access; raw strings never reach either.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    pub fn root() -> Self {
        NormalizedPath("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Appends a single entry name, renormalizing the result.
    pub fn join(&self, name: &str) -> NormalizedPath {
        normalize(&format!("{}/{}", self.0, name))
    }

    /// Maps this path onto the filesystem below `root`.
    ///
    /// Safe by construction: the normalized form contains no parent or
    /// root components, so the result cannot escape `root`.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut target = root.to_path_buf();
        for segment in self.0.split('/').filter(|s| !s.is_empty()) {
            target.push(segment);
        }
        target
    }
}

impl std::fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes an arbitrary raw path string.
///
/// Pure and total: repeated separators collapse, `.` segments drop, `..`
/// segments resolve lexically and can never climb above the root. A raw
/// value that attempts to escape collapses to the root.
pub fn normalize(raw: &str) -> NormalizedPath {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        NormalizedPath::root()
    } else {
        NormalizedPath(format!("/{}", segments.join("/")))
    }
}

/// True when the raw string carries `..` segments, i.e. normalization
/// neutralized a traversal attempt worth an audit log line.
pub fn contains_traversal(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|segment| segment == "..")
}

/// Reduces a client-supplied file name to its final path segment.
///
/// Returns `None` when nothing usable remains (empty name, bare dots,
/// separators only).
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let normalized = normalize(raw);
    if normalized.is_root() {
        return None;
    }
    normalized
        .as_str()
        .rsplit('/')
        .next()
        .map(|name| name.to_string())
}
