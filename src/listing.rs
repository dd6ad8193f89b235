//! Directory listings: immediate children, stable ordering, staging hidden.

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Serialize;
use std::cmp::Ordering;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;

use crate::config::STAGING_DIR;
use crate::error::ApiError;
use crate::paths::NormalizedPath;

/// One child of a listed directory. Produced per request, never persisted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    /// Parent path joined with the entry name, percent-encoded; directories
    /// carry a trailing slash so the renderer can link them directly.
    pub href: String,
    pub size: u64,
    pub modified: Option<String>,
}

/// Characters escaped in `href` values: the RFC 3986 path set plus `%`.
const HREF_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

#[derive(Debug)]
pub struct DirectoryLister {
    root: PathBuf,
}

impl DirectoryLister {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &std::path::Path {
        &self.root
    }

    /// Lists the immediate children of a directory under the served root.
    ///
    /// The staging subtree never appears. Directories sort before files;
    /// within each group names compare case-insensitively. A missing path is
    /// `DirectoryNotFound`; an existing regular file is `NotADirectory` so
    /// the caller can fall through to static serving.
    pub async fn list(&self, dir: &NormalizedPath) -> Result<Vec<DirectoryEntry>, ApiError> {
        let target = dir.to_fs_path(&self.root);
        let metadata = match fs::metadata(&target).await {
            Ok(metadata) => metadata,
            // ENOTDIR means a path component is a regular file, which is as
            // absent as a missing one from the client's point of view
            Err(err)
                if err.kind() == ErrorKind::NotFound
                    || err.kind() == ErrorKind::NotADirectory =>
            {
                return Err(ApiError::DirectoryNotFound);
            }
            Err(err) => return Err(ApiError::Internal(err)),
        };
        if !metadata.is_dir() {
            return Err(ApiError::NotADirectory);
        }

        let mut reader = fs::read_dir(&target).await.map_err(ApiError::Internal)?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(ApiError::Internal)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == STAGING_DIR {
                continue;
            }
            let metadata = entry.metadata().await.map_err(ApiError::Internal)?;
            let is_directory = metadata.is_dir();
            let raw_href = if is_directory {
                format!("{}/", dir.join(&name))
            } else {
                dir.join(&name).to_string()
            };
            let href = utf8_percent_encode(&raw_href, HREF_ESCAPES).to_string();
            let modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(format_timestamp);

            entries.push(DirectoryEntry {
                name,
                is_directory,
                href,
                size: metadata.len(),
                modified,
            });
        }

        entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => compare_names(&a.name, &b.name),
        });

        Ok(entries)
    }
}

/// Case-insensitive name ordering, with the raw name as a tiebreaker so the
/// result is total and stable across runs.
fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::normalize;
    use tempfile::tempdir;

    fn make_lister() -> (tempfile::TempDir, DirectoryLister) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("files");
        std::fs::create_dir_all(&root).expect("create root");
        let lister = DirectoryLister::new(root);
        (temp, lister)
    }

    #[tokio::test]
    async fn directories_sort_before_files_case_insensitively() {
        let (_temp, lister) = make_lister();
        let root = lister.root.clone();
        std::fs::write(root.join("b.txt"), b"").expect("write");
        std::fs::create_dir(root.join("A")).expect("mkdir");
        std::fs::write(root.join("a.txt"), b"").expect("write");

        let entries = lister.list(&NormalizedPath::root()).await.expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "a.txt", "b.txt"]);
        assert!(entries[0].is_directory);
    }

    #[tokio::test]
    async fn hrefs_join_parent_and_mark_directories() {
        let (_temp, lister) = make_lister();
        let root = lister.root.clone();
        std::fs::create_dir_all(root.join("maps").join("custom")).expect("mkdir");
        std::fs::write(root.join("maps").join("de_dust2.bsp"), b"VBSP").expect("write");

        let entries = lister.list(&normalize("/maps")).await.expect("list");
        let hrefs: Vec<&str> = entries.iter().map(|e| e.href.as_str()).collect();
        assert_eq!(hrefs, vec!["/maps/custom/", "/maps/de_dust2.bsp"]);
    }

    #[tokio::test]
    async fn hrefs_percent_encode_special_characters() {
        let (_temp, lister) = make_lister();
        let root = lister.root.clone();
        std::fs::write(root.join("hello world.txt"), b"").expect("write");
        std::fs::write(root.join("100%.txt"), b"").expect("write");

        let entries = lister.list(&NormalizedPath::root()).await.expect("list");
        let hrefs: Vec<&str> = entries.iter().map(|e| e.href.as_str()).collect();
        assert_eq!(hrefs, vec!["/100%25.txt", "/hello%20world.txt"]);
    }

    #[tokio::test]
    async fn path_through_regular_file_is_not_found() {
        let (_temp, lister) = make_lister();
        std::fs::write(lister.root.join("plain.txt"), b"data").expect("write");
        let result = lister.list(&normalize("/plain.txt/child")).await;
        assert!(matches!(result, Err(ApiError::DirectoryNotFound)));
    }

    #[tokio::test]
    async fn staging_subtree_is_hidden() {
        let (_temp, lister) = make_lister();
        let root = lister.root.clone();
        std::fs::create_dir(root.join(STAGING_DIR)).expect("mkdir");
        std::fs::write(root.join("visible.txt"), b"").expect("write");

        let entries = lister.list(&NormalizedPath::root()).await.expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["visible.txt"]);
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let (_temp, lister) = make_lister();
        let result = lister.list(&normalize("/nope")).await;
        assert!(matches!(result, Err(ApiError::DirectoryNotFound)));
    }

    #[tokio::test]
    async fn regular_file_is_not_a_directory() {
        let (_temp, lister) = make_lister();
        std::fs::write(lister.root.join("plain.txt"), b"data").expect("write");
        let result = lister.list(&normalize("/plain.txt")).await;
        assert!(matches!(result, Err(ApiError::NotADirectory)));
    }
}
