//! Upload staging: isolated temp writes followed by an atomic commit.
//!
//! Incoming streams land under the reserved staging subtree with a
//! per-request unique name. Only a fully staged and validated file is moved
//! to its destination, in a single rename-class operation on the same
//! volume. Every failure path removes the temp artifact before returning.

use futures_util::{Stream, StreamExt};
use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{STAGING_DIR, UPLOAD_IDLE_TIMEOUT_SECS};
use crate::error::ApiError;
use crate::paths::{NormalizedPath, sanitize_file_name};
use crate::policy::UploadRule;
use crate::validate;

/// An in-flight upload, owned exclusively by the request that staged it.
///
/// Must not outlive the request: it is consumed by [`StagingManager::commit`]
/// or removed via [`StagingManager::discard`].
#[derive(Debug)]
pub struct StagedUpload {
    pub temp_path: PathBuf,
    pub original_name: String,
    pub size_bytes: u64,
    pub target_directory: NormalizedPath,
}

#[derive(Debug)]
pub struct StagingManager {
    root: PathBuf,
    max_upload_size: u64,
    idle_timeout: Duration,
}

impl StagingManager {
    pub fn new(root: PathBuf, max_upload_size: u64) -> Self {
        Self {
            root,
            max_upload_size,
            idle_timeout: Duration::from_secs(UPLOAD_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.staging_root()).await
    }

    /// Writes the incoming byte stream to a fresh temp file.
    ///
    /// The hard global size cap is enforced mid-stream as the first line of
    /// defense, independent of any per-directory rule; exceeding it aborts
    /// the write early. A stalled stream (no chunk within the idle timeout)
    /// aborts the same way. Stream errors, including client disconnects,
    /// clean up the partial file.
    pub async fn stage<S, B, E>(
        &self,
        stream: S,
        target_directory: NormalizedPath,
        original_name: &str,
    ) -> Result<StagedUpload, ApiError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        let Some(original_name) = sanitize_file_name(original_name) else {
            return Err(ApiError::MissingFile);
        };
        let mut stream = std::pin::pin!(stream);

        let temp_path = self.staging_root().join(format!("{}.part", Uuid::new_v4()));
        let mut file = File::create(&temp_path)
            .await
            .map_err(ApiError::StagingIo)?;

        let mut size_bytes: u64 = 0;
        loop {
            let chunk = match time::timeout(self.idle_timeout, stream.next()).await {
                Err(_) => {
                    self.remove_temp(&temp_path).await;
                    return Err(ApiError::StagingIo(io::Error::new(
                        ErrorKind::TimedOut,
                        "upload stalled",
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    self.remove_temp(&temp_path).await;
                    return Err(ApiError::StagingIo(io::Error::other(err.to_string())));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            let chunk = chunk.as_ref();
            if chunk.is_empty() {
                continue;
            }
            size_bytes += chunk.len() as u64;
            if self.max_upload_size > 0 && size_bytes > self.max_upload_size {
                self.remove_temp(&temp_path).await;
                return Err(ApiError::SizeExceeded {
                    limit: self.max_upload_size,
                });
            }
            if let Err(err) = file.write_all(chunk).await {
                self.remove_temp(&temp_path).await;
                return Err(ApiError::StagingIo(err));
            }
        }

        if let Err(err) = file.sync_all().await {
            self.remove_temp(&temp_path).await;
            return Err(ApiError::StagingIo(err));
        }

        debug!(name = original_name, bytes = size_bytes, "upload staged");
        Ok(StagedUpload {
            temp_path,
            original_name,
            size_bytes,
            target_directory,
        })
    }

    /// Validates and moves a staged file to its final destination.
    ///
    /// Runs the rule's named validator if any, refuses to overwrite an
    /// existing file, and finishes with a no-replace move. On any failure
    /// the staged file is discarded before the error is returned; returns
    /// the normalized path of the committed file.
    pub async fn commit(
        &self,
        staged: StagedUpload,
        rule: &UploadRule,
    ) -> Result<NormalizedPath, ApiError> {
        if let Some(name) = &rule.validator {
            let Some(validator) = validate::lookup(name) else {
                self.discard(&staged).await;
                return Err(ApiError::ValidatorNotConfigured { name: name.clone() });
            };
            if let Err(err) = validator.validate(&staged.temp_path).await {
                self.discard(&staged).await;
                return Err(err);
            }
        }

        let target_dir = staged.target_directory.to_fs_path(&self.root);
        if let Err(err) = fs::create_dir_all(&target_dir).await {
            self.discard(&staged).await;
            return Err(ApiError::CommitIo(err));
        }
        let target = target_dir.join(&staged.original_name);

        match fs::metadata(&target).await {
            Ok(_) => {
                self.discard(&staged).await;
                return Err(ApiError::DestinationConflict {
                    name: staged.original_name,
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                self.discard(&staged).await;
                return Err(ApiError::CommitIo(err));
            }
        }

        if let Err(err) = self.move_no_replace(&staged.temp_path, &target).await {
            let conflict = err.kind() == ErrorKind::AlreadyExists;
            self.discard(&staged).await;
            return Err(if conflict {
                ApiError::DestinationConflict {
                    name: staged.original_name,
                }
            } else {
                ApiError::CommitIo(err)
            });
        }

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(staged.target_directory.join(&staged.original_name))
    }

    /// Removes a staged file. Failures are logged, never escalated, so the
    /// error that led here is not masked.
    pub async fn discard(&self, staged: &StagedUpload) {
        self.remove_temp(&staged.temp_path).await;
    }

    async fn remove_temp(&self, temp_path: &Path) {
        if let Err(err) = fs::remove_file(temp_path).await
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = ?temp_path, error = %err, "failed to remove staged upload");
        }
    }

    /// Moves `temp` to `target` without replacing an existing file.
    ///
    /// On Unix a hard link refuses an existing target atomically, closing the
    /// race left by the preceding existence check; the link plus unlink pair
    /// stays on one volume and never copies. A failed unlink is logged and
    /// left for the stale sweep. Elsewhere a plain rename is used and the
    /// existence check remains best-effort.
    async fn move_no_replace(&self, temp: &Path, target: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            fs::hard_link(temp, target).await?;
            self.remove_temp(temp).await;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            fs::rename(temp, target).await
        }
    }

    /// Sweeps staging artifacts older than `ttl`. Artifacts belonging to
    /// live requests are younger than any sane TTL, so only orphans from
    /// crashed or abandoned requests are touched.
    pub async fn cleanup_stale(&self, ttl: Duration) -> io::Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let staging_root = self.staging_root();
        if fs::metadata(&staging_root).await.is_err() {
            return Ok(());
        }

        let now = std::time::SystemTime::now();
        let mut dir = fs::read_dir(&staging_root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age >= ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale staging artifact");
                } else {
                    debug!(path = ?path, "removed stale staging artifact");
                }
            }
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
