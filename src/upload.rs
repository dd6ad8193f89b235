//! Upload endpoints: policy resolution, staging, rule checks, and commit.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::multipart::Field;
use axum::extract::{Extension, Multipart, Query};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::paths::{NormalizedPath, contains_traversal, normalize};
use crate::policy::{UploadPolicyStore, UploadRule, file_extension};
use crate::ratelimit::RateLimiter;
use crate::staging::StagingManager;

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    success: bool,
}

#[derive(Deserialize)]
pub(crate) struct RulesQuery {
    path: String,
}

/// `POST /upload`: multipart form with a `path` field naming the target
/// directory followed by the `file` field.
///
/// The file is streamed straight into staging, so the `path` field must
/// precede it in the form; without one the target defaults to the root.
pub async fn upload_file(
    Extension(config): Extension<Arc<ServerConfig>>,
    Extension(policy): Extension<Arc<UploadPolicyStore>>,
    Extension(staging): Extension<Arc<StagingManager>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or_else(|| addr.ip());
    limiter.check(client_ip).await?;

    let mut target: Option<NormalizedPath> = None;
    let mut committed: Option<NormalizedPath> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("path") => {
                if committed.is_some() {
                    // too late to retarget, the file is already committed
                    warn!("path field after file field ignored");
                    continue;
                }
                let raw = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                target = Some(audit_normalize(&raw));
            }
            Some("file") => {
                if committed.is_some() {
                    continue;
                }
                let dir = target.clone().unwrap_or_else(NormalizedPath::root);
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or(ApiError::MissingFile)?;
                let result =
                    process_upload(&config, &policy, &staging, &dir, &file_name, field_stream(field))
                        .await?;
                info!(
                    client_ip = %client_ip,
                    path = %result,
                    "upload committed"
                );
                committed = Some(result);
            }
            _ => {}
        }
    }

    if committed.is_none() {
        return Err(ApiError::MissingFile);
    }
    Ok(JsonResponse(UploadResponse { success: true }))
}

/// `GET /uploadRules?path=...`: the effective rule for a directory.
pub async fn upload_rules(
    Query(RulesQuery { path }): Query<RulesQuery>,
    Extension(config): Extension<Arc<ServerConfig>>,
    Extension(policy): Extension<Arc<UploadPolicyStore>>,
) -> Result<JsonResponse<UploadRule>, ApiError> {
    if !config.upload_enabled {
        return Err(ApiError::UploadsDisabled);
    }
    let dir = audit_normalize(&path);
    let rule = policy.rule_for(&dir).ok_or(ApiError::RuleNotFound)?;
    Ok(JsonResponse(rule.clone()))
}

/// Normalizes a raw client path, logging neutralized traversal attempts.
pub(crate) fn audit_normalize(raw: &str) -> NormalizedPath {
    let normalized = normalize(raw);
    if contains_traversal(raw) {
        warn!(raw, normalized = %normalized, "path traversal neutralized");
    }
    normalized
}

/// The full upload pipeline for one file: resolve the rule, stage the
/// stream, enforce size and extension limits, then commit.
///
/// Rule resolution happens before any disk I/O; every post-staging failure
/// discards the temp artifact before returning.
pub(crate) async fn process_upload<S, B, E>(
    config: &ServerConfig,
    policy: &UploadPolicyStore,
    staging: &StagingManager,
    target: &NormalizedPath,
    file_name: &str,
    stream: S,
) -> Result<NormalizedPath, ApiError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    if !config.upload_enabled {
        return Err(ApiError::UploadsDisabled);
    }
    let rule = policy
        .rule_for(target)
        .ok_or(ApiError::DirectoryNotUploadable)?;

    let staged = staging.stage(stream, target.clone(), file_name).await?;

    if let Some(limit) = rule.max_size_bytes
        && staged.size_bytes > limit
    {
        staging.discard(&staged).await;
        return Err(ApiError::SizeExceeded { limit });
    }
    if !rule.extension_allowed(&staged.original_name) {
        let extension = file_extension(&staged.original_name).unwrap_or_default();
        staging.discard(&staged).await;
        return Err(ApiError::ExtensionNotAllowed { extension });
    }

    staging.commit(staged, rule).await
}

/// Adapts a multipart field into a byte stream; the stream ends after the
/// first error so a broken client cannot wedge the staging loop.
fn field_stream(
    field: Field<'_>,
) -> impl Stream<Item = Result<axum::body::Bytes, axum::extract::multipart::MultipartError>> + '_ {
    futures_util::stream::try_unfold(field, |mut field| async move {
        let chunk = field.chunk().await?;
        Ok(chunk.map(|chunk| (chunk, field)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::STAGING_DIR;
    use crate::config::{RuleConfig, SizeValue};
    use futures_util::stream;
    use std::collections::HashMap;
    use std::io;
    use tempfile::tempdir;

    struct Fixture {
        _temp: tempfile::TempDir,
        config: ServerConfig,
        policy: UploadPolicyStore,
        staging: StagingManager,
    }

    fn make_fixture(upload_enabled: bool) -> Fixture {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("files");
        std::fs::create_dir_all(root.join(STAGING_DIR)).expect("create staging root");

        let mut configs = HashMap::new();
        configs.insert(
            "/docs".to_string(),
            RuleConfig {
                max_file_size: Some(SizeValue::Text("1KB".into())),
                allowed_extensions: vec![".txt".into()],
                validate_file: None,
            },
        );
        configs.insert(
            "/maps".to_string(),
            RuleConfig {
                max_file_size: None,
                allowed_extensions: vec![".bsp".into()],
                validate_file: Some("bsp-map".into()),
            },
        );
        let policy = UploadPolicyStore::build(&configs).expect("policy");

        Fixture {
            config: ServerConfig { upload_enabled },
            policy,
            staging: StagingManager::new(root, 0),
            _temp: temp,
        }
    }

    fn bytes(data: &'static [u8]) -> impl Stream<Item = Result<&'static [u8], io::Error>> {
        stream::iter(vec![Ok(data)])
    }

    fn staging_is_empty(staging: &StagingManager) -> bool {
        std::fs::read_dir(staging.staging_root())
            .map(|entries| entries.count() == 0)
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn small_txt_file_lands_at_destination() {
        let f = make_fixture(true);
        let committed = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/docs"),
            "notes.txt",
            bytes(b"five hundred bytes? close enough"),
        )
        .await
        .expect("upload");

        assert_eq!(committed.as_str(), "/docs/notes.txt");
        let content =
            std::fs::read(f.staging.root_path().join("docs").join("notes.txt")).expect("read");
        assert_eq!(content, b"five hundred bytes? close enough");
        assert!(staging_is_empty(&f.staging));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_by_rule() {
        let f = make_fixture(true);
        let big = Box::leak(vec![b'x'; 2048].into_boxed_slice());
        let result = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/docs"),
            "big.txt",
            bytes(big),
        )
        .await;

        assert!(matches!(result, Err(ApiError::SizeExceeded { limit: 1024 })));
        assert!(staging_is_empty(&f.staging));
    }

    #[tokio::test]
    async fn wrong_extension_is_rejected() {
        let f = make_fixture(true);
        let result = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/docs"),
            "tool.bin",
            bytes(b"tiny"),
        )
        .await;

        assert!(matches!(
            result,
            Err(ApiError::ExtensionNotAllowed { .. })
        ));
        assert!(staging_is_empty(&f.staging));
    }

    #[tokio::test]
    async fn disabled_uploads_are_refused_before_staging() {
        let f = make_fixture(false);
        let result = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/docs"),
            "notes.txt",
            bytes(b"data"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::UploadsDisabled)));
        assert!(staging_is_empty(&f.staging));
    }

    #[tokio::test]
    async fn unconfigured_directory_is_refused() {
        let f = make_fixture(true);
        let result = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/private"),
            "notes.txt",
            bytes(b"data"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::DirectoryNotUploadable)));
    }

    #[tokio::test]
    async fn traversal_in_target_collapses_inside_root() {
        let f = make_fixture(true);
        // normalizes to /docs, which has a rule
        let target = audit_normalize("/maps/../docs");
        let committed = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &target,
            "notes.txt",
            bytes(b"data"),
        )
        .await
        .expect("upload");
        assert_eq!(committed.as_str(), "/docs/notes.txt");
    }

    #[tokio::test]
    async fn validated_upload_passes_with_magic_number() {
        let f = make_fixture(true);
        let committed = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/maps"),
            "de_dust2.bsp",
            bytes(b"VBSP\x14\x00\x00\x00lumps"),
        )
        .await
        .expect("upload");
        assert_eq!(committed.as_str(), "/maps/de_dust2.bsp");
    }

    #[tokio::test]
    async fn validated_upload_fails_without_magic_number() {
        let f = make_fixture(true);
        let result = process_upload(
            &f.config,
            &f.policy,
            &f.staging,
            &normalize("/maps"),
            "fake.bsp",
            bytes(b"not a bsp at all"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::ValidationFailed { .. })));
        assert!(staging_is_empty(&f.staging));
    }

    #[tokio::test]
    async fn upload_rules_reports_effective_rule() {
        let f = make_fixture(true);
        let JsonResponse(rule) = upload_rules(
            Query(RulesQuery {
                path: "docs/".to_string(),
            }),
            Extension(Arc::new(f.config)),
            Extension(Arc::new(f.policy)),
        )
        .await
        .expect("rule");
        assert_eq!(rule.directory.as_str(), "/docs");
        assert_eq!(rule.max_size_bytes, Some(1024));
    }

    #[tokio::test]
    async fn upload_rules_unknown_directory_is_not_found() {
        let f = make_fixture(true);
        let result = upload_rules(
            Query(RulesQuery {
                path: "/private".to_string(),
            }),
            Extension(Arc::new(f.config)),
            Extension(Arc::new(f.policy)),
        )
        .await;
        assert!(matches!(result, Err(ApiError::RuleNotFound)));
    }

    #[tokio::test]
    async fn upload_rules_disabled_is_forbidden() {
        let f = make_fixture(false);
        let result = upload_rules(
            Query(RulesQuery {
                path: "/docs".to_string(),
            }),
            Extension(Arc::new(f.config)),
            Extension(Arc::new(f.policy)),
        )
        .await;
        assert!(matches!(result, Err(ApiError::UploadsDisabled)));
    }
}
