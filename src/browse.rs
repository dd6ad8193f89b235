//! Fallback route: directory listings or static file pass-through.

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Uri, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::config::{STAGING_DIR, ServerConfig};
use crate::error::ApiError;
use crate::listing::{DirectoryEntry, DirectoryLister};
use crate::paths::NormalizedPath;
use crate::policy::UploadPolicyStore;
use crate::upload::audit_normalize;

/// Listing payload consumed by the page renderer.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListingResponse {
    current_path: NormalizedPath,
    upload_allowed: bool,
    entries: Vec<DirectoryEntry>,
}

/// `GET /*`: a directory yields its listing, a regular file streams back
/// as-is, anything else is a 404. The staging subtree is never reachable.
pub async fn browse(
    uri: Uri,
    Extension(config): Extension<Arc<ServerConfig>>,
    Extension(policy): Extension<Arc<UploadPolicyStore>>,
    Extension(lister): Extension<Arc<DirectoryLister>>,
) -> Result<Response, ApiError> {
    // request paths arrive percent-encoded; names on disk are not
    let decoded = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| ApiError::BadRequest("request path is not valid UTF-8".to_string()))?;
    let dir = audit_normalize(&decoded);
    if is_staging_path(&dir) {
        return Err(ApiError::DirectoryNotFound);
    }

    match lister.list(&dir).await {
        Ok(entries) => {
            let upload_allowed = config.upload_enabled && policy.is_upload_allowed(&dir);
            info!(path = %dir, count = entries.len(), "list directory");
            Ok(JsonResponse(ListingResponse {
                current_path: dir,
                upload_allowed,
                entries,
            })
            .into_response())
        }
        Err(ApiError::NotADirectory) => {
            let target = dir.to_fs_path(lister.root_path());
            serve_file(&target, dir.as_str()).await
        }
        Err(err) => Err(err),
    }
}

fn is_staging_path(dir: &NormalizedPath) -> bool {
    dir.as_str() == format!("/{STAGING_DIR}")
        || dir.as_str().starts_with(&format!("/{STAGING_DIR}/"))
}

/// Streams a regular file with content type and caching headers.
async fn serve_file(target: &Path, request_path: &str) -> Result<Response, ApiError> {
    let metadata = fs::metadata(target).await.map_err(ApiError::Internal)?;
    let file = File::open(target).await.map_err(ApiError::Internal)?;
    let mime = mime_guess::from_path(request_path).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal(std::io::Error::other("invalid mime type")))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal(std::io::Error::other("invalid header value")))?,
    );
    if let Ok(modified) = metadata.modified() {
        let value = fmt_http_date(modified);
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value)
                .map_err(|_| ApiError::Internal(std::io::Error::other("invalid header value")))?,
        );
    }

    info!(path = request_path, size = metadata.len(), "serve file");
    let stream = ReaderStream::new(file);
    Ok((headers, AxumBody::from_stream(stream)).into_response())
}
