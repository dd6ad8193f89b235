//! Named content validators applied to staged files before commit.

use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::ApiError;

/// A content check resolved from its configured name.
///
/// The table of names is fixed at compile time; configuration referencing an
/// unknown name is rejected at startup, and a lookup miss at commit time is
/// reported as a server misconfiguration rather than a validation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentValidator {
    /// Compares the first four bytes of the file against an ASCII tag.
    MagicNumber { tag: [u8; 4] },
}

/// Resolves a validator name from the fixed table.
pub fn lookup(name: &str) -> Option<ContentValidator> {
    match name {
        "bsp-map" => Some(ContentValidator::MagicNumber { tag: *b"VBSP" }),
        "vtf-texture" => Some(ContentValidator::MagicNumber { tag: *b"VTF\0" }),
        _ => None,
    }
}

impl ContentValidator {
    /// Inspects a staged file, returning `ValidationFailed` on rejection.
    ///
    /// A file shorter than the magic tag fails validation; it never errors
    /// out as I/O.
    pub async fn validate(&self, staged_file: &Path) -> Result<(), ApiError> {
        match self {
            ContentValidator::MagicNumber { tag } => {
                let mut file = File::open(staged_file).await.map_err(ApiError::StagingIo)?;
                let mut magic = [0u8; 4];
                let mut filled = 0;
                while filled < magic.len() {
                    let read = file
                        .read(&mut magic[filled..])
                        .await
                        .map_err(ApiError::StagingIo)?;
                    if read == 0 {
                        return Err(ApiError::ValidationFailed {
                            reason: "file too short for magic number".to_string(),
                        });
                    }
                    filled += read;
                }
                if &magic != tag {
                    return Err(ApiError::ValidationFailed {
                        reason: format!(
                            "magic number mismatch, expected {:?}",
                            String::from_utf8_lossy(tag)
                        ),
                    });
                }
                Ok(())
            }
        }
    }
}
