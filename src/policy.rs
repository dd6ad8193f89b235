//! Per-directory upload rules, built once at startup.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::{RuleConfig, STAGING_DIR, SizeValue};
use crate::error::ConfigError;
use crate::paths::{NormalizedPath, normalize};
use crate::validate;

/// Effective upload policy for a single directory.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRule {
    pub directory: NormalizedPath,
    pub max_size_bytes: Option<u64>,
    /// Lower-cased extensions including the leading dot; a `"*"` entry
    /// admits everything.
    pub allowed_extensions: Vec<String>,
    pub validator: Option<String>,
}

impl UploadRule {
    /// Case-insensitive extension check against the allowed set.
    pub fn extension_allowed(&self, file_name: &str) -> bool {
        if self.allowed_extensions.iter().any(|ext| ext == "*") {
            return true;
        }
        let Some(extension) = file_extension(file_name) else {
            return false;
        };
        self.allowed_extensions.contains(&extension)
    }
}

/// Extracts the lower-cased extension with its leading dot, if any.
pub fn file_extension(file_name: &str) -> Option<String> {
    let dot = file_name.rfind('.')?;
    if dot == 0 {
        // dotfiles have no extension
        return None;
    }
    Some(file_name[dot..].to_lowercase())
}

/// Immutable directory-to-rule mapping.
///
/// Lookup is an exact match on the normalized directory; rules do not apply
/// to subdirectories of their key. Read-only after startup, so it is shared
/// across requests without synchronization.
#[derive(Debug, Default)]
pub struct UploadPolicyStore {
    rules: HashMap<NormalizedPath, UploadRule>,
}

impl UploadPolicyStore {
    /// Builds the store from the parsed rules file.
    ///
    /// Every key is normalized exactly once here. A malformed size string,
    /// an unknown validator name, or a rule targeting the staging subtree
    /// aborts startup.
    pub fn build(configs: &HashMap<String, RuleConfig>) -> Result<Self, ConfigError> {
        let mut rules = HashMap::new();
        for (raw_dir, config) in configs {
            let directory = normalize(raw_dir);
            if directory.as_str() == format!("/{STAGING_DIR}")
                || directory.as_str().starts_with(&format!("/{STAGING_DIR}/"))
            {
                return Err(ConfigError::ReservedDirectory {
                    directory: directory.as_str().to_string(),
                });
            }

            let max_size_bytes = match &config.max_file_size {
                None => None,
                Some(SizeValue::Bytes(bytes)) => Some(*bytes),
                Some(SizeValue::Text(text)) => {
                    Some(parse_size(text).ok_or_else(|| ConfigError::InvalidSize {
                        directory: directory.as_str().to_string(),
                        value: text.clone(),
                    })?)
                }
            };

            if let Some(name) = &config.validate_file
                && validate::lookup(name).is_none()
            {
                return Err(ConfigError::UnknownValidator {
                    directory: directory.as_str().to_string(),
                    name: name.clone(),
                });
            }

            let allowed_extensions = config
                .allowed_extensions
                .iter()
                .map(|ext| {
                    let ext = ext.trim().to_lowercase();
                    if ext == "*" || ext.starts_with('.') {
                        ext
                    } else {
                        format!(".{ext}")
                    }
                })
                .collect();

            rules.insert(
                directory.clone(),
                UploadRule {
                    directory,
                    max_size_bytes,
                    allowed_extensions,
                    validator: config.validate_file.clone(),
                },
            );
        }
        Ok(UploadPolicyStore { rules })
    }

    pub fn rule_for(&self, dir: &NormalizedPath) -> Option<&UploadRule> {
        self.rules.get(dir)
    }

    pub fn is_upload_allowed(&self, dir: &NormalizedPath) -> bool {
        self.rules.contains_key(dir)
    }
}

/// Parses `<unsigned integer><B|KB|MB|GB>` (case-insensitive, powers of
/// 1024).
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(digits_end);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}
