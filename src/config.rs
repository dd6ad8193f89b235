//! CLI arguments, server defaults, and the upload rules file format.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::ConfigError;

/// Reserved subtree under the files dir used for in-flight uploads.
/// Hidden from listings and refused as an upload rule target.
pub const STAGING_DIR: &str = ".staging";

pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 60 * 60;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;
pub const RATE_PRUNE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_UPLOAD_RATE_LIMIT: u32 = 30;
pub const DEFAULT_UPLOAD_RATE_WINDOW_SECS: u64 = 60;
pub const UPLOAD_IDLE_TIMEOUT_SECS: u64 = 30;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filegate", about = "File tree server with per-directory upload policies")]
pub struct Args {
    #[arg(
        short = 'f',
        long,
        env = "FILEGATE_FILES_DIR",
        default_value = "/files",
        help = "Directory to serve files from"
    )]
    pub files_dir: String,
    #[arg(
        long,
        env = "FILEGATE_UPLOAD_ENABLED",
        default_value_t = false,
        action = clap::ArgAction::Set,
        num_args(0..=1),
        default_missing_value = "true",
        help = "Enable uploads globally"
    )]
    pub upload_enabled: bool,
    #[arg(
        short = 'r',
        long,
        env = "FILEGATE_UPLOAD_RULES",
        help = "Path to the upload rules JSON file"
    )]
    pub upload_rules: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "FILEGATE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEGATE_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "FILEGATE_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Hard cap on any upload in bytes, independent of per-directory rules"
    )]
    pub max_upload_size: u64,
    #[arg(
        long,
        env = "FILEGATE_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Stale staging artifact cleanup threshold in seconds (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
    #[arg(
        long,
        env = "FILEGATE_UPLOAD_RATE_LIMIT",
        default_value_t = DEFAULT_UPLOAD_RATE_LIMIT,
        help = "Max upload requests per client per window (0 to disable)"
    )]
    pub upload_rate_limit: u32,
    #[arg(
        long,
        env = "FILEGATE_UPLOAD_RATE_WINDOW_SECS",
        default_value_t = DEFAULT_UPLOAD_RATE_WINDOW_SECS,
        help = "Upload rate limit window in seconds"
    )]
    pub upload_rate_window_secs: u64,
}

/// Immutable runtime settings shared with request handlers.
#[derive(Debug)]
pub struct ServerConfig {
    pub upload_enabled: bool,
}

/// One entry of the upload rules file, keyed by directory path.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default)]
    pub max_file_size: Option<SizeValue>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub validate_file: Option<String>,
}

/// Size limits may be written as plain byte counts or as strings like
/// `"512KB"` (powers of 1024).
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

/// Reads the upload rules file. A missing `--upload-rules` argument means no
/// directory accepts uploads; a present but unreadable or malformed file is
/// fatal.
pub fn load_rule_configs(path: Option<&str>) -> Result<HashMap<String, RuleConfig>, ConfigError> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(path)?;
    let rules = serde_json::from_str(&content)?;
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_file_parses_both_size_forms() {
        let json = r#"{
            "/maps": {"maxFileSize": "150MB", "allowedExtensions": [".bsp"], "validateFile": "bsp-map"},
            "/drop": {"maxFileSize": 1024, "allowedExtensions": ["*"]}
        }"#;
        let rules: HashMap<String, RuleConfig> = serde_json::from_str(json).expect("parse");
        assert!(matches!(
            rules["/maps"].max_file_size,
            Some(SizeValue::Text(_))
        ));
        assert!(matches!(
            rules["/drop"].max_file_size,
            Some(SizeValue::Bytes(1024))
        ));
        assert_eq!(rules["/maps"].validate_file.as_deref(), Some("bsp-map"));
    }

    #[test]
    fn unknown_rule_fields_are_rejected() {
        let json = r#"{"/maps": {"maxSize": "1MB"}}"#;
        let result: Result<HashMap<String, RuleConfig>, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn missing_rules_path_means_no_rules() {
        let rules = load_rule_configs(None).expect("load");
        assert!(rules.is_empty());
    }
}
