//! Service configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `medivault.toml` in the working directory, then the process environment
//! (after `.env` has been loaded by dotenvy). Keys are the upper-case
//! environment names, e.g. `DATABASE_URL`, `BCRYPT_ROUNDS`.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    pub database_url: String,
    #[serde(default = "default_pool_size")]
    pub database_pool_size: u32,

    #[serde(default = "default_master_key_file")]
    pub master_key_file: PathBuf,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default = "default_bcrypt_rounds")]
    pub bcrypt_rounds: u32,

    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: i64,
    #[serde(default = "default_cleanup_interval")]
    pub session_cleanup_interval_seconds: u64,
    #[serde(default = "default_max_failed_logins")]
    pub max_failed_logins: i32,

    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
    #[serde(default = "default_auth_rate_limit")]
    pub auth_rate_limit_per_minute: usize,
    #[serde(default = "default_suspicious_window")]
    pub suspicious_window_minutes: i64,
    #[serde(default = "default_suspicious_max_actions")]
    pub suspicious_max_actions: i64,

    #[serde(default = "default_true")]
    pub audit_enabled: bool,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_ipfs_url")]
    pub ipfs_url: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_max_upload_files")]
    pub max_upload_files: usize,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub google_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_google_base_url")]
    pub google_base_url: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_pubmed_base_url")]
    pub pubmed_base_url: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    #[serde(default)]
    pub ehr_import_root: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_pool_size() -> u32 {
    10
}
fn default_master_key_file() -> PathBuf {
    PathBuf::from("./keys/master.key")
}
fn default_kdf_iterations() -> u32 {
    100_000
}
fn default_bcrypt_rounds() -> u32 {
    12
}
fn default_session_timeout() -> i64 {
    30
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_max_failed_logins() -> i32 {
    5
}
fn default_rate_limit() -> usize {
    60
}
fn default_auth_rate_limit() -> usize {
    10
}
fn default_suspicious_window() -> i64 {
    5
}
fn default_suspicious_max_actions() -> i64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://localhost:3010".to_string(),
        "http://127.0.0.1:3010".to_string(),
    ]
}
fn default_storage_backend() -> String {
    "local".to_string()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_ipfs_url() -> String {
    "http://127.0.0.1:5001".to_string()
}
fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024
}
fn default_max_upload_files() -> usize {
    20
}
fn default_max_request_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_google_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}
fn default_pubmed_base_url() -> String {
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string()
}
fn default_http_timeout() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name("medivault").required(false))
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cors_origins"),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration (is DATABASE_URL set?)")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("DATABASE_URL must be set");
        }
        if !(4..=31).contains(&self.bcrypt_rounds) {
            bail!("BCRYPT_ROUNDS must be between 4 and 31, got {}", self.bcrypt_rounds);
        }
        if self.kdf_iterations == 0 {
            bail!("KDF_ITERATIONS must be positive");
        }
        if self.session_timeout_minutes <= 0 {
            bail!("SESSION_TIMEOUT_MINUTES must be positive");
        }
        if self.max_failed_logins <= 0 {
            bail!("MAX_FAILED_LOGINS must be positive");
        }
        if self.rate_limit_per_minute == 0 || self.auth_rate_limit_per_minute == 0 {
            bail!("rate limits must be positive");
        }
        if self.session_cleanup_interval_seconds == 0 {
            bail!("SESSION_CLEANUP_INTERVAL_SECONDS must be positive");
        }
        if self.database_pool_size == 0 {
            bail!("DATABASE_POOL_SIZE must be positive");
        }
        if self.max_upload_bytes == 0 || self.max_upload_files == 0 {
            bail!("MAX_UPLOAD_BYTES and MAX_UPLOAD_FILES must be positive");
        }
        if self.max_request_bytes < self.max_upload_bytes {
            bail!("MAX_REQUEST_BYTES must be at least MAX_UPLOAD_BYTES");
        }
        match self.storage_backend.as_str() {
            "local" | "ipfs" => {}
            other => bail!("STORAGE_BACKEND must be 'local' or 'ipfs', got '{other}'"),
        }
        Ok(())
    }

    /// Settings suitable for tests: cheap hashing, no external services and
    /// a private key file and blob directory per call.
    pub fn for_tests(database_url: &str) -> Self {
        let scratch = std::env::temp_dir().join(format!("medivault-test-{}", uuid::Uuid::new_v4()));
        Settings {
            host: default_host(),
            port: 0,
            database_url: database_url.to_string(),
            database_pool_size: 2,
            master_key_file: scratch.join("master.key"),
            kdf_iterations: 1_000,
            bcrypt_rounds: 4,
            session_timeout_minutes: default_session_timeout(),
            session_cleanup_interval_seconds: default_cleanup_interval(),
            max_failed_logins: default_max_failed_logins(),
            rate_limit_per_minute: default_rate_limit(),
            auth_rate_limit_per_minute: default_auth_rate_limit(),
            suspicious_window_minutes: default_suspicious_window(),
            suspicious_max_actions: default_suspicious_max_actions(),
            audit_enabled: true,
            cors_origins: default_cors_origins(),
            storage_backend: default_storage_backend(),
            storage_dir: scratch.join("blobs"),
            ipfs_url: default_ipfs_url(),
            max_upload_bytes: default_max_upload_bytes(),
            max_upload_files: default_max_upload_files(),
            max_request_bytes: default_max_request_bytes(),
            openai_api_key: None,
            google_api_key: None,
            anthropic_api_key: None,
            openai_base_url: default_openai_base_url(),
            google_base_url: default_google_base_url(),
            anthropic_base_url: default_anthropic_base_url(),
            pubmed_base_url: default_pubmed_base_url(),
            http_timeout_seconds: 5,
            ehr_import_root: None,
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let settings: Settings = config::Config::builder()
            .set_override("database_url", "postgres://localhost/medivault")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.port, 8000);
        assert_eq!(settings.bcrypt_rounds, 12);
        assert_eq!(settings.session_timeout_minutes, 30);
        assert_eq!(settings.kdf_iterations, 100_000);
        assert_eq!(settings.auth_rate_limit_per_minute, 10);
        assert_eq!(settings.storage_backend, "local");
        assert!(settings.audit_enabled);
        assert!(settings.openai_api_key.is_none());
        assert_eq!(settings.cors_origins.len(), 4);
        assert_eq!(settings.max_upload_files, 20);
        assert_eq!(settings.max_request_bytes, 100 * 1024 * 1024);
        settings.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = Settings::for_tests("postgres://localhost/test");
        settings.validate().unwrap();

        settings.bcrypt_rounds = 2;
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests("postgres://localhost/test");
        settings.storage_backend = "s3".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests("");
        settings.database_url = "  ".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests("postgres://localhost/test");
        settings.max_request_bytes = settings.max_upload_bytes - 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests("postgres://localhost/test");
        settings.max_upload_files = 0;
        assert!(settings.validate().is_err());
    }
}
