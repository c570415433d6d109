//! Runtime configuration, layered: defaults, then an optional `clinic.toml`,
//! then `CLINIC_*` environment variables.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::auth::{Argon2AuthProvider, AuthError, AuthProvider, DisabledAuth};
use crate::capabilities::{RealtimeError, RemoteError, ValidatedUrl};
use crate::DEFAULT_STORAGE_BUCKET;

pub const CONFIG_FILE: &str = "clinic";
pub const ENV_PREFIX: &str = "CLINIC";
pub const LOCAL_DB_FILE: &str = "local.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("'{field}' is required when a backend URL is set")]
    Missing { field: &'static str },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("local storage unavailable: {0}")]
    Storage(#[from] crate::capabilities::KvError),

    #[error("cannot prepare data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_bucket() -> String {
    DEFAULT_STORAGE_BUCKET.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("clinic-data")
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ClinicConfig {
    /// Hosted backend base URL. Absent or blank means offline-only.
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub anon_key: Option<SecretString>,
    #[serde(default = "default_bucket")]
    pub storage_bucket: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Argon2 PHC string for the admin passphrase.
    #[serde(default)]
    pub admin_passphrase_hash: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for ClinicConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: None,
            storage_bucket: default_bucket(),
            data_dir: default_data_dir(),
            admin_passphrase_hash: None,
            log_filter: default_log_filter(),
        }
    }
}

impl ClinicConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// The backend endpoint and key, or `None` when no URL is configured.
    pub fn remote_endpoint(&self) -> Result<Option<(ValidatedUrl, SecretString)>, ConfigError> {
        let Some(url) = self
            .supabase_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            return Ok(None);
        };
        let url = ValidatedUrl::new(url)?;
        let key = self
            .anon_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty())
            .ok_or(ConfigError::Missing { field: "anon_key" })?;
        Ok(Some((url, SecretString::new(key.expose_secret().clone()))))
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote_endpoint()?;
        self.auth_provider()?;
        Ok(())
    }

    pub fn auth_provider(&self) -> Result<Box<dyn AuthProvider>, AuthError> {
        match self.admin_passphrase_hash.as_deref().map(str::trim) {
            Some(hash) if !hash.is_empty() => Ok(Box::new(Argon2AuthProvider::new(hash)?)),
            _ => Ok(Box::new(DisabledAuth)),
        }
    }

    /// Builds the collaborators for [`crate::sync::Session::start`].
    #[cfg(not(target_arch = "wasm32"))]
    pub fn session_parts(&self) -> Result<crate::sync::SessionParts, ConfigError> {
        use crate::capabilities::{ChangeSource, PhoenixSource, RemoteTables, RestTables, SqliteKv};
        use std::sync::Arc;

        let (remote, changes) = match self.remote_endpoint()? {
            Some((url, key)) => {
                let changes = PhoenixSource::new(&url, SecretString::new(key.expose_secret().clone()))?;
                let tables = RestTables::new(url, key)?;
                (
                    Some(Arc::new(tables) as Arc<dyn RemoteTables>),
                    Some(Arc::new(changes) as Arc<dyn ChangeSource>),
                )
            }
            None => {
                info!("No backend URL configured");
                (None, None)
            }
        };

        std::fs::create_dir_all(&self.data_dir).map_err(|source| ConfigError::DataDir {
            path: self.data_dir.clone(),
            source,
        })?;
        let kv = SqliteKv::open(self.data_dir.join(LOCAL_DB_FILE))?;

        Ok(crate::sync::SessionParts {
            remote,
            changes,
            kv: Arc::new(kv),
            bucket: self.storage_bucket.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = ClinicConfig::from_toml_str("").unwrap();
        assert_eq!(config.storage_bucket, DEFAULT_STORAGE_BUCKET);
        assert_eq!(config.data_dir, PathBuf::from("clinic-data"));
        assert_eq!(config.log_filter, "info");
        assert!(config.remote_endpoint().unwrap().is_none());
    }

    #[test]
    fn blank_url_means_offline() {
        let config = ClinicConfig::from_toml_str("supabase_url = \"  \"").unwrap();
        assert!(config.remote_endpoint().unwrap().is_none());
    }

    #[test]
    fn url_requires_anon_key() {
        let config =
            ClinicConfig::from_toml_str("supabase_url = \"https://abc.supabase.co\"").unwrap();
        assert!(matches!(
            config.remote_endpoint(),
            Err(ConfigError::Missing { field: "anon_key" })
        ));
    }

    #[test]
    fn non_http_url_is_rejected() {
        let config = ClinicConfig::from_toml_str(
            "supabase_url = \"ftp://abc.supabase.co\"\nanon_key = \"k\"",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Remote(_))));
    }

    #[test]
    fn full_config_resolves_endpoint() {
        let config = ClinicConfig::from_toml_str(
            r#"
            supabase_url = "https://abc.supabase.co/"
            anon_key = "anon"
            storage_bucket = "scans"
            "#,
        )
        .unwrap();
        let (url, key) = config.remote_endpoint().unwrap().unwrap();
        assert_eq!(url.base(), "https://abc.supabase.co");
        assert_eq!(key.expose_secret(), "anon");
        assert_eq!(config.storage_bucket, "scans");
    }

    #[test]
    fn bad_admin_hash_fails_validation() {
        let config = ClinicConfig::from_toml_str("admin_passphrase_hash = \"plain\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Auth(_))));
    }

    #[test]
    fn offline_session_parts_open_local_db() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClinicConfig {
            data_dir: dir.path().join("nested"),
            ..ClinicConfig::default()
        };
        let parts = config.session_parts().unwrap();
        assert!(parts.remote.is_none());
        assert!(parts.changes.is_none());
        assert!(dir.path().join("nested").join(LOCAL_DB_FILE).exists());
    }
}
