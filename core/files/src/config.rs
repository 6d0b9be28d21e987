//! File service configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use driveline_common::{ContainerKind, Error, Result};
use driveline_storage::gdrive::{DriveConfig, OAuthConfig};

/// Environment variable overriding `oauth.client_secret`.
pub const CLIENT_SECRET_ENV: &str = "DRIVELINE_CLIENT_SECRET";
/// Environment variable overriding `service_refresh_token`.
pub const SERVICE_REFRESH_TOKEN_ENV: &str = "DRIVELINE_SERVICE_REFRESH_TOKEN";

/// Upper bound of `safety_margin_secs`; a margin longer than a token's
/// lifetime would refresh on every call.
const MAX_SAFETY_MARGIN_SECS: u64 = 3600;

/// Whose credential uploads are stored with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Every object is uploaded with the static service identity.
    #[default]
    ServiceIdentity,
    /// Objects are uploaded with the uploading user's own credential.
    Uploader,
}

/// Folder name per container kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderNames {
    pub product: String,
    pub order: String,
}

impl FolderNames {
    /// Folder name for `kind`.
    pub fn for_kind(&self, kind: ContainerKind) -> &str {
        match kind {
            ContainerKind::Product => &self.product,
            ContainerKind::Order => &self.order,
        }
    }
}

impl Default for FolderNames {
    fn default() -> Self {
        Self {
            product: ContainerKind::Product.default_folder_name().to_string(),
            order: ContainerKind::Order.default_folder_name().to_string(),
        }
    }
}

/// Drive API settings plus the folder layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSettings {
    #[serde(flatten)]
    pub api: DriveConfig,
    /// Folder every container folder is created under.
    pub root_folder_id: String,
    pub folders: FolderNames,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            api: DriveConfig::default(),
            root_folder_id: "root".to_string(),
            folders: FolderNames::default(),
        }
    }
}

/// Configuration of a [`crate::FileService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileServiceConfig {
    pub oauth: OAuthConfig,
    pub drive: DriveSettings,
    /// SQLite file holding credentials and object metadata.
    pub database_path: PathBuf,
    /// Refresh token of the static service identity.
    pub service_refresh_token: Option<String>,
    /// Tokens closer than this to expiry are refreshed before use.
    pub safety_margin_secs: u64,
    pub ownership: Ownership,
}

impl Default for FileServiceConfig {
    fn default() -> Self {
        Self {
            oauth: OAuthConfig::default(),
            drive: DriveSettings::default(),
            database_path: default_database_path(),
            service_refresh_token: None,
            safety_margin_secs: 60,
            ownership: Ownership::default(),
        }
    }
}

/// `<data dir>/driveline/index.db`, or `./driveline/index.db` if the
/// platform has no data directory.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("driveline")
        .join("index.db")
}

impl FileServiceConfig {
    /// Load configuration from a JSON file and apply environment overrides.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Invalid JSON or invalid values
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_json(&json)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Replace secrets with values from `lookup`, when present and non-empty.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(CLIENT_SECRET_ENV).filter(|v| !v.is_empty()) {
            self.oauth.client_secret = secret;
        }
        if let Some(token) = lookup(SERVICE_REFRESH_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.service_refresh_token = Some(token);
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        for kind in ContainerKind::ALL {
            if self.drive.folders.for_kind(kind).is_empty() {
                return Err(Error::InvalidInput(format!(
                    "Folder name for {} cannot be empty",
                    kind
                )));
            }
        }
        if self.safety_margin_secs > MAX_SAFETY_MARGIN_SECS {
            return Err(Error::InvalidInput(format!(
                "Safety margin cannot exceed {} seconds",
                MAX_SAFETY_MARGIN_SECS
            )));
        }
        if self.drive.root_folder_id.is_empty() {
            return Err(Error::InvalidInput(
                "Root folder id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Safety margin as a duration.
    pub fn safety_margin(&self) -> chrono::Duration {
        let secs = self.safety_margin_secs.min(MAX_SAFETY_MARGIN_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}
