//! File storage service for Driveline.
//!
//! Ties the credential store, the metadata index and the storage provider
//! together:
//! - [`CredentialManager`] hands out valid access tokens per subject and runs
//!   the static service identity's startup check
//! - [`FileService`] uploads, downloads, deletes, lists and exports the files
//!   attached to products and orders
//!
//! [`open_google_drive`] wires both against Google Drive from a
//! [`FileServiceConfig`].

pub mod archive;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FileServiceConfig, FolderNames, Ownership};
pub use credentials::{CredentialManager, ServiceState};
pub use service::{Download, FileService, DEFAULT_MIME_TYPE, DEFAULT_UPLOADER};

use std::sync::Arc;
use tracing::info;

use driveline_common::Result;
use driveline_index::{Database, MetadataIndex, TokenStore};
use driveline_storage::gdrive::{DriveClient, GoogleOAuth};
use driveline_storage::{DriveApi, TokenEndpoint};

/// Build a [`FileService`] over the given provider and token endpoint.
///
/// Opens the index database and runs the service identity's startup refresh.
/// A failed startup refresh leaves the service usable for per-user subjects.
pub async fn open(
    config: &FileServiceConfig,
    drive: Arc<dyn DriveApi>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
) -> Result<FileService> {
    let db = Arc::new(Database::open(&config.database_path)?);
    let credentials = Arc::new(CredentialManager::new(
        endpoint,
        TokenStore::new(db.clone()),
        clock.clone(),
        config.safety_margin(),
    ));

    let state = credentials
        .start_service_identity(config.service_refresh_token.as_deref())
        .await;
    info!(provider = drive.name(), service = ?state, "File service opened");

    Ok(FileService::new(
        drive,
        credentials,
        MetadataIndex::new(db),
        clock,
        config.drive.root_folder_id.clone(),
        config.drive.folders.clone(),
        config.ownership,
    ))
}

/// Build a [`CredentialManager`] against Google's token endpoint, without
/// starting the service identity.
///
/// Enough for the consent flow of per-user subjects.
pub fn open_google_credentials(config: &FileServiceConfig) -> Result<CredentialManager> {
    let db = Arc::new(Database::open(&config.database_path)?);
    let endpoint = Arc::new(GoogleOAuth::new(config.oauth.clone())?);
    Ok(CredentialManager::new(
        endpoint,
        TokenStore::new(db),
        Arc::new(SystemClock),
        config.safety_margin(),
    ))
}

/// Build a [`FileService`] backed by Google Drive.
pub async fn open_google_drive(config: &FileServiceConfig) -> Result<FileService> {
    config.validate()?;
    let endpoint = Arc::new(GoogleOAuth::new(config.oauth.clone())?);
    let drive = Arc::new(DriveClient::new(config.drive.api.clone())?);
    open(config, drive, endpoint, Arc::new(SystemClock)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveline_common::{Container, Subject};
    use driveline_storage::{MemoryDrive, MemoryTokenEndpoint};

    #[tokio::test]
    async fn test_open_persists_index_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileServiceConfig {
            database_path: dir.path().join("index.db"),
            service_refresh_token: Some("R-service".to_string()),
            ..Default::default()
        };
        let drive = Arc::new(MemoryDrive::new());
        let endpoint = Arc::new(MemoryTokenEndpoint::new());

        let service = open(&config, drive.clone(), endpoint.clone(), Arc::new(SystemClock))
            .await
            .unwrap();
        assert_eq!(service.credentials().service_state().await, ServiceState::Ready);
        let id = service
            .put(Container::product(42), "x.png", None, "x".into(), None)
            .await
            .unwrap();
        drop(service);

        let reopened = open(&config, drive, endpoint, Arc::new(SystemClock))
            .await
            .unwrap();
        assert_eq!(reopened.object_info(&id).unwrap().logical_name, "x.png");
        assert!(reopened
            .credentials()
            .credential(&Subject::Service)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_open_without_service_token_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileServiceConfig {
            database_path: dir.path().join("index.db"),
            ..Default::default()
        };

        let service = open(
            &config,
            Arc::new(MemoryDrive::new()),
            Arc::new(MemoryTokenEndpoint::new()),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        assert!(matches!(
            service.credentials().service_state().await,
            ServiceState::Degraded { .. }
        ));
    }
}
