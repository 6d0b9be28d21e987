//! Storage provider and token endpoint trait definitions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use driveline_common::Result;

/// MIME type the provider uses to mark folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Metadata of a file or folder held by the storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Provider-assigned identifier.
    pub id: String,
    /// Name of the object.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes (None for folders).
    pub size: Option<u64>,
    /// Last modification time, when reported.
    pub modified: Option<DateTime<Utc>>,
    /// Parent folder IDs.
    pub parents: Vec<String>,
}

impl RemoteFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// Tokens returned by an authorization-code exchange or a refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Newly issued access token.
    pub access_token: String,
    /// Refresh token, only present when the provider chose to issue one.
    pub refresh_token: Option<String>,
    /// Lifetime of the access token, when reported.
    pub expires_in: Option<Duration>,
    /// Granted scopes, space separated.
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// OAuth2 token endpoint of the storage provider.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Build the consent URL carrying `state` back to the callback.
    ///
    /// The URL requests offline access so that the first consent yields a
    /// refresh token.
    fn authorization_url(&self, state: &str) -> Result<String>;

    /// Exchange a one-time authorization code for tokens.
    ///
    /// # Errors
    /// - `ProviderExchange` if the provider rejects the code or is unreachable
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    /// Obtain a new access token from a refresh token.
    ///
    /// # Errors
    /// - `ProviderExchange` if the grant is invalid or the call fails
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Folder and object operations against the storage provider.
///
/// Every call takes the bearer token of the subject it acts for.
/// Implementations must map a missing object to `Error::RemoteNotFound`
/// and every other failure to `Error::Storage`.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Get the provider name (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// Find a non-trashed folder named exactly `name` among the direct
    /// children of `parent_id`.
    async fn find_folder(&self, token: &str, parent_id: &str, name: &str)
        -> Result<Option<RemoteFile>>;

    /// Create a folder under `parent_id`.
    async fn create_folder(&self, token: &str, parent_id: &str, name: &str) -> Result<RemoteFile>;

    /// List non-trashed direct children of a folder.
    async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<RemoteFile>>;

    /// Create a new object with metadata and content.
    ///
    /// # Postconditions
    /// - Returns metadata including the provider-assigned id
    async fn create_object(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile>;

    /// Replace the content of an existing object, keeping its id.
    async fn update_object(
        &self,
        token: &str,
        file_id: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile>;

    /// Download object content.
    async fn download(&self, token: &str, file_id: &str) -> Result<Bytes>;

    /// Delete an object.
    ///
    /// # Errors
    /// - `RemoteNotFound` if the object is already gone
    async fn delete(&self, token: &str, file_id: &str) -> Result<()>;
}
