//! Google Drive API client.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use driveline_common::{Error, Result};

use crate::provider::{DriveApi, RemoteFile, FOLDER_MIME_TYPE};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Fields requested for every file resource.
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents,trashed";
/// Fields requested for file listings.
const LIST_FIELDS: &str = "files(id,name,mimeType,size,modifiedTime,parents,trashed),nextPageToken";

/// Multipart boundary for metadata+media uploads.
const BOUNDARY: &str = "DrivelineBoundary";

/// Connection settings for the Drive API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Metadata API base URL.
    pub api_base: String,
    /// Upload API base URL.
    pub upload_base: String,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// Total timeout per request, including body transfer.
    pub request_timeout_secs: u64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    /// Modified time.
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Trashed status.
    #[serde(default)]
    pub trashed: bool,
}

impl From<DriveFile> for RemoteFile {
    fn from(file: DriveFile) -> Self {
        RemoteFile {
            size: file.size.as_ref().and_then(|s| s.parse().ok()),
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            modified: file.modified_time,
            parents: file.parents,
        }
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Escape a literal for use inside a single-quoted Drive query string.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Build a `multipart/related` body carrying JSON metadata and the media.
fn multipart_body(metadata: &serde_json::Value, mime_type: &str, data: &[u8]) -> Result<Vec<u8>> {
    let metadata_json = serde_json::to_string(metadata)?;

    let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);

    // Metadata part
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata_json.as_bytes());
    body.extend_from_slice(b"\r\n");

    // Data part
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}--", BOUNDARY).as_bytes());

    Ok(body)
}

/// Google Drive API client.
///
/// Stateless with respect to identity: the caller passes the bearer token of
/// the subject on whose behalf each request is made.
pub struct DriveClient {
    http: Client,
    config: DriveConfig,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(config: DriveConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("Driveline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    /// Run a file query, following pagination. Results come oldest first.
    async fn query_files(&self, token: &str, query: &str, page_size: &str) -> Result<Vec<DriveFile>> {
        let url = format!("{}/files", self.config.api_base);
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, Self::bearer(token))
                .query(&[
                    ("q", query),
                    ("fields", LIST_FIELDS),
                    ("pageSize", page_size),
                    ("spaces", "drive"),
                    ("orderBy", "createdTime"),
                ]);

            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Storage(format!("Failed to list files: {}", e)))?;

            let list_response: FileListResponse = Self::handle_response(response, query).await?;
            all_files.extend(list_response.files.into_iter().filter(|f| !f.trashed));

            match list_response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_files)
    }

    /// Handle API response with error checking.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        resource: &str,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("Failed to parse response: {}", e)))
        } else {
            Err(Self::status_error(response, resource).await)
        }
    }

    async fn status_error(response: reqwest::Response, resource: &str) -> Error {
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Error::RemoteNotFound(resource.to_string()),
            StatusCode::UNAUTHORIZED => {
                Error::Storage("Invalid or expired access token".to_string())
            }
            StatusCode::FORBIDDEN => Error::Storage(format!("Access denied to {}", resource)),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Error::Storage(format!("API error: {} - {}", status, body))
            }
        }
    }
}

#[async_trait]
impl DriveApi for DriveClient {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn find_folder(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<RemoteFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
            escape_query(name),
            escape_query(parent_id),
            FOLDER_MIME_TYPE
        );

        // Drive compares names case-insensitively; the match must be exact.
        let found = self
            .query_files(token, &query, "100")
            .await?
            .into_iter()
            .find(|f| f.name == name);

        debug!(parent = parent_id, name, found = found.is_some(), "Folder lookup");
        Ok(found.map(Into::into))
    }

    async fn create_folder(&self, token: &str, parent_id: &str, name: &str) -> Result<RemoteFile> {
        let url = format!("{}/files", self.config.api_base);

        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to create folder: {}", e)))?;

        let folder: DriveFile = Self::handle_response(response, parent_id).await?;
        Ok(folder.into())
    }

    async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<RemoteFile>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let files = self.query_files(token, &query, "1000").await?;
        Ok(files.into_iter().map(Into::into).collect())
    }

    async fn create_object(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile> {
        let url = format!("{}/files", self.config.upload_base);

        let metadata = serde_json::json!({
            "name": name,
            "mimeType": mime_type,
            "parents": [parent_id],
        });
        let body = multipart_body(&metadata, mime_type, &data)?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to upload file: {}", e)))?;

        let file: DriveFile = Self::handle_response(response, parent_id).await?;
        Ok(file.into())
    }

    async fn update_object(
        &self,
        token: &str,
        file_id: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile> {
        let url = format!("{}/files/{}", self.config.upload_base, file_id);

        let response = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(header::CONTENT_TYPE, mime_type)
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to update file: {}", e)))?;

        let file: DriveFile = Self::handle_response(response, file_id).await?;
        Ok(file.into())
    }

    async fn download(&self, token: &str, file_id: &str) -> Result<Bytes> {
        let url = format!("{}/files/{}", self.config.api_base, file_id);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to download file: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, file_id).await);
        }

        response
            .bytes()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read download response: {}", e)))
    }

    async fn delete(&self, token: &str, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}", self.config.api_base, file_id);

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete file: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response, file_id).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_drive_file_into_remote_file() {
        let file = DriveFile {
            id: "abc123".to_string(),
            name: "x.png".to_string(),
            mime_type: "image/png".to_string(),
            size: Some("12345".to_string()),
            modified_time: Some(Utc::now()),
            parents: vec!["folder".to_string()],
            trashed: false,
        };

        let remote: RemoteFile = file.into();
        assert_eq!(remote.id, "abc123");
        assert_eq!(remote.size, Some(12345));
        assert!(!remote.is_folder());
    }

    #[test]
    fn test_drive_file_deserialize_folder_without_size() {
        let json = r#"{
            "id": "f1",
            "name": "products",
            "mimeType": "application/vnd.google-apps.folder",
            "parents": ["root"]
        }"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        let remote: RemoteFile = file.into();

        assert!(remote.is_folder());
        assert_eq!(remote.size, None);
        assert_eq!(remote.parents, vec!["root".to_string()]);
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("plain"), "plain");
        assert_eq!(escape_query("o'brien"), "o\\'brien");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_multipart_body_layout() {
        let metadata = serde_json::json!({"name": "x.png", "parents": ["p1"]});
        let body = multipart_body(&metadata, "image/png", b"PNGDATA").unwrap();
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with("--DrivelineBoundary\r\n"));
        assert!(text.contains("Content-Type: application/json; charset=UTF-8"));
        assert!(text.contains("\"name\":\"x.png\""));
        assert!(text.contains("Content-Type: image/png\r\n\r\nPNGDATA\r\n"));
        assert!(text.ends_with("--DrivelineBoundary--"));
    }

    #[test]
    fn test_drive_config_defaults() {
        let config: DriveConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.api_base, DRIVE_API_BASE);
        assert_eq!(config.request_timeout_secs, 60);
        assert!(DriveClient::new(config).is_ok());
    }

    proptest! {
        #[test]
        fn prop_escaped_quotes_are_never_bare(value in ".{0,40}") {
            let escaped = escape_query(&value);
            let mut backslashes = 0;
            for c in escaped.chars() {
                match c {
                    '\\' => backslashes += 1,
                    '\'' => {
                        prop_assert_eq!(backslashes % 2, 1);
                        backslashes = 0;
                    }
                    _ => backslashes = 0,
                }
            }
        }
    }
}
