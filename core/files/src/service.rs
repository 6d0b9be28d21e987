//! Upload, download, delete and listing of container files.

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use driveline_common::{Container, ContainerKind, Error, FolderPath, Result, Subject};
use driveline_index::{MetadataIndex, NewStoredObject, StoredObject};
use driveline_storage::{DriveApi, FolderResolver, RemoteFile};

use crate::archive::write_zip;
use crate::clock::Clock;
use crate::config::{FolderNames, Ownership};
use crate::credentials::CredentialManager;

/// MIME type used when none is supplied or known.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
/// Uploader recorded when none is supplied.
pub const DEFAULT_UPLOADER: &str = "public";
/// Downloads in flight at once during an export.
const EXPORT_CONCURRENCY: usize = 4;

/// Content and metadata of a downloaded object.
#[derive(Debug, Clone)]
pub struct Download {
    pub data: Bytes,
    pub mime_type: String,
    pub filename: String,
}

/// Stores container files on the provider and keeps the local index in step.
pub struct FileService {
    drive: Arc<dyn DriveApi>,
    credentials: Arc<CredentialManager>,
    folders: FolderResolver,
    index: MetadataIndex,
    clock: Arc<dyn Clock>,
    folder_names: FolderNames,
    ownership: Ownership,
}

impl FileService {
    /// Create a service storing container folders under `root_folder_id`.
    pub fn new(
        drive: Arc<dyn DriveApi>,
        credentials: Arc<CredentialManager>,
        index: MetadataIndex,
        clock: Arc<dyn Clock>,
        root_folder_id: impl Into<String>,
        folder_names: FolderNames,
        ownership: Ownership,
    ) -> Self {
        Self {
            folders: FolderResolver::new(drive.clone(), root_folder_id),
            drive,
            credentials,
            index,
            clock,
            folder_names,
            ownership,
        }
    }

    /// Credential manager used for every provider call.
    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Upload `data` as `filename` into `container`.
    ///
    /// A file with the same name already in the container has its content
    /// replaced and keeps its remote id; any other name creates a new object.
    /// The index is written only after the provider call succeeds.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty payload or blank filename
    /// - Credential errors of the owning subject
    /// - `Storage` if the provider call fails
    pub async fn put(
        &self,
        container: Container,
        filename: &str,
        mime_type: Option<&str>,
        data: Bytes,
        uploader: Option<&str>,
    ) -> Result<String> {
        if filename.trim().is_empty() {
            return Err(Error::InvalidInput("Filename cannot be empty".to_string()));
        }
        if data.is_empty() {
            return Err(Error::InvalidInput(format!("{} is empty", filename)));
        }
        let mime_type = mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE);
        let uploader = uploader
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(DEFAULT_UPLOADER);
        let size_bytes = data.len() as u64;

        let existing = self.index.find_by_name(&container, filename)?;
        let (remote, owner) = match existing {
            Some(object) => {
                let token = self.credentials.ensure_valid_token(&object.owner).await?;
                match self
                    .drive
                    .update_object(&token, &object.remote_object_id, mime_type, data.clone())
                    .await
                {
                    Ok(remote) => {
                        debug!(remote_id = %remote.id, name = %filename, "Replaced object content");
                        (remote, object.owner)
                    }
                    Err(Error::RemoteNotFound(_)) => {
                        warn!(
                            remote_id = %object.remote_object_id,
                            name = %filename,
                            "Indexed object is gone from the provider, uploading anew"
                        );
                        let remote = self
                            .create(&token, &object.owner, &container, filename, mime_type, data)
                            .await?;
                        (remote, object.owner)
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                let owner = self.owner_for(uploader)?;
                let token = self.credentials.ensure_valid_token(&owner).await?;
                let remote = self
                    .create(&token, &owner, &container, filename, mime_type, data)
                    .await?;
                (remote, owner)
            }
        };

        let stored = self.index.upsert(&NewStoredObject {
            remote_object_id: remote.id,
            logical_name: filename.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes,
            uploaded_at: self.clock.now(),
            uploader: uploader.to_string(),
            owner,
            container,
        })?;

        info!(
            remote_id = %stored.remote_object_id,
            container = %container,
            name = %filename,
            size = size_bytes,
            "Stored file"
        );
        Ok(stored.remote_object_id)
    }

    /// Fetch an indexed object from the provider.
    ///
    /// # Errors
    /// - `NotFound` if the object is not indexed
    /// - `RemoteNotFound` or `Storage` from the provider
    pub async fn download(&self, remote_object_id: &str) -> Result<Download> {
        let object = self.object_info(remote_object_id)?;
        let token = self.credentials.ensure_valid_token(&object.owner).await?;
        let data = self.drive.download(&token, remote_object_id).await?;

        debug!(remote_id = %remote_object_id, size = data.len(), "Downloaded file");
        Ok(Download {
            data,
            mime_type: object.mime_type,
            filename: object.logical_name,
        })
    }

    /// Delete an object from the provider and the index.
    ///
    /// The index row is dropped when the provider deletes the object or
    /// reports it already gone. On any other failure the row is kept.
    ///
    /// # Errors
    /// - `NotFound` if the object is not indexed
    /// - `Storage` if the provider call fails
    pub async fn delete(&self, remote_object_id: &str) -> Result<()> {
        let object = self.object_info(remote_object_id)?;
        let token = self.credentials.ensure_valid_token(&object.owner).await?;

        match self.drive.delete(&token, remote_object_id).await {
            Ok(()) => {}
            Err(Error::RemoteNotFound(_)) => {
                warn!(remote_id = %remote_object_id, "Object already gone from provider, dropping index entry");
            }
            Err(e) => {
                error!(remote_id = %remote_object_id, error = %e, "Remote delete failed, keeping index entry");
                return Err(e);
            }
        }

        self.index.delete_by_remote_id(remote_object_id)?;
        info!(remote_id = %remote_object_id, container = %object.container, "Deleted file");
        Ok(())
    }

    /// Indexed objects of a container, ordered by filename.
    pub fn list_container(&self, kind: ContainerKind, id: i64) -> Result<Vec<StoredObject>> {
        self.index.list_container(&Container::new(kind, id))
    }

    /// Stored MIME type of an object, or the generic binary type if unknown.
    pub fn content_type(&self, remote_object_id: &str) -> Result<String> {
        Ok(self
            .index
            .find_by_remote_id(remote_object_id)?
            .map(|o| o.mime_type)
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()))
    }

    /// Metadata of an indexed object.
    ///
    /// # Errors
    /// - `NotFound` if the object is not indexed
    pub fn object_info(&self, remote_object_id: &str) -> Result<StoredObject> {
        self.index
            .find_by_remote_id(remote_object_id)?
            .ok_or_else(|| Error::NotFound(remote_object_id.to_string()))
    }

    /// Download every file in the container's provider folder into a ZIP
    /// archive.
    ///
    /// # Errors
    /// - `NotFound` if the container folder holds no files
    pub async fn export_container_zip(&self, kind: ContainerKind, id: i64) -> Result<Vec<u8>> {
        let container = Container::new(kind, id);
        let path = self.container_path(&container)?;

        let mut owners: BTreeSet<String> = self
            .index
            .list_container(&container)?
            .into_iter()
            .map(|o| o.owner.key())
            .collect();
        if self.ownership == Ownership::ServiceIdentity {
            owners.insert(Subject::Service.key());
        }

        let mut entries: Vec<(String, Bytes)> = Vec::new();
        for key in owners {
            let owner = Subject::from_key(&key)?;
            let token = self.credentials.ensure_valid_token(&owner).await?;
            let Some(folder_id) = self.folders.lookup(&token, &owner, &path).await? else {
                continue;
            };

            let files: Vec<RemoteFile> = self
                .drive
                .list_children(&token, &folder_id)
                .await?
                .into_iter()
                .filter(|f| !f.is_folder())
                .collect();
            let token = &token;
            let downloaded: Vec<(String, Bytes)> = stream::iter(files)
                .map(|file| async move {
                    let data = self.drive.download(token, &file.id).await?;
                    Ok::<_, Error>((file.name, data))
                })
                .buffered(EXPORT_CONCURRENCY)
                .try_collect()
                .await?;
            entries.extend(downloaded);
        }

        if entries.is_empty() {
            return Err(Error::NotFound(format!("No files stored for {}", container)));
        }

        let count = entries.len();
        let archive = write_zip(entries)?;
        info!(container = %container, files = count, bytes = archive.len(), "Exported container");
        Ok(archive)
    }

    fn owner_for(&self, uploader: &str) -> Result<Subject> {
        match self.ownership {
            Ownership::ServiceIdentity => Ok(Subject::Service),
            Ownership::Uploader => Subject::user(uploader),
        }
    }

    fn container_path(&self, container: &Container) -> Result<FolderPath> {
        FolderPath::for_container(self.folder_names.for_kind(container.kind), container)
    }

    /// Create the object in the container folder, re-resolving the folder
    /// once if the cached one has disappeared.
    async fn create(
        &self,
        token: &str,
        owner: &Subject,
        container: &Container,
        filename: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile> {
        let path = self.container_path(container)?;
        let folder_id = self.folders.resolve(token, owner, &path).await?;

        match self
            .drive
            .create_object(token, &folder_id, filename, mime_type, data.clone())
            .await
        {
            Err(Error::RemoteNotFound(_)) => {
                warn!(path = %path, folder_id = %folder_id, "Container folder vanished, resolving again");
                self.folders.invalidate(owner, &path).await;
                let folder_id = self.folders.resolve(token, owner, &path).await?;
                self.drive
                    .create_object(token, &folder_id, filename, mime_type, data)
                    .await
            }
            other => other,
        }
    }
}
