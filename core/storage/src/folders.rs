//! Resolution of logical folder paths to provider folder ids.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use driveline_common::{FolderPath, Result, Subject};

use crate::provider::DriveApi;

type CacheKey = (Subject, FolderPath);

/// Maps a path of folder names onto the provider's folder tree, creating
/// missing segments on the way down.
///
/// Each owner has its own tree, so cache entries and locks are keyed by the
/// owning subject as well as the path. Find-or-create of every path prefix is
/// serialized within this process; two processes resolving the same new path
/// at the same moment may still create sibling folders with the same name.
pub struct FolderResolver {
    drive: Arc<dyn DriveApi>,
    root_id: String,
    /// Cache of path to folder ID mapping.
    cache: RwLock<HashMap<CacheKey, String>>,
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl FolderResolver {
    /// Create a resolver rooted at `root_id`.
    pub fn new(drive: Arc<dyn DriveApi>, root_id: impl Into<String>) -> Self {
        Self {
            drive,
            root_id: root_id.into(),
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `path` for `owner`, creating any missing folder.
    ///
    /// # Postconditions
    /// - Every segment of `path` exists as a folder on the provider
    /// - Repeated calls return the same id unless the folder was removed
    ///
    /// # Errors
    /// - `Storage` if a lookup or creation call fails
    pub async fn resolve(&self, token: &str, owner: &Subject, path: &FolderPath) -> Result<String> {
        if path.is_root() {
            return Ok(self.root_id.clone());
        }

        if let Some(id) = self.cached(&(owner.clone(), path.clone())).await {
            return Ok(id);
        }

        let mut current_id = self.root_id.clone();
        for prefix in path.prefixes() {
            let key = (owner.clone(), prefix);
            if let Some(id) = self.cached(&key).await {
                current_id = id;
                continue;
            }

            // Sibling paths share their prefixes, so each prefix has its own lock.
            let lock = self.path_lock(&key).await;
            let _guard = lock.lock().await;
            if let Some(id) = self.cached(&key).await {
                current_id = id;
                continue;
            }

            let name = key.1.segments().last().map(String::as_str).unwrap_or_default();
            current_id = match self.drive.find_folder(token, &current_id, name).await? {
                Some(folder) => folder.id,
                None => {
                    let folder = self.drive.create_folder(token, &current_id, name).await?;
                    info!(path = %key.1, owner = %owner, id = %folder.id, "Created remote folder");
                    folder.id
                }
            };

            self.cache.write().await.insert(key, current_id.clone());
        }

        debug!(path = %path, owner = %owner, id = %current_id, "Resolved folder");
        Ok(current_id)
    }

    /// Find the folder at `path` without creating anything.
    ///
    /// # Returns
    /// `None` if any segment is missing.
    pub async fn lookup(&self, token: &str, owner: &Subject, path: &FolderPath) -> Result<Option<String>> {
        if path.is_root() {
            return Ok(Some(self.root_id.clone()));
        }
        if let Some(id) = self.cached(&(owner.clone(), path.clone())).await {
            return Ok(Some(id));
        }

        let mut current_id = self.root_id.clone();
        for segment in path.segments() {
            match self.drive.find_folder(token, &current_id, segment).await? {
                Some(folder) => current_id = folder.id,
                None => return Ok(None),
            }
        }
        Ok(Some(current_id))
    }

    /// Forget cached ids for `path` and everything below it.
    ///
    /// Call this when the provider reports a cached folder as gone.
    pub async fn invalidate(&self, owner: &Subject, path: &FolderPath) {
        let mut cache = self.cache.write().await;
        cache.retain(|(cached_owner, cached_path), _| {
            cached_owner != owner || !cached_path.segments().starts_with(path.segments())
        });
    }

    async fn cached(&self, key: &CacheKey) -> Option<String> {
        self.cache.read().await.get(key).cloned()
    }

    async fn path_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDrive, MEMORY_ROOT_ID};

    fn resolver() -> (Arc<MemoryDrive>, FolderResolver) {
        let drive = Arc::new(MemoryDrive::new());
        let resolver = FolderResolver::new(drive.clone(), MEMORY_ROOT_ID);
        (drive, resolver)
    }

    fn path(segments: &[&str]) -> FolderPath {
        FolderPath::from_segments(segments.iter().copied()).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_twice_returns_same_id() {
        let (drive, resolver) = resolver();
        let owner = Subject::Service;

        let first = resolver.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();
        let second = resolver.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(drive.create_folder_calls(), 2);
        assert_eq!(drive.folder_count(MEMORY_ROOT_ID, "a"), 1);
    }

    #[tokio::test]
    async fn test_resolve_with_cold_cache_reuses_existing_folders() {
        let (drive, resolver) = resolver();
        let owner = Subject::Service;
        let first = resolver.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();

        // A fresh resolver has no cache and must find, not create.
        let cold = FolderResolver::new(drive.clone(), MEMORY_ROOT_ID);
        let second = cold.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(drive.create_folder_calls(), 2);
    }

    #[tokio::test]
    async fn test_resolve_root_is_root_id() {
        let (drive, resolver) = resolver();
        let id = resolver
            .resolve("t", &Subject::Service, &FolderPath::root())
            .await
            .unwrap();
        assert_eq!(id, MEMORY_ROOT_ID);
        assert_eq!(drive.find_folder_calls(), 0);
    }

    #[tokio::test]
    async fn test_unrelated_same_named_folder_is_ignored() {
        let (drive, resolver) = resolver();
        let elsewhere = drive.seed_folder(MEMORY_ROOT_ID, "archive").unwrap();
        let decoy = drive.seed_folder(&elsewhere.id, "42").unwrap();

        let id = resolver
            .resolve("t", &Subject::Service, &path(&["products", "42"]))
            .await
            .unwrap();

        assert_ne!(id, decoy.id);
        let folder = drive.file(&id).unwrap();
        assert_eq!(folder.name, "42");
        assert_ne!(folder.parents, vec![elsewhere.id]);
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        let (drive, resolver) = resolver();
        drive.seed_folder(MEMORY_ROOT_ID, "Products").unwrap();

        resolver
            .resolve("t", &Subject::Service, &path(&["products"]))
            .await
            .unwrap();

        assert_eq!(drive.folder_count(MEMORY_ROOT_ID, "products"), 1);
        assert_eq!(drive.folder_count(MEMORY_ROOT_ID, "Products"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_creates_one_folder() {
        let (drive, resolver) = resolver();
        let resolver = Arc::new(resolver);
        let owner = Subject::Service;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            let owner = owner.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve("t", &owner, &path(&["orders", "7"])).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(drive.folder_count(MEMORY_ROOT_ID, "orders"), 1);
    }

    /// Delays every folder lookup so that concurrent resolutions overlap.
    struct SlowLookupDrive(Arc<MemoryDrive>);

    #[async_trait::async_trait]
    impl DriveApi for SlowLookupDrive {
        fn name(&self) -> &str {
            "slow"
        }

        async fn find_folder(
            &self,
            token: &str,
            parent_id: &str,
            name: &str,
        ) -> Result<Option<crate::RemoteFile>> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.find_folder(token, parent_id, name).await
        }

        async fn create_folder(&self, token: &str, parent_id: &str, name: &str) -> Result<crate::RemoteFile> {
            self.0.create_folder(token, parent_id, name).await
        }

        async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<crate::RemoteFile>> {
            self.0.list_children(token, folder_id).await
        }

        async fn create_object(
            &self,
            token: &str,
            parent_id: &str,
            name: &str,
            mime_type: &str,
            data: bytes::Bytes,
        ) -> Result<crate::RemoteFile> {
            self.0.create_object(token, parent_id, name, mime_type, data).await
        }

        async fn update_object(
            &self,
            token: &str,
            file_id: &str,
            mime_type: &str,
            data: bytes::Bytes,
        ) -> Result<crate::RemoteFile> {
            self.0.update_object(token, file_id, mime_type, data).await
        }

        async fn download(&self, token: &str, file_id: &str) -> Result<bytes::Bytes> {
            self.0.download(token, file_id).await
        }

        async fn delete(&self, token: &str, file_id: &str) -> Result<()> {
            self.0.delete(token, file_id).await
        }
    }

    #[tokio::test]
    async fn test_sibling_paths_share_one_parent_folder() {
        let drive = Arc::new(MemoryDrive::new());
        let resolver = Arc::new(FolderResolver::new(
            Arc::new(SlowLookupDrive(drive.clone())),
            MEMORY_ROOT_ID,
        ));

        let first = {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                resolver
                    .resolve("t", &Subject::Service, &path(&["products", "42"]))
                    .await
            })
        };
        let second = {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                resolver
                    .resolve("t", &Subject::Service, &path(&["products", "43"]))
                    .await
            })
        };
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(drive.folder_count(MEMORY_ROOT_ID, "products"), 1);
        let first_parent = drive.file(&first).unwrap().parents;
        let second_parent = drive.file(&second).unwrap().parents;
        assert_eq!(first_parent, second_parent);
    }

    #[tokio::test]
    async fn test_owners_have_separate_caches() {
        let (drive, resolver) = resolver();
        let alice = Subject::user("alice").unwrap();

        resolver.resolve("t", &Subject::Service, &path(&["a"])).await.unwrap();
        resolver.resolve("t", &alice, &path(&["a"])).await.unwrap();

        // Second owner looked the folder up instead of trusting the first
        // owner's cache entry.
        assert_eq!(drive.find_folder_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_recreates_removed_folder() {
        let (drive, resolver) = resolver();
        let owner = Subject::Service;
        let first = resolver.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();

        drive.remove_silently(&first);
        resolver.invalidate(&owner, &path(&["a", "b"])).await;

        let second = resolver.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(drive.create_folder_calls(), 3);
    }

    #[tokio::test]
    async fn test_lookup_does_not_create() {
        let (drive, resolver) = resolver();
        let owner = Subject::Service;

        assert_eq!(resolver.lookup("t", &owner, &path(&["a", "b"])).await.unwrap(), None);
        assert_eq!(drive.create_folder_calls(), 0);

        let id = resolver.resolve("t", &owner, &path(&["a", "b"])).await.unwrap();
        let cold = FolderResolver::new(drive.clone(), MEMORY_ROOT_ID);
        assert_eq!(cold.lookup("t", &owner, &path(&["a", "b"])).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_resolve_surfaces_provider_failure() {
        let (drive, resolver) = resolver();
        drive.set_unavailable(true);

        let result = resolver.resolve("t", &Subject::Service, &path(&["a"])).await;
        assert!(matches!(result, Err(driveline_common::Error::Storage(_))));
    }
}
