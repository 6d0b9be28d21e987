//! In-memory storage provider and token endpoint for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use driveline_common::{Error, Result};

use crate::provider::{DriveApi, RemoteFile, TokenEndpoint, TokenGrant, FOLDER_MIME_TYPE};

/// Id of the implicit root folder.
pub const MEMORY_ROOT_ID: &str = "root";

/// Failure injected into the next delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFailure {
    /// Report the object as already gone.
    NotFound,
    /// Fail like a dropped connection.
    Transient,
}

#[derive(Debug, Clone)]
struct Entry {
    file: RemoteFile,
    data: Option<Bytes>,
    trashed: bool,
}

/// Call counters of a [`MemoryDrive`].
#[derive(Debug, Default)]
struct Calls {
    find_folder: AtomicUsize,
    list_children: AtomicUsize,
    create_folder: AtomicUsize,
    create_object: AtomicUsize,
    update_object: AtomicUsize,
    download: AtomicUsize,
    delete: AtomicUsize,
}

/// In-memory storage provider.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Records call counts and the last bearer token seen,
/// and supports failure injection.
pub struct MemoryDrive {
    entries: Mutex<HashMap<String, Entry>>,
    calls: Calls,
    tokens_seen: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    next_delete_failure: Mutex<Option<DeleteFailure>>,
}

impl MemoryDrive {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            calls: Calls::default(),
            tokens_seen: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            next_delete_failure: Mutex::new(None),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, token: &str, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token.to_string());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory provider unavailable".to_string()));
        }
        Ok(())
    }

    fn check_folder(entries: &HashMap<String, Entry>, folder_id: &str) -> Result<()> {
        if folder_id == MEMORY_ROOT_ID {
            return Ok(());
        }
        match entries.get(folder_id) {
            Some(entry) if entry.file.is_folder() && !entry.trashed => Ok(()),
            Some(_) => Err(Error::Storage(format!("{} is not a folder", folder_id))),
            None => Err(Error::RemoteNotFound(folder_id.to_string())),
        }
    }

    fn insert(&self, parent_id: &str, name: &str, mime_type: &str, data: Option<Bytes>) -> Result<RemoteFile> {
        let mut entries = self.entries();
        Self::check_folder(&entries, parent_id)?;

        let file = RemoteFile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size: data.as_ref().map(|d| d.len() as u64),
            modified: Some(Utc::now()),
            parents: vec![parent_id.to_string()],
        };
        entries.insert(
            file.id.clone(),
            Entry {
                file: file.clone(),
                data,
                trashed: false,
            },
        );
        Ok(file)
    }

    /// Make every subsequent call fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Inject a failure into the next delete call.
    pub fn fail_next_delete(&self, failure: DeleteFailure) {
        *self
            .next_delete_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(failure);
    }

    /// Move an entry to the trash, as a user would in the Drive UI.
    pub fn trash(&self, id: &str) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.trashed = true;
        }
    }

    /// Remove an entry without going through the API.
    pub fn remove_silently(&self, id: &str) {
        self.entries().remove(id);
    }

    /// Seed a folder directly, bypassing call counters.
    pub fn seed_folder(&self, parent_id: &str, name: &str) -> Result<RemoteFile> {
        self.insert(parent_id, name, FOLDER_MIME_TYPE, None)
    }

    /// Get an entry's metadata.
    pub fn file(&self, id: &str) -> Option<RemoteFile> {
        self.entries().get(id).map(|e| e.file.clone())
    }

    /// Get an object's content.
    pub fn content(&self, id: &str) -> Option<Bytes> {
        self.entries().get(id).and_then(|e| e.data.clone())
    }

    /// Number of live folders with `name` directly under `parent_id`.
    pub fn folder_count(&self, parent_id: &str, name: &str) -> usize {
        self.entries()
            .values()
            .filter(|e| {
                !e.trashed
                    && e.file.is_folder()
                    && e.file.name == name
                    && e.file.parents.iter().any(|p| p == parent_id)
            })
            .count()
    }

    pub fn find_folder_calls(&self) -> usize {
        self.calls.find_folder.load(Ordering::SeqCst)
    }

    pub fn create_folder_calls(&self) -> usize {
        self.calls.create_folder.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.calls.create_object.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.calls.update_object.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.calls.download.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.calls.delete.load(Ordering::SeqCst)
    }

    /// Bearer token of the most recent call.
    pub fn last_token(&self) -> Option<String> {
        self.tokens_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl Default for MemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveApi for MemoryDrive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find_folder(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<RemoteFile>> {
        self.enter(token, &self.calls.find_folder)?;
        let entries = self.entries();
        Self::check_folder(&entries, parent_id)?;

        let mut matches: Vec<&Entry> = entries
            .values()
            .filter(|e| {
                !e.trashed
                    && e.file.is_folder()
                    && e.file.name == name
                    && e.file.parents.iter().any(|p| p == parent_id)
            })
            .collect();
        // Oldest first, like the provider's default ordering by creation.
        matches.sort_by_key(|e| e.file.modified);
        Ok(matches.first().map(|e| e.file.clone()))
    }

    async fn create_folder(&self, token: &str, parent_id: &str, name: &str) -> Result<RemoteFile> {
        self.enter(token, &self.calls.create_folder)?;
        self.insert(parent_id, name, FOLDER_MIME_TYPE, None)
    }

    async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<RemoteFile>> {
        self.enter(token, &self.calls.list_children)?;
        let entries = self.entries();
        Self::check_folder(&entries, folder_id)?;

        let mut children: Vec<RemoteFile> = entries
            .values()
            .filter(|e| !e.trashed && e.file.parents.iter().any(|p| p == folder_id))
            .map(|e| e.file.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn create_object(
        &self,
        token: &str,
        parent_id: &str,
        name: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile> {
        self.enter(token, &self.calls.create_object)?;
        self.insert(parent_id, name, mime_type, Some(data))
    }

    async fn update_object(
        &self,
        token: &str,
        file_id: &str,
        mime_type: &str,
        data: Bytes,
    ) -> Result<RemoteFile> {
        self.enter(token, &self.calls.update_object)?;
        let mut entries = self.entries();
        let entry = entries
            .get_mut(file_id)
            .filter(|e| !e.trashed)
            .ok_or_else(|| Error::RemoteNotFound(file_id.to_string()))?;

        entry.file.mime_type = mime_type.to_string();
        entry.file.size = Some(data.len() as u64);
        entry.file.modified = Some(Utc::now());
        entry.data = Some(data);
        Ok(entry.file.clone())
    }

    async fn download(&self, token: &str, file_id: &str) -> Result<Bytes> {
        self.enter(token, &self.calls.download)?;
        self.entries()
            .get(file_id)
            .filter(|e| !e.trashed)
            .and_then(|e| e.data.clone())
            .ok_or_else(|| Error::RemoteNotFound(file_id.to_string()))
    }

    async fn delete(&self, token: &str, file_id: &str) -> Result<()> {
        self.enter(token, &self.calls.delete)?;

        let injected = self
            .next_delete_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match injected {
            Some(DeleteFailure::NotFound) => {
                return Err(Error::RemoteNotFound(file_id.to_string()))
            }
            Some(DeleteFailure::Transient) => {
                return Err(Error::Storage("connection reset by peer".to_string()))
            }
            None => {}
        }

        self.entries()
            .remove(file_id)
            .map(|_| ())
            .ok_or_else(|| Error::RemoteNotFound(file_id.to_string()))
    }
}

/// In-memory OAuth2 token endpoint.
///
/// Issues access tokens `A1`, `A2`, ... in order across exchanges and
/// refreshes, so tests can tell a refreshed token from the original.
pub struct MemoryTokenEndpoint {
    issued: AtomicUsize,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    lifetime: Duration,
    issue_refresh_token: AtomicBool,
    fail_refresh: AtomicBool,
    fail_exchange: AtomicBool,
    revoked: Mutex<HashSet<String>>,
    refresh_delay: Option<Duration>,
}

impl MemoryTokenEndpoint {
    /// Create an endpoint issuing one-hour tokens with refresh tokens.
    pub fn new() -> Self {
        Self {
            issued: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            lifetime: Duration::from_secs(3600),
            issue_refresh_token: AtomicBool::new(true),
            fail_refresh: AtomicBool::new(false),
            fail_exchange: AtomicBool::new(false),
            revoked: Mutex::new(HashSet::new()),
            refresh_delay: None,
        }
    }

    /// Set the lifetime of issued access tokens.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Delay every refresh, to widen race windows in concurrency tests.
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = Some(delay);
        self
    }

    /// Whether code exchanges include a refresh token.
    pub fn set_issue_refresh_token(&self, issue: bool) {
        self.issue_refresh_token.store(issue, Ordering::SeqCst);
    }

    /// Make refreshes fail.
    pub fn set_fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    /// Make code exchanges fail.
    pub fn set_fail_exchange(&self, fail: bool) {
        self.fail_exchange.store(fail, Ordering::SeqCst);
    }

    /// Revoke a refresh token.
    pub fn revoke(&self, refresh_token: &str) {
        self.revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(refresh_token.to_string());
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn next_access_token(&self) -> String {
        format!("A{}", self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Default for MemoryTokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenEndpoint for MemoryTokenEndpoint {
    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(format!(
            "https://auth.invalid/authorize?access_type=offline&state={}",
            state
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exchange.load(Ordering::SeqCst) || code.is_empty() {
            return Err(Error::ProviderExchange("invalid_grant".to_string()));
        }

        let refresh_token = self
            .issue_refresh_token
            .load(Ordering::SeqCst)
            .then(|| format!("R-{}", code));

        Ok(TokenGrant {
            access_token: self.next_access_token(),
            refresh_token,
            expires_in: Some(self.lifetime),
            scope: Some("https://www.googleapis.com/auth/drive.file".to_string()),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }

        let revoked = self
            .revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(refresh_token);
        if revoked || self.fail_refresh.load(Ordering::SeqCst) {
            return Err(Error::ProviderExchange("invalid_grant".to_string()));
        }

        Ok(TokenGrant {
            access_token: self.next_access_token(),
            refresh_token: None,
            expires_in: Some(self.lifetime),
            scope: None,
        })
    }
}
