//! Credential lifecycle: consent, code exchange, lazy refresh and the
//! static service identity.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use driveline_common::{Error, Result, Subject};
use driveline_index::{credentials::redact, Credential, TokenStore};
use driveline_storage::{TokenEndpoint, TokenGrant};

use crate::clock::Clock;

/// Lifetime assumed when the provider does not report one.
const DEFAULT_LIFETIME_SECS: i64 = 3600;
/// Longest access token lifetime taken at face value.
const MAX_LIFETIME_SECS: i64 = 86_400;

/// State of the static service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Startup refresh has not run yet.
    Uninitialized,
    /// Startup refresh succeeded.
    Ready,
    /// Startup refresh failed. Only a restart with corrected configuration
    /// leaves this state.
    Degraded { reason: String },
}

/// Hands out valid access tokens per subject, refreshing lazily.
pub struct CredentialManager {
    endpoint: Arc<dyn TokenEndpoint>,
    store: TokenStore,
    clock: Arc<dyn Clock>,
    margin: Duration,
    service_state: RwLock<ServiceState>,
    /// Serializes read-refresh-write per subject.
    locks: Mutex<HashMap<Subject, Arc<Mutex<()>>>>,
}

impl CredentialManager {
    /// Create a manager. The service identity starts `Uninitialized`.
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        store: TokenStore,
        clock: Arc<dyn Clock>,
        margin: Duration,
    ) -> Self {
        Self {
            endpoint,
            store,
            clock,
            margin,
            service_state: RwLock::new(ServiceState::Uninitialized),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Consent URL for `subject`, carrying its key as state. No side effects.
    pub fn authorization_url(&self, subject: &Subject) -> Result<String> {
        self.endpoint.authorization_url(&subject.key())
    }

    /// Exchange a one-time authorization code and persist the credential.
    ///
    /// A refresh token already on file is kept when the provider omits one,
    /// which it does on every consent after the first.
    ///
    /// # Errors
    /// - `ProviderExchange` if the provider rejects the code
    /// - `Database` if the credential cannot be stored
    pub async fn exchange_code(&self, code: &str, subject: &Subject) -> Result<Credential> {
        if code.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Authorization code cannot be empty".to_string(),
            ));
        }

        let lock = self.subject_lock(subject).await;
        let _guard = lock.lock().await;

        let grant = self.endpoint.exchange_code(code).await?;
        let credential = self.credential_from_grant(subject, grant);
        if credential.refresh_token.is_none() {
            debug!(subject = %subject, "Provider issued no refresh token, keeping stored one");
        }
        if !self.store.save(&credential)? {
            warn!(subject = %subject, "A newer credential is already stored, keeping it");
        }

        info!(subject = %subject, expires_at = %credential.expires_at(), "Authorization code exchanged");
        self.store
            .get(subject)?
            .ok_or_else(|| Error::NoCredential(subject.key()))
    }

    /// Return an access token for `subject` that stays valid for at least
    /// the safety margin, refreshing it first if needed.
    ///
    /// # Errors
    /// - `ServiceIdentityUnavailable` for the service identity unless it is `Ready`
    /// - `NoCredential` if the subject never authorized
    /// - `NoRefreshToken` if the token is stale and cannot be renewed
    /// - `RefreshFailed` if the provider rejected the refresh
    pub async fn ensure_valid_token(&self, subject: &Subject) -> Result<String> {
        if subject.is_service() {
            self.check_service_ready().await?;
        }

        if let Some(credential) = self.store.get(subject)? {
            if credential.is_usable(self.clock.now(), self.margin) {
                return Ok(credential.access_token);
            }
        }

        let lock = self.subject_lock(subject).await;
        let _guard = lock.lock().await;

        // Re-read: a concurrent caller may have refreshed while we waited.
        let credential = self
            .store
            .get(subject)?
            .ok_or_else(|| Error::NoCredential(subject.key()))?;
        if credential.is_usable(self.clock.now(), self.margin) {
            return Ok(credential.access_token);
        }

        let refreshed = self.refresh_locked(subject, &credential).await?;
        Ok(refreshed.access_token)
    }

    /// Run the one eager refresh of the service identity.
    ///
    /// Transitions `Uninitialized` to `Ready` or `Degraded`. Any later call
    /// returns the current state unchanged.
    pub async fn start_service_identity(&self, refresh_token: Option<&str>) -> ServiceState {
        let mut state = self.service_state.write().await;
        if *state != ServiceState::Uninitialized {
            return state.clone();
        }

        *state = match refresh_token.filter(|t| !t.is_empty()) {
            None => {
                error!("No service refresh token configured; service identity unavailable");
                ServiceState::Degraded {
                    reason: "no service refresh token configured".to_string(),
                }
            }
            Some(token) => match self.bootstrap_service(token).await {
                Ok(credential) => {
                    info!(expires_at = %credential.expires_at(), "Service identity ready");
                    ServiceState::Ready
                }
                Err(e) => {
                    error!(error = %e, "Service identity startup refresh failed");
                    ServiceState::Degraded {
                        reason: e.to_string(),
                    }
                }
            },
        };
        state.clone()
    }

    /// Current state of the service identity.
    pub async fn service_state(&self) -> ServiceState {
        self.service_state.read().await.clone()
    }

    /// Stored credential of `subject`, if any.
    pub fn credential(&self, subject: &Subject) -> Result<Option<Credential>> {
        self.store.get(subject)
    }

    /// Forget the credential of `subject`.
    ///
    /// # Returns
    /// `true` if a credential existed.
    pub async fn revoke(&self, subject: &Subject) -> Result<bool> {
        let lock = self.subject_lock(subject).await;
        let _guard = lock.lock().await;

        let removed = self.store.delete(subject)?;
        if removed {
            info!(subject = %subject, "Credential revoked");
        }
        Ok(removed)
    }

    async fn check_service_ready(&self) -> Result<()> {
        match &*self.service_state.read().await {
            ServiceState::Ready => Ok(()),
            ServiceState::Uninitialized => Err(Error::ServiceIdentityUnavailable(
                "service identity not started".to_string(),
            )),
            ServiceState::Degraded { reason } => {
                Err(Error::ServiceIdentityUnavailable(reason.clone()))
            }
        }
    }

    async fn bootstrap_service(&self, refresh_token: &str) -> Result<Credential> {
        let subject = Subject::Service;
        let lock = self.subject_lock(&subject).await;
        let _guard = lock.lock().await;

        let seed = Credential {
            subject: subject.clone(),
            access_token: String::new(),
            refresh_token: Some(refresh_token.to_string()),
            issued_at: self.clock.now(),
            lifetime_secs: 0,
            scope: None,
        };
        self.refresh_locked(&subject, &seed).await
    }

    /// Refresh `current` and persist the result. Caller holds the subject lock.
    async fn refresh_locked(&self, subject: &Subject, current: &Credential) -> Result<Credential> {
        let refresh_token = match current.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => {
                warn!(subject = %subject, "Token expired and no refresh token is stored");
                return Err(Error::NoRefreshToken(subject.key()));
            }
        };

        debug!(subject = %subject, token = %redact(&current.access_token), "Refreshing access token");
        let grant = self
            .endpoint
            .refresh(refresh_token)
            .await
            .map_err(|e| Error::RefreshFailed {
                subject: subject.key(),
                reason: e.to_string(),
            })?;

        let mut refreshed = self.credential_from_grant(subject, grant);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token.to_string());
        }
        if refreshed.scope.is_none() {
            refreshed.scope = current.scope.clone();
        }
        if !self.store.save(&refreshed)? {
            warn!(subject = %subject, "A newer credential is already stored, keeping it");
        }

        info!(subject = %subject, expires_at = %refreshed.expires_at(), "Access token refreshed");
        Ok(refreshed)
    }

    fn credential_from_grant(&self, subject: &Subject, grant: TokenGrant) -> Credential {
        let lifetime_secs = grant
            .expires_in
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(DEFAULT_LIFETIME_SECS)
            .min(MAX_LIFETIME_SECS);

        Credential {
            subject: subject.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.filter(|t| !t.is_empty()),
            issued_at: self.clock.now(),
            lifetime_secs,
            scope: grant.scope,
        }
    }

    async fn subject_lock(&self, subject: &Subject) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
