//! Persisted OAuth2 credentials, one per subject.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use driveline_common::{Result, Subject};

use crate::db::Database;

/// OAuth2 credential of one subject.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Identity the credential belongs to.
    pub subject: Subject,
    /// Short-lived bearer token.
    pub access_token: String,
    /// Long-lived refresh token; without one the credential cannot renew.
    pub refresh_token: Option<String>,
    /// When the access token was issued.
    pub issued_at: DateTime<Utc>,
    /// Lifetime of the access token in seconds.
    pub lifetime_secs: i64,
    /// Granted scopes, space separated.
    pub scope: Option<String>,
}

impl Credential {
    /// Instant at which the access token expires.
    ///
    /// Saturates at the latest representable instant.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Duration::try_seconds(self.lifetime_secs)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the access token may be handed out at `now`.
    ///
    /// A token is usable only while `now < expires_at - margin`, so that it
    /// cannot expire while a request carrying it is in flight.
    pub fn is_usable(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at()
            .checked_sub_signed(margin)
            .is_some_and(|deadline| now < deadline)
    }

    /// Whether the credential can be renewed without user interaction.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("issued_at", &self.issued_at)
            .field("lifetime_secs", &self.lifetime_secs)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Keep a short prefix of a secret for log correlation.
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    format!("{}…", prefix)
}

fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn row_to_credential(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let key: String = row.get(0)?;
    let subject = Subject::from_key(&key).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Credential {
        subject,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        issued_at: from_millis(row.get(3)?, 3)?,
        lifetime_secs: row.get(4)?,
        scope: row.get(5)?,
    })
}

/// Credential table access.
#[derive(Clone)]
pub struct TokenStore {
    db: Arc<Database>,
}

impl TokenStore {
    /// Create a store over a shared database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load the credential of `subject`.
    pub fn get(&self, subject: &Subject) -> Result<Option<Credential>> {
        let key = subject.key();
        self.db.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT subject, access_token, refresh_token, issued_at, lifetime_secs, scope
                FROM credentials WHERE subject = ?1
                "#,
                [&key],
                row_to_credential,
            )
            .optional()
        })
    }

    /// Insert or update the credential of its subject.
    ///
    /// A missing refresh token or scope keeps the stored value. The write is
    /// skipped when the stored credential was issued later than `credential`,
    /// so a slow writer can never replace a newer token with an older one.
    ///
    /// # Returns
    /// `true` if the row was written.
    pub fn save(&self, credential: &Credential) -> Result<bool> {
        let key = credential.subject.key();
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO credentials
                    (subject, access_token, refresh_token, issued_at, lifetime_secs, scope)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(subject) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, credentials.refresh_token),
                    issued_at = excluded.issued_at,
                    lifetime_secs = excluded.lifetime_secs,
                    scope = COALESCE(excluded.scope, credentials.scope)
                WHERE excluded.issued_at >= credentials.issued_at
                "#,
                params![
                    key,
                    credential.access_token,
                    credential.refresh_token,
                    to_millis(&credential.issued_at),
                    credential.lifetime_secs,
                    credential.scope,
                ],
            )
        })?;

        debug!(subject = %key, written = changed > 0, "Saved credential");
        Ok(changed > 0)
    }

    /// Delete the credential of `subject`.
    ///
    /// # Returns
    /// `true` if a credential existed.
    pub fn delete(&self, subject: &Subject) -> Result<bool> {
        let key = subject.key();
        let changed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM credentials WHERE subject = ?1", [&key]))?;
        Ok(changed > 0)
    }
}
