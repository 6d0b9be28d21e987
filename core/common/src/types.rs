//! Common types used throughout Driveline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage key of the static service identity.
const SERVICE_KEY: &str = "service";
/// Storage key prefix of end-user identities.
const USER_PREFIX: &str = "user:";

/// The identity on whose behalf a credential is held.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Subject {
    /// The non-interactive account configured at process start.
    Service,
    /// An end user who went through the consent flow.
    User(String),
}

impl Subject {
    /// Create a user subject.
    ///
    /// # Errors
    /// - Returns error if `id` is empty or blank
    pub fn user(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "User id cannot be empty".to_string(),
            ));
        }
        Ok(Subject::User(id))
    }

    /// Stable key used for persistence and as the OAuth2 `state` value.
    pub fn key(&self) -> String {
        match self {
            Subject::Service => SERVICE_KEY.to_string(),
            Subject::User(id) => format!("{}{}", USER_PREFIX, id),
        }
    }

    /// Parse a key produced by [`Subject::key`].
    pub fn from_key(key: &str) -> crate::Result<Self> {
        if key == SERVICE_KEY {
            return Ok(Subject::Service);
        }
        match key.strip_prefix(USER_PREFIX) {
            Some(id) => Self::user(id),
            None => Err(crate::Error::InvalidInput(format!(
                "Unrecognized subject key: {}",
                key
            ))),
        }
    }

    /// Check if this is the service identity.
    pub fn is_service(&self) -> bool {
        matches!(self, Subject::Service)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.key()
    }
}

impl TryFrom<String> for Subject {
    type Error = crate::Error;

    fn try_from(key: String) -> crate::Result<Self> {
        Subject::from_key(&key)
    }
}

/// Kind of local entity a stored object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Product attachments.
    Product,
    /// Order receipts.
    Order,
}

impl ContainerKind {
    /// All container kinds.
    pub const ALL: [ContainerKind; 2] = [ContainerKind::Product, ContainerKind::Order];

    /// Persisted name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Product => "product",
            ContainerKind::Order => "order",
        }
    }

    /// Default plural folder name used on the storage provider.
    pub fn default_folder_name(&self) -> &'static str {
        match self {
            ContainerKind::Product => "products",
            ContainerKind::Order => "orders",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(ContainerKind::Product),
            // Orders carry payment receipts; accept both spellings.
            "order" | "orders" | "receipt" | "receipts" => Ok(ContainerKind::Order),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown container kind '{}': expected 'product' or 'order'",
                other
            ))),
        }
    }
}

/// A local parent entity, e.g. product 42 or order 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Container {
    pub kind: ContainerKind,
    pub id: i64,
}

impl Container {
    /// Create a container reference.
    pub fn new(kind: ContainerKind, id: i64) -> Self {
        Self { kind, id }
    }

    /// Shorthand for a product container.
    pub fn product(id: i64) -> Self {
        Self::new(ContainerKind::Product, id)
    }

    /// Shorthand for an order container.
    pub fn order(id: i64) -> Self {
        Self::new(ContainerKind::Order, id)
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// A folder path on the storage provider, as human-readable segment names.
///
/// Segments are matched verbatim against folder names, so no normalization
/// (trimming, case folding) is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderPath {
    segments: Vec<String>,
}

impl FolderPath {
    /// Create the empty path, which designates the root folder.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Create a path from segment names.
    ///
    /// # Errors
    /// - Returns error if any segment is empty
    pub fn from_segments<I, S>(segments: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(crate::Error::InvalidInput(
                "Folder segment cannot be empty".to_string(),
            ));
        }
        Ok(Self { segments })
    }

    /// Path of a container folder: `[plural kind name, container id]`.
    pub fn for_container(folder_name: &str, container: &Container) -> crate::Result<Self> {
        Self::from_segments([folder_name.to_string(), container.id.to_string()])
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// All non-empty prefixes, shortest first.
    pub fn prefixes(&self) -> impl Iterator<Item = FolderPath> + '_ {
        (1..=self.segments.len()).map(move |n| FolderPath {
            segments: self.segments[..n].to_vec(),
        })
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}
