//! SQLite-backed local state for Driveline.
//!
//! Two tables live in one database file:
//! - `credentials`: one OAuth2 credential per subject
//! - `stored_objects`: metadata of every object uploaded to the provider,
//!   keyed by the provider's id and unique per container and file name

pub mod credentials;
pub mod db;
pub mod objects;

pub use credentials::{Credential, TokenStore};
pub use db::Database;
pub use objects::{MetadataIndex, NewStoredObject, StoredObject};
