//! Storage provider abstraction for Driveline.
//!
//! This module provides trait-based interfaces for the remote object store
//! and its OAuth2 token endpoint, the Google Drive implementations of both,
//! in-memory doubles, and the folder resolver that maps logical paths onto
//! the provider's folder tree.
//!
//! # Design Principles
//! - Explicit identity: every provider call takes the access token of the
//!   subject it acts for; no client holds an implicit "current" account
//! - Async operations: All I/O operations are async
//! - Unified error semantics: provider 404s surface as `RemoteNotFound`,
//!   every other provider failure as `Storage`

pub mod folders;
pub mod gdrive;
pub mod memory;
pub mod provider;

pub use folders::FolderResolver;
pub use memory::{MemoryDrive, MemoryTokenEndpoint};
pub use provider::{DriveApi, RemoteFile, TokenEndpoint, TokenGrant, FOLDER_MIME_TYPE};
