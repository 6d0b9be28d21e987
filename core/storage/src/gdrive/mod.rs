//! Google Drive storage provider for Driveline.
//!
//! This module provides a storage backend using Google Drive with:
//! - OAuth2 authorization-code exchange and refresh
//! - Folder lookup scoped to direct children
//! - Multipart create and media update of objects

pub mod auth;
pub mod client;

pub use auth::{GoogleOAuth, OAuthConfig, DRIVE_FILE_SCOPE};
pub use client::{DriveClient, DriveConfig};
