//! Common utilities and types shared across Driveline crates.
//!
//! This module provides the error taxonomy and the domain identifiers
//! (subjects, containers, folder paths) used by the credential and
//! storage layers.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Container, ContainerKind, FolderPath, Subject};
