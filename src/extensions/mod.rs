//! Extension model for orbit.
//!
//! Extensions are independent OS processes described by a `manifest.json`.
//! This module holds the manifest format and the registry that tracks each
//! extension's connection state.
//!
//! # Architecture
//!
//! ```text
//! ExtensionRegistry
//! ├── order: Vec<ExtensionId>             (declaration order)
//! └── entries: HashMap<ExtensionId, RegistryEntry>
//!     ├── manifest: ExtensionManifest
//!     └── state: ConnectionState
//! ```

mod error;
mod manifest;
pub mod registry;

pub use error::{ExtensionError, ExtensionResult};
pub use manifest::{load_all, ExtensionManifest, MANIFEST_FILE};
pub use registry::{ConnectionState, ExtensionRegistry, RegistryEntry};

/// Unique identifier for an extension.
pub type ExtensionId = String;
