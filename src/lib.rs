//! Orbit - extension host for keyboard-driven launchers.
//!
//! Orbit runs launcher extensions as separate processes, talks to them over
//! a local socket, and fans each user query out to the extensions and
//! built-in shortcuts that claim it.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`config`] - Configuration loading and management
//! - [`core`] - Query routing, provider matching and result aggregation
//! - [`extensions`] - Extension manifests and the connection-state registry
//! - [`ipc`] - Wire protocol, host-side server and extension-side client
//! - [`supervisor`] - Spawning, restarting and stopping extension processes
//! - [`services`] - Built-in providers (keyword shortcuts)
//! - [`host`] - The control loop tying it together, driven via [`HostHandle`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orbit::{Config, ExtensionHost, LogNotifier};
//!
//! # async fn run() -> orbit::OrbitResult<()> {
//! let config = Config::load();
//! let host = ExtensionHost::load(&config, Arc::new(LogNotifier)).await?;
//!
//! let stream = host.dispatch_query("wttr oslo").await?;
//! if let Some(items) = stream.finished().await {
//!     for item in items {
//!         println!("{}", item.title);
//!     }
//! }
//!
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod config;
pub mod core;
pub mod extensions;
pub mod host;
pub mod ipc;
pub mod logging;
pub mod notify;
pub mod services;
pub mod supervisor;

// Internal modules
mod error;

// Re-export commonly used types for convenience
pub use config::Config;
pub use core::{DispatchEvent, DispatchStream, Query, ResultAction, ResultItem};
pub use error::{OrbitError, OrbitResult};
pub use extensions::{ConnectionState, ExtensionManifest};
pub use host::{ExtensionHost, HostHandle, RescanReport};
pub use notify::{LogNotifier, Notifier};
