//! Error types for orbit
//!
//! Provides the failure taxonomy shared by the IPC server, the process
//! supervisor and the dispatch pipeline. Every variant is contained to the
//! extension it names; none of them is allowed to take the host down.

use thiserror::Error;

use crate::core::{CorrelationId, ProviderId};
use crate::extensions::{ExtensionError, ExtensionId};

/// Errors that can occur in orbit
#[derive(Debug, Error)]
pub enum OrbitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handshake not completed within the startup timeout
    #[error("Extension '{extension}' did not complete the handshake within {timeout_ms}ms")]
    Connection { extension: ExtensionId, timeout_ms: u64 },

    /// Malformed or out-of-place message on an extension connection
    #[error("Protocol error from {}: {message}", .extension.as_deref().unwrap_or("unauthenticated connection"))]
    Protocol {
        extension: Option<ExtensionId>,
        message: String,
    },

    /// Unexpected extension process exit
    #[error("Extension '{extension}' exited unexpectedly ({status})")]
    Crash { extension: ExtensionId, status: String },

    /// Providers that had not answered when a dispatch deadline elapsed
    #[error("Dispatch {correlation_id} timed out waiting for {}", display_providers(.pending))]
    DispatchTimeout {
        correlation_id: CorrelationId,
        pending: Vec<ProviderId>,
    },

    /// Message addressed to an extension that is not connected
    #[error("Failed to send to extension '{extension}': {reason}")]
    SendFailed { extension: ExtensionId, reason: String },

    /// Manifest and registry errors
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    /// The control loop is no longer running
    #[error("Extension host has stopped")]
    HostStopped,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn display_providers(providers: &[ProviderId]) -> String {
    providers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl OrbitError {
    pub(crate) fn protocol(extension: Option<&ExtensionId>, message: impl Into<String>) -> Self {
        OrbitError::Protocol {
            extension: extension.cloned(),
            message: message.into(),
        }
    }
}

/// Result type alias for orbit operations
pub type OrbitResult<T> = Result<T, OrbitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_without_extension() {
        let err = OrbitError::protocol(None, "expected Connect");
        assert_eq!(
            err.to_string(),
            "Protocol error from unauthenticated connection: expected Connect"
        );
    }

    #[test]
    fn test_dispatch_timeout_lists_providers() {
        let err = OrbitError::DispatchTimeout {
            correlation_id: CorrelationId::from("C7"),
            pending: vec![
                ProviderId::Extension("weather".into()),
                ProviderId::Extension("notes".into()),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Dispatch C7 timed out waiting for extension:weather, extension:notes"
        );
    }
}
