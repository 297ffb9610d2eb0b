//! IPC between the host and extension processes.
//!
//! Newline-delimited JSON envelopes over a local socket (Unix domain socket
//! or Windows named pipe). The host side is [`IpcServer`]; extensions use
//! [`ExtensionClient`].

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ExtensionClient;
pub use protocol::{
    Envelope, ExtensionResultItem, HostMessage, Inbound, LogLevel, MessageKind,
    ENV_AUTH_TOKEN, ENV_EXTENSION_ID, ENV_IPC_ADDRESS, MAX_MESSAGE_BYTES,
};
pub use server::{ConnectionEvent, IpcEndpoint, IpcServer, ServerNotice, ServerReady};

use crate::error::OrbitResult;

/// Delivery of host-to-extension messages.
pub trait QueryTransport {
    /// Send `envelope` to the connection of `extension_id`.
    ///
    /// Fails with [`OrbitError::SendFailed`](crate::OrbitError::SendFailed)
    /// when that extension is not connected.
    fn send(&mut self, extension_id: &str, envelope: Envelope) -> OrbitResult<()>;
}
