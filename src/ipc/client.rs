//! Extension-side connection to the host.
//!
//! ```no_run
//! # async fn run() -> orbit::OrbitResult<()> {
//! use orbit::ipc::{ExtensionClient, ExtensionResultItem, HostMessage};
//!
//! let mut client = ExtensionClient::from_env().await?;
//! while let Some(message) = client.recv().await? {
//!     match message {
//!         HostMessage::Query { correlation_id, query } => {
//!             let item = ExtensionResultItem::new(format!("You typed {}", query));
//!             client.respond(&correlation_id, &[item]).await?;
//!         }
//!         HostMessage::Shutdown => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf, Stream};
use interprocess::local_socket::{GenericFilePath, ToFsName};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::core::CorrelationId;
use crate::error::{OrbitError, OrbitResult};
use crate::extensions::ExtensionId;

use super::protocol::{
    Envelope, ExtensionResultItem, HostMessage, LogLevel, MessageKind, ENV_AUTH_TOKEN,
    ENV_EXTENSION_ID, ENV_IPC_ADDRESS,
};

pub struct ExtensionClient {
    extension_id: ExtensionId,
    reader: BufReader<RecvHalf>,
    writer: SendHalf,
}

impl ExtensionClient {
    /// Connect and complete the handshake.
    pub async fn connect(address: &str, extension_id: &str, token: &str) -> OrbitResult<Self> {
        let name = address.to_fs_name::<GenericFilePath>()?;
        let stream = Stream::connect(name).await?;
        let (recv, send) = stream.split();

        let mut client = Self {
            extension_id: extension_id.to_string(),
            reader: BufReader::new(recv),
            writer: send,
        };
        client.send(&Envelope::connect(extension_id, token)).await?;

        match client.next_envelope().await? {
            Some(envelope) if envelope.kind == MessageKind::ConnectAck => Ok(client),
            Some(envelope) => Err(OrbitError::protocol(
                None,
                format!("expected ConnectAck, got {:?}", envelope.kind),
            )),
            None => Err(OrbitError::protocol(
                None,
                "host closed the connection during handshake",
            )),
        }
    }

    /// Connect using the variables the host sets when spawning an extension.
    pub async fn from_env() -> OrbitResult<Self> {
        let var = |key: &str| {
            std::env::var(key).map_err(|_| OrbitError::Config(format!("{} is not set", key)))
        };
        let address = var(ENV_IPC_ADDRESS)?;
        let token = var(ENV_AUTH_TOKEN)?;
        let extension_id = var(ENV_EXTENSION_ID)?;
        Self::connect(&address, &extension_id, &token).await
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Next message from the host, or `None` once the host hangs up.
    pub async fn recv(&mut self) -> OrbitResult<Option<HostMessage>> {
        match self.next_envelope().await? {
            Some(envelope) => HostMessage::parse(envelope)
                .map(Some)
                .map_err(|message| OrbitError::protocol(None, message)),
            None => Ok(None),
        }
    }

    pub async fn respond(
        &mut self,
        correlation_id: &CorrelationId,
        items: &[ExtensionResultItem],
    ) -> OrbitResult<()> {
        let envelope = Envelope::query_result(&self.extension_id, correlation_id, items)?;
        self.send(&envelope).await
    }

    pub async fn error(
        &mut self,
        correlation_id: Option<&CorrelationId>,
        message: &str,
    ) -> OrbitResult<()> {
        let envelope = Envelope::error(&self.extension_id, correlation_id, message);
        self.send(&envelope).await
    }

    pub async fn log(&mut self, level: LogLevel, message: &str) -> OrbitResult<()> {
        let envelope = Envelope::log(&self.extension_id, level, message);
        self.send(&envelope).await
    }

    /// Announce a new display name and trigger list.
    pub async fn register_manifest(
        &mut self,
        name: Option<&str>,
        triggers: &[String],
    ) -> OrbitResult<()> {
        let envelope = Envelope::register_manifest(&self.extension_id, name, triggers);
        self.send(&envelope).await
    }

    /// Write a raw line, bypassing envelope encoding.
    pub async fn send_raw(&mut self, line: &str) -> OrbitResult<()> {
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> OrbitResult<()> {
        let line = envelope.encode()?;
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn next_envelope(&mut self) -> OrbitResult<Option<Envelope>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                return Envelope::decode(&line).map(Some);
            }
        }
    }
}
