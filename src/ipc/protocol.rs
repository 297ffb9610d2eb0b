//! Wire format shared by host and extensions.
//!
//! Every message is one JSON envelope on its own line:
//!
//! ```text
//! {"type":"Query","extensionId":"weather","correlationId":"C1","payload":{"query":"wttr oslo"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{CorrelationId, ProviderId, Query, ResultAction, ResultItem};
use crate::error::{OrbitError, OrbitResult};
use crate::extensions::ExtensionId;

/// Longest accepted line, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Environment variable carrying the socket address.
pub const ENV_IPC_ADDRESS: &str = "ORBIT_IPC_ADDRESS";
/// Environment variable carrying the per-process auth token.
pub const ENV_AUTH_TOKEN: &str = "ORBIT_AUTH_TOKEN";
/// Environment variable carrying the extension id.
pub const ENV_EXTENSION_ID: &str = "ORBIT_EXTENSION_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Connect,
    ConnectAck,
    RegisterManifest,
    Query,
    QueryResult,
    Error,
    Log,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// May be omitted after the handshake; the connection identifies the sender
    #[serde(default)]
    pub extension_id: ExtensionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    fn new(kind: MessageKind, extension_id: &str, payload: Value) -> Self {
        Self {
            kind,
            extension_id: extension_id.to_string(),
            correlation_id: None,
            payload,
        }
    }

    fn correlated(mut self, correlation_id: &CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id.clone());
        self
    }

    pub fn connect(extension_id: &str, token: &str) -> Self {
        Self::new(MessageKind::Connect, extension_id, json!({ "token": token }))
    }

    pub fn connect_ack(extension_id: &str) -> Self {
        Self::new(MessageKind::ConnectAck, extension_id, Value::Null)
    }

    pub fn shutdown(extension_id: &str) -> Self {
        Self::new(MessageKind::Shutdown, extension_id, Value::Null)
    }

    pub fn query(extension_id: &str, correlation_id: &CorrelationId, query: &Query) -> Self {
        Self::new(MessageKind::Query, extension_id, json!({ "query": query.raw() }))
            .correlated(correlation_id)
    }

    pub fn query_result(
        extension_id: &str,
        correlation_id: &CorrelationId,
        items: &[ExtensionResultItem],
    ) -> OrbitResult<Self> {
        Ok(
            Self::new(MessageKind::QueryResult, extension_id, serde_json::to_value(items)?)
                .correlated(correlation_id),
        )
    }

    pub fn error(extension_id: &str, correlation_id: Option<&CorrelationId>, message: &str) -> Self {
        let envelope = Self::new(MessageKind::Error, extension_id, json!({ "message": message }));
        match correlation_id {
            Some(id) => envelope.correlated(id),
            None => envelope,
        }
    }

    pub fn log(extension_id: &str, level: LogLevel, message: &str) -> Self {
        Self::new(
            MessageKind::Log,
            extension_id,
            json!({ "level": level, "message": message }),
        )
    }

    pub fn register_manifest(extension_id: &str, name: Option<&str>, triggers: &[String]) -> Self {
        Self::new(
            MessageKind::RegisterManifest,
            extension_id,
            json!({ "name": name, "triggers": triggers }),
        )
    }

    /// Serialize as one line, newline included.
    pub fn encode(&self) -> OrbitResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (trailing newline allowed).
    pub fn decode(line: &str) -> OrbitResult<Self> {
        if line.len() > MAX_MESSAGE_BYTES {
            return Err(OrbitError::protocol(
                None,
                format!("message of {} bytes exceeds limit", line.len()),
            ));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Auth token of a `Connect` envelope.
    pub fn token(&self) -> Option<&str> {
        self.payload.get("token").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Result item as sent by an extension; the host fills in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionResultItem {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub action: ResultAction,
}

impl ExtensionResultItem {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            icon: None,
            action: ResultAction::None,
        }
    }

    pub fn into_item(self, extension_id: &str) -> ResultItem {
        ResultItem {
            source: ProviderId::Extension(extension_id.to_string()),
            title: self.title,
            description: self.description,
            icon: self.icon,
            action: self.action,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    #[serde(default)]
    name: Option<String>,
    triggers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogPayload {
    level: LogLevel,
    message: String,
}

/// Extension-to-host messages after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    RegisterManifest {
        name: Option<String>,
        triggers: Vec<String>,
    },
    QueryResult {
        correlation_id: CorrelationId,
        items: Vec<ResultItem>,
    },
    Error {
        correlation_id: Option<CorrelationId>,
        message: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

impl Inbound {
    /// Interpret an envelope received from an authenticated extension.
    pub fn parse(envelope: Envelope) -> Result<Self, String> {
        match envelope.kind {
            MessageKind::RegisterManifest => {
                let payload: RegisterPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| format!("invalid RegisterManifest payload: {}", e))?;
                Ok(Inbound::RegisterManifest {
                    name: payload.name,
                    triggers: payload.triggers,
                })
            }
            MessageKind::QueryResult => {
                let correlation_id = envelope
                    .correlation_id
                    .ok_or_else(|| "QueryResult without correlationId".to_string())?;
                let items: Vec<ExtensionResultItem> = serde_json::from_value(envelope.payload)
                    .map_err(|e| format!("invalid QueryResult payload: {}", e))?;
                Ok(Inbound::QueryResult {
                    correlation_id,
                    items: items
                        .into_iter()
                        .map(|item| item.into_item(&envelope.extension_id))
                        .collect(),
                })
            }
            MessageKind::Error => {
                let payload: ErrorPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| format!("invalid Error payload: {}", e))?;
                Ok(Inbound::Error {
                    correlation_id: envelope.correlation_id,
                    message: payload.message,
                })
            }
            MessageKind::Log => {
                let payload: LogPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| format!("invalid Log payload: {}", e))?;
                Ok(Inbound::Log {
                    level: payload.level,
                    message: payload.message,
                })
            }
            other => Err(format!("unexpected {:?} from extension", other)),
        }
    }
}

/// Host-to-extension messages, as seen by an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    Query {
        correlation_id: CorrelationId,
        query: String,
    },
    Shutdown,
}

impl HostMessage {
    pub fn parse(envelope: Envelope) -> Result<Self, String> {
        match envelope.kind {
            MessageKind::Query => {
                let correlation_id = envelope
                    .correlation_id
                    .ok_or_else(|| "Query without correlationId".to_string())?;
                let query = envelope
                    .payload
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "Query without query text".to_string())?
                    .to_string();
                Ok(HostMessage::Query {
                    correlation_id,
                    query,
                })
            }
            MessageKind::Shutdown => Ok(HostMessage::Shutdown),
            other => Err(format!("unexpected {:?} from host", other)),
        }
    }
}
