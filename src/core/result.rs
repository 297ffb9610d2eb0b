//! Result values produced by providers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::extensions::ExtensionId;

/// Identifies who produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ProviderId {
    /// A built-in shortcut, identified by its keyword
    Shortcut(String),
    /// An external extension process
    Extension(ExtensionId),
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderId::Shortcut(keyword) => write!(f, "shortcut:{}", keyword),
            ProviderId::Extension(id) => write!(f, "extension:{}", id),
        }
    }
}

/// Correlates a dispatched query with the results that answer it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        CorrelationId(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        CorrelationId(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Action to perform when selecting a result
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResultAction {
    /// Open a URL in the default handler
    Open { url: String },
    /// Copy text to the clipboard
    Copy { text: String },
    /// Run a program with an optional argument
    Run {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argument: Option<String>,
    },
    /// Replace the launcher input with `query`
    SetQuery { query: String },
    #[default]
    #[serde(other)]
    None,
}

/// A single ranked result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultItem {
    pub source: ProviderId,
    pub title: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub action: ResultAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_display() {
        assert_eq!(ProviderId::Shortcut("kw".into()).to_string(), "shortcut:kw");
        assert_eq!(
            ProviderId::Extension("weather".into()).to_string(),
            "extension:weather"
        );
    }

    #[test]
    fn test_action_wire_format() {
        let action: ResultAction =
            serde_json::from_str(r#"{"type": "open", "url": "https://example.com"}"#).unwrap();
        assert_eq!(
            action,
            ResultAction::Open {
                url: "https://example.com".into()
            }
        );

        let action: ResultAction =
            serde_json::from_str(r#"{"type": "setQuery", "query": "kw "}"#).unwrap();
        assert_eq!(action, ResultAction::SetQuery { query: "kw ".into() });

        // Unknown action types degrade to no action
        let action: ResultAction = serde_json::from_str(r#"{"type": "teleport"}"#).unwrap();
        assert_eq!(action, ResultAction::None);
    }
}
