//! Query text split into keyword and argument.

use serde::Serialize;

/// A user query as typed into the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    /// The full query text, leading whitespace removed
    raw: String,
    /// First whitespace-delimited token
    keyword: String,
    /// Text after the keyword (if any)
    argument: Option<String>,
}

impl Query {
    pub fn new(text: &str) -> Self {
        let raw = text.trim_start().to_string();
        let (keyword, argument) = match raw.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (
                keyword.to_string(),
                Some(rest.to_string()).filter(|rest| !rest.is_empty()),
            ),
            None => (raw.clone(), None),
        };

        Self {
            raw,
            keyword,
            argument,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}
