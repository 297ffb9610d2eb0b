//! Providers and the keyword matching policy they share.
//!
//! Built-in shortcuts and extensions are both [`Provider`]s. The router never
//! inspects which kind it holds beyond calling [`Provider::policy`] and
//! [`Provider::request`].

use crate::error::OrbitError;
use crate::extensions::ExtensionManifest;
use crate::ipc::{Envelope, QueryTransport};
use crate::services::ShortcutProvider;

use super::query::Query;
use super::result::{CorrelationId, ProviderId, ResultItem};

/// How a provider claimed a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The keyword matched a trigger; the remainder (if any) is the argument.
    Keyword { argument: Option<String> },
    /// The keyword matched a provider that ignores arguments.
    Static,
    /// No keyword provider claimed the query; the whole text is the argument.
    DefaultSearch { argument: String },
}

/// Matching rules for one provider.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy<'a> {
    pub triggers: &'a [String],
    pub run_without_argument: bool,
    pub default_search: bool,
}

impl MatchPolicy<'_> {
    /// Claim by exact keyword match.
    pub fn keyword_claim(&self, query: &Query) -> Option<Claim> {
        if query.is_empty() || !self.triggers.iter().any(|t| t == query.keyword()) {
            return None;
        }

        if self.run_without_argument {
            Some(Claim::Static)
        } else {
            Some(Claim::Keyword {
                argument: query.argument().map(str::to_string),
            })
        }
    }

    /// Claim as a default search. Only consulted when nothing claimed the
    /// query by keyword.
    pub fn fallback_claim(&self, query: &Query) -> Option<Claim> {
        if !self.default_search || query.is_empty() {
            return None;
        }

        if self.run_without_argument {
            Some(Claim::Static)
        } else {
            Some(Claim::DefaultSearch {
                argument: query.raw().to_string(),
            })
        }
    }
}

/// Outcome of asking a provider for results.
#[derive(Debug)]
pub enum ProviderResponse {
    /// Results are available right away.
    Ready(Vec<ResultItem>),
    /// The request was sent; results arrive later by correlation id.
    Awaiting,
    /// The provider could not be asked.
    Unavailable(OrbitError),
}

/// What a provider needs to answer one dispatch.
pub struct RequestContext<'a> {
    pub correlation_id: &'a CorrelationId,
    pub transport: &'a mut dyn QueryTransport,
}

/// A source of results: a built-in shortcut or an extension process.
#[derive(Debug, Clone, Copy)]
pub enum Provider<'a> {
    Shortcut(&'a ShortcutProvider),
    Extension(&'a ExtensionManifest),
}

impl<'a> Provider<'a> {
    pub fn id(&self) -> ProviderId {
        match self {
            Provider::Shortcut(shortcut) => ProviderId::Shortcut(shortcut.keyword().to_string()),
            Provider::Extension(manifest) => ProviderId::Extension(manifest.id.clone()),
        }
    }

    pub fn policy(&self) -> MatchPolicy<'a> {
        match *self {
            Provider::Shortcut(shortcut) => shortcut.policy(),
            Provider::Extension(manifest) => MatchPolicy {
                triggers: &manifest.triggers,
                run_without_argument: false,
                default_search: false,
            },
        }
    }

    /// Ask the provider for results matching `query` under `claim`.
    pub fn request(
        &self,
        query: &Query,
        claim: &Claim,
        ctx: &mut RequestContext<'_>,
    ) -> ProviderResponse {
        match self {
            Provider::Shortcut(shortcut) => ProviderResponse::Ready(vec![shortcut.respond(query, claim)]),
            Provider::Extension(manifest) => {
                let envelope = Envelope::query(&manifest.id, ctx.correlation_id, query);
                match ctx.transport.send(&manifest.id, envelope) {
                    Ok(()) => ProviderResponse::Awaiting,
                    Err(e) => ProviderResponse::Unavailable(e),
                }
            }
        }
    }
}

/// Resolve which providers claim `query`, in provider order.
///
/// Exact keyword claims win. Default-search fallbacks are considered only
/// when no provider claimed the keyword. An empty query claims nothing.
pub fn resolve_claims<'a>(providers: &[Provider<'a>], query: &Query) -> Vec<(Provider<'a>, Claim)> {
    if query.is_empty() {
        return Vec::new();
    }

    let keyword: Vec<_> = providers
        .iter()
        .filter_map(|p| p.policy().keyword_claim(query).map(|claim| (*p, claim)))
        .collect();
    if !keyword.is_empty() {
        return keyword;
    }

    providers
        .iter()
        .filter_map(|p| p.policy().fallback_claim(query).map(|claim| (*p, claim)))
        .collect()
}
