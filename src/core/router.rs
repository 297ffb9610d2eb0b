//! Query routing.
//!
//! Resolves a query to the providers that claim it, asks each of them, and
//! registers the resulting [`Dispatch`] with the aggregator. Extension
//! requests are fire-and-forget; their answers reach the aggregator through
//! the control loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::extensions::{ConnectionState, ExtensionRegistry};
use crate::ipc::QueryTransport;
use crate::services::ShortcutProvider;

use super::aggregator::{Dispatch, DispatchStream, ResultAggregator, SessionId};
use super::provider::{resolve_claims, Provider, ProviderResponse, RequestContext};
use super::query::Query;
use super::result::CorrelationId;

pub struct QueryRouter {
    shortcuts: Vec<ShortcutProvider>,
    deadline: Duration,
    next_correlation: u64,
    /// Receives the correlation id of each dispatch whose deadline passed
    deadlines: mpsc::UnboundedSender<CorrelationId>,
}

impl QueryRouter {
    pub fn new(
        shortcuts: Vec<ShortcutProvider>,
        deadline: Duration,
        deadlines: mpsc::UnboundedSender<CorrelationId>,
    ) -> Self {
        Self {
            shortcuts,
            deadline,
            next_correlation: 0,
            deadlines,
        }
    }

    pub fn shortcuts(&self) -> &[ShortcutProvider] {
        &self.shortcuts
    }

    fn next_correlation_id(&mut self) -> CorrelationId {
        self.next_correlation += 1;
        CorrelationId::from(format!("C{}", self.next_correlation))
    }

    /// Candidate providers for `query`: every shortcut in declaration order,
    /// then extensions whose triggers match, skipping disabled ones.
    pub fn candidates<'a>(
        &'a self,
        query: &Query,
        registry: &'a ExtensionRegistry,
    ) -> Vec<Provider<'a>> {
        let extensions = registry
            .find_by_keyword(query.raw())
            .into_iter()
            .filter_map(|id| registry.get(&id))
            .filter(|entry| entry.state != ConnectionState::Disabled)
            .map(|entry| Provider::Extension(&entry.manifest));

        self.shortcuts
            .iter()
            .map(Provider::Shortcut)
            .chain(extensions)
            .collect()
    }

    /// Fan `query` out to its providers and make the new dispatch current
    /// for `session`.
    pub fn dispatch(
        &mut self,
        session: SessionId,
        query: Query,
        registry: &ExtensionRegistry,
        transport: &mut impl QueryTransport,
        aggregator: &mut ResultAggregator,
    ) -> DispatchStream {
        let correlation_id = self.next_correlation_id();
        let deadline = Instant::now() + self.deadline;
        let mut dispatch = Dispatch::new(correlation_id.clone());

        let providers = self.candidates(&query, registry);
        let mut ctx = RequestContext {
            correlation_id: &correlation_id,
            transport,
        };
        for (provider, claim) in resolve_claims(&providers, &query) {
            match provider.request(&query, &claim, &mut ctx) {
                ProviderResponse::Ready(items) => dispatch.push_ready(provider.id(), items),
                ProviderResponse::Awaiting => dispatch.push_pending(provider.id()),
                ProviderResponse::Unavailable(e) => {
                    tracing::warn!(provider = %provider.id(), "Skipping provider: {}", e)
                }
            }
        }

        tracing::debug!(
            session,
            correlation_id = %correlation_id,
            pending = dispatch.pending().len(),
            "Dispatching query"
        );

        let waiting = !dispatch.is_settled();
        let stream = aggregator.begin(session, dispatch);
        if waiting {
            self.arm_deadline(correlation_id, deadline);
        }
        stream
    }

    fn arm_deadline(&self, correlation_id: CorrelationId, deadline: Instant) {
        let deadlines = self.deadlines.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = deadlines.send(correlation_id);
        });
    }
}
