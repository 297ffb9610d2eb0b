//! Per-session result collection.
//!
//! The aggregator owns the current [`Dispatch`] of every session. Built-in
//! results land at dispatch creation; extension results arrive later by
//! correlation id. Each dispatch ends with exactly one terminal event:
//! `Complete` once nothing is pending or its deadline passes, or
//! `Superseded` when a newer dispatch replaces it.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::OrbitError;

use super::result::{CorrelationId, ProviderId, ResultItem};

/// Identifies an independent query stream (one launcher input box).
pub type SessionId = u64;

/// Session used by [`HostHandle::dispatch_query`](crate::host::HostHandle::dispatch_query).
pub const DEFAULT_SESSION: SessionId = 0;

/// Events observed by the consumer of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// One provider's results, in arrival order.
    Batch {
        provider: ProviderId,
        items: Vec<ResultItem>,
    },
    /// Final merged results. `timed_out` lists providers that never answered.
    Complete {
        items: Vec<ResultItem>,
        timed_out: Vec<ProviderId>,
    },
    /// A newer dispatch for the same session replaced this one.
    Superseded,
}

impl DispatchEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchEvent::Batch { .. })
    }
}

/// Receiving end of a dispatch's events.
#[derive(Debug)]
pub struct DispatchStream {
    correlation_id: CorrelationId,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl DispatchStream {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Next event, or `None` after the terminal event has been consumed.
    pub async fn next(&mut self) -> Option<DispatchEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal event. Returns the merged items, or `None` when
    /// the dispatch was superseded or the host went away.
    pub async fn finished(mut self) -> Option<Vec<ResultItem>> {
        while let Some(event) = self.next().await {
            match event {
                DispatchEvent::Batch { .. } => continue,
                DispatchEvent::Complete { items, .. } => return Some(items),
                DispatchEvent::Superseded => return None,
            }
        }
        None
    }
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Answered(Vec<ResultItem>),
}

#[derive(Debug)]
struct Slot {
    provider: ProviderId,
    state: SlotState,
}

/// One in-flight fan-out of a query.
#[derive(Debug)]
pub struct Dispatch {
    correlation_id: CorrelationId,
    /// Built-ins first, then extensions in the order they were asked
    slots: Vec<Slot>,
}

impl Dispatch {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            slots: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Record results that are already available.
    pub fn push_ready(&mut self, provider: ProviderId, items: Vec<ResultItem>) {
        self.slots.push(Slot {
            provider,
            state: SlotState::Answered(items),
        });
    }

    /// Record a provider whose results will arrive later.
    pub fn push_pending(&mut self, provider: ProviderId) {
        self.slots.push(Slot {
            provider,
            state: SlotState::Pending,
        });
    }

    /// Providers that have not answered yet.
    pub fn pending(&self) -> Vec<ProviderId> {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Pending))
            .map(|slot| slot.provider.clone())
            .collect()
    }

    pub fn is_settled(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| matches!(slot.state, SlotState::Answered(_)))
    }

    fn is_pending(&self, provider: &ProviderId) -> bool {
        self.slots
            .iter()
            .any(|slot| &slot.provider == provider && matches!(slot.state, SlotState::Pending))
    }

    /// Answer the first pending slot for `provider`.
    fn answer(&mut self, provider: &ProviderId, items: Vec<ResultItem>) -> bool {
        match self
            .slots
            .iter_mut()
            .find(|slot| &slot.provider == provider && matches!(slot.state, SlotState::Pending))
        {
            Some(slot) => {
                slot.state = SlotState::Answered(items);
                true
            }
            None => false,
        }
    }

    fn merged(&self, max_results: usize) -> Vec<ResultItem> {
        self.slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Answered(items) => Some(items.iter().cloned()),
                SlotState::Pending => None,
            })
            .flatten()
            .take(max_results)
            .collect()
    }
}

struct Active {
    dispatch: Dispatch,
    sink: mpsc::UnboundedSender<DispatchEvent>,
}

impl Active {
    fn emit(&self, event: DispatchEvent) {
        // The consumer may have dropped its stream; that is not an error here
        let _ = self.sink.send(event);
    }
}

/// Collects provider results into the current dispatch of each session.
pub struct ResultAggregator {
    max_results: usize,
    sessions: HashMap<SessionId, Active>,
}

impl ResultAggregator {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            sessions: HashMap::new(),
        }
    }

    /// Make `dispatch` current for `session`, superseding any previous one.
    ///
    /// Ready results are emitted as batches immediately; a dispatch with
    /// nothing pending completes on the spot.
    pub fn begin(&mut self, session: SessionId, dispatch: Dispatch) -> DispatchStream {
        let (sink, events) = mpsc::unbounded_channel();
        let stream = DispatchStream {
            correlation_id: dispatch.correlation_id.clone(),
            events,
        };
        let active = Active { dispatch, sink };

        for slot in &active.dispatch.slots {
            if let SlotState::Answered(items) = &slot.state {
                active.emit(DispatchEvent::Batch {
                    provider: slot.provider.clone(),
                    items: items.clone(),
                });
            }
        }

        if let Some(previous) = self.sessions.insert(session, active) {
            tracing::debug!(
                session,
                correlation_id = %previous.dispatch.correlation_id,
                "Dispatch superseded"
            );
            previous.emit(DispatchEvent::Superseded);
        }

        self.finish_if_settled(session);
        stream
    }

    /// Correlation id of the session's current dispatch.
    pub fn current(&self, session: SessionId) -> Option<&CorrelationId> {
        self.sessions
            .get(&session)
            .map(|active| &active.dispatch.correlation_id)
    }

    /// Number of dispatches still waiting on providers.
    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }

    /// Attribute `items` from `provider` to the dispatch `correlation_id`.
    ///
    /// Returns `false` (and drops the items) when the dispatch is no longer
    /// current or never asked this provider.
    pub fn accept(
        &mut self,
        correlation_id: &CorrelationId,
        provider: &ProviderId,
        items: Vec<ResultItem>,
    ) -> bool {
        let Some(session) = self.session_of(correlation_id) else {
            tracing::debug!(%correlation_id, %provider, "Dropping results for stale dispatch");
            return false;
        };
        let Some(active) = self.sessions.get_mut(&session) else {
            return false;
        };

        if !active.dispatch.answer(provider, items.clone()) {
            tracing::debug!(%correlation_id, %provider, "Dropping results from provider that was not asked");
            return false;
        }

        active.emit(DispatchEvent::Batch {
            provider: provider.clone(),
            items,
        });
        self.finish_if_settled(session);
        true
    }

    /// Resolve `provider`'s slot in `correlation_id` with no results.
    pub fn provider_failed(&mut self, correlation_id: &CorrelationId, provider: &ProviderId) -> bool {
        let Some(session) = self.session_of(correlation_id) else {
            return false;
        };
        let resolved = self
            .sessions
            .get_mut(&session)
            .is_some_and(|active| active.dispatch.answer(provider, Vec::new()));
        if resolved {
            self.finish_if_settled(session);
        }
        resolved
    }

    /// Resolve every pending slot of `provider`, e.g. after its process
    /// crashed. Returns the number of slots resolved.
    pub fn abandon_provider(&mut self, provider: &ProviderId) -> usize {
        let sessions: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, active)| active.dispatch.is_pending(provider))
            .map(|(session, _)| *session)
            .collect();

        for session in &sessions {
            if let Some(active) = self.sessions.get_mut(session) {
                while active.dispatch.answer(provider, Vec::new()) {}
            }
            self.finish_if_settled(*session);
        }
        sessions.len()
    }

    /// The deadline of `correlation_id` passed. Completes it with whatever
    /// arrived; returns `false` if it had already finished.
    pub fn on_deadline(&mut self, correlation_id: &CorrelationId) -> bool {
        match self.session_of(correlation_id) {
            Some(session) => {
                self.finish(session);
                true
            }
            None => false,
        }
    }

    /// Supersede every in-flight dispatch, e.g. on shutdown.
    pub fn clear(&mut self) {
        for (_, active) in self.sessions.drain() {
            active.emit(DispatchEvent::Superseded);
        }
    }

    fn session_of(&self, correlation_id: &CorrelationId) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, active)| &active.dispatch.correlation_id == correlation_id)
            .map(|(session, _)| *session)
    }

    fn finish_if_settled(&mut self, session: SessionId) {
        if self
            .sessions
            .get(&session)
            .is_some_and(|active| active.dispatch.is_settled())
        {
            self.finish(session);
        }
    }

    fn finish(&mut self, session: SessionId) {
        let Some(active) = self.sessions.remove(&session) else {
            return;
        };

        let timed_out = active.dispatch.pending();
        if !timed_out.is_empty() {
            let err = OrbitError::DispatchTimeout {
                correlation_id: active.dispatch.correlation_id.clone(),
                pending: timed_out.clone(),
            };
            tracing::debug!("{}", err);
        }

        let items = active.dispatch.merged(self.max_results);
        tracing::debug!(
            correlation_id = %active.dispatch.correlation_id,
            results = items.len(),
            "Dispatch complete"
        );
        active.emit(DispatchEvent::Complete { items, timed_out });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResultAction;

    fn item(source: &ProviderId, title: &str) -> ResultItem {
        ResultItem {
            source: source.clone(),
            title: title.to_string(),
            description: None,
            icon: None,
            action: ResultAction::None,
        }
    }

    fn ext(id: &str) -> ProviderId {
        ProviderId::Extension(id.to_string())
    }

    fn dispatch(id: &str, pending: &[&str]) -> Dispatch {
        let mut dispatch = Dispatch::new(CorrelationId::from(id));
        for provider in pending {
            dispatch.push_pending(ext(provider));
        }
        dispatch
    }

    fn drain(stream: &mut DispatchStream) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = stream.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_zero_providers_completes_immediately() {
        let mut aggregator = ResultAggregator::new(20);
        let mut stream = aggregator.begin(DEFAULT_SESSION, dispatch("C1", &[]));
        assert_eq!(
            drain(&mut stream),
            vec![DispatchEvent::Complete {
                items: vec![],
                timed_out: vec![]
            }]
        );
        assert_eq!(aggregator.in_flight(), 0);
    }

    #[test]
    fn test_single_result_completes() {
        let mut aggregator = ResultAggregator::new(20);
        let mut stream = aggregator.begin(DEFAULT_SESSION, dispatch("C1", &["weather"]));
        assert!(drain(&mut stream).is_empty());

        let weather = ext("weather");
        let oslo = item(&weather, "Oslo: 14°C");
        assert!(aggregator.accept(&"C1".into(), &weather, vec![oslo.clone()]));

        assert_eq!(
            drain(&mut stream),
            vec![
                DispatchEvent::Batch {
                    provider: weather.clone(),
                    items: vec![oslo.clone()]
                },
                DispatchEvent::Complete {
                    items: vec![oslo],
                    timed_out: vec![]
                }
            ]
        );
    }

    #[test]
    fn test_superseded_dispatch_drops_late_results() {
        let mut aggregator = ResultAggregator::new(20);
        let weather = ext("weather");
        let mut first = aggregator.begin(DEFAULT_SESSION, dispatch("C1", &["weather"]));
        let mut second = aggregator.begin(DEFAULT_SESSION, dispatch("C2", &["weather"]));

        assert_eq!(drain(&mut first), vec![DispatchEvent::Superseded]);
        assert!(!aggregator.accept(&"C1".into(), &weather, vec![item(&weather, "late")]));
        assert!(drain(&mut second).is_empty());

        assert!(aggregator.accept(&"C2".into(), &weather, vec![item(&weather, "fresh")]));
        let events = drain(&mut second);
        let titles: Vec<_> = events
            .iter()
            .flat_map(|event| match event {
                DispatchEvent::Batch { items, .. } | DispatchEvent::Complete { items, .. } => {
                    items.iter().map(|i| i.title.clone()).collect::<Vec<_>>()
                }
                DispatchEvent::Superseded => vec![],
            })
            .collect();
        assert!(titles.iter().all(|title| title == "fresh"));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut aggregator = ResultAggregator::new(20);
        let mut first = aggregator.begin(1, dispatch("C1", &["weather"]));
        let _second = aggregator.begin(2, dispatch("C2", &["weather"]));
        assert!(drain(&mut first).is_empty());
        assert_eq!(aggregator.in_flight(), 2);
        assert_eq!(aggregator.current(1), Some(&CorrelationId::from("C1")));
    }

    #[test]
    fn test_unasked_provider_is_dropped() {
        let mut aggregator = ResultAggregator::new(20);
        let notes = ext("notes");
        let _stream = aggregator.begin(DEFAULT_SESSION, dispatch("C1", &["weather"]));
        assert!(!aggregator.accept(&"C1".into(), &notes, vec![item(&notes, "x")]));
        assert_eq!(aggregator.in_flight(), 1);
    }

    #[test]
    fn test_deadline_completes_with_partial_results() {
        let mut aggregator = ResultAggregator::new(20);
        let weather = ext("weather");
        let mut stream =
            aggregator.begin(DEFAULT_SESSION, dispatch("C1", &["weather", "forecast"]));
        aggregator.accept(&"C1".into(), &weather, vec![item(&weather, "Oslo")]);

        assert!(aggregator.on_deadline(&"C1".into()));
        let events = drain(&mut stream);
        assert_eq!(
            events.last(),
            Some(&DispatchEvent::Complete {
                items: vec![item(&weather, "Oslo")],
                timed_out: vec![ext("forecast")]
            })
        );

        // Already finished
        assert!(!aggregator.on_deadline(&"C1".into()));
    }

    #[test]
    fn test_abandon_provider_resolves_early() {
        let mut aggregator = ResultAggregator::new(20);
        let mut stream = aggregator.begin(DEFAULT_SESSION, dispatch("C1", &["weather"]));
        assert_eq!(aggregator.abandon_provider(&ext("weather")), 1);
        assert_eq!(
            drain(&mut stream),
            vec![DispatchEvent::Complete {
                items: vec![],
                timed_out: vec![]
            }]
        );
    }

    #[test]
    fn test_provider_failed_resolves_slot() {
        let mut aggregator = ResultAggregator::new(20);
        let mut stream = aggregator.begin(DEFAULT_SESSION, dispatch("C1", &["weather"]));
        assert!(aggregator.provider_failed(&"C1".into(), &ext("weather")));
        assert!(matches!(
            drain(&mut stream).as_slice(),
            [DispatchEvent::Complete { .. }]
        ));
    }

    #[tokio::test]
    async fn test_merge_order_and_cap() {
        let mut aggregator = ResultAggregator::new(3);
        let shortcut = ProviderId::Shortcut("g".into());
        let (first, second) = (ext("first"), ext("second"));

        let mut d = dispatch("C1", &[]);
        d.push_ready(shortcut.clone(), vec![item(&shortcut, "s")]);
        d.push_pending(first.clone());
        d.push_pending(second.clone());
        let stream = aggregator.begin(DEFAULT_SESSION, d);

        // Second answers before first; merge still follows dispatch order
        aggregator.accept(
            &"C1".into(),
            &second,
            vec![item(&second, "b1"), item(&second, "b2")],
        );
        aggregator.accept(&"C1".into(), &first, vec![item(&first, "a1")]);

        let items = stream.finished().await.unwrap();
        let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["s", "a1", "b1"]);
    }
}
