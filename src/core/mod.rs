//! Core engine module - query routing and result aggregation.
//!
//! Nothing in here touches sockets or processes directly:
//! - Query parsing and result types
//! - The provider contract and keyword matching policy
//! - The router that fans a query out to providers
//! - The aggregator that collects answers per dispatch

pub mod aggregator;
pub mod provider;
pub mod query;
pub mod result;
pub mod router;

pub use aggregator::{
    Dispatch, DispatchEvent, DispatchStream, ResultAggregator, SessionId, DEFAULT_SESSION,
};
pub use provider::{resolve_claims, Claim, MatchPolicy, Provider, ProviderResponse, RequestContext};
pub use query::Query;
pub use result::{CorrelationId, ProviderId, ResultAction, ResultItem};
pub use router::QueryRouter;
