//! Application Layer
//!
//! This module contains:
//! - RequestProxy: one client request, its execution and its downloads
//! - RequestContainer: queue, quotas, dispatcher loop and persistence
//! - ServerContext: collaborators shared by every session
//! - Runtime: listener and lifecycle
//! - Metrics: Prometheus counters and the stats summary

mod container;
mod context;
pub mod metrics;
mod proxy;
mod runtime;

pub use container::{ContainerSettings, ContainerSnapshot, RequestContainer};
pub use context::{ServerContext, SessionGuard};
pub use proxy::{
    NewRequest, ProxyDeps, ProxyOptions, ProxySnapshot, RequestProxy, UsageGuard, LOCAL_VOLUME,
};
pub use runtime::Runtime;

#[cfg(test)]
pub(crate) use proxy::testing;
