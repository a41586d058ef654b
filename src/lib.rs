//! arcproxy - routing proxy for federated archive requests
//!
//! # Architecture
//!
//! ```text
//! client ─ Session ─ RequestContainer ─ RequestProxy ─ Router ─ Upstream nodes
//!                                            └──── LocalStore
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, timestamps
//! ├── request/         # Request lines, templates, status documents
//! ├── snapshot/        # Inventory and routing snapshots
//! ├── transport/       # TCP transport and the upstream node client
//! ├── local/           # Local SDS archive
//! ├── router/          # Expansion, route resolution, sharded execution
//! ├── protocol/        # Client command parsing
//! ├── session/         # Per-connection state machine
//! └── app/             # Proxy, container, context, runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;
pub mod request;

// Layered architecture
pub mod snapshot;
pub mod transport;
pub mod local;
pub mod router;
pub mod protocol;
pub mod session;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Stream};
pub use config::Config;
pub use error::{Error, Result};

pub use app::{RequestContainer, RequestProxy, Runtime, ServerContext};
pub use request::{Request, RequestLine, RequestTemplate, RequestType};
pub use router::Router;
pub use session::Session;
pub use transport::{Transport, Upstream};
