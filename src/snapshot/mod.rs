//! Inventory and routing snapshots
//!
//! Responsibilities:
//! - Read-only views of known streams and of the nodes serving them
//! - Fetched fresh for every top-level request, never cached or persisted
//!
//! The producer of the snapshots is external; this module only consumes them
//! through [`SnapshotSource`].

pub mod inventory;
pub mod routing;

pub use inventory::Inventory;
pub use routing::{Destination, Route, RouteEntry, Routing};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::request::Request;

/// Source of snapshots for one top-level request
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Inventory covering at least the request's lines
    async fn inventory(&self, request: &Request) -> Result<Arc<Inventory>>;

    /// Routing covering at least the request's lines
    async fn routing(&self, request: &Request) -> Result<Arc<Routing>>;
}

/// Snapshots read from JSON files on every call
///
/// An unset path yields an empty snapshot.
pub struct FileSnapshotSource {
    inventory_file: Option<PathBuf>,
    routing_file: Option<PathBuf>,
}

impl FileSnapshotSource {
    pub fn new(inventory_file: Option<PathBuf>, routing_file: Option<PathBuf>) -> Self {
        Self {
            inventory_file,
            routing_file,
        }
    }

    async fn load<T: DeserializeOwned + Default>(path: Option<&Path>, what: &str) -> Result<T> {
        let Some(path) = path else {
            return Ok(T::default());
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} snapshot {} not found, using empty snapshot", what, path.display());
                return Ok(T::default());
            }
            Err(e) => {
                return Err(Error::Routing(format!(
                    "error reading {} snapshot {}: {}",
                    what,
                    path.display(),
                    e
                )))
            }
        };

        debug!("Loaded {} snapshot from {}", what, path.display());
        serde_json::from_str(&content).map_err(|e| {
            Error::Routing(format!("error parsing {} snapshot {}: {}", what, path.display(), e))
        })
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    async fn inventory(&self, _request: &Request) -> Result<Arc<Inventory>> {
        Self::load(self.inventory_file.as_deref(), "inventory")
            .await
            .map(Arc::new)
    }

    async fn routing(&self, _request: &Request) -> Result<Arc<Routing>> {
        Self::load(self.routing_file.as_deref(), "routing")
            .await
            .map(Arc::new)
    }
}

/// Fixed snapshots held in memory
#[derive(Default)]
pub struct StaticSnapshotSource {
    inventory: Arc<Inventory>,
    routing: Arc<Routing>,
}

impl StaticSnapshotSource {
    pub fn new(inventory: Inventory, routing: Routing) -> Self {
        Self {
            inventory: Arc::new(inventory),
            routing: Arc::new(routing),
        }
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn inventory(&self, _request: &Request) -> Result<Arc<Inventory>> {
        Ok(Arc::clone(&self.inventory))
    }

    async fn routing(&self, _request: &Request) -> Result<Arc<Routing>> {
        Ok(Arc::clone(&self.routing))
    }
}
