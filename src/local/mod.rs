//! Local store
//!
//! Responsibilities:
//! - Decide whether a waveform line can be served without routing it
//! - Read the bytes for such a line
//!
//! Data is opaque; a store hands out whole files (or other units) as they are
//! stored and never re-encodes them.

#[cfg(test)]
pub mod memory;
mod sds;

pub use sds::SdsArchive;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::common::Result;
use crate::request::RequestLine;

/// One stored unit, open for reading
pub struct LocalUnit {
    /// Exact number of bytes `reader` yields
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
}

/// Archive readable by this process
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Whether the store holds the data for the whole line
    async fn exists(&self, line: &RequestLine) -> bool;

    /// Keys of the units holding the line's data, in order. Nothing is read yet.
    async fn units(&self, line: &RequestLine) -> Result<Vec<String>>;

    /// Open a unit named by [`LocalStore::units`]
    async fn open(&self, unit: &str) -> Result<LocalUnit>;
}
