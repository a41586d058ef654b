//! Transport Layer
//!
//! Responsibilities:
//! - Raw TCP connections and listeners
//! - The client side of the line protocol towards upstream nodes
//!
//! Nothing here knows about routing or queueing; an [`Upstream`] only submits,
//! polls, downloads and purges single requests at a given address.

mod arclink;
#[cfg(test)]
pub mod mock;
mod tcp;

pub use arclink::{ArclinkClient, ClientSettings};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::common::{Address, Result, Stream};
use crate::request::{Request, RequestStatus, SentRequest, Ticket};

/// Transport trait for establishing raw connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;

    /// Create a listener bound to an address
    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>>;
}

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<(Stream, Address)>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;
}

/// Identity sub-requests are submitted under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub user_ip: Option<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            user_ip: None,
        }
    }
}

/// Writer a download is streamed into
pub type Sink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Client for upstream nodes
///
/// Every call is bounded by the implementation's socket timeout; failures are
/// reported as `Error::Transport` or `Error::Timeout`.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Submit a request to the node at `address`
    async fn submit(&self, address: &str, caller: &Caller, request: &Request) -> Result<SentRequest>;

    /// Fetch the current status
    async fn status(&self, ticket: &Ticket) -> Result<RequestStatus>;

    /// Wait until the node reports the request ready and return that status
    async fn wait(&self, ticket: &Ticket) -> Result<RequestStatus>;

    /// Stream one volume, or the whole request, into `sink`; returns the byte count
    async fn download(&self, ticket: &Ticket, volume: Option<&str>, sink: Sink<'_>) -> Result<u64>;

    /// Delete the request on the node
    async fn purge(&self, ticket: &Ticket) -> Result<()>;
}
