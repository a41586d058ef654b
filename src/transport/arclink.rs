//! Upstream client speaking the line protocol
//!
//! One short-lived connection per operation: `HELLO`, `USER`, optional
//! `USER_IP`, the command itself, then `BYE`. Waiting for a request polls
//! `STATUS`, so no connection is held open between operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::common::{Address, Result, Stream};
use crate::error::Error;
use crate::request::status::parse_status_document;
use crate::request::{Request, RequestStatus, SentRequest, Ticket};

use super::{Caller, Sink, Transport, Upstream};

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Bound on every single read, write and connect
    pub socket_timeout: Duration,
    /// How long one wait round may take
    pub request_timeout: Duration,
    /// Extra wait rounds before giving up, and failed status polls tolerated in a row
    pub download_retries: u32,
    pub poll_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(300),
            download_retries: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

pub struct ArclinkClient {
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
}

impl ArclinkClient {
    pub fn new(transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    async fn connect(&self, address: &str, user: &str, user_ip: Option<&str>) -> Result<Connection> {
        let addr = Address::parse(address)
            .map_err(|_| Error::Transport(format!("invalid node address: {}", address)))?;
        let stream = self.transport.connect(&addr).await?;
        Connection::open(stream, address, user, user_ip, self.settings.socket_timeout).await
    }

    async fn connect_ticket(&self, ticket: &Ticket) -> Result<Connection> {
        self.connect(&ticket.address, &ticket.user, ticket.user_ip.as_deref())
            .await
    }
}

#[async_trait]
impl Upstream for ArclinkClient {
    async fn submit(&self, address: &str, caller: &Caller, request: &Request) -> Result<SentRequest> {
        let mut conn = self.connect(address, &caller.user, caller.user_ip.as_deref()).await?;

        let wire = request.to_wire();
        let header = wire.len() - request.len() - 1;
        for line in &wire[..header] {
            conn.expect_ok(line).await?;
        }
        for line in &wire[header..wire.len() - 1] {
            conn.send(line).await?;
        }
        conn.send("END").await?;

        let reply = conn.read_line().await?;
        if reply.starts_with("ERROR") {
            return Err(conn.rejection("END", &reply).await);
        }
        if reply.is_empty() || reply.contains(char::is_whitespace) {
            return Err(Error::Transport(format!(
                "unexpected response from {}: {}",
                address, reply
            )));
        }

        debug!("[{}] Request {} submitted ({} lines)", address, reply, request.len());
        let organization = conn.organization.clone();
        conn.close().await;

        Ok(SentRequest {
            ticket: Ticket {
                address: address.to_string(),
                id: reply,
                user: caller.user.clone(),
                user_ip: caller.user_ip.clone(),
            },
            organization,
            content: request.content.clone(),
            status: None,
        })
    }

    async fn status(&self, ticket: &Ticket) -> Result<RequestStatus> {
        let mut conn = self.connect_ticket(ticket).await?;
        conn.send(&format!("STATUS {}", ticket.id)).await?;

        let mut document = String::new();
        loop {
            let line = conn.read_line().await?;
            if line == "END" {
                break;
            }
            if line.starts_with("ERROR") {
                return Err(conn.rejection("STATUS", &line).await);
            }
            document.push_str(&line);
            document.push('\n');
        }
        conn.close().await;

        let mut requests = parse_status_document(&document)?;
        match requests.iter().position(|r| r.id == ticket.id) {
            Some(i) => Ok(requests.swap_remove(i)),
            None if requests.len() == 1 => Ok(requests.swap_remove(0)),
            None => Err(Error::Transport(format!(
                "{}: no status for request {}",
                ticket.address, ticket.id
            ))),
        }
    }

    async fn wait(&self, ticket: &Ticket) -> Result<RequestStatus> {
        let rounds = self.settings.download_retries.saturating_add(1);
        let deadline = Instant::now() + self.settings.request_timeout * rounds;

        let mut failures = 0;
        loop {
            let status = match self.status(ticket).await {
                Ok(status) => {
                    failures = 0;
                    status
                }
                Err(e) if failures < self.settings.download_retries && Instant::now() < deadline => {
                    failures += 1;
                    warn!(
                        "[{}] Status of request {} failed ({}/{}): {}",
                        ticket.address, ticket.id, failures, self.settings.download_retries, e
                    );
                    tokio::time::sleep(self.settings.poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if status.ready {
                debug!("[{}] Request {} ready", ticket.address, ticket.id);
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(Error::Transport(format!(
                    "{}: request {} not ready in time",
                    ticket.address, ticket.id
                )));
            }
            trace!("[{}] Request {} not ready yet", ticket.address, ticket.id);
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn download(&self, ticket: &Ticket, volume: Option<&str>, sink: Sink<'_>) -> Result<u64> {
        let mut conn = self.connect_ticket(ticket).await?;
        let target = match volume {
            Some(v) => format!("{}.{}", ticket.id, v),
            None => ticket.id.clone(),
        };
        conn.send(&format!("DOWNLOAD {}", target)).await?;

        let reply = conn.read_line().await?;
        if reply.starts_with("ERROR") {
            return Err(conn.rejection("DOWNLOAD", &reply).await);
        }
        let size: u64 = reply.parse().map_err(|_| {
            Error::Transport(format!("unexpected response from {}: {}", ticket.address, reply))
        })?;

        conn.copy_to(sink, size).await?;

        let trailer = conn.read_line().await?;
        if trailer != "END" {
            return Err(Error::Transport(format!(
                "{}: END not found after download",
                ticket.address
            )));
        }
        conn.close().await;

        debug!("[{}] Downloaded {} bytes of {}", ticket.address, size, target);
        Ok(size)
    }

    async fn purge(&self, ticket: &Ticket) -> Result<()> {
        let mut conn = self.connect_ticket(ticket).await?;
        conn.expect_ok(&format!("PURGE {}", ticket.id)).await?;
        conn.close().await;
        debug!("[{}] Request {} purged", ticket.address, ticket.id);
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

struct Connection {
    stream: BufReader<Stream>,
    peer: String,
    organization: String,
    timeout: Duration,
}

impl Connection {
    async fn open(
        stream: Stream,
        peer: &str,
        user: &str,
        user_ip: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut conn = Self {
            stream: BufReader::new(stream),
            peer: peer.to_string(),
            organization: String::new(),
            timeout,
        };

        conn.send("HELLO").await?;
        let software = conn.read_line().await?;
        if software.starts_with("ERROR") {
            return Err(conn.rejection("HELLO", &software).await);
        }
        conn.organization = conn.read_line().await?;
        trace!("[{}] {} ({})", conn.peer, software, conn.organization);

        conn.expect_ok(&format!("USER {}", user)).await?;
        if let Some(ip) = user_ip {
            conn.expect_ok(&format!("USER_IP {}", ip)).await?;
        }
        Ok(conn)
    }

    fn io_error(&self, e: std::io::Error) -> Error {
        Error::Transport(format!("{}: {}", self.peer, e))
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let data = format!("{}\r\n", line);
        let write = async {
            self.stream.write_all(data.as_bytes()).await?;
            self.stream.flush().await
        };
        match timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        match timeout(self.timeout, self.stream.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(Error::Transport(format!("{}: connection closed", self.peer))),
            Ok(Ok(_)) => Ok(line.trim_end().to_string()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn expect_ok(&mut self, command: &str) -> Result<()> {
        self.send(command).await?;
        let reply = self.read_line().await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(self.rejection(command, &reply).await)
        }
    }

    /// Turn an `ERROR` reply into an error, asking `SHOWERR` when no reason was given
    async fn rejection(&mut self, command: &str, reply: &str) -> Error {
        let verb = command.split_whitespace().next().unwrap_or(command);
        let Some(reason) = reply.strip_prefix("ERROR") else {
            return Error::Transport(format!("unexpected response from {}: {}", self.peer, reply));
        };

        let mut reason = reason.trim().to_string();
        if reason.is_empty() {
            reason = match self.send("SHOWERR").await {
                Ok(()) => self.read_line().await.unwrap_or_default(),
                Err(_) => String::new(),
            };
        }
        Error::Transport(format!("{} not accepted by {}: {}", verb, self.peer, reason))
    }

    async fn copy_to(&mut self, sink: Sink<'_>, size: u64) -> Result<()> {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match timeout(self.timeout, self.stream.read(&mut buf[..want])).await {
                Ok(Ok(0)) => {
                    return Err(Error::Transport(format!(
                        "{}: connection closed with {} bytes outstanding",
                        self.peer, remaining
                    )))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.io_error(e)),
                Err(_) => return Err(Error::Timeout),
            };
            sink.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    async fn close(mut self) {
        let _ = self.send("BYE").await;
    }
}
