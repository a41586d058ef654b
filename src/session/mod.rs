//! Session Layer
//!
//! Responsibilities:
//! - Read client command lines and answer each one
//! - Collect selection lines between `REQUEST` and `END`
//! - Enforce ownership on `STATUS`, `DOWNLOAD` and `PURGE`
//! - Keep every request created here in use until disconnect
//!
//! A command's failure is reported as `ERROR <reason>` and remembered for
//! `SHOWERR`; only socket errors end the session.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::app::metrics::DOWNLOADED_BYTES;
use crate::app::{NewRequest, ServerContext, UsageGuard};
use crate::common::{Address, Result};
use crate::error::Error;
use crate::protocol::{parse_selection, Command, SOFTWARE};
use crate::request::{RequestLine, RequestTemplate, RequestType};
use crate::transport::Sink;

const SUCCESS: &str = "success";

/// Whether to keep reading after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Request between `REQUEST` and `END`
struct RequestBuilder {
    template: RequestTemplate,
    lines: Vec<RequestLine>,
    /// First failure; reported at `END`
    error: Option<Error>,
}

pub struct Session {
    ctx: Arc<ServerContext>,
    peer: Address,
    user: String,
    institution: String,
    label: Option<String>,
    user_ip: String,
    builder: Option<RequestBuilder>,
    owned: Vec<UsageGuard>,
    last_error: String,
}

impl Session {
    pub fn new(ctx: Arc<ServerContext>, peer: Address) -> Self {
        let user_ip = peer.host();
        Self {
            ctx,
            peer,
            user: String::new(),
            institution: String::new(),
            label: None,
            user_ip,
            builder: None,
            owned: Vec::new(),
            last_error: SUCCESS.to_string(),
        }
    }

    /// Serve one connection until `BYE`, EOF, idle timeout or shutdown
    pub async fn run<S>(mut self, stream: S, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let idle = self.ctx.config.server.socket_timeout();

        loop {
            let line = tokio::select! {
                line = tokio::time::timeout(idle, lines.next_line()) => match line {
                    Ok(line) => line?,
                    Err(_) => {
                        debug!("[session {}] Idle timeout", self.peer);
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            };
            let Some(line) = line else {
                break;
            };

            let flow = self.handle(&line, &mut writer).await?;
            writer.flush().await?;
            if flow == Flow::Close {
                break;
            }
        }

        info!(
            "[session {}] Closed ({} requests held)",
            self.peer,
            self.owned.len()
        );
        Ok(())
    }

    async fn handle(&mut self, line: &str, out: Sink<'_>) -> Result<Flow> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = tokens.first() else {
            return Ok(Flow::Continue);
        };

        let control = ["BYE", "SHOWERR"]
            .iter()
            .any(|c| keyword.eq_ignore_ascii_case(c));
        if self.builder.is_some() && !control && !Command::is_end(&tokens) {
            self.add_line(&tokens);
            return Ok(Flow::Continue);
        }

        match self.dispatch(&tokens, out).await {
            Ok(flow) => {
                self.last_error = SUCCESS.to_string();
                Ok(flow)
            }
            Err(e) if e.is_recoverable() => {
                debug!("[session {}] {}: {}", self.peer, keyword, e);
                self.last_error = e.to_string();
                out.write_all(format!("ERROR {}\r\n", e).as_bytes()).await?;
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&mut self, tokens: &[&str], out: Sink<'_>) -> Result<Flow> {
        match Command::parse(tokens)? {
            Command::Hello => {
                let reply = format!("{}\r\n{}\r\n", SOFTWARE, self.ctx.config.server.organization);
                out.write_all(reply.as_bytes()).await?;
            }
            Command::User { name, .. } => {
                self.user = name;
                ok(out).await?;
            }
            Command::Institution(institution) => {
                self.institution = institution;
                ok(out).await?;
            }
            Command::Label(label) => {
                self.label = Some(label);
                ok(out).await?;
            }
            Command::UserIp(ip) => {
                self.user_ip = ip;
                ok(out).await?;
            }
            Command::Request { kind, args } => {
                if self.ctx.config.local.local_only && kind != RequestType::Waveform {
                    return Err(Error::Protocol(format!("{} request is disabled", kind)));
                }
                self.builder = Some(RequestBuilder {
                    template: self.ctx.template(kind, args, self.label.clone()),
                    lines: Vec::new(),
                    error: None,
                });
                ok(out).await?;
            }
            Command::End => {
                let id = self.finish().await?;
                out.write_all(format!("{}\r\n", id).as_bytes()).await?;
            }
            Command::Status(selector) => {
                let document = self.ctx.container.status_document(&selector, &self.user)?;
                for line in document.lines() {
                    out.write_all(line.as_bytes()).await?;
                    out.write_all(b"\r\n").await?;
                }
                out.write_all(b"END\r\n").await?;
            }
            Command::Download {
                request,
                volume,
                blocking,
                chunked,
                ..
            } => {
                let proxy = self.ctx.container.lookup_owned(&request, &self.user)?;
                let sent = proxy.download(out, volume.as_deref(), blocking, chunked).await?;
                out.write_all(b"END\r\n").await?;
                DOWNLOADED_BYTES.inc_by(sent);
                debug!("[session {}] Sent {} bytes of request {}", self.peer, sent, request);
            }
            Command::Purge(request) => {
                let proxy = self.ctx.container.lookup_owned(&request, &self.user)?;
                let id = proxy.id();
                self.owned.retain(|guard| guard.proxy().id() != id);
                self.ctx.container.purge(id);
                ok(out).await?;
            }
            Command::ShowErr => {
                out.write_all(format!("{}\r\n", self.last_error).as_bytes()).await?;
            }
            Command::Bye => return Ok(Flow::Close),
        }
        Ok(Flow::Continue)
    }

    /// Append a selection line; the first failure sticks until `END`
    fn add_line(&mut self, tokens: &[&str]) {
        let max_lines = self.ctx.config.queue.max_lines;
        let Some(builder) = self.builder.as_mut() else {
            return;
        };
        if builder.error.is_some() {
            return;
        }

        if max_lines > 0 && builder.lines.len() >= max_lines {
            builder.error = Some(Error::Capacity("too many lines".into()));
            return;
        }
        match parse_selection(tokens) {
            Ok(line) => builder.lines.push(line),
            Err(e) => builder.error = Some(e),
        }
    }

    /// Close the builder and queue the request; the builder is gone either way
    async fn finish(&mut self) -> Result<u64> {
        let Some(builder) = self.builder.take() else {
            return Err(Error::Protocol("invalid command".into()));
        };
        if let Some(e) = builder.error {
            return Err(e);
        }

        let request = NewRequest::build(
            builder.template,
            self.user.clone(),
            Some(self.user_ip.clone()),
            builder.lines,
            &self.ctx.deps,
        )
        .await;
        let proxy = self.ctx.container.put(request)?;
        self.owned.push(proxy.acquire());

        info!(
            "[session {}] Request {} from {} ({})",
            self.peer,
            proxy.id(),
            self.user,
            self.institution
        );
        Ok(proxy.id())
    }
}

async fn ok(out: Sink<'_>) -> Result<()> {
    out.write_all(b"OK\r\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::deps;
    use crate::config::Config;
    use crate::local::memory::MemoryStore;
    use crate::transport::mock::MockUpstream;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    const LINE: &str = "2023,1,1,0,0,0 2023,1,1,0,1,0 NET STA CHA LOC";

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        session: JoinHandle<Result<()>>,
        _shutdown: broadcast::Sender<()>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> String {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            line.trim_end().to_string()
        }

        async fn call(&mut self, line: &str) -> String {
            self.send(line).await;
            self.recv().await
        }

        /// Lines up to and including `END`
        async fn document(&mut self, line: &str) -> Vec<String> {
            self.send(line).await;
            let mut lines = Vec::new();
            loop {
                let line = self.recv().await;
                let end = line == "END" || line.starts_with("ERROR");
                lines.push(line);
                if end {
                    return lines;
                }
            }
        }
    }

    fn context(config: Config) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(
            config,
            deps(Arc::new(MockUpstream::new()), Arc::new(MemoryStore::new())),
        ))
    }

    fn connect(ctx: &Arc<ServerContext>) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let peer = Address::parse("127.0.0.1:4000").unwrap();
        let session = tokio::spawn(Session::new(Arc::clone(ctx), peer).run(server, shutdown_rx));

        let (reader, writer) = tokio::io::split(client);
        Client {
            reader: BufReader::new(reader),
            writer,
            session,
            _shutdown: shutdown_tx,
        }
    }

    async fn submit(client: &mut Client, lines: &[&str]) -> String {
        assert_eq!(client.call("REQUEST WAVEFORM").await, "OK");
        for line in lines {
            client.send(line).await;
        }
        client.call("END").await
    }

    #[tokio::test]
    async fn test_end_to_end_unrouted() {
        let ctx = context(Config::default());
        let mut client = connect(&ctx);

        assert_eq!(client.call("HELLO").await, SOFTWARE);
        assert_eq!(client.recv().await, "proxy");
        assert_eq!(client.call("USER alice").await, "OK");
        assert_eq!(submit(&mut client, &[LINE]).await, "0");

        let status = client.document("STATUS 0").await.join("\n");
        assert!(status.contains("status=\"PROCESSING\""));
        assert!(status.contains("ready=\"false\""));

        for proxy in ctx.container.tick(Utc::now()) {
            proxy.execute().await;
        }

        let status = client.document("STATUS 0").await.join("\n");
        assert!(status.contains("ready=\"true\""));
        assert!(status.contains("<volume id=\"NODATA\""));
        assert!(status.contains("content=\"2023,1,1,0,0,0 2023,1,1,0,1,0 NET STA CHA LOC\" status=\"NODATA\" size=\"0\""));

        assert_eq!(client.document("BDOWNLOAD 0").await, vec!["0", "END"]);

        assert_eq!(client.call("BYE").await, "");
        client.session.await.unwrap().unwrap();
        assert_eq!(ctx.container.get(0).unwrap().usage(), 0);
    }

    #[tokio::test]
    async fn test_errors_and_showerr() {
        let ctx = context(Config::default());
        let mut client = connect(&ctx);

        assert_eq!(client.call("SHOWERR").await, "success");
        assert_eq!(client.call("FROB").await, "ERROR invalid command");
        assert_eq!(client.call("SHOWERR").await, "invalid command");
        assert_eq!(client.call("SHOWERR").await, "success");
        assert_eq!(client.call("END").await, "ERROR invalid command");
        assert_eq!(client.call("STATUS").await, "ERROR syntax error");
        assert_eq!(
            client.call("DOWNLOAD 5").await,
            "ERROR request not found or access denied"
        );
        assert_eq!(client.call("REQUEST BOGUS").await, "ERROR unknown request type: BOGUS");
        assert_eq!(client.document("STATUS ALL").await.last().unwrap(), "END");
    }

    #[tokio::test]
    async fn test_sticky_builder_errors() {
        let mut config = Config::default();
        config.queue.max_lines = 1;
        let ctx = context(config);
        let mut client = connect(&ctx);

        assert_eq!(submit(&mut client, &["garbage", LINE]).await, "ERROR syntax error");
        assert_eq!(submit(&mut client, &[LINE, LINE]).await, "ERROR too many lines");
        assert!(ctx.container.is_empty());

        // The builder is gone after a failed END
        assert_eq!(client.call("END").await, "ERROR invalid command");
        assert_eq!(submit(&mut client, &[LINE]).await, "0");
    }

    #[tokio::test]
    async fn test_ownership_and_purge() {
        let ctx = context(Config::default());
        let mut alice = connect(&ctx);
        let mut bob = connect(&ctx);

        assert_eq!(alice.call("USER alice").await, "OK");
        assert_eq!(bob.call("USER bob").await, "OK");
        assert_eq!(submit(&mut alice, &[LINE]).await, "0");

        assert_eq!(bob.call("STATUS 0").await, "ERROR request not found or access denied");
        assert_eq!(bob.call("PURGE 0").await, "ERROR request not found or access denied");
        assert_eq!(
            bob.call("DOWNLOAD 0.local").await,
            "ERROR request not found or access denied"
        );

        assert_eq!(alice.call("DOWNLOAD 0").await, "ERROR request not ready");
        assert_eq!(alice.call("PURGE 0").await, "OK");
        assert_eq!(alice.call("STATUS 0").await, "ERROR request not found or access denied");
        assert!(ctx.container.queued_ids().is_empty());
    }

    #[tokio::test]
    async fn test_quota_and_local_only() {
        let mut config = Config::default();
        config.queue.max_queued_per_user = 1;
        config.local.local_only = true;
        let ctx = context(config);
        let mut client = connect(&ctx);

        assert_eq!(client.call("USER alice").await, "OK");
        assert_eq!(client.call("REQUEST INVENTORY").await, "ERROR INVENTORY request is disabled");
        assert_eq!(submit(&mut client, &[LINE]).await, "0");
        assert_eq!(
            submit(&mut client, &[LINE]).await,
            "ERROR maximum number of requests per user (alice) queued"
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let ctx = context(Config::default());
        let client = connect(&ctx);

        client._shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
