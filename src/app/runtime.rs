//! Runtime - listener and lifecycle
//!
//! The runtime is responsible for:
//! - Binding the client listener
//! - Spawning one task per session, the dispatcher and the stats reporter
//! - Ordered shutdown: stop accepting, finish running executions, save state

use std::future::Future;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::common::{Address, Result, Stream};
use crate::config::Config;
use crate::error::Error;
use crate::session::Session;
use crate::transport::{Listener, TcpTransport, Transport};

use super::context::ServerContext;
use super::metrics::{self, init_metrics};

pub struct Runtime {
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    pub fn from_config(config: Config) -> Result<Self> {
        init_metrics();
        Ok(Self::new(Arc::new(ServerContext::from_config(config)?)))
    }

    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { ctx, shutdown_tx }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind the configured address and serve until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        let server = &self.ctx.config.server;
        let listen = Address::parse(&server.listen)?;
        let transport = TcpTransport::new(server.socket_timeout());
        let listener = transport
            .bind(&listen)
            .await
            .map_err(|e| Error::Config(format!("cannot listen on {}: {}", listen, e)))?;

        self.serve(listener, tokio::signal::ctrl_c()).await
    }

    /// Serve `listener` until `signal` resolves, then shut down in order
    pub async fn serve<F>(&self, listener: Box<dyn Listener>, signal: F) -> Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        info!("Listening on {}", listener.local_addr()?);

        let container = tokio::spawn(Arc::clone(&self.ctx.container).run(self.shutdown_tx.subscribe()));

        let ctx = Arc::clone(&self.ctx);
        let shutdown_tx = self.shutdown_tx.clone();
        let accept = tokio::spawn(async move { run_listener(listener, ctx, shutdown_tx).await });

        let stats_rx = self.shutdown_tx.subscribe();
        let stats = tokio::spawn(async move { stats_reporter(stats_rx).await });

        signal.await?;
        info!("Shutting down...");
        let _ = self.shutdown_tx.send(());

        let _ = accept.await;
        let _ = stats.await;
        if let Err(e) = container.await {
            error!("Dispatcher task failed: {}", e);
        }

        let wait = self.ctx.config.server.socket_timeout();
        if tokio::time::timeout(wait, self.ctx.wait_for_sessions()).await.is_err() {
            warn!("{} sessions still open", self.ctx.session_count());
        }

        if let Some(path) = &self.ctx.config.state_file {
            if let Err(e) = self.ctx.container.save(path) {
                error!("Failed to save state: {}", e);
            }
        }

        info!("[stats] {}", metrics::summary());
        Ok(())
    }
}

/// Stats reporter task - logs stats periodically and on SIGUSR1 signal
#[cfg(unix)]
async fn stats_reporter(mut shutdown_rx: broadcast::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(sigusr1) => Some(sigusr1),
        Err(e) => {
            warn!("Cannot install SIGUSR1 handler: {}", e);
            None
        }
    };

    loop {
        tokio::select! {
            _ = interval.tick() => {
                info!("[stats] {}", metrics::summary());
            }
            Some(()) = async { sigusr1.as_mut()?.recv().await } => {
                info!("Received SIGUSR1, printing statistics...");
                info!("[stats] {}", metrics::summary());
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

/// Stats reporter task - logs stats periodically (non-Unix)
#[cfg(not(unix))]
async fn stats_reporter(mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                info!("[stats] {}", metrics::summary());
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

/// Accept clients until shutdown
async fn run_listener(
    listener: Box<dyn Listener>,
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        conn_count += 1;
                        let conn_id = conn_count;

                        let Some(slot) = ctx.try_enter() else {
                            warn!("Rejecting connection #{} from {}: too many sessions", conn_id, peer);
                            tokio::spawn(reject(stream));
                            continue;
                        };
                        debug!("New connection #{} from {}", conn_id, peer);

                        let session = Session::new(Arc::clone(&ctx), peer.clone());
                        let session_shutdown = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            let _slot = slot;
                            if let Err(e) = session.run(stream, session_shutdown).await {
                                warn!("Connection #{} from {} error: {}", conn_id, peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Listener shutting down (handled {} connections)", conn_count);
                break;
            }
        }
    }
}

async fn reject(mut stream: Stream) {
    let _ = stream.write_all(b"ERROR too many sessions\r\n").await;
    let _ = stream.shutdown().await;
}
