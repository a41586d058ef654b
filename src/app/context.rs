//! Server context
//!
//! Everything a session needs, built once at startup from the configuration
//! and shared by reference.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::local::SdsArchive;
use crate::request::{RequestTemplate, RequestType, ShardLimits};
use crate::router::{Router, RouterSettings};
use crate::snapshot::FileSnapshotSource;
use crate::transport::{ArclinkClient, ClientSettings, TcpTransport, Upstream};

use super::container::{ContainerSettings, RequestContainer};
use super::metrics::SESSIONS_ACTIVE;
use super::proxy::{ProxyDeps, ProxyOptions};

pub struct ServerContext {
    pub config: Arc<Config>,
    pub container: Arc<RequestContainer>,
    pub deps: ProxyDeps,
    sessions: AtomicUsize,
    idle: Notify,
}

impl ServerContext {
    /// Wire up the upstream client, router, local store and container
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let socket_timeout = config.server.socket_timeout();
        let transport = Arc::new(TcpTransport::new(socket_timeout));
        let upstream: Arc<dyn Upstream> = Arc::new(ArclinkClient::new(
            transport,
            ClientSettings {
                socket_timeout,
                request_timeout: Duration::from_secs(config.upstream.request_timeout),
                download_retries: config.upstream.download_retries,
                ..Default::default()
            },
        ));

        let snapshots = Arc::new(FileSnapshotSource::new(
            config.routing.inventory_file.clone(),
            config.routing.routing_file.clone(),
        ));
        let router = Router::new(
            Arc::clone(&upstream),
            snapshots,
            RouterSettings {
                address: config.upstream.address.clone(),
                aliases: config.upstream.aliases.clone(),
            },
        );

        let deps = ProxyDeps {
            router: Arc::new(router),
            upstream,
            store: Arc::new(SdsArchive::new(config.local.directories.clone())),
            options: Arc::new(ProxyOptions {
                use_inventory: config.routing.use_inventory,
                disable_routing: config.routing.disabled,
                local_only: config.local.local_only,
                dcid: config.server.dcid.clone(),
                default_user: config.upstream.default_user.clone(),
            }),
        };

        info!(
            "Upstream {}, routing {}, {} local directories",
            config.upstream.address,
            if config.routing.disabled { "disabled" } else { "enabled" },
            config.local.directories.len()
        );
        Ok(Self::new(config, deps))
    }

    /// Context over the given collaborators; restores saved state if configured
    pub fn new(config: Config, deps: ProxyDeps) -> Self {
        let settings = ContainerSettings::from(&config.queue);
        let container = match &config.state_file {
            Some(path) => RequestContainer::restore(path, settings, deps.clone()),
            None => RequestContainer::new(settings, deps.clone()),
        };

        Self {
            config: Arc::new(config),
            container: Arc::new(container),
            deps,
            sessions: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Template for a new client request, with the configured shard limits
    pub fn template(
        &self,
        kind: RequestType,
        args: BTreeMap<String, String>,
        label: Option<String>,
    ) -> RequestTemplate {
        RequestTemplate {
            kind,
            args,
            label,
            limits: ShardLimits {
                max_lines: self.config.upstream.max_lines_per_request,
                max_megabytes: self.config.upstream.max_megabytes_per_request,
            },
        }
    }

    /// Claim a session slot, `None` when `max_sessions` are connected
    pub fn try_enter(self: &Arc<Self>) -> Option<SessionGuard> {
        let max = self.config.server.max_sessions;
        self.sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()?;

        SESSIONS_ACTIVE.inc();
        Some(SessionGuard {
            ctx: Arc::clone(self),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Resolves once every session has ended
    pub async fn wait_for_sessions(&self) {
        loop {
            let idle = self.idle.notified();
            if self.session_count() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Session slot, released on drop
pub struct SessionGuard {
    ctx: Arc<ServerContext>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.ctx.sessions.fetch_sub(1, Ordering::SeqCst);
        SESSIONS_ACTIVE.dec();
        self.ctx.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::proxy::testing::deps;
    use crate::local::memory::MemoryStore;
    use crate::transport::mock::MockUpstream;

    fn context(max_sessions: usize) -> Arc<ServerContext> {
        let mut config = Config::default();
        config.server.max_sessions = max_sessions;
        config.upstream.max_lines_per_request = 7;
        Arc::new(ServerContext::new(
            config,
            deps(Arc::new(MockUpstream::new()), Arc::new(MemoryStore::new())),
        ))
    }

    #[test]
    fn test_session_limit() {
        let ctx = context(2);
        let first = ctx.try_enter().unwrap();
        let _second = ctx.try_enter().unwrap();
        assert!(ctx.try_enter().is_none());
        assert_eq!(ctx.session_count(), 2);

        drop(first);
        assert!(ctx.try_enter().is_some());
    }

    #[tokio::test]
    async fn test_wait_for_sessions() {
        let ctx = context(0);
        let guard = ctx.try_enter().unwrap();

        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_for_sessions().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_template_limits() {
        let ctx = context(1);
        let template = ctx.template(RequestType::Waveform, BTreeMap::new(), Some("x".into()));
        assert_eq!(template.limits.max_lines, 7);
        assert_eq!(template.label.as_deref(), Some("x"));
    }

    #[test]
    fn test_from_config() {
        let ctx = ServerContext::from_config(Config::default()).unwrap();
        assert!(ctx.container.is_empty());
        assert_eq!(ctx.deps.options.dcid, ctx.config.server.dcid);
    }
}
