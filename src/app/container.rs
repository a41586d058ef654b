//! Request container
//!
//! Responsibilities:
//! - Admit built requests under global and per-user queue quotas
//! - Launch queued requests in FIFO order, at most `max_executing` at a time
//! - Sweep ready requests older than `max_age`
//! - Save and restore the whole registry as one JSON snapshot
//!
//! The dispatcher loop in [`RequestContainer::run`] is the only writer of the
//! queue and the executing set apart from `put` and `purge`.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::request::status::render_status_document;

use super::metrics::{REQUESTS_EXECUTING, REQUESTS_QUEUED};
use super::proxy::{NewRequest, ProxyDeps, ProxySnapshot, RequestProxy};

/// Dispatcher wake-up period
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// 0 disables the limit
    pub max_queued: usize,
    /// 0 disables the limit
    pub max_queued_per_user: usize,
    pub max_executing: usize,
    pub max_age: Duration,
}

impl From<&QueueConfig> for ContainerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_queued: config.max_queued,
            max_queued_per_user: config.max_queued_per_user,
            max_executing: config.max_executing,
            max_age: Duration::from_secs(config.max_age),
        }
    }
}

/// Plain-data form of the container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub next_id: u64,
    pub registry: Vec<ProxySnapshot>,
    pub queued: Vec<u64>,
}

#[derive(Default)]
struct ContainerState {
    next_id: u64,
    registry: BTreeMap<u64, Arc<RequestProxy>>,
    queued: VecDeque<u64>,
    /// A purged request stays here until its execution finishes
    executing: BTreeMap<u64, Arc<RequestProxy>>,
}

impl ContainerState {
    fn update_gauges(&self) {
        REQUESTS_QUEUED.set(self.queued.len() as i64);
        REQUESTS_EXECUTING.set(self.executing.len() as i64);
    }
}

pub struct RequestContainer {
    settings: ContainerSettings,
    deps: ProxyDeps,
    state: Mutex<ContainerState>,
    wake: Notify,
}

impl RequestContainer {
    pub fn new(settings: ContainerSettings, deps: ProxyDeps) -> Self {
        Self {
            settings,
            deps,
            state: Mutex::new(ContainerState::default()),
            wake: Notify::new(),
        }
    }

    /// Admit a request; on error nothing changes
    pub fn put(&self, request: NewRequest) -> Result<Arc<RequestProxy>> {
        let proxy = {
            let mut state = self.state.lock();

            let max_queued = self.settings.max_queued;
            if max_queued > 0 && state.queued.len() >= max_queued {
                return Err(Error::Capacity("maximum number of requests queued".into()));
            }

            let max_per_user = self.settings.max_queued_per_user;
            if max_per_user > 0 {
                let own = state
                    .queued
                    .iter()
                    .filter_map(|id| state.registry.get(id))
                    .filter(|proxy| proxy.owner() == request.owner)
                    .count();
                if own >= max_per_user {
                    return Err(Error::Capacity(format!(
                        "maximum number of requests per user ({}) queued",
                        request.owner
                    )));
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            let proxy = Arc::new(RequestProxy::new(id, Utc::now(), request, self.deps.clone()));
            state.registry.insert(id, Arc::clone(&proxy));
            state.queued.push_back(id);
            state.update_gauges();
            proxy
        };

        info!("[request {}] Queued for {}", proxy.id(), proxy.owner());
        self.wake.notify_one();
        Ok(proxy)
    }

    pub fn get(&self, id: u64) -> Option<Arc<RequestProxy>> {
        self.state.lock().registry.get(&id).cloned()
    }

    /// The request `id` if `user` owns it
    pub fn lookup_owned(&self, id: &str, user: &str) -> Result<Arc<RequestProxy>> {
        id.parse::<u64>()
            .ok()
            .and_then(|id| self.get(id))
            .filter(|proxy| proxy.owner() == user)
            .ok_or_else(Error::access_denied)
    }

    /// Requests `user` may see: one id, or `ALL` of theirs in id order
    pub fn visible(&self, selector: &str, user: &str) -> Result<Vec<Arc<RequestProxy>>> {
        if selector.eq_ignore_ascii_case("ALL") {
            let state = self.state.lock();
            return Ok(state
                .registry
                .values()
                .filter(|proxy| proxy.owner() == user)
                .cloned()
                .collect());
        }
        Ok(vec![self.lookup_owned(selector, user)?])
    }

    pub fn status_document(&self, selector: &str, user: &str) -> Result<String> {
        let statuses: Vec<_> = self
            .visible(selector, user)?
            .iter()
            .map(|proxy| proxy.status())
            .collect();
        Ok(render_status_document(&statuses))
    }

    /// Unregister `id` and purge it; returns whether it existed
    pub fn purge(&self, id: u64) -> bool {
        let proxy = {
            let mut state = self.state.lock();
            let Some(proxy) = state.registry.remove(&id) else {
                return false;
            };
            if !proxy.is_ready() {
                state.queued.retain(|queued| *queued != id);
            }
            state.update_gauges();
            proxy
        };

        info!("[request {}] Purged", id);
        proxy.purge();
        true
    }

    /// One dispatcher step: sweep, reap, launch. Returns the proxies to execute.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Arc<RequestProxy>> {
        let mut expired = Vec::new();
        let mut launch = Vec::new();

        {
            let mut state = self.state.lock();

            let max_age = self.settings.max_age;
            state.registry.retain(|_, proxy| {
                let age = (now - proxy.created_at()).to_std().unwrap_or_default();
                let keep = !proxy.is_ready() || age <= max_age;
                if !keep {
                    expired.push(Arc::clone(proxy));
                }
                keep
            });

            state.executing.retain(|_, proxy| !proxy.is_ready());

            while state.executing.len() < self.settings.max_executing {
                let Some(id) = state.queued.pop_front() else {
                    break;
                };
                if let Some(proxy) = state.registry.get(&id).cloned() {
                    state.executing.insert(id, Arc::clone(&proxy));
                    launch.push(proxy);
                }
            }

            state.update_gauges();
        }

        for proxy in expired {
            info!("[request {}] Expired", proxy.id());
            proxy.purge();
        }
        launch
    }

    /// Dispatcher loop; on shutdown stops launching and waits for running executions
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tasks = JoinSet::new();
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("[container] Execution task failed: {}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }

            for proxy in self.tick(Utc::now()) {
                debug!("[request {}] Executing", proxy.id());
                tasks.spawn(async move { proxy.execute().await });
            }
        }

        if !tasks.is_empty() {
            info!("[container] Waiting for {} executions", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("[container] Execution task failed: {}", e);
            }
        }
        info!("[container] Stopped");
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        let state = self.state.lock();
        ContainerSnapshot {
            next_id: state.next_id,
            registry: state.registry.values().map(|proxy| proxy.snapshot()).collect(),
            queued: state.queued.iter().copied().collect(),
        }
    }

    /// Rebuild from a snapshot; unfinished requests that were not queued go first
    pub fn from_snapshot(snapshot: ContainerSnapshot, settings: ContainerSettings, deps: ProxyDeps) -> Self {
        let mut state = ContainerState {
            next_id: snapshot.next_id,
            ..Default::default()
        };

        for proxy in snapshot.registry {
            state.next_id = state.next_id.max(proxy.id + 1);
            let proxy = RequestProxy::restore(proxy, deps.clone());
            state.registry.insert(proxy.id(), Arc::new(proxy));
        }

        let pending = |id: &u64| state.registry.get(id).is_some_and(|proxy| !proxy.is_ready());
        let queued: Vec<u64> = snapshot.queued.into_iter().filter(|id| pending(id)).collect();
        let mut requeued: Vec<u64> = state
            .registry
            .keys()
            .copied()
            .filter(|id| pending(id) && !queued.contains(id))
            .collect();
        requeued.extend(queued);
        state.queued = requeued.into();
        state.update_gauges();

        Self {
            settings,
            deps,
            state: Mutex::new(state),
            wake: Notify::new(),
        }
    }

    /// Write the snapshot atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::Storage(format!("cannot serialize state: {}", e)))?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let storage = |e: std::io::Error| Error::Storage(format!("{}: {}", path.display(), e));

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(storage)?;
        file.write_all(&data).map_err(storage)?;
        file.as_file().sync_all().map_err(storage)?;
        file.persist(path).map_err(|e| storage(e.error))?;

        info!(
            "[container] Saved {} requests to {}",
            snapshot.registry.len(),
            path.display()
        );
        Ok(())
    }

    /// Load from `path`; a missing or unreadable file gives an empty container
    pub fn restore(path: &Path, settings: ContainerSettings, deps: ProxyDeps) -> Self {
        let snapshot = match std::fs::read(path) {
            Ok(data) => match serde_json::from_slice::<ContainerSnapshot>(&data) {
                Ok(snapshot) => {
                    info!(
                        "[container] Restored {} requests from {}",
                        snapshot.registry.len(),
                        path.display()
                    );
                    snapshot
                }
                Err(e) => {
                    warn!("[container] Ignoring corrupt state file {}: {}", path.display(), e);
                    ContainerSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ContainerSnapshot::default(),
            Err(e) => {
                warn!("[container] Cannot read state file {}: {}", path.display(), e);
                ContainerSnapshot::default()
            }
        };
        Self::from_snapshot(snapshot, settings, deps)
    }

    pub fn len(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued_ids(&self) -> Vec<u64> {
        self.state.lock().queued.iter().copied().collect()
    }

    pub fn executing_ids(&self) -> Vec<u64> {
        self.state.lock().executing.keys().copied().collect()
    }
}
