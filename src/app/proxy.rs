//! Server-side request
//!
//! A [`RequestProxy`] is one client request after `END`. Its lines are split
//! into those served from the local store and those routed upstream. The
//! result partition is filled once by [`RequestProxy::execute`], after which
//! `ready` flips and every waiting download wakes up.
//!
//! Remote sub-requests are purged only when nobody uses the proxy any more.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::local::LocalStore;
use crate::request::{
    LineStatus, Request, RequestLine, RequestStatus, RequestTemplate, RequestType, SentRequest,
    Status, Ticket, VolumeStatus,
};
use crate::router::{ExecuteOptions, Router};
use crate::transport::{Caller, Sink, Upstream};

/// Volume id of the locally served part
pub const LOCAL_VOLUME: &str = "local";

/// Settings every proxy shares
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub use_inventory: bool,
    pub disable_routing: bool,
    /// Serve every waveform line locally
    pub local_only: bool,
    /// Data centre id shown on synthetic volumes
    pub dcid: String,
    /// Upstream user when the client never sent `USER`
    pub default_user: String,
}

/// Live collaborators, recreated on restore
#[derive(Clone)]
pub struct ProxyDeps {
    pub router: Arc<Router>,
    pub upstream: Arc<dyn Upstream>,
    pub store: Arc<dyn LocalStore>,
    pub options: Arc<ProxyOptions>,
}

/// A built request waiting for an id
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub template: RequestTemplate,
    pub owner: String,
    pub owner_ip: Option<String>,
    pub local: Vec<RequestLine>,
    pub proxied: Vec<RequestLine>,
}

impl NewRequest {
    /// Place every line: waveform lines the local store holds stay local
    pub async fn build(
        template: RequestTemplate,
        owner: String,
        owner_ip: Option<String>,
        lines: Vec<RequestLine>,
        deps: &ProxyDeps,
    ) -> Self {
        let mut local = Vec::new();
        let mut proxied = Vec::new();

        for line in lines {
            let is_local = template.kind == RequestType::Waveform
                && (deps.options.local_only || deps.store.exists(&line).await);
            if is_local {
                local.push(line);
            } else {
                proxied.push(line);
            }
        }

        Self {
            template,
            owner,
            owner_ip,
            local,
            proxied,
        }
    }
}

/// Where a remote volume lives
#[derive(Debug, Clone)]
struct VolumeRef {
    ticket: Ticket,
    volume: String,
    size: u64,
}

#[derive(Default)]
struct ProxyState {
    error: Option<String>,
    sent: Vec<SentRequest>,
    unrouted: Vec<RequestLine>,
    no_data: Vec<RequestLine>,
    volumes: BTreeMap<String, VolumeRef>,
    size: u64,
    encrypted: bool,
    usage: u32,
    purge_requested: bool,
    purged: bool,
}

impl ProxyState {
    fn index(&mut self) {
        self.volumes.clear();
        self.size = 0;
        self.encrypted = false;

        for sent in &self.sent {
            let Some(status) = &sent.status else {
                continue;
            };
            for volume in &status.volumes {
                self.volumes.insert(
                    volume_key(&volume.id, sent),
                    VolumeRef {
                        ticket: sent.ticket.clone(),
                        volume: volume.id.clone(),
                        size: volume.size,
                    },
                );
                self.size += volume.size;
                self.encrypted |= volume.encrypted;
            }
        }
    }
}

fn volume_key(volume: &str, sent: &SentRequest) -> String {
    let remote_id = match &sent.status {
        Some(status) if !status.id.is_empty() => status.id.as_str(),
        _ => sent.ticket.id.as_str(),
    };
    format!("{}-{}", volume, remote_id)
}

/// Plain-data form of a proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySnapshot {
    pub id: u64,
    pub template: RequestTemplate,
    pub owner: String,
    #[serde(default)]
    pub owner_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ready: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub local: Vec<RequestLine>,
    #[serde(default)]
    pub proxied: Vec<RequestLine>,
    #[serde(default)]
    pub sent: Vec<SentRequest>,
    #[serde(default)]
    pub unrouted: Vec<RequestLine>,
    #[serde(default)]
    pub no_data: Vec<RequestLine>,
}

pub struct RequestProxy {
    id: u64,
    template: Arc<RequestTemplate>,
    owner: String,
    owner_ip: Option<String>,
    created_at: DateTime<Utc>,
    local: Vec<RequestLine>,
    proxied: Vec<RequestLine>,
    deps: ProxyDeps,
    state: Mutex<ProxyState>,
    ready: watch::Sender<bool>,
}

impl std::fmt::Debug for RequestProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProxy")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Keeps a proxy in use; remote purging waits for the last guard
pub struct UsageGuard {
    proxy: Arc<RequestProxy>,
}

impl UsageGuard {
    pub fn proxy(&self) -> &Arc<RequestProxy> {
        &self.proxy
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.proxy.release();
    }
}

impl RequestProxy {
    pub fn new(id: u64, created_at: DateTime<Utc>, request: NewRequest, deps: ProxyDeps) -> Self {
        Self {
            id,
            template: Arc::new(request.template),
            owner: request.owner,
            owner_ip: request.owner_ip,
            created_at,
            local: request.local,
            proxied: request.proxied,
            deps,
            state: Mutex::new(ProxyState::default()),
            ready: watch::Sender::new(false),
        }
    }

    /// Rebuild a proxy from its snapshot with fresh live handles
    pub fn restore(snapshot: ProxySnapshot, deps: ProxyDeps) -> Self {
        let mut state = ProxyState {
            error: snapshot.error,
            sent: snapshot.sent,
            unrouted: snapshot.unrouted,
            no_data: snapshot.no_data,
            ..Default::default()
        };
        state.index();

        Self {
            id: snapshot.id,
            template: Arc::new(snapshot.template),
            owner: snapshot.owner,
            owner_ip: snapshot.owner_ip,
            created_at: snapshot.created_at,
            local: snapshot.local,
            proxied: snapshot.proxied,
            deps,
            state: Mutex::new(state),
            ready: watch::Sender::new(snapshot.ready),
        }
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        let ready = self.is_ready();
        let state = self.state.lock();
        ProxySnapshot {
            id: self.id,
            template: (*self.template).clone(),
            owner: self.owner.clone(),
            owner_ip: self.owner_ip.clone(),
            created_at: self.created_at,
            ready,
            error: state.error.clone(),
            local: self.local.clone(),
            proxied: self.proxied.clone(),
            sent: state.sent.clone(),
            unrouted: state.unrouted.clone(),
            no_data: state.no_data.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn usage(&self) -> u32 {
        self.state.lock().usage
    }

    pub fn acquire(self: &Arc<Self>) -> UsageGuard {
        self.state.lock().usage += 1;
        UsageGuard {
            proxy: Arc::clone(self),
        }
    }

    fn release(&self) {
        let tickets = {
            let mut state = self.state.lock();
            state.usage = state.usage.saturating_sub(1);
            Self::take_purge(&mut state)
        };
        self.purge_remote(tickets);
    }

    async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run the proxied lines through the router and publish the result
    pub async fn execute(self: &Arc<Self>) {
        let _usage = self.acquire();
        if self.is_ready() {
            return;
        }

        let mut error = None;
        let mut sent = Vec::new();
        let mut unrouted = Vec::new();
        let mut no_data = Vec::new();

        if !self.proxied.is_empty() {
            let request = Request::with_lines(&self.template, self.proxied.clone());
            let options = &self.deps.options;
            let caller = Caller {
                user: if self.owner.is_empty() {
                    options.default_user.clone()
                } else {
                    self.owner.clone()
                },
                user_ip: self.owner_ip.clone(),
            };
            let execute_options = ExecuteOptions {
                use_inventory: options.use_inventory,
                use_routing: !options.disable_routing
                    && !matches!(
                        self.template.kind,
                        RequestType::Inventory | RequestType::Response | RequestType::Routing
                    ),
                ..Default::default()
            };

            match self.deps.router.execute(&request, &caller, &execute_options).await {
                Ok(outcome) => {
                    sent = outcome.sent;
                    unrouted = outcome.unrouted;
                    no_data = outcome.no_data;
                }
                Err(e) => {
                    warn!("[request {}] Execution failed: {}", self.id, e);
                    error = Some(e.to_string());
                    unrouted = self.proxied.clone();
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.error = error;
            state.sent = sent;
            state.unrouted = unrouted;
            state.no_data = no_data;
            state.index();
            info!(
                "[request {}] Ready: {} sub-requests, {} bytes",
                self.id,
                state.sent.len(),
                state.size
            );
        }
        self.ready.send_replace(true);
    }

    /// Status of this request as shown to its owner
    pub fn status(&self) -> RequestStatus {
        let ready = self.is_ready();
        let state = self.state.lock();
        let dcid = &self.deps.options.dcid;

        let mut status = RequestStatus {
            id: self.id.to_string(),
            kind: self.template.kind.to_string(),
            label: self.template.label.clone().unwrap_or_default(),
            args: self.template.args_string(),
            ready,
            error: state.error.is_some(),
            size: if ready { state.size } else { 0 },
            encrypted: state.encrypted,
            message: state.error.clone().unwrap_or_default(),
            volumes: Vec::new(),
        };

        if ready {
            for sent in &state.sent {
                let Some(remote) = &sent.status else {
                    continue;
                };
                for volume in &remote.volumes {
                    status.volumes.push(VolumeStatus {
                        id: volume_key(&volume.id, sent),
                        ..volume.clone()
                    });
                }
            }

            let failed: Vec<&RequestLine> = state.unrouted.iter().chain(&state.no_data).collect();
            if !failed.is_empty() {
                status.volumes.push(synthetic_volume(
                    "NODATA",
                    dcid,
                    Status::NoData,
                    "routing failed",
                    failed.into_iter().map(|line| (line, Status::NoData, 0)),
                ));
            }
        } else {
            status.volumes.push(synthetic_volume(
                "UNSET",
                dcid,
                Status::Processing,
                "",
                self.proxied.iter().map(|line| (line, Status::Unset, 0)),
            ));
        }

        if !self.local.is_empty() {
            status.volumes.push(synthetic_volume(
                LOCAL_VOLUME,
                dcid,
                Status::Ok,
                "",
                self.local
                    .iter()
                    .map(|line| (line, Status::Ok, line.nominal_size())),
            ));
        }

        status
    }

    /// Stream data into `sink`; returns the payload byte count.
    ///
    /// `selector` is `None` for everything, `local` for the locally served
    /// lines or a volume key from the status document.
    pub async fn download(
        self: &Arc<Self>,
        sink: Sink<'_>,
        selector: Option<&str>,
        blocking: bool,
        chunked: bool,
    ) -> Result<u64> {
        let _usage = self.acquire();

        match selector {
            None => self.download_all(sink, blocking, chunked).await,
            Some(LOCAL_VOLUME) => self.download_local(sink, chunked).await,
            Some(key) => self.download_volume(sink, key, blocking, chunked).await,
        }
    }

    async fn download_all(&self, sink: Sink<'_>, blocking: bool, chunked: bool) -> Result<u64> {
        if !blocking && !self.is_ready() {
            return Err(Error::State("request not ready".into()));
        }

        // Refusals come before the first byte
        let remote = !self.proxied.is_empty();
        if remote || !chunked {
            self.wait_ready().await;
            self.check_encrypted()?;
        }
        let units = self.local_units().await?;

        if chunked {
            let mut total = 0;
            let mut frames = 0;
            for unit in &units {
                total += self.write_local_chunk(sink, unit).await?;
                frames += 1;
            }

            // Each remote payload is spooled whole, so a failure lands between frames
            for ticket in self.tickets_with_data() {
                let mut spool = Spool::new().await?;
                self.deps
                    .upstream
                    .download(&ticket, None, &mut spool.file)
                    .await
                    .map_err(remote_error)?;
                total += spool.emit(sink, true).await?;
                frames += 1;
            }

            if frames == 0 {
                sink.write_all(b"CHUNK 0\r\n").await?;
            }
            return Ok(total);
        }

        let mut spool = Spool::new().await?;
        for unit in &units {
            self.spool_local(&mut spool, unit).await?;
        }
        for ticket in self.tickets_with_data() {
            self.deps
                .upstream
                .download(&ticket, None, &mut spool.file)
                .await
                .map_err(remote_error)?;
        }
        spool.emit(sink, false).await
    }

    async fn download_local(&self, sink: Sink<'_>, chunked: bool) -> Result<u64> {
        if self.local.is_empty() {
            return Err(Error::State("volume not found".into()));
        }
        let units = self.local_units().await?;

        if chunked {
            let mut total = 0;
            for unit in &units {
                total += self.write_local_chunk(sink, unit).await?;
            }
            return Ok(total);
        }

        let mut spool = Spool::new().await?;
        for unit in &units {
            self.spool_local(&mut spool, unit).await?;
        }
        spool.emit(sink, false).await
    }

    async fn download_volume(&self, sink: Sink<'_>, key: &str, blocking: bool, chunked: bool) -> Result<u64> {
        if !self.is_ready() {
            if !blocking {
                return Err(Error::State("request not ready".into()));
            }
            self.wait_ready().await;
        }

        let volume = self
            .state
            .lock()
            .volumes
            .get(key)
            .cloned()
            .ok_or_else(|| Error::State("volume not found".into()))?;

        let mut spool = Spool::new().await?;
        if volume.size > 0 {
            self.deps
                .upstream
                .download(&volume.ticket, Some(&volume.volume), &mut spool.file)
                .await
                .map_err(remote_error)?;
        }
        spool.emit(sink, chunked).await
    }

    async fn local_units(&self) -> Result<Vec<String>> {
        let mut units = Vec::new();
        for line in &self.local {
            units.extend(self.deps.store.units(line).await?);
        }
        Ok(units)
    }

    /// Stream one local unit as a chunk frame
    async fn write_local_chunk(&self, sink: Sink<'_>, unit: &str) -> Result<u64> {
        let mut unit = self.deps.store.open(unit).await?;
        sink.write_all(format!("CHUNK {}\r\n", unit.size).as_bytes()).await?;

        let copied = tokio::io::copy(&mut unit.reader, sink).await?;
        if copied != unit.size {
            // Header already sent, so the session has to end
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("local unit ended after {} of {} bytes", copied, unit.size),
            )));
        }
        Ok(copied)
    }

    async fn spool_local(&self, spool: &mut Spool, unit: &str) -> Result<()> {
        let mut unit = self.deps.store.open(unit).await?;
        tokio::io::copy(&mut unit.reader, &mut spool.file)
            .await
            .map_err(spool_error)?;
        Ok(())
    }

    fn check_encrypted(&self) -> Result<()> {
        if self.state.lock().encrypted {
            Err(Error::State(
                "cannot download encrypted request with multiple volumes".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn tickets_with_data(&self) -> Vec<Ticket> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|sent| sent.size() > 0)
            .map(|sent| sent.ticket.clone())
            .collect()
    }

    /// Ask for removal; remote sub-requests go once the proxy is unused
    pub fn purge(&self) {
        let tickets = {
            let mut state = self.state.lock();
            state.purge_requested = true;
            Self::take_purge(&mut state)
        };
        self.purge_remote(tickets);
    }

    fn take_purge(state: &mut ProxyState) -> Vec<Ticket> {
        if state.usage > 0 || !state.purge_requested || state.purged {
            return Vec::new();
        }
        state.purged = true;
        state.sent.iter().map(|sent| sent.ticket.clone()).collect()
    }

    fn purge_remote(&self, tickets: Vec<Ticket>) {
        if tickets.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("[request {}] No runtime, remote requests left in place", self.id);
            return;
        };

        let id = self.id;
        let upstream = Arc::clone(&self.deps.upstream);
        handle.spawn(async move {
            for ticket in tickets {
                match upstream.purge(&ticket).await {
                    Ok(()) => debug!("[request {}] Purged {} at {}", id, ticket.id, ticket.address),
                    Err(e) => warn!("[request {}] Purge of {} failed: {}", id, ticket.id, e),
                }
            }
        });
    }
}

fn synthetic_volume<'a>(
    id: &str,
    dcid: &str,
    status: Status,
    message: &str,
    lines: impl Iterator<Item = (&'a RequestLine, Status, u64)>,
) -> VolumeStatus {
    let lines: Vec<LineStatus> = lines
        .map(|(line, status, size)| LineStatus {
            content: line.content(),
            status,
            size,
            message: message.to_string(),
        })
        .collect();

    VolumeStatus {
        id: id.to_string(),
        dcid: dcid.to_string(),
        status,
        size: lines.iter().map(|l| l.size).sum(),
        encrypted: false,
        message: message.to_string(),
        lines,
    }
}

fn spool_error(e: std::io::Error) -> Error {
    Error::Storage(format!("spool file: {}", e))
}

/// Io errors of a remote download can only come from the spool
fn remote_error(e: Error) -> Error {
    match e {
        Error::Io(e) => spool_error(e),
        e => e,
    }
}

/// Temporary file collecting data whose length must be known up front
struct Spool {
    file: tokio::fs::File,
}

impl Spool {
    async fn new() -> Result<Self> {
        let file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(|e| Error::Storage(format!("spool file: {}", e)))?
            .map_err(spool_error)?;
        Ok(Self {
            file: tokio::fs::File::from_std(file),
        })
    }

    /// Write the length header and the spooled bytes
    async fn emit(mut self, sink: Sink<'_>, chunked: bool) -> Result<u64> {
        self.file.flush().await.map_err(spool_error)?;
        let size = self.file.seek(SeekFrom::End(0)).await.map_err(spool_error)?;
        self.file.seek(SeekFrom::Start(0)).await.map_err(spool_error)?;

        let header = if chunked {
            format!("CHUNK {}\r\n", size)
        } else {
            format!("{}\r\n", size)
        };
        sink.write_all(header.as_bytes()).await?;
        tokio::io::copy(&mut self.file, sink).await?;
        Ok(size)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{deps, line};
    use super::*;
    use crate::local::memory::MemoryStore;
    use crate::transport::mock::{MockUpstream, NodeBehavior};

    async fn proxy(lines: Vec<RequestLine>, deps: &ProxyDeps) -> Arc<RequestProxy> {
        let request = NewRequest::build(
            RequestTemplate::new(RequestType::Waveform),
            "alice".into(),
            None,
            lines,
            deps,
        )
        .await;
        Arc::new(RequestProxy::new(7, Utc::now(), request, deps.clone()))
    }

    #[tokio::test]
    async fn test_status_before_and_after_execute() {
        let deps = deps(Arc::new(MockUpstream::new()), Arc::new(MemoryStore::new()));
        let proxy = proxy(vec![line("GE", "APE"), line("NET", "STA")], &deps).await;

        let status = proxy.status();
        assert!(!status.ready);
        assert_eq!(status.volumes.len(), 1);
        assert_eq!(status.volumes[0].status, Status::Processing);
        assert_eq!(status.volumes[0].lines.len(), 2);

        proxy.execute().await;
        let status = proxy.status();
        assert!(status.ready);
        assert_eq!(status.size, 4);
        assert_eq!(status.volumes.len(), 2);
        assert_eq!(status.volumes[0].id, "V1-1");
        let nodata = &status.volumes[1];
        assert_eq!(nodata.id, "NODATA");
        assert_eq!(nodata.dcid, "TEST");
        assert_eq!(nodata.lines[0].content, line("NET", "STA").content());
        assert_eq!(nodata.lines[0].message, "routing failed");
    }

    #[tokio::test]
    async fn test_download_framing() {
        let store = Arc::new(MemoryStore::new());
        let local = line("GE", "LOC");
        store.insert(&local, vec![b"ab", b"cde"]);
        let deps = deps(Arc::new(MockUpstream::new()), store);
        let proxy = proxy(vec![local, line("GE", "APE")], &deps).await;

        let mut out = Vec::new();
        let err = proxy.download(&mut out, None, false, false).await.unwrap_err();
        assert_eq!(err.to_string(), "request not ready");

        proxy.execute().await;

        let mut out = Vec::new();
        assert_eq!(proxy.download(&mut out, None, true, false).await.unwrap(), 9);
        assert_eq!(out, b"9\r\nabcdeDATA");

        let mut out = Vec::new();
        proxy.download(&mut out, None, true, true).await.unwrap();
        assert_eq!(out, b"CHUNK 2\r\nabCHUNK 3\r\ncdeCHUNK 4\r\nDATA");

        let mut out = Vec::new();
        proxy.download(&mut out, Some("local"), false, false).await.unwrap();
        assert_eq!(out, b"5\r\nabcde");

        let mut out = Vec::new();
        proxy.download(&mut out, Some("V1-1"), false, true).await.unwrap();
        assert_eq!(out, b"CHUNK 4\r\nDATA");

        let mut out = Vec::new();
        let err = proxy.download(&mut out, Some("V9-9"), false, false).await.unwrap_err();
        assert_eq!(err.to_string(), "volume not found");
    }

    #[tokio::test]
    async fn test_encrypted_refused_before_local_frames() {
        let store = Arc::new(MemoryStore::new());
        let local = line("GE", "LOC");
        store.insert(&local, vec![b"ab"]);
        let upstream = Arc::new(MockUpstream::new());
        upstream.set("geofon:1", NodeBehavior::Encrypted);
        let deps = deps(upstream, store);
        let proxy = proxy(vec![local, line("GE", "APE")], &deps).await;
        proxy.execute().await;

        for chunked in [true, false] {
            let mut out = Vec::new();
            let err = proxy.download(&mut out, None, true, chunked).await.unwrap_err();
            assert!(matches!(err, Error::State(_)));
            assert!(out.is_empty());
        }

        // The local volume alone is still available
        let mut out = Vec::new();
        proxy.download(&mut out, Some("local"), false, true).await.unwrap();
        assert_eq!(out, b"CHUNK 2\r\nab");
    }

    #[tokio::test]
    async fn test_remote_failure_after_whole_frames() {
        let store = Arc::new(MemoryStore::new());
        let local = line("GE", "LOC");
        store.insert(&local, vec![b"ab", b"cde"]);
        let upstream = Arc::new(MockUpstream::new());
        upstream.set("geofon:1", NodeBehavior::FailDownload);
        let deps = deps(upstream, store);
        let proxy = proxy(vec![local, line("GE", "APE")], &deps).await;
        proxy.execute().await;

        let mut out = Vec::new();
        let err = proxy.download(&mut out, None, true, true).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(out, b"CHUNK 2\r\nabCHUNK 3\r\ncde");
    }

    #[tokio::test]
    async fn test_local_chunks_without_remote_lines() {
        let store = Arc::new(MemoryStore::new());
        let local = line("GE", "LOC");
        store.insert(&local, vec![b"ab"]);
        let deps = deps(Arc::new(MockUpstream::new()), store);
        let proxy = proxy(vec![local], &deps).await;

        // Nothing remote to wait for
        let mut out = Vec::new();
        let download = proxy.download(&mut out, None, true, true);
        let n = tokio::time::timeout(std::time::Duration::from_secs(5), download)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, b"CHUNK 2\r\nab");
        assert!(!proxy.is_ready());
    }

    #[tokio::test]
    async fn test_blocking_download_waits() {
        let deps = deps(Arc::new(MockUpstream::new()), Arc::new(MemoryStore::new()));
        let proxy = proxy(vec![line("NET", "STA")], &deps).await;

        let waiter = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                let mut out = Vec::new();
                proxy.download(&mut out, None, true, false).await.unwrap();
                out
            })
        };
        tokio::task::yield_now().await;
        proxy.execute().await;

        assert_eq!(waiter.await.unwrap(), b"0\r\n");
    }

    #[tokio::test]
    async fn test_purge_waits_for_users() {
        let upstream = Arc::new(MockUpstream::new());
        let deps = deps(upstream.clone(), Arc::new(MemoryStore::new()));
        let proxy = proxy(vec![line("GE", "APE")], &deps).await;
        proxy.execute().await;

        let guard = proxy.acquire();
        proxy.purge();
        tokio::task::yield_now().await;
        assert!(upstream.purged().is_empty());

        drop(guard);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(upstream.purged(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let deps = deps(Arc::new(MockUpstream::new()), Arc::new(MemoryStore::new()));
        let proxy = proxy(vec![line("GE", "APE"), line("NET", "STA")], &deps).await;
        proxy.execute().await;

        let snapshot = proxy.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = RequestProxy::restore(serde_json::from_str(&json).unwrap(), deps.clone());

        assert!(restored.is_ready());
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.status(), proxy.status());
    }

    #[tokio::test]
    async fn test_router_error_marks_lines_unrouted() {
        let mut deps = deps(Arc::new(MockUpstream::new()), Arc::new(MemoryStore::new()));
        deps.options = Arc::new(ProxyOptions {
            use_inventory: true,
            ..(*deps.options).clone()
        });
        let proxy = proxy(vec![line("GE", "APE")], &deps).await;
        proxy.execute().await;

        let status = proxy.status();
        assert!(status.error);
        assert_eq!(status.message, "empty request after wildcard expansion");
        assert_eq!(status.volumes[0].id, "NODATA");
    }
}
