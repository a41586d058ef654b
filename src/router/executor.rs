//! Per-destination execution
//!
//! A [`RequestExecutor`] owns the lines routed to one destination for one
//! pass. It shards them, submits the shards in line order, waits for each
//! and hands back whatever has to be routed again.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::app::metrics::SUBMITTED_REQUESTS;
use crate::request::{Request, RequestLine, RequestStatus, RequestTemplate, SentRequest, ShardLimits};
use crate::transport::{Caller, Upstream};

/// Split lines into shards bounded by line count and estimated size.
///
/// A shard is closed before a line that would take it over the byte limit;
/// a single line above the limit still forms a shard of its own.
pub fn shard_lines(lines: Vec<RequestLine>, limits: &ShardLimits) -> Vec<Vec<RequestLine>> {
    let max_lines = limits.max_lines.max(1);
    let max_bytes = limits.max_bytes();

    let mut shards = Vec::new();
    let mut current: Vec<RequestLine> = Vec::new();
    let mut bytes = 0u64;

    for line in lines {
        let full = current.len() >= max_lines || bytes.saturating_add(line.estimated_size) > max_bytes;
        if full && !current.is_empty() {
            shards.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes = bytes.saturating_add(line.estimated_size);
        current.push(line);
    }

    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

/// Mark every line as tried at `address`
pub(crate) fn stamp(mut lines: Vec<RequestLine>, address: &str) -> Vec<RequestLine> {
    for line in &mut lines {
        line.routes_tried.insert(address.to_string());
    }
    lines
}

#[derive(Debug, Default)]
pub struct ExecutorReport {
    pub sent: Vec<SentRequest>,
    /// Lines to route again, already stamped with this destination
    pub retry: Vec<RequestLine>,
}

pub struct RequestExecutor<'a> {
    pub upstream: &'a dyn Upstream,
    pub caller: &'a Caller,
    pub template: &'a Arc<RequestTemplate>,
    pub address: String,
    pub lines: Vec<RequestLine>,
}

impl RequestExecutor<'_> {
    pub async fn run(mut self) -> ExecutorReport {
        let mut report = ExecutorReport::default();
        let lines = stamp(std::mem::take(&mut self.lines), &self.address);

        for shard in shard_lines(lines, &self.template.limits) {
            let request = Request::with_lines(self.template, shard);

            let mut sent = match self.upstream.submit(&self.address, self.caller, &request).await {
                Ok(sent) => sent,
                Err(e) => {
                    warn!("[{}] Submit of {} lines failed: {}", self.address, request.len(), e);
                    report.retry.extend(request.content);
                    continue;
                }
            };
            SUBMITTED_REQUESTS.inc();

            let status = match self.upstream.wait(&sent.ticket).await {
                Ok(status) if !(status.error && status.volumes.is_empty()) => status,
                Ok(status) => {
                    warn!(
                        "[{}] Request {} failed: {}",
                        self.address, sent.ticket.id, status.message
                    );
                    self.discard(&sent).await;
                    report.retry.extend(request.content);
                    continue;
                }
                Err(e) => {
                    warn!("[{}] Request {} failed: {}", self.address, sent.ticket.id, e);
                    self.discard(&sent).await;
                    report.retry.extend(request.content);
                    continue;
                }
            };

            let failed = failed_lines(&request.content, &status);
            debug!(
                "[{}] Request {} done, {} of {} lines to retry",
                self.address,
                sent.ticket.id,
                failed.len(),
                request.len()
            );
            report.retry.extend(failed);
            sent.status = Some(status);
            report.sent.push(sent);
        }

        report
    }

    async fn discard(&self, sent: &SentRequest) {
        if let Err(e) = self.upstream.purge(&sent.ticket).await {
            debug!("[{}] Purge of {} failed: {}", self.address, sent.ticket.id, e);
        }
    }
}

/// Lines whose volume or own status is not final
fn failed_lines(lines: &[RequestLine], status: &RequestStatus) -> Vec<RequestLine> {
    let failed: HashSet<&str> = status
        .volumes
        .iter()
        .flat_map(|volume| {
            volume
                .lines
                .iter()
                .filter(move |line| !volume.status.is_final() || !line.status.is_final())
                .map(|line| line.content.as_str())
        })
        .collect();

    lines
        .iter()
        .filter(|line| failed.contains(line.content().as_str()))
        .cloned()
        .collect()
}
