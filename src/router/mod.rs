//! Router Layer
//!
//! Responsibilities:
//! - Expand wildcard lines against the inventory snapshot
//! - Resolve every line to its next untried destination
//! - Run one executor per destination, concurrently, pass after pass
//! - Partition the result into sent, unrouted and no-data lines
//!
//! Every retried line carries the destinations it was already sent to, so each
//! pass shrinks the set of candidates and the loop terminates.

mod executor;
mod expand;
mod resolve;

pub use executor::{shard_lines, ExecutorReport, RequestExecutor};
pub use expand::expand;
pub use resolve::{find_route, resolve, Resolution, SPECIFICITY_ORDER};

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::app::metrics::{RETRIED_LINES, ROUTER_PASSES, SUBMITTED_REQUESTS};
use crate::error::{Error, Result};
use crate::request::{Request, RequestLine, RequestTemplate, SentRequest};
use crate::snapshot::{Routing, SnapshotSource};
use crate::transport::{Caller, Upstream};

use executor::stamp;

#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    /// Node everything goes to when routing is off
    pub address: String,
    /// Destination address rewrites
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub use_inventory: bool,
    pub use_routing: bool,
    pub preferred_sample_rate: Option<f64>,
    /// Resolve and shard, submit nothing
    pub dry_run: bool,
}

/// A sub-request that would be submitted
#[derive(Debug, Clone)]
pub struct Shard {
    pub address: String,
    pub lines: Vec<RequestLine>,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub sent: Vec<SentRequest>,
    /// Only filled on a dry run
    pub planned: Vec<Shard>,
    pub unrouted: Vec<RequestLine>,
    pub no_data: Vec<RequestLine>,
}

#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub sent: Vec<SentRequest>,
    pub failed: Vec<RequestLine>,
}

/// Lines of one pass, grouped by destination in first-seen order
#[derive(Default)]
struct Assignment {
    groups: Vec<(String, Vec<RequestLine>)>,
    unrouted: Vec<RequestLine>,
    no_data: Vec<RequestLine>,
}

pub struct Router {
    upstream: Arc<dyn Upstream>,
    snapshots: Arc<dyn SnapshotSource>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        snapshots: Arc<dyn SnapshotSource>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            upstream,
            snapshots,
            settings,
        }
    }

    /// Route, submit and wait for every line, retrying on alternate routes
    pub async fn execute(
        &self,
        request: &Request,
        caller: &Caller,
        options: &ExecuteOptions,
    ) -> Result<Outcome> {
        let lines = self.prepare(request, options).await?;
        if !options.use_routing {
            return self.execute_direct(&request.template, lines, caller, options).await;
        }

        let routing = self.snapshots.routing(request).await?;
        let mut outcome = Outcome::default();
        let mut pending = lines;
        let mut pass = 0;

        while !pending.is_empty() {
            pass += 1;
            ROUTER_PASSES.inc();

            let assignment = self.assign(pending, &routing);
            outcome.unrouted.extend(assignment.unrouted);
            outcome.no_data.extend(assignment.no_data);
            if assignment.groups.is_empty() {
                break;
            }

            if options.dry_run {
                outcome.planned = plan(&request.template, assignment.groups);
                break;
            }

            debug!(
                "[router] Pass {}: {} destinations",
                pass,
                assignment.groups.len()
            );
            let executors = assignment.groups.into_iter().map(|(address, lines)| {
                RequestExecutor {
                    upstream: self.upstream.as_ref(),
                    caller,
                    template: &request.template,
                    address,
                    lines,
                }
                .run()
            });

            pending = Vec::new();
            for report in join_all(executors).await {
                outcome.sent.extend(report.sent);
                pending.extend(report.retry);
            }
            RETRIED_LINES.inc_by(pending.len() as u64);
        }

        info!(
            "[router] {} sub-requests sent, {} lines unrouted, {} without data after {} passes",
            outcome.sent.len(),
            outcome.unrouted.len(),
            outcome.no_data.len(),
            pass
        );
        Ok(outcome)
    }

    /// Route and submit without waiting for the results
    pub async fn route(
        &self,
        request: &Request,
        caller: &Caller,
        options: &ExecuteOptions,
    ) -> Result<RouteOutcome> {
        let lines = self.prepare(request, options).await?;
        let routing = self.snapshots.routing(request).await?;
        let mut outcome = RouteOutcome::default();
        let mut pending = lines;

        while !pending.is_empty() {
            let assignment = self.assign(pending, &routing);
            outcome.failed.extend(assignment.unrouted);
            outcome.failed.extend(assignment.no_data);
            if assignment.groups.is_empty() {
                break;
            }

            let mut failed = Vec::new();
            for (address, lines) in assignment.groups {
                let mut shards = shard_lines(stamp(lines, &address), &request.template.limits).into_iter();
                while let Some(shard) = shards.next() {
                    let child = Request::with_lines(&request.template, shard);
                    match self.upstream.submit(&address, caller, &child).await {
                        Ok(sent) => {
                            SUBMITTED_REQUESTS.inc();
                            outcome.sent.push(sent);
                        }
                        Err(e) => {
                            warn!("[{}] Submit failed: {}", address, e);
                            failed.extend(child.content);
                            failed.extend(shards.by_ref().flatten());
                        }
                    }
                }
            }
            pending = failed;
        }

        Ok(outcome)
    }

    /// Lines to work on, expanded if requested
    async fn prepare(&self, request: &Request, options: &ExecuteOptions) -> Result<Vec<RequestLine>> {
        if request.is_empty() {
            return Err(Error::Routing("empty request".into()));
        }
        if !options.use_inventory {
            return Ok(request.content.clone());
        }

        let inventory = self.snapshots.inventory(request).await?;
        expand(&request.content, &inventory, options.preferred_sample_rate)
    }

    fn assign(&self, lines: Vec<RequestLine>, routing: &Routing) -> Assignment {
        let mut assignment = Assignment::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for line in lines {
            match resolve(&line, routing, &self.settings.aliases) {
                Resolution::Routed(address) => match index.get(&address) {
                    Some(&i) => assignment.groups[i].1.push(line),
                    None => {
                        index.insert(address.clone(), assignment.groups.len());
                        assignment.groups.push((address, vec![line]));
                    }
                },
                Resolution::NoData => assignment.no_data.push(line),
                Resolution::Unrouted => {
                    debug!("[router] No route for {}", line);
                    assignment.unrouted.push(line);
                }
            }
        }
        assignment
    }

    /// Everything to the primary node, no retries
    async fn execute_direct(
        &self,
        template: &Arc<RequestTemplate>,
        lines: Vec<RequestLine>,
        caller: &Caller,
        options: &ExecuteOptions,
    ) -> Result<Outcome> {
        let address = &self.settings.address;
        let mut outcome = Outcome::default();

        for shard in shard_lines(lines, &template.limits) {
            if options.dry_run {
                outcome.planned.push(Shard {
                    address: address.clone(),
                    lines: shard,
                });
                continue;
            }

            let request = Request::with_lines(template, shard);
            let mut sent = self
                .upstream
                .submit(address, caller, &request)
                .await
                .map_err(|e| {
                    Error::Transport(format!(
                        "error getting {} data from {}: {}",
                        template.kind, address, e
                    ))
                })?;
            SUBMITTED_REQUESTS.inc();

            match self.upstream.wait(&sent.ticket).await {
                Ok(status) => sent.status = Some(status),
                Err(e) => warn!("[{}] Request {} failed: {}", address, sent.ticket.id, e),
            }
            outcome.sent.push(sent);
        }

        Ok(outcome)
    }
}

fn plan(template: &RequestTemplate, groups: Vec<(String, Vec<RequestLine>)>) -> Vec<Shard> {
    groups
        .into_iter()
        .flat_map(|(address, lines)| {
            shard_lines(lines, &template.limits)
                .into_iter()
                .map(move |lines| Shard {
                    address: address.clone(),
                    lines,
                })
        })
        .collect()
}
