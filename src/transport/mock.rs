//! Scripted in-memory upstream used by router, proxy and session tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::common::Result;
use crate::error::Error;
use crate::request::{
    LineStatus, Request, RequestStatus, SentRequest, Status, Ticket, VolumeStatus,
};

use super::{Caller, Sink, Upstream};

/// How a fake node answers
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBehavior {
    /// Accept and serve every line
    Serve,
    /// Refuse every submission
    FailSubmit,
    /// Accept, then never become ready
    FailWait,
    /// Accept, but report every line with this status
    LineStatus(Status),
    /// Serve, flagging every volume as encrypted
    Encrypted,
    /// Serve, but fail every download
    FailDownload,
}

/// A submission as the fake node saw it
#[derive(Debug, Clone)]
pub struct Submission {
    pub address: String,
    pub user: String,
    pub lines: Vec<String>,
}

pub struct MockUpstream {
    behaviors: Mutex<HashMap<String, NodeBehavior>>,
    statuses: Mutex<HashMap<String, RequestStatus>>,
    submissions: Mutex<Vec<Submission>>,
    purged: Mutex<Vec<String>>,
    payload: Vec<u8>,
    next_id: AtomicU64,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::with_payload(b"DATA".to_vec())
    }

    /// Every served volume streams `payload`
    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            purged: Mutex::new(Vec::new()),
            payload,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set(&self, address: &str, behavior: NodeBehavior) {
        self.behaviors.lock().insert(address.to_string(), behavior);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn submissions_to(&self, address: &str) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.address == address)
            .count()
    }

    pub fn purged(&self) -> Vec<String> {
        self.purged.lock().clone()
    }

    fn behavior(&self, address: &str) -> NodeBehavior {
        self.behaviors
            .lock()
            .get(address)
            .cloned()
            .unwrap_or(NodeBehavior::Serve)
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn submit(&self, address: &str, caller: &Caller, request: &Request) -> Result<SentRequest> {
        let lines: Vec<String> = request.content.iter().map(|l| l.content()).collect();
        self.submissions.lock().push(Submission {
            address: address.to_string(),
            user: caller.user.clone(),
            lines: lines.clone(),
        });

        let behavior = self.behavior(address);
        if behavior == NodeBehavior::FailSubmit {
            return Err(Error::Transport(format!("cannot connect to {}", address)));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (volume_status, line_status) = match &behavior {
            NodeBehavior::LineStatus(status) => (Status::Ok, *status),
            _ => (Status::Ok, Status::Ok),
        };
        let served = line_status == Status::Ok;
        let size = if served { self.payload.len() as u64 } else { 0 };

        let status = RequestStatus {
            id: id.clone(),
            kind: request.kind().to_string(),
            ready: behavior != NodeBehavior::FailWait,
            size,
            volumes: vec![VolumeStatus {
                id: "V1".into(),
                dcid: address.to_string(),
                status: volume_status,
                size,
                encrypted: behavior == NodeBehavior::Encrypted,
                lines: lines
                    .into_iter()
                    .map(|content| LineStatus {
                        content,
                        status: line_status,
                        size: 0,
                        message: String::new(),
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        self.statuses.lock().insert(id.clone(), status);

        Ok(SentRequest {
            ticket: Ticket {
                address: address.to_string(),
                id,
                user: caller.user.clone(),
                user_ip: caller.user_ip.clone(),
            },
            organization: format!("org@{}", address),
            content: request.content.clone(),
            status: None,
        })
    }

    async fn status(&self, ticket: &Ticket) -> Result<RequestStatus> {
        self.statuses
            .lock()
            .get(&ticket.id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown request {}", ticket.id)))
    }

    async fn wait(&self, ticket: &Ticket) -> Result<RequestStatus> {
        let status = self.status(ticket).await?;
        if status.ready {
            Ok(status)
        } else {
            Err(Error::Timeout)
        }
    }

    async fn download(&self, ticket: &Ticket, _volume: Option<&str>, sink: Sink<'_>) -> Result<u64> {
        let size = self.status(ticket).await?.size;
        if self.behavior(&ticket.address) == NodeBehavior::FailDownload {
            return Err(Error::Transport(format!("{}: download failed", ticket.address)));
        }
        if size == 0 {
            return Ok(0);
        }
        sink.write_all(&self.payload).await?;
        Ok(self.payload.len() as u64)
    }

    async fn purge(&self, ticket: &Ticket) -> Result<()> {
        self.purged.lock().push(ticket.id.clone());
        Ok(())
    }
}
