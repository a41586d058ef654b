//! Request model
//!
//! Responsibilities:
//! - Selection lines and the requests built from them
//! - Immutable request templates used to derive sub-requests
//! - Tickets for requests submitted to an upstream node
//! - Remote status documents

mod line;
pub mod status;

pub use line::RequestLine;
pub use status::{LineStatus, RequestStatus, Status, VolumeStatus};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    Waveform,
    Inventory,
    Response,
    Routing,
    Qc,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Waveform => "WAVEFORM",
            RequestType::Inventory => "INVENTORY",
            RequestType::Response => "RESPONSE",
            RequestType::Routing => "ROUTING",
            RequestType::Qc => "QC",
        }
    }
}

impl FromStr for RequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "WAVEFORM" => Ok(RequestType::Waveform),
            "INVENTORY" => Ok(RequestType::Inventory),
            "RESPONSE" => Ok(RequestType::Response),
            "ROUTING" => Ok(RequestType::Routing),
            "QC" => Ok(RequestType::Qc),
            _ => Err(Error::Protocol(format!("unknown request type: {}", s))),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size limits for one sub-request sent to a single destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLimits {
    pub max_lines: usize,
    pub max_megabytes: u64,
}

impl ShardLimits {
    pub fn max_bytes(&self) -> u64 {
        self.max_megabytes.saturating_mul(1024 * 1024)
    }
}

impl Default for ShardLimits {
    fn default() -> Self {
        Self {
            max_lines: 990,
            max_megabytes: 500,
        }
    }
}

/// Everything a request carries except its lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub kind: RequestType,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub limits: ShardLimits,
}

impl RequestTemplate {
    pub fn new(kind: RequestType) -> Self {
        Self {
            kind,
            args: BTreeMap::new(),
            label: None,
            limits: ShardLimits::default(),
        }
    }

    /// Arguments as `key=value` separated by spaces
    pub fn args_string(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A template plus an ordered list of lines
#[derive(Debug, Clone)]
pub struct Request {
    pub template: Arc<RequestTemplate>,
    pub content: Vec<RequestLine>,
}

impl Request {
    pub fn new(template: RequestTemplate) -> Self {
        Self {
            template: Arc::new(template),
            content: Vec::new(),
        }
    }

    /// Empty request sharing type, args, label and limits
    pub fn from_template(template: &Arc<RequestTemplate>) -> Self {
        Self {
            template: Arc::clone(template),
            content: Vec::new(),
        }
    }

    pub fn with_lines(template: &Arc<RequestTemplate>, content: Vec<RequestLine>) -> Self {
        Self {
            template: Arc::clone(template),
            content,
        }
    }

    pub fn push(&mut self, line: RequestLine) {
        self.content.push(line);
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn kind(&self) -> RequestType {
        self.template.kind
    }

    /// Command lines that submit this request, `END` included
    pub fn to_wire(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.content.len() + 3);
        if let Some(label) = &self.template.label {
            lines.push(format!("LABEL {}", label));
        }
        let args = self.template.args_string();
        if args.is_empty() {
            lines.push(format!("REQUEST {}", self.template.kind));
        } else {
            lines.push(format!("REQUEST {} {}", self.template.kind, args));
        }
        lines.extend(self.content.iter().map(RequestLine::content));
        lines.push("END".to_string());
        lines
    }
}

/// Handle for a request accepted by an upstream node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub address: String,
    pub id: String,
    pub user: String,
    #[serde(default)]
    pub user_ip: Option<String>,
}

/// A sub-request that was submitted, with its cached final status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentRequest {
    pub ticket: Ticket,
    /// Organization name the node announced
    pub organization: String,
    pub content: Vec<RequestLine>,
    #[serde(default)]
    pub status: Option<RequestStatus>,
}

impl SentRequest {
    /// Total size of all volumes, 0 until the status is known
    pub fn size(&self) -> u64 {
        self.status
            .as_ref()
            .map(|s| s.volumes.iter().map(|v| v.size).sum())
            .unwrap_or(0)
    }
}
