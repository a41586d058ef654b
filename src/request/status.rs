//! Status documents
//!
//! Both directions of the `<arclink>` status document: parsing what an
//! upstream node sends in reply to `STATUS`, and rendering the document this
//! server sends to its own clients.

use std::fmt;
use std::str::FromStr;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Processing state of a request, volume or line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    Unset,
    Processing,
    Cancelled,
    Ok,
    Warning,
    Error,
    Retry,
    Denied,
    NoData,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unset => "UNSET",
            Status::Processing => "PROCESSING",
            Status::Cancelled => "CANCELLED",
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Error => "ERROR",
            Status::Retry => "RETRY",
            Status::Denied => "DENIED",
            Status::NoData => "NODATA",
        }
    }

    /// Terminal states that must not be retried elsewhere
    pub fn is_final(&self) -> bool {
        matches!(self, Status::Ok | Status::Warning | Status::Denied)
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "UNSET" => Ok(Status::Unset),
            "PROCESSING" => Ok(Status::Processing),
            "CANCELLED" => Ok(Status::Cancelled),
            "OK" => Ok(Status::Ok),
            "WARNING" => Ok(Status::Warning),
            "ERROR" => Ok(Status::Error),
            "RETRY" => Ok(Status::Retry),
            "DENIED" => Ok(Status::Denied),
            "NODATA" => Ok(Status::NoData),
            _ => Err(Error::Protocol(format!("invalid status value: {}", s))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStatus {
    pub content: String,
    pub status: Status,
    pub size: u64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub id: String,
    #[serde(default)]
    pub dcid: String,
    pub status: Status,
    pub size: u64,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub lines: Vec<LineStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub args: String,
    pub ready: bool,
    #[serde(default)]
    pub error: bool,
    pub size: u64,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub volumes: Vec<VolumeStatus>,
}

// ============================================================================
// Parsing
// ============================================================================

fn malformed(e: impl fmt::Display) -> Error {
    Error::Protocol(format!("malformed status document: {}", e))
}

fn attributes(e: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn parse_size(value: &str) -> Result<u64> {
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| malformed(format!("invalid size: {}", value)))
}

/// Parse the document an upstream node returns for `STATUS`
pub fn parse_status_document(xml: &str) -> Result<Vec<RequestStatus>> {
    let mut reader = Reader::from_str(xml);
    let mut requests: Vec<RequestStatus> = Vec::new();
    let mut seen_root = false;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"arclink" => seen_root = true,
                b"request" => {
                    let mut request = RequestStatus::default();
                    for (key, value) in attributes(&e)? {
                        match key.as_str() {
                            "id" => request.id = value,
                            "type" => request.kind = value,
                            "label" => request.label = value,
                            "args" => request.args = value,
                            "ready" => request.ready = parse_bool(&value),
                            "error" => request.error = parse_bool(&value),
                            "encrypted" => request.encrypted = parse_bool(&value),
                            "size" => request.size = parse_size(&value)?,
                            "message" => request.message = value,
                            _ => {}
                        }
                    }
                    requests.push(request);
                }
                b"volume" => {
                    let request = requests
                        .last_mut()
                        .ok_or_else(|| malformed("volume outside request"))?;
                    let mut volume = VolumeStatus::default();
                    for (key, value) in attributes(&e)? {
                        match key.as_str() {
                            "id" => volume.id = value,
                            "dcid" => volume.dcid = value,
                            "status" => volume.status = value.parse()?,
                            "size" => volume.size = parse_size(&value)?,
                            "encrypted" => volume.encrypted = parse_bool(&value),
                            "message" => volume.message = value,
                            _ => {}
                        }
                    }
                    request.volumes.push(volume);
                }
                b"line" => {
                    let volume = requests
                        .last_mut()
                        .and_then(|r| r.volumes.last_mut())
                        .ok_or_else(|| malformed("line outside volume"))?;
                    let mut line = LineStatus::default();
                    for (key, value) in attributes(&e)? {
                        match key.as_str() {
                            "content" => line.content = value.trim().to_string(),
                            "status" => line.status = value.parse()?,
                            "size" => line.size = parse_size(&value)?,
                            "message" => line.message = value,
                            _ => {}
                        }
                    }
                    volume.lines.push(line);
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(malformed("bad root element"));
    }
    Ok(requests)
}

// ============================================================================
// Rendering
// ============================================================================

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Render a status document, without the trailing `END` line
pub fn render_status_document(requests: &[RequestStatus]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<arclink>\n");

    for request in requests {
        out.push_str(&format!(
            "  <request id=\"{}\" type=\"{}\" label=\"{}\" args=\"{}\" size=\"{}\" ready=\"{}\" encrypted=\"{}\" error=\"{}\" message=\"{}\">\n",
            escape(request.id.as_str()),
            escape(request.kind.as_str()),
            escape(request.label.as_str()),
            escape(request.args.as_str()),
            request.size,
            bool_str(request.ready),
            bool_str(request.encrypted),
            bool_str(request.error),
            escape(request.message.as_str()),
        ));

        for volume in &request.volumes {
            out.push_str(&format!(
                "    <volume id=\"{}\" dcid=\"{}\" encrypted=\"{}\" status=\"{}\" size=\"{}\" message=\"{}\">\n",
                escape(volume.id.as_str()),
                escape(volume.dcid.as_str()),
                bool_str(volume.encrypted),
                volume.status,
                volume.size,
                escape(volume.message.as_str()),
            ));
            for line in &volume.lines {
                out.push_str(&format!(
                    "      <line content=\"{}\" status=\"{}\" size=\"{}\" message=\"{}\" />\n",
                    escape(line.content.as_str()),
                    line.status,
                    line.size,
                    escape(line.message.as_str()),
                ));
            }
            out.push_str("    </volume>\n");
        }

        out.push_str("  </request>\n");
    }

    out.push_str("</arclink>");
    out
}
