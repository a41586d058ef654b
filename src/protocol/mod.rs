//! Wire Protocol Layer
//!
//! Responsibilities:
//! - Tokenize client command lines (case-insensitive keywords)
//! - Check argument counts and shapes
//! - Parse selection lines sent while a request is being built
//!
//! No state lives here; the session decides what a command means in context.

mod selection;

pub use selection::parse_selection;

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::request::RequestType;

/// Software line answered to `HELLO`
pub const SOFTWARE: &str = concat!("ArcLink Proxy v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello,
    User {
        name: String,
        password: Option<String>,
    },
    Institution(String),
    Label(String),
    UserIp(String),
    Request {
        kind: RequestType,
        args: BTreeMap<String, String>,
    },
    End,
    /// Request id or `ALL`
    Status(String),
    Download {
        request: String,
        volume: Option<String>,
        position: Option<u64>,
        blocking: bool,
        chunked: bool,
    },
    Purge(String),
    ShowErr,
    Bye,
}

impl Command {
    /// Whether a line opens with `END`, the only command accepted while building
    pub fn is_end(tokens: &[&str]) -> bool {
        tokens.first().is_some_and(|t| t.eq_ignore_ascii_case("END"))
    }

    pub fn parse(tokens: &[&str]) -> Result<Self> {
        let Some(keyword) = tokens.first() else {
            return Err(invalid());
        };
        let argc = tokens.len();

        let command = match keyword.to_uppercase().as_str() {
            "HELLO" => Command::Hello,
            "USER" => {
                check(argc, 2, 3)?;
                Command::User {
                    name: tokens[1].to_string(),
                    password: tokens.get(2).map(|p| p.to_string()),
                }
            }
            "INSTITUTION" => {
                check(argc, 2, usize::MAX)?;
                Command::Institution(tokens[1..].join(" "))
            }
            "LABEL" => {
                check(argc, 2, 2)?;
                Command::Label(tokens[1].to_string())
            }
            "USER_IP" => {
                check(argc, 2, 2)?;
                Command::UserIp(tokens[1].to_string())
            }
            "REQUEST" => {
                check(argc, 2, usize::MAX)?;
                Command::Request {
                    kind: tokens[1].parse()?,
                    args: parse_args(&tokens[2..])?,
                }
            }
            "END" => Command::End,
            "STATUS" => {
                check(argc, 2, 2)?;
                Command::Status(tokens[1].to_string())
            }
            "DOWNLOAD" => download(tokens, false, false)?,
            "BDOWNLOAD" => download(tokens, true, false)?,
            "BCDOWNLOAD" => download(tokens, true, true)?,
            "PURGE" => {
                check(argc, 2, 2)?;
                Command::Purge(tokens[1].to_string())
            }
            "SHOWERR" => Command::ShowErr,
            "BYE" => Command::Bye,
            _ => return Err(invalid()),
        };
        Ok(command)
    }
}

fn invalid() -> Error {
    Error::Protocol("invalid command".into())
}

fn check(argc: usize, min: usize, max: usize) -> Result<()> {
    if argc < min || argc > max {
        Err(Error::syntax())
    } else {
        Ok(())
    }
}

fn parse_args(tokens: &[&str]) -> Result<BTreeMap<String, String>> {
    tokens
        .iter()
        .map(|t| {
            t.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(Error::syntax)
        })
        .collect()
}

fn download(tokens: &[&str], blocking: bool, chunked: bool) -> Result<Command> {
    check(tokens.len(), 2, 3)?;

    let (request, volume) = match tokens[1].split_once('.') {
        Some((request, volume)) => (request.to_string(), Some(volume.to_string())),
        None => (tokens[1].to_string(), None),
    };
    let position = tokens
        .get(2)
        .map(|p| p.parse::<u64>().map_err(|_| Error::syntax()))
        .transpose()?;

    Ok(Command::Download {
        request,
        volume,
        position,
        blocking,
        chunked,
    })
}
