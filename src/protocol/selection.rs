//! Selection lines
//!
//! `start end [net [sta [cha [loc]]]] [key=value ...]`, where `.` stands for
//! "any" in every code position.

use crate::common::time::parse_timestamp;
use crate::error::{Error, Result};
use crate::request::RequestLine;

const MAX_CODES: usize = 4;

/// Parse the whitespace-separated tokens of one selection line
pub fn parse_selection(tokens: &[&str]) -> Result<RequestLine> {
    let [start, end, rest @ ..] = tokens else {
        return Err(Error::syntax());
    };
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;

    let split = rest
        .iter()
        .position(|t| t.contains('='))
        .unwrap_or(rest.len());
    let (codes, constraints) = rest.split_at(split);
    if codes.len() > MAX_CODES {
        return Err(Error::syntax());
    }

    let code = |i: usize| codes.get(i).copied().unwrap_or(".");
    let mut line = RequestLine::new(code(0), code(1), code(2), code(3), start, Some(end));

    for pair in constraints {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                line.constraints.insert(key.to_string(), value.to_string());
            }
            _ => return Err(Error::syntax()),
        }
    }

    Ok(line)
}
