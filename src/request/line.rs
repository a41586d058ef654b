//! Request lines

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::time::{format_timestamp, open_end, whole_seconds};
use crate::common::Timestamp;

/// One stream/time selection
///
/// Empty codes mean "any". `routes_tried` collects the destinations this
/// line was already submitted to and only ever grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLine {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location: String,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    #[serde(default)]
    pub constraints: BTreeMap<String, String>,
    #[serde(default)]
    pub routes_tried: BTreeSet<String>,
    #[serde(default)]
    pub estimated_size: u64,
}

impl RequestLine {
    /// Create a line; `.` is accepted as "any" for every code
    pub fn new(
        network: &str,
        station: &str,
        channel: &str,
        location: &str,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> Self {
        Self {
            network: undot(network),
            station: undot(station),
            channel: undot(channel),
            location: undot(location),
            start,
            end,
            constraints: BTreeMap::new(),
            routes_tried: BTreeSet::new(),
            estimated_size: 0,
        }
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    /// Whether any code is empty or carries a glob character
    pub fn has_wildcard(&self) -> bool {
        [&self.network, &self.station, &self.channel, &self.location]
            .iter()
            .any(|code| code.contains('*') || code.contains('?'))
            || self.network.is_empty()
            || self.station.is_empty()
            || self.channel.is_empty()
    }

    /// Canonical text, also used to match remote line status back to lines
    pub fn content(&self) -> String {
        self.to_string()
    }

    /// Rough size by band code of the channel, used for locally served lines
    pub fn nominal_size(&self) -> u64 {
        let samples_per_second = match self.channel.chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('E') | Some('H') => 100.0,
            Some('S') => 50.0,
            Some('B') => 20.0,
            Some('L') => 1.0,
            Some('V') => 0.1,
            Some('U') => 0.01,
            _ => 20.0,
        };
        let end = self.end.unwrap_or_else(open_end);
        (whole_seconds(&self.start, &end) as f64 * samples_per_second * 1.5) as u64
    }
}

fn undot(code: &str) -> String {
    if code == "." {
        String::new()
    } else {
        code.to_string()
    }
}

fn dot(code: &str) -> &str {
    if code.is_empty() {
        "."
    } else {
        code
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.end.unwrap_or_else(open_end);
        write!(
            f,
            "{} {} {} {} {} {}",
            format_timestamp(&self.start),
            format_timestamp(&end),
            dot(&self.network),
            dot(&self.station),
            dot(&self.channel),
            dot(&self.location)
        )?;
        for (key, value) in &self.constraints {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::parse_timestamp;

    fn line(net: &str, sta: &str, cha: &str, loc: &str) -> RequestLine {
        RequestLine::new(
            net,
            sta,
            cha,
            loc,
            parse_timestamp("2023,1,1,0,0,0").unwrap(),
            Some(parse_timestamp("2023,1,1,0,1,0").unwrap()),
        )
    }

    #[test]
    fn test_content() {
        let l = line("GE", "APE", "BHZ", "").with_constraint("quality", "D");
        assert_eq!(l.content(), "2023,1,1,0,0,0 2023,1,1,0,1,0 GE APE BHZ . quality=D");
        assert_eq!(l.location, "");
    }

    #[test]
    fn test_open_end_content() {
        let mut l = line("GE", "APE", "BHZ", "00");
        l.end = None;
        assert_eq!(l.content(), "2023,1,1,0,0,0 9999,12,31,23,59,59 GE APE BHZ 00");
    }

    #[test]
    fn test_dot_is_wildcard() {
        let l = line("GE", ".", "BH?", ".");
        assert_eq!(l.station, "");
        assert!(l.has_wildcard());
        assert!(!line("GE", "APE", "BHZ", "").has_wildcard());
    }

    #[test]
    fn test_nominal_size() {
        // 60 s of a 20 Hz channel
        assert_eq!(line("GE", "APE", "BHZ", "").nominal_size(), 1800);
        assert_eq!(line("GE", "APE", "LHZ", "").nominal_size(), 90);
    }
}
