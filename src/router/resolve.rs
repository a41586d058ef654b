//! Destination resolution
//!
//! Pure lookup against a routing snapshot, no IO. The key search drops
//! location before channel, channel before station, station before network.

use std::collections::HashMap;

use crate::common::time::overlaps;
use crate::request::RequestLine;
use crate::snapshot::{Destination, RouteEntry, Routing};

const NETWORK: u8 = 8;
const STATION: u8 = 4;
const CHANNEL: u8 = 2;
const LOCATION: u8 = 1;

/// Key masks in lookup order
pub const SPECIFICITY_ORDER: [u8; 16] = [15, 14, 13, 11, 7, 12, 10, 9, 6, 5, 3, 8, 4, 2, 1, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Next untried destination
    Routed(String),
    /// Every viable destination was already tried
    NoData,
    /// No route key, or none of its destinations covers the window
    Unrouted,
}

/// First routing entry found for the line in specificity order
pub fn find_route<'a>(routing: &'a Routing, line: &RequestLine) -> Option<&'a RouteEntry> {
    SPECIFICITY_ORDER.iter().find_map(|&mask| {
        routing.get(
            pick(mask, NETWORK, &line.network),
            pick(mask, STATION, &line.station),
            pick(mask, LOCATION, &line.location),
            pick(mask, CHANNEL, &line.channel),
        )
    })
}

fn pick(mask: u8, bit: u8, code: &str) -> &str {
    if mask & bit != 0 {
        code
    } else {
        ""
    }
}

pub fn resolve(line: &RequestLine, routing: &Routing, aliases: &HashMap<String, String>) -> Resolution {
    let Some(entry) = find_route(routing, line) else {
        return Resolution::Unrouted;
    };

    let mut candidates: Vec<&Destination> = entry
        .arclink
        .iter()
        .filter(|d| overlaps(&d.start, d.end.as_ref(), &line.start, line.end.as_ref()))
        .collect();
    if candidates.is_empty() {
        return Resolution::Unrouted;
    }
    candidates.sort_by_key(|d| d.priority);

    candidates
        .into_iter()
        .map(|d| aliases.get(&d.address).unwrap_or(&d.address))
        .find(|address| !line.routes_tried.contains(*address))
        .map(|address| Resolution::Routed(address.clone()))
        .unwrap_or(Resolution::NoData)
}
