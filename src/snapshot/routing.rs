//! Routing snapshot
//!
//! Maps an exact `(network, station, location, channel)` key, where any
//! component may be empty, to the destinations serving it. The file form is a
//! flat list of routes; it is indexed on load.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::Timestamp;

/// One node able to serve a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// `host:port`
    pub address: String,
    /// Lower is preferred
    pub priority: u32,
    pub start: Timestamp,
    #[serde(default)]
    pub end: Option<Timestamp>,
}

/// Destinations per sub-protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    #[serde(default)]
    pub arclink: Vec<Destination>,
    #[serde(default)]
    pub seedlink: Vec<Destination>,
}

/// A route as it appears in the snapshot file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub station: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub channel: String,
    #[serde(flatten)]
    pub entry: RouteEntry,
}

/// On-disk form of [`Routing`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingFile {
    #[serde(default)]
    pub routes: Vec<Route>,
}

type RouteKey = (String, String, String, String);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RoutingFile", into = "RoutingFile")]
pub struct Routing {
    routes: HashMap<RouteKey, RouteEntry>,
}

impl Routing {
    /// Add a route; destinations for an existing key are appended
    pub fn add(&mut self, route: Route) {
        let key = (route.network, route.station, route.location, route.channel);
        let entry = self.routes.entry(key).or_default();
        entry.arclink.extend(route.entry.arclink);
        entry.seedlink.extend(route.entry.seedlink);
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.add(route);
        self
    }

    /// Exact key lookup
    pub fn get(&self, network: &str, station: &str, location: &str, channel: &str) -> Option<&RouteEntry> {
        self.routes.get(&(
            network.to_string(),
            station.to_string(),
            location.to_string(),
            channel.to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl From<RoutingFile> for Routing {
    fn from(file: RoutingFile) -> Self {
        let mut routing = Routing::default();
        for route in file.routes {
            routing.add(route);
        }
        routing
    }
}

impl From<Routing> for RoutingFile {
    fn from(routing: Routing) -> Self {
        let mut routes: Vec<Route> = routing
            .routes
            .into_iter()
            .map(|((network, station, location, channel), entry)| Route {
                network,
                station,
                location,
                channel,
                entry,
            })
            .collect();
        routes.sort_by(|a, b| {
            (&a.network, &a.station, &a.location, &a.channel)
                .cmp(&(&b.network, &b.station, &b.location, &b.channel))
        });
        RoutingFile { routes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_lookup() {
        let routing: Routing = serde_json::from_str(
            r#"{"routes": [
                {"network": "GE", "arclink": [
                    {"address": "geofon:18001", "priority": 1, "start": "1990-01-01T00:00:00"}
                ]},
                {"network": "GE", "station": "APE", "arclink": [
                    {"address": "noa:18001", "priority": 2, "start": "1990-01-01T00:00:00", "end": "2020-01-01T00:00:00"}
                ]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(routing.len(), 2);
        let entry = routing.get("GE", "", "", "").unwrap();
        assert_eq!(entry.arclink[0].address, "geofon:18001");
        assert!(entry.seedlink.is_empty());

        let entry = routing.get("GE", "APE", "", "").unwrap();
        assert!(entry.arclink[0].end.is_some());
        assert!(routing.get("GE", "APE", "", "BHZ").is_none());
    }

    #[test]
    fn test_duplicate_keys_merge() {
        let start = crate::common::time::parse_timestamp("2000,1,1").unwrap();
        let dest = |address: &str| Destination {
            address: address.into(),
            priority: 1,
            start,
            end: None,
        };
        let route = |address: &str| Route {
            network: "GE".into(),
            entry: RouteEntry {
                arclink: vec![dest(address)],
                seedlink: vec![],
            },
            ..Default::default()
        };

        let routing = Routing::default().with_route(route("a:1")).with_route(route("b:1"));
        assert_eq!(routing.len(), 1);
        assert_eq!(routing.get("GE", "", "", "").unwrap().arclink.len(), 2);

        let json = serde_json::to_string(&routing).unwrap();
        let back: Routing = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("GE", "", "", "").unwrap().arclink.len(), 2);
    }
}
