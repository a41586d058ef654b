//! Wildcard expansion against an inventory snapshot

use std::collections::HashSet;

use chrono::Utc;
use glob::Pattern;
use tracing::warn;

use crate::common::time::whole_seconds;
use crate::common::Timestamp;
use crate::error::{Error, Result};
use crate::request::RequestLine;
use crate::snapshot::inventory::{Epoch, Inventory, StationEpoch};

/// Diff assigned to streams without a usable sample rate
const UNKNOWN_RATE_DIFF: f64 = 10000.0;

/// Smallest estimate for a waveform stream with a known rate
const MIN_ESTIMATE: u64 = 512;

struct Patterns {
    network: Pattern,
    station: Pattern,
    location: Pattern,
    channel: Pattern,
}

impl Patterns {
    fn new(line: &RequestLine) -> Option<Self> {
        let compile = |code: &str| Pattern::new(if code.is_empty() { "*" } else { code }).ok();
        Some(Self {
            network: compile(&line.network)?,
            station: compile(&line.station)?,
            location: compile(&line.location)?,
            channel: compile(&line.channel)?,
        })
    }
}

/// Sample rate of a matched stream
#[derive(Debug, Clone, Copy, PartialEq)]
enum StreamRate {
    /// Not a waveform; never filtered by rate, estimated at 0
    Auxiliary,
    /// Waveform stream, `None` when the rate is unusable
    Waveform(Option<f64>),
}

impl StreamRate {
    fn known(self) -> Option<f64> {
        match self {
            StreamRate::Waveform(rate) => rate,
            StreamRate::Auxiliary => None,
        }
    }
}

/// One concrete stream matched by a line
struct Match {
    network: String,
    station: String,
    location: String,
    channel: String,
    rate: StreamRate,
}

impl Match {
    fn is_aux(&self) -> bool {
        self.rate == StreamRate::Auxiliary
    }

    fn rate_diff(&self, preferred: f64) -> f64 {
        match self.rate.known() {
            Some(rate) => (rate - preferred).abs(),
            None => UNKNOWN_RATE_DIFF,
        }
    }
}

/// Expand every line into concrete streams
pub fn expand(
    lines: &[RequestLine],
    inventory: &Inventory,
    preferred_sample_rate: Option<f64>,
) -> Result<Vec<RequestLine>> {
    let mut expanded = Vec::new();

    for line in lines {
        let mut matches = match_streams(line, inventory);
        if let Some(preferred) = preferred_sample_rate {
            matches = filter_sample_rate(matches, preferred);
        }

        if matches.is_empty() {
            warn!("[router] No match for {}", line);
            continue;
        }

        let now = Utc::now().naive_utc();
        expanded.extend(matches.into_iter().map(|m| concrete_line(line, m, &now)));
    }

    if expanded.is_empty() {
        return Err(Error::Routing("empty request after wildcard expansion".into()));
    }
    Ok(expanded)
}

/// Stations matched by the line, group aliases first
fn match_stations<'a>(
    line: &'a RequestLine,
    patterns: &Patterns,
    inventory: &'a Inventory,
) -> Vec<(&'a str, &'a str, &'a Epoch<StationEpoch>)> {
    let start = &line.start;
    let end = line.end.as_ref();
    let mut stations = Vec::new();

    for group in &inventory.station_groups {
        if !patterns.network.matches(&group.code) {
            continue;
        }
        for id in &group.station_refs {
            if let Some((net, sta, epoch)) = inventory.station_by_id(id) {
                if patterns.station.matches(sta) && epoch.overlaps(start, end) {
                    stations.push((net, sta, epoch));
                }
            }
        }
    }

    for net in &inventory.networks {
        if !patterns.network.matches(&net.code) {
            continue;
        }
        for net_epoch in net.epochs_in(start, end) {
            for sta in &net_epoch.body.stations {
                if !patterns.station.matches(&sta.code) {
                    continue;
                }
                for sta_epoch in sta.epochs_in(start, end) {
                    stations.push((net.code.as_str(), sta.code.as_str(), sta_epoch));
                }
            }
        }
    }

    stations
}

fn match_streams(line: &RequestLine, inventory: &Inventory) -> Vec<Match> {
    let Some(patterns) = Patterns::new(line) else {
        warn!("[router] Invalid pattern in {}", line);
        return Vec::new();
    };
    let start = &line.start;
    let end = line.end.as_ref();

    let mut seen = HashSet::new();
    let mut matches = Vec::new();
    let mut push = |net: &str, sta: &str, loc: &str, cha: &str, rate: StreamRate| {
        let key = (net.to_string(), sta.to_string(), loc.to_string(), cha.to_string());
        if seen.insert(key) {
            matches.push(Match {
                network: net.to_string(),
                station: sta.to_string(),
                location: loc.to_string(),
                channel: cha.to_string(),
                rate,
            });
        }
    };

    for (net, sta, sta_epoch) in match_stations(line, &patterns, inventory) {
        for loc in &sta_epoch.body.locations {
            if !patterns.location.matches(&loc.code) {
                continue;
            }
            for loc_epoch in loc.epochs_in(start, end) {
                for stream in &loc_epoch.body.streams {
                    if !patterns.channel.matches(&stream.code) {
                        continue;
                    }
                    for epoch in stream.epochs_in(start, end) {
                        let rate = StreamRate::Waveform(epoch.body.sample_rate());
                        push(net, sta, &loc.code, &stream.code, rate);
                    }
                }
                for aux in &loc_epoch.body.aux_streams {
                    if patterns.channel.matches(&aux.code) && aux.epochs_in(start, end).next().is_some() {
                        push(net, sta, &loc.code, &aux.code, StreamRate::Auxiliary);
                    }
                }
            }
        }
    }

    matches
}

/// Keep, per location, only the channels with the rate closest to `preferred`
fn filter_sample_rate(matches: Vec<Match>, preferred: f64) -> Vec<Match> {
    let mut winners: Vec<((String, String, String), f64, Option<f64>)> = Vec::new();

    for m in matches.iter().filter(|m| !m.is_aux()) {
        let key = (m.network.clone(), m.station.clone(), m.location.clone());
        let diff = m.rate_diff(preferred);
        let rate = m.rate.known();
        match winners.iter_mut().find(|(k, _, _)| *k == key) {
            Some(winner) if diff < winner.1 => *winner = (key, diff, rate),
            Some(_) => {}
            None => winners.push((key, diff, rate)),
        }
    }

    matches
        .into_iter()
        .filter(|m| {
            m.is_aux()
                || winners.iter().any(|(k, _, rate)| {
                    k.0 == m.network && k.1 == m.station && k.2 == m.location && *rate == m.rate.known()
                })
        })
        .collect()
}

fn concrete_line(line: &RequestLine, m: Match, now: &Timestamp) -> RequestLine {
    let estimated_size = match m.rate.known() {
        Some(rate) => {
            let end = line.end.unwrap_or(*now);
            let seconds = whole_seconds(&line.start, &end) as f64;
            ((seconds * rate * 1.5) as u64).max(MIN_ESTIMATE)
        }
        None => 0,
    };

    RequestLine {
        network: m.network,
        station: m.station,
        location: m.location,
        channel: m.channel,
        estimated_size,
        ..line.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::parse_timestamp;

    const INVENTORY: &str = r#"{
        "networks": [{
            "code": "GE",
            "epochs": [{
                "start": "1993-01-01T00:00:00",
                "stations": [
                    {"code": "APE", "epochs": [{
                        "start": "2000-01-01T00:00:00",
                        "id": "sta/GE/APE",
                        "locations": [{"code": "", "epochs": [{
                            "start": "2000-01-01T00:00:00",
                            "streams": [
                                {"code": "BHZ", "epochs": [{"start": "2000-01-01T00:00:00",
                                    "sample_rate_numerator": 20, "sample_rate_denominator": 1}]},
                                {"code": "HHZ", "epochs": [{"start": "2000-01-01T00:00:00",
                                    "sample_rate_numerator": 100, "sample_rate_denominator": 1}]},
                                {"code": "XXZ", "epochs": [{"start": "2000-01-01T00:00:00",
                                    "sample_rate_numerator": 1, "sample_rate_denominator": 0}]}
                            ],
                            "aux_streams": [{"code": "LOG", "epochs": [{"start": "2000-01-01T00:00:00"}]}]
                        }]}]
                    }]},
                    {"code": "WLF", "epochs": [{
                        "start": "2000-01-01T00:00:00",
                        "end": "2010-01-01T00:00:00",
                        "locations": [{"code": "00", "epochs": [{
                            "start": "2000-01-01T00:00:00",
                            "streams": [{"code": "BHZ", "epochs": [{"start": "2000-01-01T00:00:00",
                                "sample_rate_numerator": 20, "sample_rate_denominator": 1}]}]
                        }]}]
                    }]}
                ]
            }]
        }],
        "station_groups": [{"code": "_GRP", "station_refs": ["sta/GE/APE"]}]
    }"#;

    fn inventory() -> Inventory {
        serde_json::from_str(INVENTORY).unwrap()
    }

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

    fn codes(lines: &[RequestLine]) -> Vec<String> {
        lines
            .iter()
            .map(|l| format!("{}.{}.{}.{}", l.network, l.station, l.location, l.channel))
            .collect()
    }

    #[test]
    fn test_glob_expansion() {
        let expanded = expand(&[line("GE", "*", "?HZ", "")], &inventory(), None).unwrap();
        // WLF closed in 2010
        assert_eq!(codes(&expanded), vec!["GE.APE..BHZ", "GE.APE..HHZ"]);
        assert_eq!(expanded[0].estimated_size, 1800);
        assert_eq!(expanded[1].estimated_size, 9000);
    }

    #[test]
    fn test_station_group() {
        let mut l = line("_GRP", "", "BHZ", "");
        l.routes_tried.insert("x:1".into());
        let expanded = expand(&[l], &inventory(), None).unwrap();
        assert_eq!(codes(&expanded), vec!["GE.APE..BHZ"]);
        assert!(expanded[0].routes_tried.contains("x:1"));
    }

    #[test]
    fn test_preferred_sample_rate() {
        let expanded = expand(&[line("GE", "APE", "", "")], &inventory(), Some(90.0)).unwrap();
        assert_eq!(codes(&expanded), vec!["GE.APE..HHZ", "GE.APE..LOG"]);
        assert_eq!(expanded[1].estimated_size, 0);
    }

    #[test]
    fn test_minimum_and_rateless_sizes() {
        let mut l = line("GE", "APE", "BHZ", "");
        l.end = Some(parse_timestamp("2023,1,1,0,0,1").unwrap());
        let expanded = expand(&[l, line("GE", "APE", "XXZ", "")], &inventory(), None).unwrap();
        assert_eq!(expanded[0].estimated_size, 512);
        assert_eq!(expanded[1].estimated_size, 0);
    }

    #[test]
    fn test_duplicates_removed() {
        let expanded = expand(&[line("*", "APE", "BHZ", "")], &inventory(), None).unwrap();
        assert_eq!(expanded.len(), 1);
    }

    #[test]
    fn test_no_match() {
        let result = expand(&[line("XX", "", "", "")], &inventory(), None);
        assert_eq!(
            result.unwrap_err().to_string(),
            "empty request after wildcard expansion"
        );

        let expanded = expand(&[line("XX", "", "", ""), line("GE", "APE", "BHZ", "")], &inventory(), None)
            .unwrap();
        assert_eq!(expanded.len(), 1);
    }
}
