//! Inventory snapshot
//!
//! `network -> epoch -> station -> epoch -> location -> epoch -> stream -> epoch`,
//! plus station groups that alias a set of station epochs under one code.

use serde::{Deserialize, Serialize};

use crate::common::time::overlaps;
use crate::common::Timestamp;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub networks: Vec<Coded<NetworkEpoch>>,
    #[serde(default)]
    pub station_groups: Vec<StationGroup>,
}

/// An object code with its epochs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coded<T> {
    pub code: String,
    #[serde(default = "Vec::new")]
    pub epochs: Vec<Epoch<T>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch<T> {
    pub start: Timestamp,
    #[serde(default)]
    pub end: Option<Timestamp>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Epoch<T> {
    pub fn overlaps(&self, start: &Timestamp, end: Option<&Timestamp>) -> bool {
        overlaps(&self.start, self.end.as_ref(), start, end)
    }
}

impl<T> Coded<T> {
    /// Epochs intersecting the window
    pub fn epochs_in<'a>(
        &'a self,
        start: &'a Timestamp,
        end: Option<&'a Timestamp>,
    ) -> impl Iterator<Item = &'a Epoch<T>> + 'a {
        self.epochs.iter().filter(move |e| e.overlaps(start, end))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkEpoch {
    #[serde(default)]
    pub stations: Vec<Coded<StationEpoch>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationEpoch {
    /// Referenced by station groups
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub locations: Vec<Coded<LocationEpoch>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationEpoch {
    #[serde(default)]
    pub streams: Vec<Coded<StreamEpoch>>,
    #[serde(default)]
    pub aux_streams: Vec<Coded<AuxStreamEpoch>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEpoch {
    pub sample_rate_numerator: u32,
    pub sample_rate_denominator: u32,
}

impl StreamEpoch {
    /// Samples per second, `None` for a zero denominator
    pub fn sample_rate(&self) -> Option<f64> {
        if self.sample_rate_denominator == 0 {
            None
        } else {
            Some(self.sample_rate_numerator as f64 / self.sample_rate_denominator as f64)
        }
    }
}

/// Non-waveform stream; carries no sample rate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxStreamEpoch {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationGroup {
    pub code: String,
    /// Station epoch ids
    #[serde(default)]
    pub station_refs: Vec<String>,
}

impl Inventory {
    /// Find a station epoch by id, with its network and station codes
    pub fn station_by_id(&self, id: &str) -> Option<(&str, &str, &Epoch<StationEpoch>)> {
        self.networks.iter().find_map(|net| {
            net.epochs.iter().find_map(|net_epoch| {
                net_epoch.body.stations.iter().find_map(|sta| {
                    sta.epochs
                        .iter()
                        .find(|e| e.body.id.as_deref() == Some(id))
                        .map(|e| (net.code.as_str(), sta.code.as_str(), e))
                })
            })
        })
    }
}
