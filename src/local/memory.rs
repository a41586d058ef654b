//! In-memory store for tests

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::common::Result;
use crate::error::Error;
use crate::request::RequestLine;

use super::{LocalStore, LocalUnit};

/// Units keyed by the line's canonical text
#[derive(Default)]
pub struct MemoryStore {
    units: Mutex<HashMap<String, Vec<Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, line: &RequestLine, units: Vec<&'static [u8]>) {
        self.units.lock().insert(
            line.content(),
            units.into_iter().map(Bytes::from_static).collect(),
        );
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn exists(&self, line: &RequestLine) -> bool {
        self.units.lock().contains_key(&line.content())
    }

    async fn units(&self, line: &RequestLine) -> Result<Vec<String>> {
        let content = line.content();
        let count = self.units.lock().get(&content).map_or(0, Vec::len);
        Ok((0..count).map(|i| format!("{}#{}", content, i)).collect())
    }

    async fn open(&self, unit: &str) -> Result<LocalUnit> {
        let missing = || Error::Storage(format!("{}: no such unit", unit));
        let (content, index) = unit.rsplit_once('#').ok_or_else(missing)?;
        let index: usize = index.parse().map_err(|_| missing())?;

        let data = self
            .units
            .lock()
            .get(content)
            .and_then(|units| units.get(index).cloned())
            .ok_or_else(missing)?;
        Ok(LocalUnit {
            size: data.len() as u64,
            reader: Box::new(Cursor::new(data)),
        })
    }
}
