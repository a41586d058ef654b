//! SDS day-file archive
//!
//! Layout: `<root>/<YEAR>/<NET>/<STA>/<CHA>.D/<NET>.<STA>.<LOC>.<CHA>.D.<YEAR>.<DOY>`.
//! A line is local only if every day it touches has a file under one of the
//! roots; whole day files are returned, not cut to the line's window. Files
//! are opened one at a time as the reader gets to them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::common::Result;
use crate::error::Error;
use crate::request::RequestLine;

use super::{LocalStore, LocalUnit};

/// Windows longer than this are never served locally
const MAX_DAYS: usize = 366;

pub struct SdsArchive {
    roots: Vec<PathBuf>,
}

impl SdsArchive {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Relative day-file paths for the line, `None` if it cannot be local
    fn day_files(&self, line: &RequestLine) -> Option<Vec<PathBuf>> {
        if self.roots.is_empty() || line.has_wildcard() {
            return None;
        }
        let end = line.end?;
        if end < line.start {
            return None;
        }

        let first = line.start.date();
        // An end at midnight does not touch that day
        let last = if end.time() == NaiveTime::MIN && end > line.start {
            end.date().pred_opt()?
        } else {
            end.date()
        };

        let mut files = Vec::new();
        let mut day = first;
        while day <= last {
            if files.len() >= MAX_DAYS {
                return None;
            }
            files.push(self.relative_path(line, day));
            day = day.succ_opt()?;
        }
        Some(files)
    }

    fn relative_path(&self, line: &RequestLine, day: NaiveDate) -> PathBuf {
        let year = day.year();
        let name = format!(
            "{}.{}.{}.{}.D.{}.{:03}",
            line.network,
            line.station,
            line.location,
            line.channel,
            year,
            day.ordinal()
        );
        PathBuf::from(year.to_string())
            .join(&line.network)
            .join(&line.station)
            .join(format!("{}.D", line.channel))
            .join(name)
    }

    async fn locate(&self, relative: &Path) -> Option<PathBuf> {
        for root in &self.roots {
            let path = root.join(relative);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }
}

#[async_trait]
impl LocalStore for SdsArchive {
    async fn exists(&self, line: &RequestLine) -> bool {
        let Some(files) = self.day_files(line) else {
            return false;
        };
        for relative in &files {
            if self.locate(relative).await.is_none() {
                return false;
            }
        }
        true
    }

    async fn units(&self, line: &RequestLine) -> Result<Vec<String>> {
        let Some(files) = self.day_files(line) else {
            return Ok(Vec::new());
        };

        let mut units = Vec::with_capacity(files.len());
        for relative in &files {
            match self.locate(relative).await {
                Some(path) => units.push(path.to_string_lossy().into_owned()),
                None => warn!("Day file {} disappeared", relative.display()),
            }
        }
        Ok(units)
    }

    async fn open(&self, unit: &str) -> Result<LocalUnit> {
        let storage = |e: std::io::Error| Error::Storage(format!("{}: {}", unit, e));

        let file = tokio::fs::File::open(unit).await.map_err(storage)?;
        let size = file.metadata().await.map_err(storage)?.len();
        debug!("Reading {} bytes from {}", size, unit);
        Ok(LocalUnit {
            size,
            reader: Box::new(file.take(size)),
        })
    }
}
