//! Optional structured record sink.
//!
//! Two record kinds exist: atmospheric readings and image references. The
//! server pushes one record after every successful temperature, pressure or
//! image file write when a [`RecordSink`] is configured.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::SinkError;

/// A structured record derived from a persisted packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// A temperature and/or pressure reading.
    Atmospheric {
        /// Client that produced the reading.
        client: String,
        /// Temperature, when this record carries one.
        temperature: Option<f32>,
        /// Pressure, when this record carries one.
        pressure: Option<f32>,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// Reference to an image file written by the filesystem sink.
    Image {
        /// Client that produced the image.
        client: String,
        /// Path of the written file.
        file_path: PathBuf,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
}

impl Record {
    /// Temperature record stamped with the current time.
    pub fn temperature(client: &str, value: f32) -> Self {
        Self::Atmospheric {
            client: client.to_string(),
            temperature: Some(value),
            pressure: None,
            timestamp: now_millis(),
        }
    }

    /// Pressure record stamped with the current time.
    pub fn pressure(client: &str, value: f32) -> Self {
        Self::Atmospheric {
            client: client.to_string(),
            temperature: None,
            pressure: Some(value),
            timestamp: now_millis(),
        }
    }

    /// Image reference stamped with the current time.
    pub fn image(client: &str, file_path: &Path) -> Self {
        Self::Image {
            client: client.to_string(),
            file_path: file_path.to_path_buf(),
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Destination for [`Record`]s. Shared by every session.
///
/// `record` may block; sessions call it from tokio's blocking pool.
pub trait RecordSink: Send + Sync {
    /// Persist one record.
    fn record(&self, record: &Record) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(SinkError::io(&path))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The file records are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonLinesSink {
    fn record(&self, record: &Record) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line).map_err(SinkError::io(&self.path))
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RecordSink for MemorySink {
    fn record(&self, record: &Record) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
