//! Per-sample-key data stream files.
//!
//! On-disk layout of one stream:
//!
//! ```text
//! column_headings:        ┐
//! - t_s                   │ YAML header
//! - current_a             │
//! technique: cv           ┘
//! %%                        terminator line
//! {"t_s":0.0,"current_a":1e-6}
//! {"t_s":0.1,"current_a":2e-6}
//! ```
//!
//! The header is buffered until it is closed. Data arriving for a stream whose
//! header is still open forces the terminator out first, so every file has
//! both zones even when a driver skips `close_header`. Cutting the drain off
//! still closes every stream.
//!
//! Writes are blocking; the drain runs on the blocking pool.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::record::FileEntry;
use crate::error::{OrchError, Result};

pub const HEADER_TERMINATOR: &str = "%%";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    #[serde(default)]
    pub column_headings: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StreamHeader {
    pub fn with_columns<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            column_headings: columns.into_iter().map(Into::into).collect(),
            fields: Map::new(),
        }
    }

    /// Merge `fields` in. A `column_headings` array replaces the current one.
    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            if key == "column_headings" {
                match serde_json::from_value::<Vec<String>>(value) {
                    Ok(columns) => self.column_headings = columns,
                    Err(e) => warn!(error = %e, "ignoring malformed column_headings"),
                }
            } else {
                self.fields.insert(key, value);
            }
        }
    }
}

/// A stream a handler declares before its action starts.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub sample_key: String,
    pub header: Option<StreamHeader>,
}

impl StreamSpec {
    pub fn new(sample_key: impl Into<String>) -> Self {
        Self {
            sample_key: sample_key.into(),
            header: None,
        }
    }

    pub fn with_header(mut self, header: StreamHeader) -> Self {
        self.header = Some(header);
        self
    }
}

#[derive(Debug, Clone)]
pub enum DataEvent {
    UpdateHeader {
        sample_key: String,
        fields: Map<String, Value>,
    },
    CloseHeader {
        sample_key: String,
    },
    Data {
        sample_key: String,
        row: Map<String, Value>,
    },
}

/// What travels on an action's data queue.
#[derive(Debug)]
pub(crate) enum Queued {
    Event(DataEvent),
    /// Stop waiting for producers: apply what is queued and close the streams.
    CutOff,
}

/// Cloneable producer side of an action's data queue.
#[derive(Debug, Clone)]
pub struct DataSender {
    tx: mpsc::UnboundedSender<Queued>,
}

impl DataSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Queued>) -> Self {
        Self { tx }
    }

    fn send(&self, event: DataEvent) {
        if self.tx.send(Queued::Event(event)).is_err() {
            warn!("data queue already closed, event dropped");
        }
    }

    pub fn update_header(&self, sample_key: &str, fields: Map<String, Value>) {
        self.send(DataEvent::UpdateHeader {
            sample_key: sample_key.to_string(),
            fields,
        });
    }

    pub fn close_header(&self, sample_key: &str) {
        self.send(DataEvent::CloseHeader {
            sample_key: sample_key.to_string(),
        });
    }

    pub fn send_row(&self, sample_key: &str, row: Map<String, Value>) {
        self.send(DataEvent::Data {
            sample_key: sample_key.to_string(),
            row,
        });
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub(crate) struct StreamWriter {
    sample_key: String,
    path: PathBuf,
    out: BufWriter<File>,
    header: StreamHeader,
    header_closed: bool,
    rows: u64,
}

impl StreamWriter {
    pub(crate) fn create(path: PathBuf, spec: &StreamSpec) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            sample_key: spec.sample_key.clone(),
            path,
            out: BufWriter::new(file),
            header: spec.header.clone().unwrap_or_default(),
            header_closed: false,
            rows: 0,
        })
    }

    fn update_header(&mut self, fields: Map<String, Value>) {
        if self.header_closed {
            warn!(sample_key = %self.sample_key, "header already closed, update ignored");
            return;
        }
        self.header.merge(fields);
    }

    fn close_header(&mut self) -> Result<()> {
        if self.header_closed {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(&self.header)?;
        self.out.write_all(yaml.as_bytes())?;
        writeln!(self.out, "{HEADER_TERMINATOR}")?;
        self.header_closed = true;
        Ok(())
    }

    fn write_row(&mut self, row: &Map<String, Value>) -> Result<()> {
        if !self.header_closed {
            error!(
                sample_key = %self.sample_key,
                "data arrived before header was closed, forcing terminator"
            );
            self.close_header()?;
        }
        serde_json::to_writer(&mut self.out, row)?;
        self.out.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<FileEntry> {
        self.close_header()?;
        self.out.flush()?;
        Ok(FileEntry {
            file_name: file_name_of(&self.path),
            sample_key: self.sample_key,
            column_headings: self.header.column_headings,
            rows: Some(self.rows),
        })
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn apply(writers: &mut BTreeMap<String, StreamWriter>, event: DataEvent) {
    let (key, result) = match event {
        DataEvent::UpdateHeader { sample_key, fields } => match writers.get_mut(&sample_key) {
            Some(w) => {
                w.update_header(fields);
                (sample_key, Ok(()))
            }
            None => (sample_key, Err(None)),
        },
        DataEvent::CloseHeader { sample_key } => match writers.get_mut(&sample_key) {
            Some(w) => {
                let r = w.close_header().map_err(Some);
                (sample_key, r)
            }
            None => (sample_key, Err(None)),
        },
        DataEvent::Data { sample_key, row } => match writers.get_mut(&sample_key) {
            Some(w) => {
                let r = w.write_row(&row).map_err(Some);
                (sample_key, r)
            }
            None => (sample_key, Err(None)),
        },
    };
    match result {
        Ok(()) => {}
        Err(None) => warn!(sample_key = %key, "no stream open for sample key, event dropped"),
        Err(Some(e)) => error!(sample_key = %key, error = %e, "stream write failed"),
    }
}

/// Drain body, run on the blocking pool. Applies queued events until every
/// producer is gone or a cut-off arrives, then closes every stream. Returns
/// the file manifest; row counts are unknown for a cut-off drain.
pub(crate) fn drain(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    mut writers: BTreeMap<String, StreamWriter>,
) -> Vec<FileEntry> {
    let mut cut_off = false;
    while let Some(queued) = rx.blocking_recv() {
        match queued {
            Queued::Event(event) => apply(&mut writers, event),
            Queued::CutOff => {
                rx.close();
                while let Ok(queued) = rx.try_recv() {
                    if let Queued::Event(event) = queued {
                        apply(&mut writers, event);
                    }
                }
                cut_off = true;
                break;
            }
        }
    }

    let mut files = Vec::with_capacity(writers.len());
    for (key, writer) in writers {
        match writer.finish() {
            Ok(mut entry) => {
                if cut_off {
                    entry.rows = None;
                }
                files.push(entry);
            }
            Err(e) => error!(sample_key = %key, error = %e, "could not close stream"),
        }
    }
    files
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStream {
    pub header: StreamHeader,
    pub rows: Vec<Map<String, Value>>,
}

/// Parse a stream file written by an action container.
pub fn read_stream(path: &Path) -> Result<ParsedStream> {
    let reader = BufReader::new(File::open(path)?);
    let mut header_text = String::new();
    let mut rows = Vec::new();
    let mut in_header = true;

    for line in reader.lines() {
        let line = line?;
        if in_header {
            if line == HEADER_TERMINATOR {
                in_header = false;
            } else {
                header_text.push_str(&line);
                header_text.push('\n');
            }
        } else if !line.trim().is_empty() {
            rows.push(serde_json::from_str(&line)?);
        }
    }

    if in_header {
        return Err(OrchError::Validation(format!(
            "{} has no header terminator",
            path.display()
        )));
    }
    let header = serde_yaml::from_str(&header_text)?;
    Ok(ParsedStream { header, rows })
}
