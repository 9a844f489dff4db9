//! Reader for InfluxDB annotated CSV query results.
//!
//! A result body holds one or more tables. Each table starts with a header
//! row and may be preceded by `#group`, `#datatype` and `#default`
//! annotation rows, which are skipped. Errors raised while the query runs
//! are reported in-band as a table with `error` and `reference` columns.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use super::AggregatedRecord;

/// A query failure the server reported inside the result body.
///
/// Unlike a malformed row, this means the whole result is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("query error: {message}")]
pub struct QueryError {
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum Header {
    Values { time: usize, value: usize },
    Error { message: usize },
}

impl Header {
    fn detect(record: &csv::StringRecord) -> Option<Self> {
        let position = |name: &str| record.iter().position(|f| f == name);

        if let (Some(time), Some(value)) = (position("_time"), position("_value")) {
            return Some(Self::Values { time, value });
        }
        if let (Some(message), Some(_)) = (position("error"), position("reference")) {
            return Some(Self::Error { message });
        }
        None
    }

    fn parse(self, record: &csv::StringRecord) -> Result<AggregatedRecord> {
        match self {
            Self::Values { time, value } => {
                let raw_time = record
                    .get(time)
                    .ok_or_else(|| anyhow!("row has no _time column"))?;
                let raw_value = record
                    .get(value)
                    .ok_or_else(|| anyhow!("row has no _value column"))?;

                let timestamp = DateTime::parse_from_rfc3339(raw_time)
                    .with_context(|| format!("parsing _time {raw_time:?}"))?
                    .with_timezone(&Utc);
                let mean_percent: f64 = raw_value
                    .parse()
                    .with_context(|| format!("parsing _value {raw_value:?}"))?;

                Ok(AggregatedRecord {
                    timestamp,
                    mean_percent,
                })
            }
            Self::Error { message } => {
                let message = record.get(message).unwrap_or("unknown error");
                Err(QueryError {
                    message: message.to_string(),
                }
                .into())
            }
        }
    }
}

/// Lazily decodes aggregated records from an annotated CSV body.
///
/// The stream is finite and cannot be restarted. A malformed row yields an
/// `Err` item and decoding continues with the next row. Rows of an in-band
/// error table yield errors that downcast to [`QueryError`].
pub struct RecordStream<R> {
    reader: csv::Reader<R>,
    record: csv::StringRecord,
    header: Option<Header>,
    done: bool,
}

impl<R: Read> RecordStream<R> {
    /// Wraps a reader over an annotated CSV body.
    pub fn new(rdr: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(rdr);

        Self {
            reader,
            record: csv::StringRecord::new(),
            header: None,
            done: false,
        }
    }
}

impl<R: Read> Iterator for RecordStream<R> {
    type Item = Result<AggregatedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            match self.reader.read_record(&mut self.record) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    // IO errors leave the reader in an unknown position.
                    if e.is_io_error() {
                        self.done = true;
                    }
                    return Some(Err(anyhow::Error::new(e).context("reading result row")));
                }
            }

            if self.record.iter().all(str::is_empty) {
                continue;
            }

            if let Some(header) = Header::detect(&self.record) {
                self.header = Some(header);
                continue;
            }

            return Some(match self.header {
                Some(header) => header.parse(&self.record),
                None => Err(anyhow!("result row before any header row")),
            });
        }
    }
}
