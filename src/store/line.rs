use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};

/// A single time-series point: measurement, tag set, field set and timestamp.
///
/// Tags and fields are kept sorted so the encoded line is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Creates a point with no tags or fields.
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Adds a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds a float field.
    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Encodes the point as one line of InfluxDB line protocol with
    /// nanosecond precision.
    pub fn to_line_protocol(&self) -> Result<String> {
        if self.measurement.is_empty() {
            bail!("point measurement must not be empty");
        }
        if self.fields.is_empty() {
            bail!("point {} has no fields", self.measurement);
        }

        let ts = self
            .timestamp
            .timestamp_nanos_opt()
            .ok_or_else(|| anyhow!("timestamp {} out of range", self.timestamp))?;

        let mut line = String::with_capacity(64);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (k, v) in &self.tags {
            if k.is_empty() || v.is_empty() {
                continue;
            }
            line.push(',');
            escape_into(&mut line, k, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, v, &[',', '=', ' ']);
        }

        let mut first = true;
        for (k, v) in &self.fields {
            if !v.is_finite() {
                bail!("field {k} has non-finite value {v}");
            }
            line.push(if first { ' ' } else { ',' });
            first = false;
            escape_into(&mut line, k, &[',', '=', ' ']);
            let _ = write!(line, "={v}");
        }

        let _ = write!(line, " {ts}");

        Ok(line)
    }
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
