//! Least-squares linear trend over an aggregated window.
//!
//! Fits `value = intercept + slope * t`, where `t` is seconds since the
//! earliest record, and extrapolates past the latest record.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::store::{AggregatedRecord, RecordStream};

/// Fitted linear trend.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTrend {
    origin: DateTime<Utc>,
    /// Change in value per second.
    slope: f64,
    intercept: f64,
    /// Offset of the latest record from the origin, in seconds.
    last_offset: f64,
}

impl LinearTrend {
    /// Fit by ordinary least squares. Records need not be sorted.
    ///
    /// With a single distinct timestamp the slope is zero and the trend is
    /// the mean value.
    pub fn fit(records: &[AggregatedRecord]) -> Result<Self> {
        let Some(origin) = records.iter().map(|r| r.timestamp).min() else {
            bail!("no data points to fit");
        };

        let offsets: Vec<f64> = records
            .iter()
            .map(|r| seconds_between(origin, r.timestamp))
            .collect();

        let n = records.len() as f64;
        let mean_t = offsets.iter().sum::<f64>() / n;
        let mean_y = records.iter().map(|r| r.mean_percent).sum::<f64>() / n;

        let (mut sxx, mut sxy) = (0.0, 0.0);
        for (t, r) in offsets.iter().zip(records) {
            let dt = t - mean_t;
            sxx += dt * dt;
            sxy += dt * (r.mean_percent - mean_y);
        }

        let slope = if sxx > f64::EPSILON { sxy / sxx } else { 0.0 };
        let intercept = mean_y - slope * mean_t;
        let last_offset = offsets.iter().copied().fold(0.0, f64::max);

        if !slope.is_finite() || !intercept.is_finite() {
            bail!("fit produced non-finite coefficients");
        }

        Ok(Self {
            origin,
            slope,
            intercept,
            last_offset,
        })
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    /// Predicted value `t` seconds after the origin.
    pub fn predict_at(&self, t: f64) -> f64 {
        self.intercept + self.slope * t
    }

    /// Predicted value `horizon` after the latest record.
    pub fn predict_after_last(&self, horizon: Duration) -> f64 {
        self.predict_at(self.last_offset + horizon.as_secs_f64())
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Loads every record of an annotated CSV snapshot. Any malformed row is
/// an error.
pub fn load_series(path: &Path) -> Result<Vec<AggregatedRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let records = RecordStream::new(file)
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("reading {}", path.display()))?;

    if records.is_empty() {
        bail!("{} contains no _time/_value rows", path.display());
    }

    Ok(records)
}
