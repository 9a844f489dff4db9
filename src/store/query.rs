use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Aggregate function applied to each window bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Mean,
    Median,
    Min,
    Max,
    Sum,
    Count,
    First,
    Last,
}

impl Default for AggregateFn {
    fn default() -> Self {
        Self::Mean
    }
}

impl AggregateFn {
    /// Returns the Flux function name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

/// Declarative range + filter + aggregate query over one field.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowQuery {
    pub bucket: String,
    pub measurement: String,
    pub field: String,
    /// Tag equality filters, applied in order.
    pub tags: Vec<(String, String)>,
    /// How far back from now the range starts.
    pub range: Duration,
    /// Bucket width.
    pub every: Duration,
    pub function: AggregateFn,
    /// Emit empty buckets as nulls.
    pub create_empty: bool,
}

impl WindowQuery {
    /// Builds the window query for this host from configuration.
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bucket: cfg.store.bucket.clone(),
            measurement: cfg.sampling.measurement.clone(),
            field: cfg.sampling.field.clone(),
            tags: vec![("host".to_string(), cfg.host.clone())],
            range: cfg.aggregation.range,
            every: cfg.aggregation.every,
            function: cfg.aggregation.function,
            create_empty: false,
        }
    }

    /// Renders the query as a Flux script.
    pub fn to_flux(&self) -> String {
        let mut flux = String::with_capacity(320);

        let _ = writeln!(flux, "from(bucket: {})", flux_string(&self.bucket));
        let _ = writeln!(flux, "  |> range(start: -{})", flux_duration(self.range));
        let _ = writeln!(
            flux,
            "  |> filter(fn: (r) => r._measurement == {})",
            flux_string(&self.measurement)
        );
        let _ = writeln!(
            flux,
            "  |> filter(fn: (r) => r._field == {})",
            flux_string(&self.field)
        );
        for (key, value) in &self.tags {
            let _ = writeln!(
                flux,
                "  |> filter(fn: (r) => r[{}] == {})",
                flux_string(key),
                flux_string(value)
            );
        }
        let _ = writeln!(
            flux,
            "  |> aggregateWindow(every: {}, fn: {}, createEmpty: {})",
            flux_duration(self.every),
            self.function.as_str(),
            self.create_empty
        );
        let _ = write!(
            flux,
            "  |> yield(name: {})",
            flux_string(self.function.as_str())
        );

        flux
    }
}

/// Formats a duration as the largest exact Flux duration unit.
fn flux_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

/// Quotes a Flux string literal.
fn flux_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
