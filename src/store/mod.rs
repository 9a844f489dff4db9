pub mod annotated;
pub mod influx;
pub mod line;
pub mod query;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use self::annotated::{QueryError, RecordStream};
pub use self::influx::InfluxClient;
pub use self::line::Point;
pub use self::query::{AggregateFn, WindowQuery};

/// One bucket of an aggregated window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregatedRecord {
    pub timestamp: DateTime<Utc>,
    pub mean_percent: f64,
}

/// Time-series sink accepting single points.
pub trait TimeSeriesSink: Send + Sync {
    /// Write one point. Returns once the store acknowledged it.
    fn write(&self, point: &Point) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Query engine bucketing stored samples into an aggregated window.
pub trait WindowAggregator: Send + Sync {
    /// Records of one query result. Consumed once; each item may fail on its own.
    /// An item error wrapping [`QueryError`] fails the whole result.
    type Records: Iterator<Item = Result<AggregatedRecord>> + Send;

    /// Run the query and return its records in store order.
    fn query(
        &self,
        query: &WindowQuery,
    ) -> impl std::future::Future<Output = Result<Self::Records>> + Send;
}
