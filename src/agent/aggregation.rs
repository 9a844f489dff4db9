use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::{HealthMetrics, Window};
use crate::forecast::Forecaster;
use crate::snapshot::{self, SnapshotRefresher};
use crate::store::{AggregatedRecord, QueryError, WindowAggregator, WindowQuery};

/// Outcome of an optional post-query step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Disabled,
    Done,
    Failed,
}

/// Result of one aggregation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Records published, or `None` if the query failed and the cycle was
    /// skipped.
    pub records: Option<usize>,
    /// Records dropped because they could not be read.
    pub skipped_records: usize,
    pub snapshot: StepOutcome,
    pub forecast: StepOutcome,
    pub prediction: Option<f64>,
}

impl CycleReport {
    fn query_failed() -> Self {
        Self {
            records: None,
            skipped_records: 0,
            snapshot: StepOutcome::Disabled,
            forecast: StepOutcome::Disabled,
            prediction: None,
        }
    }
}

/// Periodically re-aggregates the recent window, then refreshes the
/// snapshot and runs the forecaster.
pub struct AggregationLoop<A, R, F> {
    aggregator: Arc<A>,
    query: WindowQuery,
    refresher: Option<R>,
    forecaster: Option<(F, PathBuf)>,
    print_records: bool,
    window: watch::Sender<Window>,
    health: Option<Arc<HealthMetrics>>,
}

impl<A, R, F> AggregationLoop<A, R, F>
where
    A: WindowAggregator,
    R: SnapshotRefresher,
    F: Forecaster,
{
    /// Creates a loop that only queries and publishes the window.
    pub fn new(query: WindowQuery, aggregator: Arc<A>, window: watch::Sender<Window>) -> Self {
        Self {
            aggregator,
            query,
            refresher: None,
            forecaster: None,
            print_records: false,
            window,
            health: None,
        }
    }

    pub fn with_refresher(mut self, refresher: R) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Run `forecaster` on the snapshot at `snapshot` after every
    /// successful query.
    pub fn with_forecaster(mut self, forecaster: F, snapshot: impl Into<PathBuf>) -> Self {
        self.forecaster = Some((forecaster, snapshot.into()));
        self
    }

    /// Print each window to stdout.
    pub fn with_print_records(mut self, print: bool) -> Self {
        self.print_records = print;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run one aggregation cycle.
    pub async fn tick(&mut self) -> CycleReport {
        let records = match self.aggregator.query(&self.query).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to query cpu window");
                self.count_query("error");
                return CycleReport::query_failed();
            }
        };

        let mut window: Vec<AggregatedRecord> = Vec::new();
        let mut skipped_records = 0;
        for record in records {
            match record {
                Ok(record) => window.push(record),
                Err(e) if e.downcast_ref::<QueryError>().is_some() => {
                    warn!(error = %e, "cpu window query failed in-band");
                    self.count_query("error");
                    return CycleReport::query_failed();
                }
                Err(e) => {
                    skipped_records += 1;
                    warn!(error = %e, "skipping unreadable window record");
                }
            }
        }
        window.sort_by_key(|r| r.timestamp);

        self.count_query("success");
        info!(
            records = window.len(),
            skipped = skipped_records,
            "queried cpu window"
        );

        if self.print_records {
            self.print(&window);
        }

        let published = window.len();
        if let Some(h) = &self.health {
            h.window_records.set(published as f64);
        }
        self.window.send_replace(Arc::from(window));

        let snapshot = self.refresh_snapshot().await;
        let (forecast, prediction) = self.run_forecast().await;

        CycleReport {
            records: Some(published),
            skipped_records,
            snapshot,
            forecast,
            prediction,
        }
    }

    fn count_query(&self, status: &str) {
        if let Some(h) = &self.health {
            h.queries.with_label_values(&[status]).inc();
        }
    }

    fn print(&self, window: &[AggregatedRecord]) {
        println!(
            "CPU Usage (last {}):",
            humantime::format_duration(self.query.range)
        );
        for record in window {
            println!(
                "Time: {}, CPU Usage: {:.2}%",
                record.timestamp.to_rfc3339(),
                record.mean_percent
            );
        }
    }

    async fn refresh_snapshot(&self) -> StepOutcome {
        let Some(refresher) = &self.refresher else {
            return StepOutcome::Disabled;
        };
        let path = refresher.path();

        let (outcome, status) = match refresher.refresh(&self.query).await {
            Ok(()) => {
                match snapshot::header_line(path).await {
                    Ok(header) => info!(
                        path = %path.display(),
                        header = header.as_deref().unwrap_or_default(),
                        "refreshed snapshot"
                    ),
                    Err(e) => warn!(error = %e, path = %path.display(), "refreshed snapshot is unreadable"),
                }
                (StepOutcome::Done, "success")
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to refresh snapshot");
                (StepOutcome::Failed, "error")
            }
        };

        if let Some(h) = &self.health {
            h.snapshot_refreshes.with_label_values(&[status]).inc();
        }

        outcome
    }

    async fn run_forecast(&self) -> (StepOutcome, Option<f64>) {
        let Some((forecaster, path)) = &self.forecaster else {
            return (StepOutcome::Disabled, None);
        };

        match forecaster.forecast(path).await {
            Ok(prediction) => {
                info!(prediction, "forecast cpu usage");
                println!("Predicted CPU usage: {prediction:.2}%");
                if let Some(h) = &self.health {
                    h.forecasts.with_label_values(&["success"]).inc();
                    h.forecast_percent.set(prediction);
                }
                (StepOutcome::Done, Some(prediction))
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to forecast cpu usage");
                if let Some(h) = &self.health {
                    h.forecasts.with_label_values(&["error"]).inc();
                }
                (StepOutcome::Failed, None)
            }
        }
    }

    /// Tick every `interval` until cancelled.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("aggregation loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}
