use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{Action, AlertMessage, Debouncer, Notifier};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sampler::{Sample, SampleSource};
use crate::store::{Point, TimeSeriesSink};

/// What happened to a fired alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    /// The debouncer did not fire.
    None,
    /// Fired and delivered.
    Sent,
    /// Fired but delivery failed. The debouncer still counts it as sent.
    Failed,
}

/// Result of one sampling tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The sample source failed; nothing else ran.
    SourceFailed,
    Sampled {
        sample: Sample,
        /// Whether the sink accepted the point.
        written: bool,
        alert: AlertOutcome,
    },
}

/// Samples CPU usage, stores each sample and feeds the alert debouncer.
///
/// The loop is the only owner of the debouncer, and notifications are
/// awaited inside the tick, so alert sends never overlap.
pub struct SamplingLoop<S, K, N> {
    source: S,
    sink: Arc<K>,
    notifier: Option<N>,
    debouncer: Debouncer,
    host: String,
    measurement: String,
    field: String,
    health: Option<Arc<HealthMetrics>>,
}

impl<S, K, N> SamplingLoop<S, K, N>
where
    S: SampleSource,
    K: TimeSeriesSink,
    N: Notifier,
{
    /// Creates the loop with a debouncer derived from configuration.
    pub fn new(cfg: &Config, source: S, sink: Arc<K>, notifier: Option<N>) -> Self {
        Self::with_debouncer(cfg, source, sink, notifier, Debouncer::from_config(cfg))
    }

    pub fn with_debouncer(
        cfg: &Config,
        source: S,
        sink: Arc<K>,
        notifier: Option<N>,
        debouncer: Debouncer,
    ) -> Self {
        Self {
            source,
            sink,
            notifier,
            debouncer,
            host: cfg.host.clone(),
            measurement: cfg.sampling.measurement.clone(),
            field: cfg.sampling.field.clone(),
            health: None,
        }
    }

    /// Record loop activity in health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    /// Run one sampling cycle. Never fails: every error is logged and
    /// reflected in the outcome.
    pub async fn tick(&mut self) -> TickOutcome {
        let sample = match self.source.sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "failed to read cpu sample");
                if let Some(h) = &self.health {
                    h.sample_errors.inc();
                }
                return TickOutcome::SourceFailed;
            }
        };

        if let Some(h) = &self.health {
            h.samples.inc();
            h.cpu_percent.set(sample.percent);
        }

        let written = self.write(&sample).await;

        let alert = match self.debouncer.evaluate(&sample) {
            Action::None => AlertOutcome::None,
            Action::Fire(message) => self.deliver(&message).await,
        };

        TickOutcome::Sampled {
            sample,
            written,
            alert,
        }
    }

    async fn write(&self, sample: &Sample) -> bool {
        let point = Point::new(self.measurement.as_str(), sample.timestamp)
            .tag("host", self.host.as_str())
            .field(self.field.as_str(), sample.percent);

        let (written, status) = match self.sink.write(&point).await {
            Ok(()) => {
                info!(percent = sample.percent, "wrote cpu sample");
                (true, "success")
            }
            Err(e) => {
                warn!(error = %e, percent = sample.percent, "failed to write cpu sample");
                (false, "error")
            }
        };

        if let Some(h) = &self.health {
            h.sink_writes.with_label_values(&[status]).inc();
        }

        written
    }

    async fn deliver(&self, message: &AlertMessage) -> AlertOutcome {
        if let Some(h) = &self.health {
            h.alerts_fired.inc();
        }

        let result = match &self.notifier {
            Some(notifier) => notifier
                .send(message)
                .await
                .map(|()| notifier.name().to_string()),
            None => Err(anyhow::anyhow!("no notifier configured")),
        };

        match result {
            Ok(via) => {
                info!(recipient = %message.recipient, via = %via, "alert sent");
                AlertOutcome::Sent
            }
            Err(e) => {
                warn!(error = %e, recipient = %message.recipient, "failed to send alert");
                if let Some(h) = &self.health {
                    h.alerts_failed.inc();
                }
                AlertOutcome::Failed
            }
        }
    }

    /// Tick every `interval` until cancelled. Late ticks are skipped, not
    /// queued.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        // Usage is measured between refreshes, so the first tick waits a
        // full interval.
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("sampling loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}
