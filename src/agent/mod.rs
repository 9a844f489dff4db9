pub mod aggregation;
pub mod sampling;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alert::SmtpNotifier;
use crate::config::Config;
use crate::export::health::{HealthMetrics, Window};
use crate::forecast::CommandForecaster;
use crate::sampler::SysinfoSource;
use crate::snapshot::InfluxCliSnapshot;
use crate::store::{InfluxClient, WindowQuery};

pub use self::aggregation::{AggregationLoop, CycleReport, StepOutcome};
pub use self::sampling::{AlertOutcome, SamplingLoop, TickOutcome};

/// Agent wires the collaborators together and runs both periodic loops.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Start the health server and both loops.
    pub async fn start(&mut self) -> Result<()> {
        let (window_tx, window_rx) = watch::channel::<Window>(Arc::from(Vec::new()));

        // 1. Health server first so probes respond during startup.
        if self.cfg.health.enabled {
            self.health
                .start(window_rx)
                .await
                .context("starting health metrics server")?;
        }

        // 2. Store client shared by both loops.
        let store = Arc::new(self.create_store_client()?);
        info!(url = %self.cfg.store.url, bucket = %self.cfg.store.bucket, "store client configured");

        // 3. Alert delivery.
        let notifier = if self.cfg.alerting_enabled() {
            let notifier = SmtpNotifier::new(&self.cfg.smtp).context("creating SMTP notifier")?;
            info!(
                threshold = self.cfg.alert.threshold,
                policy = ?self.cfg.alert.policy,
                recipient = %self.cfg.smtp.recipient,
                "alerting enabled",
            );
            Some(notifier)
        } else {
            info!("SMTP or threshold not configured; alerting disabled");
            None
        };

        // 4. Sampling loop.
        let sampling = SamplingLoop::new(
            &self.cfg,
            SysinfoSource::new(),
            Arc::clone(&store),
            notifier,
        )
        .with_health(Arc::clone(&self.health));

        self.tasks.push(tokio::spawn(
            sampling.run(self.cfg.sampling.interval, self.cancel.child_token()),
        ));

        // 5. Aggregation loop with optional snapshot and forecast.
        let mut aggregation: AggregationLoop<InfluxClient, InfluxCliSnapshot, CommandForecaster> =
            AggregationLoop::new(WindowQuery::from_config(&self.cfg), store, window_tx)
                .with_print_records(self.cfg.aggregation.print_records)
                .with_health(Arc::clone(&self.health));

        if self.cfg.snapshot_refresh_enabled() {
            aggregation = aggregation.with_refresher(InfluxCliSnapshot::from_config(&self.cfg));
            info!(path = %self.cfg.snapshot.path.display(), "snapshot refresh enabled");
        }

        if self.cfg.forecast_enabled() {
            aggregation = aggregation.with_forecaster(
                CommandForecaster::from_config(&self.cfg),
                self.cfg.snapshot.path.clone(),
            );
            info!(program = %self.cfg.forecast.program, "forecasting enabled");
        } else {
            info!("snapshot path not configured; forecasting disabled");
        }

        self.tasks.push(tokio::spawn(
            aggregation.run(self.cfg.aggregation.interval, self.cancel.child_token()),
        ));

        info!(
            sampling_interval = ?self.cfg.sampling.interval,
            aggregation_interval = ?self.cfg.aggregation.interval,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal both loops to stop.
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "loop task failed");
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Create a store client with metrics callback.
    fn create_store_client(&self) -> Result<InfluxClient> {
        let client = InfluxClient::new(&self.cfg.store).context("creating store client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |operation, _status, duration| {
            health.record_store_request(operation, duration);
        }));

        Ok(client)
    }
}
