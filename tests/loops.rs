use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use cpuwatch::agent::{AggregationLoop, AlertOutcome, SamplingLoop, StepOutcome, TickOutcome};
use cpuwatch::alert::{AlertMessage, Debouncer, Notifier};
use cpuwatch::config::{AlertConfig, Config};
use cpuwatch::export::health::Window;
use cpuwatch::forecast::Forecaster;
use cpuwatch::sampler::{Sample, SampleSource};
use cpuwatch::snapshot::SnapshotRefresher;
use cpuwatch::store::{
    AggregatedRecord, Point, RecordStream, TimeSeriesSink, WindowAggregator, WindowQuery,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + secs, 0)
        .single()
        .expect("valid ts")
}

// --- Sampling mocks ---

/// Replays scripted samples; `None` entries fail.
struct ScriptedSource(VecDeque<Option<(i64, f64)>>);

impl SampleSource for ScriptedSource {
    fn sample(&mut self) -> Result<Sample> {
        match self.0.pop_front() {
            Some(Some((t, p))) => Sample::new(at(t), p),
            Some(None) => bail!("source unavailable"),
            None => bail!("script exhausted"),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    fail: bool,
    points: Mutex<Vec<Point>>,
}

impl TimeSeriesSink for RecordingSink {
    async fn write(&self, point: &Point) -> Result<()> {
        self.points.lock().push(point.clone());
        if self.fail {
            bail!("store unavailable");
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    fail: bool,
    sent: Mutex<Vec<AlertMessage>>,
}

impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &AlertMessage) -> Result<()> {
        self.sent.lock().push(message.clone());
        if self.fail {
            bail!("relay refused");
        }
        Ok(())
    }
}

fn alerting_debouncer() -> Debouncer {
    let cfg = AlertConfig {
        threshold: 80.0,
        sustain: Duration::from_secs(30),
        ..Default::default()
    };
    Debouncer::new(&cfg, "localhost", Some("ops@example.com"))
}

fn sampling_loop(
    script: Vec<Option<(i64, f64)>>,
    sink: Arc<RecordingSink>,
    notifier: RecordingNotifier,
) -> SamplingLoop<ScriptedSource, RecordingSink, RecordingNotifier> {
    SamplingLoop::with_debouncer(
        &Config::default(),
        ScriptedSource(script.into()),
        sink,
        Some(notifier),
        alerting_debouncer(),
    )
}

#[tokio::test]
async fn test_sampling_writes_point_with_host_tag() {
    let sink = Arc::new(RecordingSink::default());
    let mut lp = sampling_loop(
        vec![Some((0, 42.5))],
        Arc::clone(&sink),
        RecordingNotifier::default(),
    );

    let outcome = lp.tick().await;
    assert!(matches!(
        outcome,
        TickOutcome::Sampled {
            written: true,
            alert: AlertOutcome::None,
            ..
        }
    ));

    let points = sink.points.lock();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].measurement, "cpu_usage");
    assert_eq!(points[0].tags.get("host").map(String::as_str), Some("localhost"));
    assert_eq!(points[0].fields.get("percent"), Some(&42.5));
    assert_eq!(points[0].timestamp, at(0));
}

#[tokio::test]
async fn test_source_failure_skips_tick_without_touching_state() {
    let sink = Arc::new(RecordingSink::default());
    let mut lp = sampling_loop(
        vec![Some((0, 90.0)), None, Some((30, 90.0))],
        Arc::clone(&sink),
        RecordingNotifier::default(),
    );

    lp.tick().await;
    let armed = lp.debouncer().state().clone();

    assert_eq!(lp.tick().await, TickOutcome::SourceFailed);
    assert_eq!(lp.debouncer().state(), &armed);
    assert_eq!(sink.points.lock().len(), 1);

    assert!(matches!(
        lp.tick().await,
        TickOutcome::Sampled {
            alert: AlertOutcome::Sent,
            ..
        }
    ));
}

#[tokio::test]
async fn test_sink_failure_does_not_block_evaluation() {
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..Default::default()
    });
    let script = (0..=4).map(|i| Some((i * 10, 85.0))).collect();
    let mut lp = sampling_loop(script, Arc::clone(&sink), RecordingNotifier::default());

    let mut alerts = Vec::new();
    for _ in 0..5 {
        match lp.tick().await {
            TickOutcome::Sampled { written, alert, .. } => {
                assert!(!written);
                alerts.push(alert);
            }
            TickOutcome::SourceFailed => panic!("source should not fail"),
        }
    }

    assert_eq!(sink.points.lock().len(), 5);
    assert_eq!(
        alerts,
        vec![
            AlertOutcome::None,
            AlertOutcome::None,
            AlertOutcome::None,
            AlertOutcome::Sent,
            AlertOutcome::None,
        ]
    );
}

#[tokio::test]
async fn test_failed_delivery_still_advances_debouncer() {
    let sink = Arc::new(RecordingSink::default());
    let notifier = RecordingNotifier {
        fail: true,
        ..Default::default()
    };
    let script = (0..=4).map(|i| Some((i * 10, 95.0))).collect();
    let mut lp = sampling_loop(script, sink, notifier);

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        if let TickOutcome::Sampled { alert, .. } = lp.tick().await {
            outcomes.push(alert);
        }
    }

    assert_eq!(outcomes[3], AlertOutcome::Failed);
    // No retry on the next tick: the window restarted at t=30.
    assert_eq!(outcomes[4], AlertOutcome::None);
    assert_eq!(lp.debouncer().state().last_alert_sent, Some(at(30)));
}

// --- Aggregation mocks ---

/// Returns scripted query results in order.
struct ScriptedAggregator {
    results: Mutex<VecDeque<Result<Vec<Result<AggregatedRecord>>>>>,
}

impl ScriptedAggregator {
    fn new(results: Vec<Result<Vec<Result<AggregatedRecord>>>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
        }
    }
}

impl WindowAggregator for ScriptedAggregator {
    type Records = std::vec::IntoIter<Result<AggregatedRecord>>;

    async fn query(&self, _query: &WindowQuery) -> Result<Self::Records> {
        let next = self
            .results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("script exhausted")));
        next.map(Vec::into_iter)
    }
}

/// Serves scripted annotated CSV bodies in order.
struct BodyAggregator {
    bodies: Mutex<VecDeque<&'static str>>,
}

impl WindowAggregator for BodyAggregator {
    type Records = RecordStream<Cursor<Vec<u8>>>;

    async fn query(&self, _query: &WindowQuery) -> Result<Self::Records> {
        let body = self
            .bodies
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted"))?;
        Ok(RecordStream::new(Cursor::new(body.as_bytes().to_vec())))
    }
}

struct StubRefresher {
    ok: bool,
    path: std::path::PathBuf,
    calls: Mutex<usize>,
}

impl SnapshotRefresher for StubRefresher {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn refresh(&self, _query: &WindowQuery) -> Result<()> {
        *self.calls.lock() += 1;
        if self.ok {
            Ok(())
        } else {
            bail!("influx not found")
        }
    }
}

struct StubForecaster(Result<f64, String>);

impl Forecaster for StubForecaster {
    async fn forecast(&self, _snapshot: &Path) -> Result<f64> {
        self.0.clone().map_err(|e| anyhow!(e))
    }
}

fn record(secs: i64, value: f64) -> Result<AggregatedRecord> {
    Ok(AggregatedRecord {
        timestamp: at(secs),
        mean_percent: value,
    })
}

fn window_query() -> WindowQuery {
    WindowQuery::from_config(&Config::default())
}

fn channel() -> (watch::Sender<Window>, watch::Receiver<Window>) {
    watch::channel::<Window>(Arc::from(Vec::new()))
}

#[tokio::test]
async fn test_aggregation_publishes_sorted_window() {
    let (tx, rx) = channel();
    let agg = Arc::new(ScriptedAggregator::new(vec![Ok(vec![
        record(60, 30.0),
        Err(anyhow!("bad row")),
        record(0, 10.0),
        record(30, 20.0),
    ])]));
    let mut lp: AggregationLoop<_, StubRefresher, StubForecaster> =
        AggregationLoop::new(window_query(), agg, tx);

    let report = lp.tick().await;
    assert_eq!(report.records, Some(3));
    assert_eq!(report.skipped_records, 1);
    assert_eq!(report.snapshot, StepOutcome::Disabled);
    assert_eq!(report.forecast, StepOutcome::Disabled);

    let window = rx.borrow().clone();
    let values: Vec<f64> = window.iter().map(|r| r.mean_percent).collect();
    assert_eq!(values, vec![10.0, 20.0, 30.0]);
}

#[tokio::test]
async fn test_query_failure_keeps_previous_window() {
    let (tx, rx) = channel();
    let agg = Arc::new(ScriptedAggregator::new(vec![
        Ok(vec![record(0, 10.0), record(30, 20.0)]),
        Err(anyhow!("connection refused")),
    ]));
    let refresher = StubRefresher {
        ok: true,
        path: "cpu.csv".into(),
        calls: Mutex::new(0),
    };
    let mut lp = AggregationLoop::new(window_query(), agg, tx)
        .with_refresher(refresher)
        .with_forecaster(StubForecaster(Ok(21.0)), "cpu.csv");

    let first = lp.tick().await;
    assert_eq!(first.records, Some(2));

    let second = lp.tick().await;
    assert_eq!(second.records, None);
    assert_eq!(second.snapshot, StepOutcome::Disabled);
    assert_eq!(second.forecast, StepOutcome::Disabled);
    assert_eq!(rx.borrow().len(), 2);
}

#[tokio::test]
async fn test_in_band_query_error_keeps_previous_window() {
    let (tx, rx) = channel();
    let agg = Arc::new(BodyAggregator {
        bodies: Mutex::new(
            vec![
                ",result,table,_time,_value\n\
                 ,mean,0,2024-05-01T10:00:30Z,12.5\n\
                 ,mean,0,2024-05-01T10:01:00Z,40\n",
                "#datatype,string,string\n,error,reference\n,bucket not found,897\n",
            ]
            .into(),
        ),
    });
    let refresher = StubRefresher {
        ok: true,
        path: "cpu.csv".into(),
        calls: Mutex::new(0),
    };
    let mut lp = AggregationLoop::new(window_query(), agg, tx)
        .with_refresher(refresher)
        .with_forecaster(StubForecaster(Ok(21.0)), "cpu.csv");

    let first = lp.tick().await;
    assert_eq!(first.records, Some(2));
    assert_eq!(first.snapshot, StepOutcome::Done);

    let second = lp.tick().await;
    assert_eq!(second.records, None);
    assert_eq!(second.snapshot, StepOutcome::Disabled);
    assert_eq!(second.forecast, StepOutcome::Disabled);

    let window = rx.borrow().clone();
    let values: Vec<f64> = window.iter().map(|r| r.mean_percent).collect();
    assert_eq!(values, vec![12.5, 40.0]);
}

#[tokio::test]
async fn test_snapshot_failure_does_not_block_forecast() {
    let (tx, _rx) = channel();
    let agg = Arc::new(ScriptedAggregator::new(vec![Ok(vec![record(0, 10.0)])]));
    let refresher = StubRefresher {
        ok: false,
        path: "cpu.csv".into(),
        calls: Mutex::new(0),
    };
    let mut lp = AggregationLoop::new(window_query(), agg, tx)
        .with_refresher(refresher)
        .with_forecaster(StubForecaster(Ok(55.5)), "cpu.csv");

    let report = lp.tick().await;
    assert_eq!(report.snapshot, StepOutcome::Failed);
    assert_eq!(report.forecast, StepOutcome::Done);
    assert_eq!(report.prediction, Some(55.5));
}

#[tokio::test]
async fn test_forecast_failure_is_reported() {
    let (tx, _rx) = channel();
    let agg = Arc::new(ScriptedAggregator::new(vec![Ok(vec![record(0, 10.0)])]));
    let mut lp: AggregationLoop<_, StubRefresher, _> = AggregationLoop::new(window_query(), agg, tx)
        .with_forecaster(StubForecaster(Err("exit status 1".to_string())), "cpu.csv");

    let report = lp.tick().await;
    assert_eq!(report.records, Some(1));
    assert_eq!(report.forecast, StepOutcome::Failed);
    assert_eq!(report.prediction, None);
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let (tx, _rx) = channel();
    let agg = Arc::new(ScriptedAggregator::new(Vec::new()));
    let lp: AggregationLoop<_, StubRefresher, StubForecaster> =
        AggregationLoop::new(window_query(), agg, tx);

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(lp.run(Duration::from_millis(10), cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop exits promptly")
        .expect("loop task");
}

#[tokio::test(start_paused = true)]
async fn test_loops_tick_independently_and_stop_together() {
    let sink = Arc::new(RecordingSink::default());
    let script = (0..50).map(|i| Some((i * 10, 50.0))).collect();
    let sampling = sampling_loop(script, Arc::clone(&sink), RecordingNotifier::default());

    let (tx, _rx) = channel();
    let agg = Arc::new(ScriptedAggregator::new(
        (0..20).map(|i| Ok(vec![record(i, 10.0)])).collect(),
    ));
    let aggregation: AggregationLoop<_, StubRefresher, StubForecaster> =
        AggregationLoop::new(window_query(), Arc::clone(&agg), tx);

    let cancel = tokio_util::sync::CancellationToken::new();
    let sampling_task = tokio::spawn(sampling.run(Duration::from_millis(10), cancel.clone()));
    let aggregation_task =
        tokio::spawn(aggregation.run(Duration::from_millis(25), cancel.clone()));

    // Ticks land at 10ms steps and 25ms steps respectively.
    tokio::time::sleep(Duration::from_millis(105)).await;

    assert_eq!(sink.points.lock().len(), 10);
    assert_eq!(agg.results.lock().len(), 20 - 4);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), sampling_task)
        .await
        .expect("sampling loop exits promptly")
        .expect("sampling task");
    tokio::time::timeout(Duration::from_secs(1), aggregation_task)
        .await
        .expect("aggregation loop exits promptly")
        .expect("aggregation task");
}
