use std::io::{Cursor, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::config::StoreConfig;

use super::annotated::RecordStream;
use super::line::Point;
use super::query::WindowQuery;
use super::{TimeSeriesSink, WindowAggregator};

/// Callback type for recording store request metrics.
/// Receives (operation, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Records of one InfluxDB query response.
pub type QueryRecords = RecordStream<Cursor<Vec<u8>>>;

/// InfluxDB v2 HTTP API client used both as sink and aggregator.
pub struct InfluxClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    org: String,
    bucket: String,
    gzip: bool,
    metrics: Option<MetricsCallback>,
}

impl InfluxClient {
    /// Create a new client from store configuration.
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            org: cfg.org.clone(),
            bucket: cfg.bucket.clone(),
            gzip: cfg.gzip,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, operation: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(operation, status, duration);
        }
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    async fn post_write(&self, body: Vec<u8>) -> Result<()> {
        let mut request = self
            .http
            .post(format!("{}/api/v2/write", self.base_url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", self.auth_header())
            .header("Content-Type", "text/plain; charset=utf-8");

        let body = if self.gzip {
            request = request.header("Content-Encoding", "gzip");
            compress_gzip(&body)?
        } else {
            body
        };

        let response = request
            .body(body)
            .send()
            .await
            .context("sending write request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from write: {text}");
        }

        // Drain body for connection reuse.
        let _ = response.bytes().await;

        Ok(())
    }

    async fn post_query(&self, flux: String) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/api/v2/query", self.base_url))
            .query(&[("org", self.org.as_str())])
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux)
            .send()
            .await
            .context("sending query request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from query: {text}");
        }

        let body = response
            .bytes()
            .await
            .context("reading query response body")?;

        Ok(body.to_vec())
    }
}

impl TimeSeriesSink for InfluxClient {
    async fn write(&self, point: &Point) -> Result<()> {
        let mut line = point.to_line_protocol()?;
        line.push('\n');

        let start = Instant::now();
        let result = self.post_write(line.into_bytes()).await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request("write", status, start.elapsed());

        result
    }
}

impl WindowAggregator for InfluxClient {
    type Records = QueryRecords;

    async fn query(&self, query: &WindowQuery) -> Result<Self::Records> {
        let start = Instant::now();
        let result = self.post_query(query.to_flux()).await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request("query", status, start.elapsed());

        Ok(RecordStream::new(Cursor::new(result?)))
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
