pub mod linear;

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::command::ExternalCommand;
use crate::config::Config;

pub use self::linear::{load_series, LinearTrend};

/// Predicts near-term utilization from a snapshot file.
pub trait Forecaster: Send + Sync {
    fn forecast(&self, snapshot: &Path) -> impl std::future::Future<Output = Result<f64>> + Send;
}

/// Runs an external forecaster with the snapshot path as its last argument.
///
/// The process must print exactly one finite number on stdout.
pub struct CommandForecaster {
    command: ExternalCommand,
}

impl CommandForecaster {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let command = cfg.forecast.args.iter().fold(
            ExternalCommand::new(&cfg.forecast.program, cfg.forecast.timeout),
            |cmd, arg| cmd.arg(arg),
        );

        Self::new(command)
    }
}

impl Forecaster for CommandForecaster {
    async fn forecast(&self, snapshot: &Path) -> Result<f64> {
        let output = self
            .command
            .run([snapshot.as_os_str()])
            .await
            .context("running forecaster")?;

        parse_prediction(&output.stdout_lossy())
    }
}

/// Parses forecaster output: one floating-point number, surrounding
/// whitespace allowed.
pub fn parse_prediction(stdout: &str) -> Result<f64> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        bail!("forecaster printed nothing");
    }
    if trimmed.split_whitespace().nth(1).is_some() {
        bail!("forecaster printed more than one value: {trimmed:?}");
    }

    let value: f64 = trimmed
        .parse()
        .with_context(|| format!("forecaster output {trimmed:?} is not a number"))?;
    if !value.is_finite() {
        bail!("forecaster output {value} is not finite");
    }

    Ok(value)
}
