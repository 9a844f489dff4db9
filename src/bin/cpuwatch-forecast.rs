use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use cpuwatch::forecast::{load_series, LinearTrend};

/// Predict near-term CPU utilization from an aggregated window snapshot.
///
/// Reads an InfluxDB annotated CSV with `_time` and `_value` columns, fits a
/// least-squares linear trend and prints the value `--horizon` after the
/// latest record.
#[derive(Parser)]
#[command(name = "cpuwatch-forecast", version, about)]
struct Cli {
    /// Snapshot CSV file.
    csv: PathBuf,

    /// How far past the latest record to predict.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    horizon: Duration,
}

fn run(cli: &Cli) -> Result<f64> {
    let series = load_series(&cli.csv)?;
    let trend = LinearTrend::fit(&series)?;

    Ok(trend.predict_after_last(cli.horizon))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(prediction) => {
            println!("{prediction:.2}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
