use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::command::ExternalCommand;
use crate::config::Config;
use crate::store::WindowQuery;

/// Materialises the raw output of a window query to a file.
pub trait SnapshotRefresher: Send + Sync {
    /// Path of the snapshot file.
    fn path(&self) -> &Path;

    /// Re-run the query and replace the snapshot. A failed refresh leaves
    /// the previous snapshot untouched.
    fn refresh(&self, query: &WindowQuery) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Refreshes the snapshot through the `influx` command-line client.
pub struct InfluxCliSnapshot {
    command: ExternalCommand,
    path: PathBuf,
}

impl InfluxCliSnapshot {
    /// `command` receives `query -f <script> --raw` as extra arguments.
    pub fn new(command: ExternalCommand, path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            path: path.into(),
        }
    }

    /// Builds the refresher with store credentials passed through the
    /// child environment.
    pub fn from_config(cfg: &Config) -> Self {
        let command = ExternalCommand::new(&cfg.snapshot.program, cfg.snapshot.timeout)
            .env("INFLUX_HOST", &cfg.store.url)
            .env("INFLUX_ORG", &cfg.store.org)
            .env("INFLUX_TOKEN", &cfg.store.token);

        Self::new(command, &cfg.snapshot.path)
    }
}

impl SnapshotRefresher for InfluxCliSnapshot {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn refresh(&self, query: &WindowQuery) -> Result<()> {
        let script = tempfile::Builder::new()
            .prefix("cpuwatch-")
            .suffix(".flux")
            .tempfile()
            .context("creating query script file")?;

        tokio::fs::write(script.path(), query.to_flux())
            .await
            .context("writing query script")?;

        let output = self
            .command
            .run([
                OsString::from("query"),
                OsString::from("-f"),
                script.path().as_os_str().to_owned(),
                OsString::from("--raw"),
            ])
            .await
            .context("running snapshot query")?;

        write_atomic(self.path.clone(), output.stdout).await
    }
}

/// Replaces `path` with `data` through a temporary file in the same
/// directory, so readers never see a partial file.
pub async fn write_atomic(path: PathBuf, data: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("creating temporary file in {}", dir.display()))?;
        tmp.write_all(&data).context("writing snapshot data")?;
        tmp.as_file().sync_all().context("syncing snapshot data")?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("replacing snapshot {}", path.display()))?;

        Ok(())
    })
    .await
    .context("snapshot writer task failed")?
}

/// First line of a snapshot file, if any.
pub async fn header_line(path: &Path) -> Result<Option<String>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading snapshot {}", path.display()))?;

    Ok(data
        .lines()
        .next()
        .map(|line| line.trim_end().to_string()))
}
