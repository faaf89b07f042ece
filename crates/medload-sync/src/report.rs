use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use medload_core::RunCounters;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// One audit line per run:
/// `[<utc timestamp>] csv=<id> total_rows=N duplicates_in_csv=N missing_key_rows=N upserted_or_modified=N`
pub fn format_report_line(at: DateTime<Utc>, csv_id: &str, counters: &RunCounters) -> String {
    format!(
        "[{}] csv={} total_rows={} duplicates_in_csv={} missing_key_rows={} upserted_or_modified={}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        csv_id,
        counters.total_rows,
        counters.duplicates_in_csv,
        counters.missing_key_rows,
        counters.upserted_or_modified
    )
}

/// Appends run lines to a plain-text log; existing lines are never touched.
#[derive(Debug, Clone)]
pub struct RunReporter {
    path: PathBuf,
}

impl RunReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn report(&self, counters: &RunCounters, csv_id: &str) -> Result<String> {
        self.report_at(Utc::now(), counters, csv_id).await
    }

    pub async fn report_at(
        &self,
        at: DateTime<Utc>,
        counters: &RunCounters,
        csv_id: &str,
    ) -> Result<String> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let line = format_report_line(at, csv_id, counters);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().await.context("flushing run report")?;

        info!(path = %self.path.display(), "{line}");
        Ok(line)
    }
}
