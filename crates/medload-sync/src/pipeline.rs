use anyhow::{bail, Context, Result};
use chrono::Utc;
use medload_core::{AdmissionDocument, AdmissionRecord, NaturalKey, RunCounters};
use medload_intake::{normalize, IntakeError, RawRow};
use medload_storage::DocumentStore;
use tracing::{debug, error, info, warn};

use crate::config::RunMode;
use crate::dedup::{derive_key, DedupTracker, KeyDerivation};
use crate::writer::{UpsertWriter, WriteResult};

/// Mutable state threaded through one run.
#[derive(Debug, Default)]
pub struct RunContext {
    pub counters: RunCounters,
    pub dedup: DedupTracker,
    previewed: usize,
}

/// Streams chunks of raw rows through normalize, key derivation, in-run
/// duplicate tracking and the writer. Rows are handled strictly in input
/// order, so the last occurrence of a key is what ends up stored.
#[derive(Debug, Clone)]
pub struct BatchPipeline {
    mode: RunMode,
    preview_limit: usize,
}

impl BatchPipeline {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            preview_limit: 5,
        }
    }

    pub fn with_preview_limit(mut self, limit: usize) -> Self {
        self.preview_limit = limit;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub async fn run<I>(&self, chunks: I, store: Option<&dyn DocumentStore>) -> Result<RunCounters>
    where
        I: IntoIterator<Item = Result<Vec<RawRow>, IntakeError>>,
    {
        let writer = match (self.mode.write_mode(), store) {
            (Some(mode), Some(store)) => Some(UpsertWriter::new(store, mode)),
            (Some(_), None) => bail!("{} mode needs a document store", self.mode),
            (None, _) => None,
        };

        let mut ctx = RunContext::default();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let rows = chunk.with_context(|| format!("reading chunk {}", index + 1))?;
            debug!(chunk = index + 1, rows = rows.len(), "processing chunk");
            for row in &rows {
                self.process_row(&mut ctx, writer.as_ref(), row).await;
            }
        }

        let counters = ctx.counters;
        info!(
            total_rows = counters.total_rows,
            write_attempts = counters.write_attempts(),
            duplicates_in_csv = counters.duplicates_in_csv,
            missing_key_rows = counters.missing_key_rows,
            upserted_or_modified = counters.upserted_or_modified,
            conflicts = counters.conflicts,
            failed_writes = counters.failed_writes,
            distinct_keys = ctx.dedup.distinct_keys(),
            "pipeline finished"
        );
        Ok(counters)
    }

    async fn process_row(&self, ctx: &mut RunContext, writer: Option<&UpsertWriter<'_>>, row: &RawRow) {
        ctx.counters.total_rows += 1;

        let record = normalize(&row.record);
        for (column, issue) in record.issues() {
            debug!(line = row.line, column = %column, %issue, "value left unset");
        }

        let key = match derive_key(&record) {
            KeyDerivation::Complete(key) => key,
            KeyDerivation::Incomplete { missing } => {
                ctx.counters.missing_key_rows += 1;
                let missing: Vec<&str> = missing.iter().map(|column| column.header()).collect();
                warn!(line = row.line, missing = ?missing, "row skipped: natural key incomplete");
                return;
            }
        };

        if ctx.dedup.observe(&key) {
            ctx.counters.duplicates_in_csv += 1;
            debug!(line = row.line, %key, "key repeats earlier row in this file");
        }

        match writer {
            Some(writer) => self.write_row(ctx, writer, row, &record, &key).await,
            None => self.preview_row(ctx, row, &record, &key),
        }
    }

    async fn write_row(
        &self,
        ctx: &mut RunContext,
        writer: &UpsertWriter<'_>,
        row: &RawRow,
        record: &AdmissionRecord,
        key: &NaturalKey,
    ) {
        match writer.write(record, key).await {
            WriteResult::Written(outcome) => {
                if ctx.dedup.mark_written(key) {
                    ctx.counters.upserted_or_modified += 1;
                }
                debug!(line = row.line, ?outcome, "row written");
            }
            WriteResult::Skipped(reason) => {
                ctx.counters.conflicts += 1;
                warn!(line = row.line, %key, ?reason, "row skipped by store");
            }
            WriteResult::Failed(err) => {
                ctx.counters.failed_writes += 1;
                error!(line = row.line, %key, error = %err, "write failed");
            }
        }
    }

    fn preview_row(&self, ctx: &mut RunContext, row: &RawRow, record: &AdmissionRecord, key: &NaturalKey) {
        let document = AdmissionDocument::new(record, key, Utc::now());
        if ctx.previewed < self.preview_limit {
            ctx.previewed += 1;
            match serde_json::to_string_pretty(&document) {
                Ok(json) => info!(line = row.line, "dry-run document:\n{json}"),
                Err(err) => warn!(line = row.line, error = %err, "could not render preview"),
            }
        } else {
            debug!(line = row.line, %key, "dry-run: would write");
        }
    }
}
