pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod report;
pub mod writer;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use medload_core::RunCounters;
use medload_intake::{fingerprint_file, CsvChunks};
use medload_storage::{BackoffPolicy, DocumentStore, IndexStatus, PgDocumentStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, LoadConfig, LoadOverrides, RunMode, WriteMode};
pub use dedup::{derive_key, DedupTracker, KeyDerivation};
pub use pipeline::{BatchPipeline, RunContext};
pub use report::{format_report_line, RunReporter};
pub use writer::{SkipReason, UpsertWriter, WriteResult};

pub const CRATE_NAME: &str = "medload-sync";

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub csv_path: String,
    pub csv_sha256: String,
    pub counters: RunCounters,
    pub documents_in_collection: Option<u64>,
    pub report_line: Option<String>,
}

impl LoadSummary {
    pub fn one_line(&self) -> String {
        let c = &self.counters;
        let mut line = format!(
            "load complete: run_id={} mode={} total_rows={} duplicates_in_csv={} missing_key_rows={} upserted_or_modified={} conflicts={} failed_writes={}",
            self.run_id,
            self.mode,
            c.total_rows,
            c.duplicates_in_csv,
            c.missing_key_rows,
            c.upserted_or_modified,
            c.conflicts,
            c.failed_writes
        );
        if let Some(count) = self.documents_in_collection {
            line.push_str(&format!(" documents={count}"));
        }
        line
    }
}

async fn connect(config: &LoadConfig) -> Result<PgDocumentStore> {
    let (url, name) = config.store_target()?;
    let store = PgDocumentStore::connect(url, name, BackoffPolicy::default())
        .await
        .context("connecting to document store")?;
    Ok(store)
}

/// Full run against the configured Postgres collection. Dry runs never open
/// a connection.
pub async fn run_load(config: &LoadConfig) -> Result<LoadSummary> {
    config.validate()?;
    if config.mode.write_mode().is_none() {
        return run_load_with_store(config, None).await;
    }
    // Open the file first so a bad path or header fails before the store is contacted.
    CsvChunks::open(config.csv_path()?, config.chunk_size)?;
    let store = connect(config).await?;
    run_load_with_store(config, Some(&store)).await
}

/// Run with an already-connected store (`None` is only valid for dry runs).
pub async fn run_load_with_store(
    config: &LoadConfig,
    store: Option<&dyn DocumentStore>,
) -> Result<LoadSummary> {
    config.validate()?;
    let run_id = Uuid::new_v4();
    let span = info_span!("load_run", %run_id, mode = %config.mode);
    run_inner(config, store, run_id).instrument(span).await
}

async fn run_inner(
    config: &LoadConfig,
    store: Option<&dyn DocumentStore>,
    run_id: Uuid,
) -> Result<LoadSummary> {
    let started_at = Utc::now();
    let csv_path = config.csv_path()?;
    let csv_label = csv_path.display().to_string();

    let chunks = CsvChunks::open(csv_path, config.chunk_size)?;
    let csv_sha256 = fingerprint_file(csv_path)?;
    info!(csv = %csv_label, sha256 = %csv_sha256, chunk_size = config.chunk_size, "reading input");

    let dry_run = config.mode.write_mode().is_none();
    if config.create_indexes {
        match store {
            Some(store) if !dry_run => {
                let status = store
                    .ensure_unique_index()
                    .await
                    .context("provisioning unique index")?;
                info!(target_collection = %store.describe(), ?status, "unique index ready");
            }
            _ => warn!("index provisioning skipped in dry-run mode"),
        }
    }

    let counters = BatchPipeline::new(config.mode)
        .with_preview_limit(config.preview_limit)
        .run(chunks, store)
        .await?;

    let mut documents_in_collection = None;
    let mut report_line = None;
    if !dry_run {
        let line = RunReporter::new(&config.report_log)
            .report(&counters, &csv_label)
            .await?;
        report_line = Some(line);

        if let Some(store) = store {
            match store.count_documents().await {
                Ok(count) => {
                    info!(target_collection = %store.describe(), documents = count, "collection size after run");
                    documents_in_collection = Some(count);
                }
                Err(err) => {
                    warn!(target_collection = %store.describe(), error = %err, "could not count documents after run");
                }
            }
        }
    }

    Ok(LoadSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        mode: config.mode,
        csv_path: csv_label,
        csv_sha256,
        counters,
        documents_in_collection,
        report_line,
    })
}

/// Provision the unique index on the configured collection without loading rows.
pub async fn ensure_index_from_config(config: &LoadConfig) -> Result<IndexStatus> {
    let store = connect(config).await?;
    let status = store
        .ensure_unique_index()
        .await
        .with_context(|| format!("provisioning unique index on {}", store.describe()))?;
    info!(target_collection = %store.describe(), ?status, "unique index ready");
    Ok(status)
}
