use chrono::{DateTime, Utc};
use medload_core::{AdmissionDocument, AdmissionRecord, NaturalKey};
use medload_storage::{DocumentStore, StoreError, UpsertOutcome};

use crate::config::WriteMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Insert-only mode hit an existing document with the same natural key.
    DuplicateKey,
}

#[derive(Debug)]
pub enum WriteResult {
    Written(UpsertOutcome),
    Skipped(SkipReason),
    Failed(StoreError),
}

impl WriteResult {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteResult::Written(_))
    }
}

/// Persists one keyed record. Store failures come back as values so the
/// pipeline can count them and move on to the next row.
pub struct UpsertWriter<'a> {
    store: &'a dyn DocumentStore,
    mode: WriteMode,
}

impl<'a> UpsertWriter<'a> {
    pub fn new(store: &'a dyn DocumentStore, mode: WriteMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub async fn write(&self, record: &AdmissionRecord, key: &NaturalKey) -> WriteResult {
        self.write_at(record, key, Utc::now()).await
    }

    pub async fn write_at(
        &self,
        record: &AdmissionRecord,
        key: &NaturalKey,
        now: DateTime<Utc>,
    ) -> WriteResult {
        let document = AdmissionDocument::new(record, key, now);
        match self.mode {
            WriteMode::Upsert => match self.store.upsert(key, &document).await {
                Ok(outcome) => WriteResult::Written(outcome),
                Err(err) => WriteResult::Failed(err),
            },
            WriteMode::InsertOnly => match self.store.insert(&document).await {
                Ok(()) => WriteResult::Written(UpsertOutcome::Inserted),
                Err(err) if err.is_duplicate_key() => WriteResult::Skipped(SkipReason::DuplicateKey),
                Err(err) => WriteResult::Failed(err),
            },
        }
    }
}
