//! Document store for admission records: a Postgres JSONB collection backend,
//! an in-memory backend, unique-index provisioning and connect backoff.

use std::time::Duration;

use async_trait::async_trait;
use medload_core::{AdmissionDocument, NaturalKey};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "medload-storage";

const INDEX_SUFFIX: &str = "uniq_admission";
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a document with natural key {key} already exists")]
    DuplicateKey { key: String },
    #[error("invalid identifier {0:?}: use letters, digits and underscores, not starting with a digit")]
    InvalidIdentifier(String),
    #[error("store unavailable after {attempts} attempt(s): {source}")]
    Unavailable {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    AlreadyPresent,
}

/// Collaborator contract consumed by the load pipeline.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable target, e.g. `healthcare.patients`.
    fn describe(&self) -> String;

    /// Create the unique index over the five natural-key fields if absent.
    async fn ensure_unique_index(&self) -> Result<IndexStatus, StoreError>;

    /// Insert-or-update the document matching `key`. On update every field is
    /// replaced except `ingested_at`.
    async fn upsert(
        &self,
        key: &NaturalKey,
        document: &AdmissionDocument,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Plain insert. Collisions with the unique index surface as
    /// [`StoreError::DuplicateKey`].
    async fn insert(&self, document: &AdmissionDocument) -> Result<(), StoreError>;

    async fn count_documents(&self) -> Result<u64, StoreError>;
}

pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// A validated `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionName {
    database: String,
    collection: String,
}

impl CollectionName {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self, StoreError> {
        let database = database.into();
        let collection = collection.into();
        validate_identifier(&database)?;
        validate_identifier(&collection)?;
        Ok(Self {
            database,
            collection,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.database, self.collection)
    }

    fn index_name(&self) -> String {
        let name = format!("{}_{}", self.collection, INDEX_SUFFIX);
        name.chars().take(MAX_IDENTIFIER_LEN).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Precomputed statements for one collection. Identifiers are validated
/// before they are spliced in.
#[derive(Debug, Clone)]
struct CollectionSql {
    create_schema: String,
    create_table: String,
    index_exists: String,
    create_index: String,
    update_by_key: String,
    insert: String,
    count: String,
}

fn key_filter_sql(first_param: usize) -> String {
    NaturalKey::FIELDS
        .iter()
        .enumerate()
        .map(|(i, column)| format!("doc->>'{}' = ${}", column.document_field(), first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl CollectionSql {
    fn new(name: &CollectionName) -> Self {
        let table = name.qualified();
        let key_columns = NaturalKey::FIELDS
            .iter()
            .map(|column| format!("(doc->>'{}')", column.document_field()))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            create_schema: format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", name.database),
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (id uuid PRIMARY KEY, doc jsonb NOT NULL)"
            ),
            index_exists: "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE schemaname = $1 AND tablename = $2 AND indexname = $3)".to_string(),
            create_index: format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"{}\" ON {table} ({key_columns})",
                name.index_name()
            ),
            update_by_key: format!(
                "UPDATE {table} SET doc = $1::jsonb || jsonb_build_object('ingested_at', COALESCE(doc->'ingested_at', $1::jsonb->'ingested_at')) \
                 WHERE id = (SELECT id FROM {table} WHERE {} LIMIT 1 FOR UPDATE)",
                key_filter_sql(2)
            ),
            insert: format!("INSERT INTO {table} (id, doc) VALUES ($1, $2::jsonb)"),
            count: format!("SELECT COUNT(*) FROM {table}"),
        }
    }
}

/// Postgres-backed collection: one table of `(id uuid, doc jsonb)` rows.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    name: CollectionName,
    sql: CollectionSql,
}

impl PgDocumentStore {
    /// Connect with bounded retries, then make sure the schema and table exist.
    /// Exhausting the retries is reported as [`StoreError::Unavailable`].
    pub async fn connect(
        database_url: &str,
        name: CollectionName,
        backoff: BackoffPolicy,
    ) -> Result<Self, StoreError> {
        let span = info_span!("store_connect", collection = %format!("{}.{}", name.database, name.collection));
        async move {
            let mut attempt = 0usize;
            let pool = loop {
                let connected = PgPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(database_url)
                    .await;
                match connected {
                    Ok(pool) => break pool,
                    Err(err)
                        if classify_sqlx_error(&err) == RetryDisposition::Retryable
                            && attempt < backoff.max_retries =>
                    {
                        let delay = backoff.delay_for_attempt(attempt);
                        warn!(attempt = attempt + 1, ?delay, error = %err, "store not reachable, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        return Err(StoreError::Unavailable {
                            attempts: attempt + 1,
                            source: err,
                        })
                    }
                }
            };

            let store = Self {
                pool,
                sql: CollectionSql::new(&name),
                name,
            };
            store.ensure_collection().await?;
            info!("connected to document store");
            Ok(store)
        }
        .instrument(span)
        .await
    }

    async fn ensure_collection(&self) -> Result<(), StoreError> {
        sqlx::query(&self.sql.create_schema).execute(&self.pool).await?;
        sqlx::query(&self.sql.create_table).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn describe(&self) -> String {
        format!("{}.{}", self.name.database, self.name.collection)
    }

    async fn ensure_unique_index(&self) -> Result<IndexStatus, StoreError> {
        let exists: bool = sqlx::query_scalar(&self.sql.index_exists)
            .bind(&self.name.database)
            .bind(&self.name.collection)
            .bind(self.name.index_name())
            .fetch_one(&self.pool)
            .await?;
        if exists {
            return Ok(IndexStatus::AlreadyPresent);
        }
        sqlx::query(&self.sql.create_index).execute(&self.pool).await?;
        Ok(IndexStatus::Created)
    }

    async fn upsert(
        &self,
        key: &NaturalKey,
        document: &AdmissionDocument,
    ) -> Result<UpsertOutcome, StoreError> {
        let body: JsonValue = serde_json::to_value(document)?;
        let [name, gender, blood_type, date_of_admission, hospital] = key.document_values();

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(&self.sql.update_by_key)
            .bind(&body)
            .bind(name)
            .bind(gender)
            .bind(blood_type)
            .bind(date_of_admission)
            .bind(hospital)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() > 0 {
            tx.commit().await?;
            return Ok(UpsertOutcome::Updated);
        }

        sqlx::query(&self.sql.insert)
            .bind(Uuid::new_v4())
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(|err| duplicate_or_database(err, key))?;
        tx.commit().await?;
        Ok(UpsertOutcome::Inserted)
    }

    async fn insert(&self, document: &AdmissionDocument) -> Result<(), StoreError> {
        let body: JsonValue = serde_json::to_value(document)?;
        sqlx::query(&self.sql.insert)
            .bind(Uuid::new_v4())
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(|err| duplicate_or_database(err, &document.natural_key()))?;
        Ok(())
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&self.sql.count)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn duplicate_or_database(err: sqlx::Error, key: &NaturalKey) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::DuplicateKey {
            key: key.to_string(),
        }
    } else {
        StoreError::Database(err)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: Vec<AdmissionDocument>,
    unique_index: bool,
}

/// In-process collection with the same contract as [`PgDocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    label: String,
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Documents in insertion order.
    pub async fn snapshot(&self) -> Vec<AdmissionDocument> {
        self.state.lock().await.documents.clone()
    }

    pub async fn has_unique_index(&self) -> bool {
        self.state.lock().await.unique_index
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn describe(&self) -> String {
        format!("memory:{}", self.label)
    }

    async fn ensure_unique_index(&self) -> Result<IndexStatus, StoreError> {
        let mut state = self.state.lock().await;
        if state.unique_index {
            return Ok(IndexStatus::AlreadyPresent);
        }
        let mut keys: Vec<NaturalKey> = state.documents.iter().map(AdmissionDocument::natural_key).collect();
        keys.sort();
        if let Some(pair) = keys.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(StoreError::DuplicateKey {
                key: pair[0].to_string(),
            });
        }
        state.unique_index = true;
        Ok(IndexStatus::Created)
    }

    async fn upsert(
        &self,
        key: &NaturalKey,
        document: &AdmissionDocument,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.documents.iter_mut().find(|doc| doc.natural_key() == *key) {
            Some(existing) => {
                let ingested_at = existing.ingested_at;
                *existing = document.clone();
                existing.ingested_at = ingested_at;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.documents.push(document.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn insert(&self, document: &AdmissionDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = document.natural_key();
        if state.unique_index && state.documents.iter().any(|doc| doc.natural_key() == key) {
            return Err(StoreError::DuplicateKey {
                key: key.to_string(),
            });
        }
        state.documents.push(document.clone());
        Ok(())
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.documents.len() as u64)
    }
}
