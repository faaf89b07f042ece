use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use medload_core::{AdmissionDocument, NaturalKey};
use medload_storage::{DocumentStore, IndexStatus, MemoryDocumentStore, StoreError, UpsertOutcome};
use medload_sync::{run_load_with_store, LoadConfig, RunMode};
use tempfile::TempDir;

const HEADER: &str = "Name,Age,Gender,Blood Type,Medical Condition,Date of Admission,Doctor,Hospital,Insurance Provider,Billing Amount,Room Number,Admission Type,Discharge Date,Medication,Test Results";
const BLOOD_TYPES: [&str; 4] = ["A+", "B-", "O+", "AB-"];

fn patient_row(i: usize, name: &str, gender: &str, condition: &str) -> String {
    let day = i % 28 + 1;
    let month = i % 12 + 1;
    let year = 2020 + i % 4;
    format!(
        "{name},{age},{gender},{blood},{condition},{day:02}/{month:02}/{year},Dr. Lane,Hospital {hospital},Medicare,\"{bill},250.75\",{room},Urgent,{dday:02}/{month:02}/{year},Aspirin,Normal",
        age = 20 + i % 60,
        blood = BLOOD_TYPES[i % 4],
        hospital = i % 10,
        bill = 1 + i % 9,
        room = 100 + i,
        dday = (day + 1).min(28),
    )
}

/// 1000 data rows: 991 distinct keys, 7 repeats of earlier keys (written in
/// different casing, with a new condition) and 2 rows without a gender.
fn scenario_csv() -> String {
    let mut lines = vec![HEADER.to_string()];
    for i in 0..991 {
        let gender = if i % 2 == 0 { "Female" } else { "Male" };
        lines.push(patient_row(i, &format!("Patient {i}"), gender, "Asthma"));
    }
    for j in 0..2 {
        lines.push(patient_row(j, &format!("Nobody {j}"), "", "Flu"));
    }
    for i in 0..7 {
        let gender = if i % 2 == 0 { "FEMALE" } else { "MALE" };
        lines.push(patient_row(i, &format!("  PATIENT {i} "), gender, "Revised"));
    }
    lines.join("\n") + "\n"
}

struct Fixture {
    dir: TempDir,
    csv: PathBuf,
}

impl Fixture {
    fn new(contents: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("healthcare_dataset.csv");
        let mut file = std::fs::File::create(&csv).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Self { dir, csv }
    }

    fn report_log(&self) -> PathBuf {
        self.dir.path().join("reports").join("ingest_runs.log")
    }

    fn config(&self, mode: RunMode) -> LoadConfig {
        LoadConfig {
            csv_path: Some(self.csv.clone()),
            database_url: Some("postgres://unused@localhost/health".to_string()),
            mode,
            report_log: self.report_log(),
            ..Default::default()
        }
    }
}

/// Writes succeed but the post-run document count does not.
struct CountFailsStore {
    inner: MemoryDocumentStore,
}

#[async_trait]
impl DocumentStore for CountFailsStore {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn ensure_unique_index(&self) -> Result<IndexStatus, StoreError> {
        self.inner.ensure_unique_index().await
    }

    async fn upsert(
        &self,
        key: &NaturalKey,
        document: &AdmissionDocument,
    ) -> Result<UpsertOutcome, StoreError> {
        self.inner.upsert(key, document).await
    }

    async fn insert(&self, document: &AdmissionDocument) -> Result<(), StoreError> {
        self.inner.insert(document).await
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }
}

fn report_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Documents keyed and sorted, with run timestamps cleared.
fn contents(mut docs: Vec<AdmissionDocument>) -> Vec<(NaturalKey, AdmissionDocument)> {
    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    let mut keyed: Vec<_> = docs
        .drain(..)
        .map(|mut doc| {
            doc.ingested_at = epoch;
            doc.last_modified_at = epoch;
            (doc.natural_key(), doc)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed
}

#[tokio::test]
async fn first_run_on_fresh_collection() {
    let fixture = Fixture::new(&scenario_csv());
    let store = MemoryDocumentStore::new("scenario");

    let summary = run_load_with_store(&fixture.config(RunMode::Upsert), Some(&store))
        .await
        .unwrap();

    let c = summary.counters;
    assert_eq!(c.total_rows, 1000);
    assert_eq!(c.duplicates_in_csv, 7);
    assert_eq!(c.missing_key_rows, 2);
    assert_eq!(c.upserted_or_modified, 991);
    assert_eq!(c.failed_writes, 0);
    assert_eq!(summary.documents_in_collection, Some(991));
    assert_eq!(summary.csv_sha256.len(), 64);

    let keys: std::collections::BTreeSet<NaturalKey> = store
        .snapshot()
        .await
        .iter()
        .map(AdmissionDocument::natural_key)
        .collect();
    assert_eq!(keys.len(), 991);

    let lines = report_lines(&fixture.report_log());
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with(
        "total_rows=1000 duplicates_in_csv=7 missing_key_rows=2 upserted_or_modified=991"
    ));
    assert_eq!(summary.report_line.as_deref(), Some(lines[0].as_str()));
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let fixture = Fixture::new(&scenario_csv());
    let store = MemoryDocumentStore::new("scenario");
    let config = fixture.config(RunMode::Upsert);

    run_load_with_store(&config, Some(&store)).await.unwrap();
    let before = store.snapshot().await;

    let summary = run_load_with_store(&config, Some(&store)).await.unwrap();
    let after = store.snapshot().await;

    assert_eq!(summary.counters.upserted_or_modified, 991);
    assert_eq!(summary.counters.duplicates_in_csv, 7);
    assert_eq!(summary.counters.missing_key_rows, 2);
    assert_eq!(store.count_documents().await.unwrap(), 991);
    assert_eq!(contents(before.clone()), contents(after.clone()));

    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.ingested_at, new.ingested_at);
        assert!(new.last_modified_at >= old.last_modified_at);
    }
    assert_eq!(report_lines(&fixture.report_log()).len(), 2);
}

#[tokio::test]
async fn last_occurrence_of_a_key_wins() {
    let fixture = Fixture::new(&scenario_csv());
    let store = MemoryDocumentStore::new("scenario");
    run_load_with_store(&fixture.config(RunMode::Upsert), Some(&store))
        .await
        .unwrap();

    let docs = store.snapshot().await;
    let revised: Vec<_> = docs
        .iter()
        .filter(|doc| doc.medical_condition.as_deref() == Some("Revised"))
        .map(|doc| doc.name.as_str())
        .collect();
    assert_eq!(revised.len(), 7);
    assert!(revised.contains(&"patient 0"));
    assert!(docs.iter().all(|doc| doc.source == "csv_migration_v2"));
    assert!(docs.iter().all(|doc| !doc.name.starts_with("nobody")));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let fixture = Fixture::new(&scenario_csv());
    let store = MemoryDocumentStore::new("scenario");
    let mut config = fixture.config(RunMode::DryRun);
    config.database_url = None;
    config.create_indexes = true;

    let summary = run_load_with_store(&config, Some(&store)).await.unwrap();

    assert_eq!(summary.counters.total_rows, 1000);
    assert_eq!(summary.counters.duplicates_in_csv, 7);
    assert_eq!(summary.counters.missing_key_rows, 2);
    assert_eq!(summary.counters.upserted_or_modified, 0);
    assert!(summary.report_line.is_none());
    assert!(store.snapshot().await.is_empty());
    assert!(!store.has_unique_index().await);
    assert!(!fixture.report_log().exists());
}

#[tokio::test]
async fn chunk_size_does_not_change_outcome() {
    let fixture = Fixture::new(&scenario_csv());
    let mut outcomes = Vec::new();
    for chunk_size in [1, 7, 333, 5000] {
        let store = MemoryDocumentStore::new("chunks");
        let mut config = fixture.config(RunMode::Upsert);
        config.chunk_size = chunk_size;
        let summary = run_load_with_store(&config, Some(&store)).await.unwrap();
        outcomes.push((summary.counters, contents(store.snapshot().await)));
    }
    for pair in outcomes.windows(2) {
        assert_eq!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn insert_only_rerun_reports_conflicts() {
    let fixture = Fixture::new(&scenario_csv());
    let store = MemoryDocumentStore::new("insert");
    let mut config = fixture.config(RunMode::InsertOnly);
    config.create_indexes = true;

    let first = run_load_with_store(&config, Some(&store)).await.unwrap();
    assert!(store.has_unique_index().await);
    assert_eq!(first.counters.upserted_or_modified, 991);
    assert_eq!(first.counters.conflicts, 7);

    let second = run_load_with_store(&config, Some(&store)).await.unwrap();
    assert_eq!(second.counters.upserted_or_modified, 0);
    assert_eq!(second.counters.conflicts, 998);
    assert_eq!(store.count_documents().await.unwrap(), 991);
}

#[tokio::test]
async fn missing_header_column_fails_before_any_write() {
    let fixture = Fixture::new("Name,Age,Gender\nAnn,30,Female\n");
    let store = MemoryDocumentStore::new("bad");

    let err = run_load_with_store(&fixture.config(RunMode::Upsert), Some(&store))
        .await
        .unwrap_err();

    assert!(err
        .downcast_ref::<medload_intake::IntakeError>()
        .is_some_and(|e| matches!(e, medload_intake::IntakeError::MissingColumns { .. })));
    assert!(store.snapshot().await.is_empty());
    assert!(!fixture.report_log().exists());
}

#[tokio::test]
async fn unparseable_cells_do_not_drop_rows() {
    let csv = format!(
        "{HEADER}\nAnn,unknown,Female,A+,Flu,01/02/2024,Dr. X,General,Aetna,lots,12,Elective,someday,None,Normal\n"
    );
    let fixture = Fixture::new(&csv);
    let store = MemoryDocumentStore::new("lenient");

    let summary = run_load_with_store(&fixture.config(RunMode::Upsert), Some(&store))
        .await
        .unwrap();

    assert_eq!(summary.counters.upserted_or_modified, 1);
    let docs = store.snapshot().await;
    assert_eq!(docs[0].age, None);
    assert_eq!(docs[0].billing_amount, None);
    assert_eq!(docs[0].discharge_date, None);
    assert_eq!(docs[0].medication, None);
    assert_eq!(docs[0].room_number.as_deref(), Some("12"));
}

#[tokio::test]
async fn report_line_survives_failed_document_count() {
    let csv = format!("{HEADER}\n{}\n", patient_row(0, "Ann", "Female", "Flu"));
    let fixture = Fixture::new(&csv);
    let store = CountFailsStore {
        inner: MemoryDocumentStore::new("count-fails"),
    };

    let summary = run_load_with_store(&fixture.config(RunMode::Upsert), Some(&store))
        .await
        .unwrap();

    assert_eq!(summary.counters.upserted_or_modified, 1);
    assert_eq!(summary.documents_in_collection, None);
    assert_eq!(store.inner.snapshot().await.len(), 1);
    let lines = report_lines(&fixture.report_log());
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with("upserted_or_modified=1"));
}
