//! Tabular intake: header validation, bounded-memory chunk reading and
//! per-field normalization into the handoff record used by the load pipeline.

pub mod dates;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use medload_core::{AdmissionRecord, Field, RawRecord, SourceColumn};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub use dates::parse_day_first;

pub const CRATE_NAME: &str = "medload-intake";

/// Cell contents treated as an absent value, matching common spreadsheet exports.
const NA_MARKERS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("opening {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("missing expected columns: {}", .missing.join(", "))]
    MissingColumns { missing: Vec<String> },
    #[error("chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("reading csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("fingerprinting {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where each expected column sits in the file's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    positions: [usize; 15],
    extra: Vec<String>,
}

impl ColumnLayout {
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Result<Self, IntakeError> {
        let headers: Vec<&str> = headers
            .into_iter()
            .enumerate()
            .map(|(i, h)| if i == 0 { h.trim_start_matches('\u{feff}') } else { h })
            .collect();

        let mut positions = [0usize; 15];
        let mut missing = Vec::new();
        for (slot, column) in positions.iter_mut().zip(SourceColumn::ALL) {
            match headers.iter().position(|h| *h == column.header()) {
                Some(pos) => *slot = pos,
                None => missing.push(column.header().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(IntakeError::MissingColumns { missing });
        }

        let extra = headers
            .iter()
            .filter(|h| !SourceColumn::ALL.iter().any(|c| c.header() == **h))
            .map(|h| h.to_string())
            .collect();
        Ok(Self { positions, extra })
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra
    }

    fn project(&self, record: &csv::ByteRecord) -> RawRecord {
        let mut raw = RawRecord::new();
        for (column, pos) in SourceColumn::ALL.into_iter().zip(self.positions) {
            if let Some(bytes) = record.get(pos) {
                raw.set(column, String::from_utf8_lossy(bytes).into_owned());
            }
        }
        raw
    }
}

/// One input row with its 1-based line number for log context.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub line: u64,
    pub record: RawRecord,
}

/// Streams a CSV source as chunks of at most `chunk_size` rows.
///
/// The header is validated when the reader is constructed, so a malformed
/// file fails before any row is read.
pub struct CsvChunks<R: Read> {
    reader: csv::Reader<R>,
    layout: ColumnLayout,
    chunk_size: usize,
    record: csv::ByteRecord,
    finished: bool,
}

impl CsvChunks<File> {
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, IntakeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IntakeError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file, chunk_size)
    }
}

impl<R: Read> CsvChunks<R> {
    pub fn from_reader(reader: R, chunk_size: usize) -> Result<Self, IntakeError> {
        if chunk_size == 0 {
            return Err(IntakeError::ZeroChunkSize);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = reader.byte_headers()?.clone();
        let headers: Vec<String> = headers
            .iter()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .collect();
        let layout = ColumnLayout::from_headers(headers.iter().map(String::as_str))?;
        if !layout.extra_columns().is_empty() {
            warn!(extra = ?layout.extra_columns(), "extra columns present and will be ignored");
        }

        Ok(Self {
            reader,
            layout,
            chunk_size,
            record: csv::ByteRecord::new(),
            finished: false,
        })
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }
}

impl<R: Read> Iterator for CsvChunks<R> {
    type Item = Result<Vec<RawRow>, IntakeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {
                    let line = self.record.position().map(|p| p.line()).unwrap_or_default();
                    chunk.push(RawRow {
                        line,
                        record: self.layout.project(&self.record),
                    });
                }
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

/// Convert one raw row into a typed record. Unparseable cells become unset
/// fields carrying a [`medload_core::FieldIssue`]; the row itself is never rejected here.
pub fn normalize(raw: &RawRecord) -> AdmissionRecord {
    AdmissionRecord {
        name: lowered_text(raw, SourceColumn::Name),
        age: integer(raw, SourceColumn::Age),
        gender: lowered_text(raw, SourceColumn::Gender),
        blood_type: lowered_text(raw, SourceColumn::BloodType),
        medical_condition: text(raw, SourceColumn::MedicalCondition),
        date_of_admission: date(raw, SourceColumn::DateOfAdmission),
        doctor: text(raw, SourceColumn::Doctor),
        hospital: lowered_text(raw, SourceColumn::Hospital),
        insurance_provider: text(raw, SourceColumn::InsuranceProvider),
        billing_amount: decimal(raw, SourceColumn::BillingAmount),
        room_number: text(raw, SourceColumn::RoomNumber),
        admission_type: text(raw, SourceColumn::AdmissionType),
        discharge_date: date(raw, SourceColumn::DischargeDate),
        medication: text(raw, SourceColumn::Medication),
        test_results: text(raw, SourceColumn::TestResults),
    }
}

fn cell(raw: &RawRecord, column: SourceColumn) -> Option<&str> {
    raw.get(column)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !NA_MARKERS.contains(s))
}

fn text(raw: &RawRecord, column: SourceColumn) -> Field<String> {
    match cell(raw, column) {
        Some(value) => Field::present(value.to_string()),
        None => Field::empty(),
    }
}

fn lowered_text(raw: &RawRecord, column: SourceColumn) -> Field<String> {
    match cell(raw, column) {
        Some(value) => Field::present(value.to_lowercase()),
        None => Field::empty(),
    }
}

fn integer(raw: &RawRecord, column: SourceColumn) -> Field<i64> {
    let Some(value) = cell(raw, column) else {
        return Field::empty();
    };
    if let Ok(parsed) = value.parse::<i64>() {
        return Field::present(parsed);
    }
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() && parsed.abs() < i64::MAX as f64 => {
            Field::present(parsed.trunc() as i64)
        }
        _ => Field::unparseable(value, "integer"),
    }
}

fn decimal(raw: &RawRecord, column: SourceColumn) -> Field<f64> {
    let Some(value) = cell(raw, column) else {
        return Field::empty();
    };
    match value.replace(',', "").parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Field::present(parsed),
        _ => Field::unparseable(value, "number"),
    }
}

fn date(raw: &RawRecord, column: SourceColumn) -> Field<chrono::NaiveDateTime> {
    let Some(value) = cell(raw, column) else {
        return Field::empty();
    };
    match parse_day_first(value) {
        Some(parsed) => Field::present(parsed),
        None => Field::unparseable(value, "date"),
    }
}

/// SHA-256 of a whole input file, streamed so large exports stay out of memory.
pub fn fingerprint_file(path: impl AsRef<Path>) -> Result<String, IntakeError> {
    let path = path.as_ref();
    let wrap = |source| IntakeError::Fingerprint {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(wrap)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(wrap)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "Name,Age,Gender,Blood Type,Medical Condition,Date of Admission,Doctor,Hospital,Insurance Provider,Billing Amount,Room Number,Admission Type,Discharge Date,Medication,Test Results";

    fn csv_text(rows: &[&str]) -> String {
        let mut text = String::from(HEADER);
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text.push('\n');
        text
    }

    fn raw_row() -> RawRecord {
        RawRecord::new()
            .with(SourceColumn::Name, "  Bobby JacksOn ")
            .with(SourceColumn::Age, "30")
            .with(SourceColumn::Gender, "Male")
            .with(SourceColumn::BloodType, "B-")
            .with(SourceColumn::MedicalCondition, " Cancer ")
            .with(SourceColumn::DateOfAdmission, "31/01/2024")
            .with(SourceColumn::Doctor, "Matthew Smith")
            .with(SourceColumn::Hospital, "Sons and Miller")
            .with(SourceColumn::InsuranceProvider, "Blue Cross")
            .with(SourceColumn::BillingAmount, "18856.281305978155")
            .with(SourceColumn::RoomNumber, "328")
            .with(SourceColumn::AdmissionType, "Urgent")
            .with(SourceColumn::DischargeDate, "02/02/2024")
            .with(SourceColumn::Medication, "Paracetamol")
            .with(SourceColumn::TestResults, "Normal")
    }

    #[test]
    fn key_fields_are_lowercased_and_others_only_trimmed() {
        let record = normalize(&raw_row());
        assert_eq!(record.name.get().map(String::as_str), Some("bobby jackson"));
        assert_eq!(record.gender.get().map(String::as_str), Some("male"));
        assert_eq!(record.blood_type.get().map(String::as_str), Some("b-"));
        assert_eq!(record.hospital.get().map(String::as_str), Some("sons and miller"));
        assert_eq!(record.medical_condition.get().map(String::as_str), Some("Cancer"));
        assert_eq!(record.doctor.get().map(String::as_str), Some("Matthew Smith"));
        assert_eq!(record.room_number.get().map(String::as_str), Some("328"));
        assert_eq!(record.age.cloned(), Some(30));
        assert_eq!(
            record.discharge_date.cloned(),
            NaiveDate::from_ymd_opt(2024, 2, 2).unwrap().and_hms_opt(0, 0, 0)
        );
        assert!(record.issues().is_empty());
    }

    #[test]
    fn unparseable_numbers_become_unset_with_issue() {
        let raw = raw_row()
            .with(SourceColumn::Age, "thirty")
            .with(SourceColumn::BillingAmount, "n/a-ish");
        let record = normalize(&raw);
        assert!(!record.age.is_set());
        assert_eq!(record.age.issue.as_ref().map(|i| i.raw.as_str()), Some("thirty"));
        assert!(!record.billing_amount.is_set());
        assert_eq!(record.issues().len(), 2);
        assert!(record.name.is_set());
    }

    #[test]
    fn numeric_coercion_matches_spreadsheet_exports() {
        let raw = raw_row()
            .with(SourceColumn::Age, "42.9")
            .with(SourceColumn::BillingAmount, "1,234.50");
        let record = normalize(&raw);
        assert_eq!(record.age.cloned(), Some(42));
        assert_eq!(record.billing_amount.cloned(), Some(1234.5));
    }

    #[test]
    fn empty_and_na_cells_are_unset_without_issue() {
        let raw = raw_row()
            .with(SourceColumn::Gender, "   ")
            .with(SourceColumn::Medication, "NaN");
        let record = normalize(&raw);
        assert!(!record.gender.is_set());
        assert!(record.gender.issue.is_none());
        assert!(!record.medication.is_set());
    }

    #[test]
    fn bad_date_is_flagged() {
        let record = normalize(&raw_row().with(SourceColumn::DateOfAdmission, "soon"));
        assert!(!record.date_of_admission.is_set());
        assert_eq!(record.issues()[0].0, SourceColumn::DateOfAdmission);
    }

    #[test]
    fn missing_columns_fail_before_rows() {
        let text = "Name,Age,Gender\nA,1,Male\n";
        let err = CsvChunks::from_reader(text.as_bytes(), 10).err().expect("header error");
        match err {
            IntakeError::MissingColumns { missing } => {
                assert_eq!(missing.len(), 12);
                assert!(missing.contains(&"Blood Type".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn header_match_is_case_sensitive() {
        let text = HEADER.replace("Hospital", "hospital");
        let err = CsvChunks::from_reader(text.as_bytes(), 10).err().expect("header error");
        assert!(matches!(err, IntakeError::MissingColumns { ref missing } if missing == &["Hospital".to_string()]));
    }

    #[test]
    fn extra_and_reordered_columns_are_tolerated() {
        let layout = ColumnLayout::from_headers(
            std::iter::once("Notes").chain(SourceColumn::ALL.iter().rev().map(|c| c.header())),
        )
        .expect("layout");
        assert_eq!(layout.extra_columns(), &["Notes".to_string()]);
    }

    #[test]
    fn chunks_respect_size_and_preserve_order() {
        let rows: Vec<String> = (0..7)
            .map(|i| format!("P{i},30,Male,A+,Flu,01/02/2024,Doc,Hosp,Ins,10,1,Urgent,02/02/2024,Med,Normal"))
            .collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let text = csv_text(&refs);

        let chunks: Vec<Vec<RawRow>> = CsvChunks::from_reader(text.as_bytes(), 3)
            .expect("reader")
            .collect::<Result<_, _>>()
            .expect("chunks");
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);

        let names: Vec<_> = chunks
            .iter()
            .flatten()
            .map(|row| row.record.get(SourceColumn::Name).unwrap().to_string())
            .collect();
        assert_eq!(names, (0..7).map(|i| format!("P{i}")).collect::<Vec<_>>());
        assert_eq!(chunks[0][0].line, 2);
    }

    #[test]
    fn short_rows_and_bad_bytes_do_not_abort() {
        let mut bytes = csv_text(&["Short,1,Male"]).into_bytes();
        bytes.extend_from_slice(b"Bad\xff,2,Female,O+,Flu,01/02/2024,Doc,Hosp,Ins,10,1,Urgent,02/02/2024,Med,Normal\n");
        let rows: Vec<RawRow> = CsvChunks::from_reader(bytes.as_slice(), 10)
            .expect("reader")
            .flat_map(|chunk| chunk.expect("chunk"))
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record.get(SourceColumn::Hospital), None);
        assert!(rows[1].record.get(SourceColumn::Name).unwrap().starts_with("Bad"));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let text = csv_text(&[]);
        assert!(matches!(
            CsvChunks::from_reader(text.as_bytes(), 0),
            Err(IntakeError::ZeroChunkSize)
        ));
    }

    #[test]
    fn fingerprint_matches_in_memory_hash() {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(b"hello world").expect("write");
        let digest = fingerprint_file(file.path()).expect("fingerprint");
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn open_reports_missing_file() {
        let err = CsvChunks::open("/definitely/not/here.csv", 10).err().expect("error");
        assert!(matches!(err, IntakeError::Open { .. }));
    }
}
