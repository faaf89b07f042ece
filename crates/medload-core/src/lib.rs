//! Core domain model for the admissions loader.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "medload-core";

/// Tag written into every stored document to identify the pipeline version.
pub const SOURCE_TAG: &str = "csv_migration_v2";

/// The fifteen columns of the source file, in their canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceColumn {
    Name,
    Age,
    Gender,
    BloodType,
    MedicalCondition,
    DateOfAdmission,
    Doctor,
    Hospital,
    InsuranceProvider,
    BillingAmount,
    RoomNumber,
    AdmissionType,
    DischargeDate,
    Medication,
    TestResults,
}

impl SourceColumn {
    pub const ALL: [SourceColumn; 15] = [
        SourceColumn::Name,
        SourceColumn::Age,
        SourceColumn::Gender,
        SourceColumn::BloodType,
        SourceColumn::MedicalCondition,
        SourceColumn::DateOfAdmission,
        SourceColumn::Doctor,
        SourceColumn::Hospital,
        SourceColumn::InsuranceProvider,
        SourceColumn::BillingAmount,
        SourceColumn::RoomNumber,
        SourceColumn::AdmissionType,
        SourceColumn::DischargeDate,
        SourceColumn::Medication,
        SourceColumn::TestResults,
    ];

    /// Exact, case-sensitive header text in the source file.
    pub const fn header(self) -> &'static str {
        match self {
            SourceColumn::Name => "Name",
            SourceColumn::Age => "Age",
            SourceColumn::Gender => "Gender",
            SourceColumn::BloodType => "Blood Type",
            SourceColumn::MedicalCondition => "Medical Condition",
            SourceColumn::DateOfAdmission => "Date of Admission",
            SourceColumn::Doctor => "Doctor",
            SourceColumn::Hospital => "Hospital",
            SourceColumn::InsuranceProvider => "Insurance Provider",
            SourceColumn::BillingAmount => "Billing Amount",
            SourceColumn::RoomNumber => "Room Number",
            SourceColumn::AdmissionType => "Admission Type",
            SourceColumn::DischargeDate => "Discharge Date",
            SourceColumn::Medication => "Medication",
            SourceColumn::TestResults => "Test Results",
        }
    }

    /// Field name used in the persisted document.
    pub const fn document_field(self) -> &'static str {
        match self {
            SourceColumn::Name => "name",
            SourceColumn::Age => "age",
            SourceColumn::Gender => "gender",
            SourceColumn::BloodType => "blood_type",
            SourceColumn::MedicalCondition => "medical_condition",
            SourceColumn::DateOfAdmission => "date_of_admission",
            SourceColumn::Doctor => "doctor",
            SourceColumn::Hospital => "hospital",
            SourceColumn::InsuranceProvider => "insurance_provider",
            SourceColumn::BillingAmount => "billing_amount",
            SourceColumn::RoomNumber => "room_number",
            SourceColumn::AdmissionType => "admission_type",
            SourceColumn::DischargeDate => "discharge_date",
            SourceColumn::Medication => "medication",
            SourceColumn::TestResults => "test_results",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SourceColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// One untyped input row, keyed by source column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    values: [Option<String>; 15],
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: SourceColumn) -> Option<&str> {
        self.values[column.index()].as_deref()
    }

    pub fn set(&mut self, column: SourceColumn, value: impl Into<String>) {
        self.values[column.index()] = Some(value.into());
    }

    pub fn with(mut self, column: SourceColumn, value: impl Into<String>) -> Self {
        self.set(column, value);
        self
    }
}

/// Why a cell could not be coerced into its target type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub raw: String,
    pub expected: &'static str,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, got {:?}", self.expected, self.raw)
    }
}

/// Normalized field: either a value, a plain absence, or an absence caused by
/// an unparseable cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Field<T> {
    pub value: Option<T>,
    pub issue: Option<FieldIssue>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            issue: None,
        }
    }

    pub fn present(value: T) -> Self {
        Self {
            value: Some(value),
            issue: None,
        }
    }

    pub fn unparseable(raw: impl Into<String>, expected: &'static str) -> Self {
        Self {
            value: None,
            issue: Some(FieldIssue {
                raw: raw.into(),
                expected,
            }),
        }
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T: Clone> Field<T> {
    pub fn cloned(&self) -> Option<T> {
        self.value.clone()
    }
}

/// Typed, cleaned admission row. Timestamps are assigned at write time, not here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdmissionRecord {
    pub name: Field<String>,
    pub age: Field<i64>,
    pub gender: Field<String>,
    pub blood_type: Field<String>,
    pub medical_condition: Field<String>,
    pub date_of_admission: Field<NaiveDateTime>,
    pub doctor: Field<String>,
    pub hospital: Field<String>,
    pub insurance_provider: Field<String>,
    pub billing_amount: Field<f64>,
    pub room_number: Field<String>,
    pub admission_type: Field<String>,
    pub discharge_date: Field<NaiveDateTime>,
    pub medication: Field<String>,
    pub test_results: Field<String>,
}

impl AdmissionRecord {
    /// Cells that were present but could not be coerced.
    pub fn issues(&self) -> Vec<(SourceColumn, &FieldIssue)> {
        let candidates = [
            (SourceColumn::Age, self.age.issue.as_ref()),
            (SourceColumn::DateOfAdmission, self.date_of_admission.issue.as_ref()),
            (SourceColumn::BillingAmount, self.billing_amount.issue.as_ref()),
            (SourceColumn::DischargeDate, self.discharge_date.issue.as_ref()),
        ];
        candidates
            .into_iter()
            .filter_map(|(column, issue)| issue.map(|issue| (column, issue)))
            .collect()
    }
}

/// The five normalized values that identify one admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub name: String,
    pub gender: String,
    pub blood_type: String,
    pub date_of_admission: NaiveDateTime,
    pub hospital: String,
}

impl NaturalKey {
    pub const FIELDS: [SourceColumn; 5] = [
        SourceColumn::Name,
        SourceColumn::Gender,
        SourceColumn::BloodType,
        SourceColumn::DateOfAdmission,
        SourceColumn::Hospital,
    ];

    /// Key components rendered exactly as they appear in a stored document,
    /// in `FIELDS` order.
    pub fn document_values(&self) -> [String; 5] {
        [
            self.name.clone(),
            self.gender.clone(),
            self.blood_type.clone(),
            format_document_date(&self.date_of_admission),
            self.hospital.clone(),
        ]
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.name,
            self.gender,
            self.blood_type,
            self.date_of_admission.date(),
            self.hospital
        )
    }
}

/// Stored dates are always midnight, so the fractional part never appears.
pub fn format_document_date(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Persisted document shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDocument {
    pub name: String,
    pub age: Option<i64>,
    pub gender: String,
    pub blood_type: String,
    pub medical_condition: Option<String>,
    #[serde(with = "document_date")]
    pub date_of_admission: NaiveDateTime,
    pub doctor: Option<String>,
    pub hospital: String,
    pub insurance_provider: Option<String>,
    pub billing_amount: Option<f64>,
    pub room_number: Option<String>,
    pub admission_type: Option<String>,
    #[serde(with = "document_date::option")]
    pub discharge_date: Option<NaiveDateTime>,
    pub medication: Option<String>,
    pub test_results: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub source: String,
}

impl AdmissionDocument {
    /// Build the document for a record whose key is complete. Both timestamps
    /// start at `now`; stores keep the original `ingested_at` on update.
    pub fn new(record: &AdmissionRecord, key: &NaturalKey, now: DateTime<Utc>) -> Self {
        Self {
            name: key.name.clone(),
            age: record.age.cloned(),
            gender: key.gender.clone(),
            blood_type: key.blood_type.clone(),
            medical_condition: record.medical_condition.cloned(),
            date_of_admission: key.date_of_admission,
            doctor: record.doctor.cloned(),
            hospital: key.hospital.clone(),
            insurance_provider: record.insurance_provider.cloned(),
            billing_amount: record.billing_amount.cloned(),
            room_number: record.room_number.cloned(),
            admission_type: record.admission_type.cloned(),
            discharge_date: record.discharge_date.cloned(),
            medication: record.medication.cloned(),
            test_results: record.test_results.cloned(),
            ingested_at: now,
            last_modified_at: now,
            source: SOURCE_TAG.to_string(),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            name: self.name.clone(),
            gender: self.gender.clone(),
            blood_type: self.blood_type.clone(),
            date_of_admission: self.date_of_admission,
            hospital: self.hospital.clone(),
        }
    }
}

mod document_date {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_document_date(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<NaiveDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            let text = Option::<String>::deserialize(deserializer)?;
            text.map(|text| {
                NaiveDateTime::parse_from_str(&text, super::FORMAT).map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

/// Run-scoped tallies. Only the first four appear in the audit line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_rows: u64,
    pub duplicates_in_csv: u64,
    pub missing_key_rows: u64,
    pub upserted_or_modified: u64,
    pub conflicts: u64,
    pub failed_writes: u64,
}

impl RunCounters {
    /// Rows that reached the writer (or would have, in a dry run).
    pub fn write_attempts(&self) -> u64 {
        self.total_rows - self.missing_key_rows
    }
}
