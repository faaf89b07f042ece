use std::collections::HashMap;

use medload_core::{AdmissionRecord, NaturalKey, SourceColumn};

/// Outcome of deriving the natural key for one normalized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDerivation {
    Complete(NaturalKey),
    Incomplete { missing: Vec<SourceColumn> },
}

impl KeyDerivation {
    pub fn is_complete(&self) -> bool {
        matches!(self, KeyDerivation::Complete(_))
    }

    pub fn key(&self) -> Option<&NaturalKey> {
        match self {
            KeyDerivation::Complete(key) => Some(key),
            KeyDerivation::Incomplete { .. } => None,
        }
    }
}

/// Components are taken as-is: the normalizer already lowercased the text
/// fields and truncated the admission date to midnight.
pub fn derive_key(record: &AdmissionRecord) -> KeyDerivation {
    let present = |field: &medload_core::Field<String>| field.get().filter(|v| !v.is_empty()).cloned();

    let name = present(&record.name);
    let gender = present(&record.gender);
    let blood_type = present(&record.blood_type);
    let date_of_admission = record.date_of_admission.cloned();
    let hospital = present(&record.hospital);

    match (name, gender, blood_type, date_of_admission, hospital) {
        (Some(name), Some(gender), Some(blood_type), Some(date_of_admission), Some(hospital)) => {
            KeyDerivation::Complete(NaturalKey {
                name,
                gender,
                blood_type,
                date_of_admission,
                hospital,
            })
        }
        (name, gender, blood_type, date_of_admission, hospital) => {
            let flags = [
                name.is_none(),
                gender.is_none(),
                blood_type.is_none(),
                date_of_admission.is_none(),
                hospital.is_none(),
            ];
            let missing = NaturalKey::FIELDS
                .into_iter()
                .zip(flags)
                .filter_map(|(column, absent)| absent.then_some(column))
                .collect();
            KeyDerivation::Incomplete { missing }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    occurrences: u64,
    written: bool,
}

/// Natural keys seen so far in one run. Cross-run repeats are the store's
/// business; this only flags repeats inside the current input.
#[derive(Debug, Default)]
pub struct DedupTracker {
    seen: HashMap<NaturalKey, KeyState>,
}

impl DedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`; returns `true` when it was already seen in this run.
    pub fn observe(&mut self, key: &NaturalKey) -> bool {
        let state = self.seen.entry(key.clone()).or_default();
        state.occurrences += 1;
        state.occurrences > 1
    }

    /// Record a successful write; returns `true` only for the first one per key.
    pub fn mark_written(&mut self, key: &NaturalKey) -> bool {
        let state = self.seen.entry(key.clone()).or_default();
        !std::mem::replace(&mut state.written, true)
    }

    pub fn distinct_keys(&self) -> usize {
        self.seen.len()
    }

    pub fn occurrences(&self, key: &NaturalKey) -> u64 {
        self.seen.get(key).map_or(0, |state| state.occurrences)
    }
}
