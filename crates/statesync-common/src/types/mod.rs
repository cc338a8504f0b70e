//! Record model shared by the scanner and the reconciliation side
//!
//! On the wire a [`Batch`] is a bare JSON array of records:
//!
//! ```json
//! [{"ModuleCategoryID":"M1","ModuleState":"Online"}]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RecordError, Result};

/// Operational state of a monitored module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    Online,
    Run,
    NotReady,
    Offline,
}

impl ModuleState {
    /// Every state, in declaration order
    pub const ALL: [ModuleState; 4] = [
        ModuleState::Online,
        ModuleState::Run,
        ModuleState::NotReady,
        ModuleState::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Online => "Online",
            ModuleState::Run => "Run",
            ModuleState::NotReady => "NotReady",
            ModuleState::Offline => "Offline",
        }
    }
}

impl FromStr for ModuleState {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        ModuleState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| RecordError::UnknownState(trimmed.to_string()))
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized state of one monitored entity
///
/// The category key is the store's natural key. It is never empty: both
/// [`StateRecord::new`] and wire decoding reject blank keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireRecord")]
pub struct StateRecord {
    #[serde(rename = "ModuleCategoryID")]
    category_key: String,
    #[serde(rename = "ModuleState")]
    state: ModuleState,
}

impl StateRecord {
    /// Build a record, trimming the key and rejecting it if blank
    pub fn new(category_key: impl Into<String>, state: ModuleState) -> Result<Self> {
        let category_key = category_key.into().trim().to_string();
        if category_key.is_empty() {
            return Err(RecordError::EmptyCategoryKey);
        }
        Ok(Self {
            category_key,
            state,
        })
    }

    pub fn category_key(&self) -> &str {
        &self.category_key
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }
}

/// Unvalidated wire shape, converted through [`StateRecord::new`]
#[derive(Deserialize)]
struct WireRecord {
    #[serde(rename = "ModuleCategoryID")]
    category_key: String,
    #[serde(rename = "ModuleState")]
    state: ModuleState,
}

impl TryFrom<WireRecord> for StateRecord {
    type Error = RecordError;

    fn try_from(wire: WireRecord) -> Result<Self> {
        StateRecord::new(wire.category_key, wire.state)
    }
}

/// Records parsed from one source file, transmitted as one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    records: Vec<StateRecord>,
}

impl Batch {
    pub fn new(records: Vec<StateRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[StateRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<StateRecord> {
        self.records
    }

    /// Encode as a UTF-8 JSON array
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.records)?)
    }

    /// Decode a UTF-8 JSON array, validating every record
    pub fn from_json_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

impl FromIterator<StateRecord> for Batch {
    fn from_iter<I: IntoIterator<Item = StateRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Batch {
    type Item = StateRecord;
    type IntoIter = std::vec::IntoIter<StateRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a StateRecord;
    type IntoIter = std::slice::Iter<'a, StateRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_module_state_from_str() {
        assert_eq!("Online".parse::<ModuleState>().unwrap(), ModuleState::Online);
        assert_eq!("run".parse::<ModuleState>().unwrap(), ModuleState::Run);
        assert_eq!(" NotReady ".parse::<ModuleState>().unwrap(), ModuleState::NotReady);
        assert_eq!("OFFLINE".parse::<ModuleState>().unwrap(), ModuleState::Offline);
        assert!(matches!(
            "Broken".parse::<ModuleState>(),
            Err(RecordError::UnknownState(s)) if s == "Broken"
        ));
    }

    #[test]
    fn test_record_rejects_blank_key() {
        assert!(matches!(
            StateRecord::new("   ", ModuleState::Run),
            Err(RecordError::EmptyCategoryKey)
        ));
        let record = StateRecord::new(" M1 ", ModuleState::Run).unwrap();
        assert_eq!(record.category_key(), "M1");
    }

    #[test]
    fn test_batch_wire_format() {
        let batch = Batch::new(vec![
            StateRecord::new("M1", ModuleState::Online).unwrap(),
            StateRecord::new("M2", ModuleState::NotReady).unwrap(),
        ]);

        let body = String::from_utf8(batch.to_json_bytes().unwrap()).unwrap();
        assert_eq!(
            body,
            r#"[{"ModuleCategoryID":"M1","ModuleState":"Online"},{"ModuleCategoryID":"M2","ModuleState":"NotReady"}]"#
        );
        assert_eq!(Batch::from_json_slice(body.as_bytes()).unwrap(), batch);
    }

    #[test]
    fn test_batch_decode_rejects_invalid_records() {
        let empty_key = br#"[{"ModuleCategoryID":"","ModuleState":"Run"}]"#;
        assert!(Batch::from_json_slice(empty_key).is_err());

        let bad_state = br#"[{"ModuleCategoryID":"M1","ModuleState":"Exploded"}]"#;
        assert!(Batch::from_json_slice(bad_state).is_err());

        let not_an_array = br#"{"ModuleCategoryID":"M1","ModuleState":"Run"}"#;
        assert!(Batch::from_json_slice(not_an_array).is_err());
    }

    #[test]
    fn test_empty_batch_round_trips_as_empty_array() {
        let batch = Batch::default();
        assert_eq!(batch.to_json_bytes().unwrap(), b"[]");
        assert!(Batch::from_json_slice(b"[]").unwrap().is_empty());
    }
}
