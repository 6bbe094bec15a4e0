// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

/// Length of a SHA-256 PCR value.
pub const PCR_MEASUREMENT_LENGTH: usize = 32;
/// Length of a TDX MRTD/RTMR value.
pub const TDX_MEASUREMENT_LENGTH: usize = 48;
/// PCR extended with the cluster id once a node is bootstrapped.
pub const PCR_INDEX_CLUSTER_ID: u32 = 12;
/// RTMR extended with the cluster id on TDX nodes.
pub const RTMR_INDEX_CLUSTER_ID: u32 = 2;

#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("invalid measurement at index {0}: not hex or base64")]
    Encoding(u32),
    #[error("invalid measurement at index {index}: invalid length {len}")]
    Length { index: u32, len: usize },
    #[error("inconsistent measurement length at index {index}: expected {expected}, got {got}")]
    Inconsistent {
        index: u32,
        expected: usize,
        got: usize,
    },
    #[error("index {0} is not part of the measurements")]
    UnknownIndex(u32),
    #[error("json error")]
    Json(#[from] serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Enforcement {
    Enforce,
    WarnOnly,
}

/// Expected value of a single PCR, RTMR or MRTD.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub expected: Vec<u8>,
    pub enforcement: Enforcement,
}

impl Measurement {
    pub fn new(expected: Vec<u8>, enforcement: Enforcement) -> Self {
        Self {
            expected,
            enforcement,
        }
    }

    /// A measurement where every one of `len` bytes is `b`.
    pub fn with_all_bytes(b: u8, enforcement: Enforcement, len: usize) -> Self {
        Self::new(vec![b; len], enforcement)
    }

    pub fn is_enforced(&self) -> bool {
        self.enforcement == Enforcement::Enforce
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedMeasurement {
    expected: String,
    #[serde(rename = "warnOnly", default)]
    warn_only: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MeasurementRepr {
    Encoded(EncodedMeasurement),
    Legacy(String),
}

fn decode_expected(value: &str) -> Option<Vec<u8>> {
    hex::decode(value)
        .ok()
        .or_else(|| STANDARD.decode(value).ok())
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EncodedMeasurement {
            expected: hex::encode(&self.expected),
            warn_only: self.enforcement == Enforcement::WarnOnly,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Measurement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (expected, warn_only) = match MeasurementRepr::deserialize(deserializer)? {
            MeasurementRepr::Encoded(e) => (e.expected, e.warn_only),
            // legacy files carry the value alone and imply enforcement
            MeasurementRepr::Legacy(expected) => (expected, false),
        };
        let expected = decode_expected(&expected)
            .ok_or_else(|| D::Error::custom("measurement is neither hex nor base64"))?;
        if expected.len() != PCR_MEASUREMENT_LENGTH && expected.len() != TDX_MEASUREMENT_LENGTH {
            return Err(D::Error::custom(format!(
                "invalid measurement length {}",
                expected.len()
            )));
        }
        let enforcement = if warn_only {
            Enforcement::WarnOnly
        } else {
            Enforcement::Enforce
        };
        Ok(Measurement::new(expected, enforcement))
    }
}

/// Expected measurements keyed by register index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MeasurementSet(BTreeMap<u32, Measurement>);

impl<'de> Deserialize<'de> for MeasurementSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let inner = BTreeMap::<u32, Measurement>::deserialize(deserializer)?;
        let set = MeasurementSet(inner);
        set.check_consistent().map_err(D::Error::custom)?;
        Ok(set)
    }
}

impl FromIterator<(u32, Measurement)> for MeasurementSet {
    fn from_iter<T: IntoIterator<Item = (u32, Measurement)>>(iter: T) -> Self {
        MeasurementSet(iter.into_iter().collect())
    }
}

impl MeasurementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON wire form, rejecting records whose digest length is not
    /// `expected_len`.
    pub fn load(json: &[u8], expected_len: usize) -> Result<Self, MeasurementError> {
        let set: MeasurementSet = serde_json::from_slice(json)?;
        set.check_length(expected_len)?;
        Ok(set)
    }

    pub fn save(&self) -> Result<Vec<u8>, MeasurementError> {
        let json = serde_json::to_vec_pretty(self)?;
        Ok(json)
    }

    pub fn insert(&mut self, index: u32, measurement: Measurement) -> Option<Measurement> {
        self.0.insert(index, measurement)
    }

    pub fn get(&self, index: u32) -> Option<&Measurement> {
        self.0.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Measurement)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every record must be exactly `len` bytes long.
    pub fn check_length(&self, len: usize) -> Result<(), MeasurementError> {
        for (index, m) in self.0.iter() {
            if m.expected.len() != len {
                return Err(MeasurementError::Length {
                    index: *index,
                    len: m.expected.len(),
                });
            }
        }
        Ok(())
    }

    fn check_consistent(&self) -> Result<(), MeasurementError> {
        let mut length = None;
        for (index, m) in self.0.iter() {
            match length {
                None => length = Some(m.expected.len()),
                Some(expected) if expected != m.expected.len() => {
                    return Err(MeasurementError::Inconsistent {
                        index: *index,
                        expected,
                        got: m.expected.len(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Compare against observed register values.
    ///
    /// Returns `(warnings, errors)`. An expected index that is absent from
    /// `observed` counts as a mismatch. Observed indices without an
    /// expectation are ignored.
    pub fn compare(&self, observed: &BTreeMap<u32, Vec<u8>>) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for (index, m) in self.0.iter() {
            let msg = match observed.get(index) {
                Some(value) if *value == m.expected => continue,
                Some(value) => format!(
                    "untrusted measurement at index {index}: expected {}, got {}",
                    hex::encode(&m.expected),
                    hex::encode(value)
                ),
                None => format!("measurement at index {index} missing"),
            };
            match m.enforcement {
                Enforcement::WarnOnly => warnings.push(msg),
                Enforcement::Enforce => errors.push(msg),
            }
        }
        (warnings, errors)
    }

    pub fn equal_to(&self, other: &MeasurementSet) -> bool {
        self == other
    }

    /// Overwrite entries with those of `other`, keeping indices only present here.
    pub fn copy_from(&mut self, other: &MeasurementSet) {
        for (index, m) in other.0.iter() {
            self.0.insert(*index, m.clone());
        }
    }

    pub fn enforced_indices(&self) -> Vec<u32> {
        self.0
            .iter()
            .filter(|(_, m)| m.is_enforced())
            .map(|(index, _)| *index)
            .collect()
    }

    /// Enforce exactly the given indices and downgrade all others to warn-only.
    pub fn set_enforced(&mut self, enforced: &[u32]) -> Result<(), MeasurementError> {
        if let Some(index) = enforced.iter().find(|i| !self.0.contains_key(i)) {
            return Err(MeasurementError::UnknownIndex(*index));
        }
        for (index, m) in self.0.iter_mut() {
            m.enforcement = if enforced.contains(index) {
                Enforcement::Enforce
            } else {
                Enforcement::WarnOnly
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(entries: &[(u32, u8)]) -> BTreeMap<u32, Vec<u8>> {
        entries
            .iter()
            .map(|(i, b)| (*i, vec![*b; PCR_MEASUREMENT_LENGTH]))
            .collect()
    }

    #[test]
    fn warn_only_mismatch_is_a_warning() {
        let set: MeasurementSet = [
            (
                0,
                Measurement::with_all_bytes(0x00, Enforcement::Enforce, PCR_MEASUREMENT_LENGTH),
            ),
            (
                2,
                Measurement::with_all_bytes(0x00, Enforcement::WarnOnly, PCR_MEASUREMENT_LENGTH),
            ),
        ]
        .into_iter()
        .collect();

        let (warnings, errors) = set.compare(&observed(&[(0, 0x00), (2, 0x11)]));
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("index 2"));
    }

    #[test]
    fn enforced_mismatch_and_missing_are_errors() {
        let set: MeasurementSet = [
            (
                4,
                Measurement::with_all_bytes(0x01, Enforcement::Enforce, PCR_MEASUREMENT_LENGTH),
            ),
            (
                9,
                Measurement::with_all_bytes(0x01, Enforcement::Enforce, PCR_MEASUREMENT_LENGTH),
            ),
        ]
        .into_iter()
        .collect();

        let (warnings, errors) = set.compare(&observed(&[(4, 0x02), (17, 0x01)]));
        assert!(warnings.is_empty());
        assert_eq!(errors.len(), 2);
        assert!(errors[1].contains("index 9 missing"));
    }

    #[test]
    fn load_accepts_hex_base64_and_legacy() {
        let json = format!(
            r#"{{"0": {{"expected": "{}", "warnOnly": true}}, "1": {{"expected": "{}", "warnOnly": false}}, "2": "{}"}}"#,
            hex::encode([0xaa; 32]),
            STANDARD.encode([0xbb; 32]),
            hex::encode([0xcc; 32]),
        );
        let set = MeasurementSet::load(json.as_bytes(), PCR_MEASUREMENT_LENGTH).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(0).unwrap().enforcement, Enforcement::WarnOnly);
        assert_eq!(set.get(1).unwrap().expected, vec![0xbb; 32]);
        assert_eq!(set.get(2).unwrap().enforcement, Enforcement::Enforce);
    }

    #[test]
    fn load_rejects_wrong_lengths() {
        let json = format!(r#"{{"0": {{"expected": "{}"}}}}"#, hex::encode([0u8; 20]));
        assert!(MeasurementSet::load(json.as_bytes(), PCR_MEASUREMENT_LENGTH).is_err());

        let json = format!(r#"{{"0": {{"expected": "{}"}}}}"#, hex::encode([0u8; 48]));
        let err = MeasurementSet::load(json.as_bytes(), PCR_MEASUREMENT_LENGTH).unwrap_err();
        assert!(matches!(err, MeasurementError::Length { index: 0, len: 48 }));

        let json = format!(
            r#"{{"0": "{}", "1": "{}"}}"#,
            hex::encode([0u8; 32]),
            hex::encode([0u8; 48])
        );
        assert!(serde_json::from_str::<MeasurementSet>(&json).is_err());
    }

    #[test]
    fn save_writes_hex() {
        let mut set = MeasurementSet::new();
        set.insert(
            11,
            Measurement::with_all_bytes(0x00, Enforcement::Enforce, PCR_MEASUREMENT_LENGTH),
        );
        let json = String::from_utf8(set.save().unwrap()).unwrap();
        assert!(json.contains(&hex::encode([0u8; 32])));
        assert!(json.contains("\"warnOnly\": false"));

        let reloaded = MeasurementSet::load(json.as_bytes(), PCR_MEASUREMENT_LENGTH).unwrap();
        assert!(reloaded.equal_to(&set));
    }

    #[test]
    fn set_enforced() {
        let mut set: MeasurementSet = (0..3)
            .map(|i| {
                (
                    i,
                    Measurement::with_all_bytes(0x00, Enforcement::Enforce, PCR_MEASUREMENT_LENGTH),
                )
            })
            .collect();
        set.set_enforced(&[1]).unwrap();
        assert_eq!(set.enforced_indices(), vec![1]);
        assert!(matches!(
            set.set_enforced(&[7]),
            Err(MeasurementError::UnknownIndex(7))
        ));
    }
}
