// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Node state persisted on the state disk at cluster join.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Node state relative to the mounted state disk.
pub const NODE_STATE_PATH: &str = "constellation/node_state.json";
pub const MEASUREMENT_SALT_LENGTH: usize = 32;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("reading node state {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing node state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing state information to retaint node: measurement salt has {0} bytes")]
    SaltLength(usize),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    ControlPlane,
    Worker,
    Admin,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::ControlPlane => "ControlPlane",
            Role::Worker => "Worker",
            Role::Admin => "Admin",
            Role::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeState {
    #[serde(default)]
    pub role: Role,
    #[serde(with = "salt")]
    pub measurement_salt: [u8; MEASUREMENT_SALT_LENGTH],
}

mod salt {
    use super::*;

    pub fn serialize<S: Serializer>(salt: &[u8; MEASUREMENT_SALT_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(salt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; MEASUREMENT_SALT_LENGTH], D::Error> {
        let bytes = STANDARD
            .decode(Option::<String>::deserialize(d)?.unwrap_or_default())
            .map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(StateError::SaltLength(len)))
    }
}

impl NodeState {
    pub fn from_json(json: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let json = fs::read(path).map_err(|source| StateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_node_state() {
        let salt = STANDARD.encode([0x42; 32]);
        let json = format!(r#"{{"Role": "ControlPlane", "MeasurementSalt": "{salt}"}}"#);
        let state = NodeState::from_json(json.as_bytes()).unwrap();
        assert_eq!(state.role, Role::ControlPlane);
        assert_eq!(state.measurement_salt, [0x42; 32]);

        let again = NodeState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(again, state);
    }

    #[test]
    fn salt_length_is_strict() {
        for len in [0, 16, 31, 33] {
            let salt = STANDARD.encode(vec![1u8; len]);
            let json = format!(r#"{{"Role": "Worker", "MeasurementSalt": "{salt}"}}"#);
            assert!(NodeState::from_json(json.as_bytes()).is_err(), "{len} byte salt");
        }
        assert!(NodeState::from_json(br#"{"Role": "Worker"}"#).is_err());
    }

    #[test]
    fn unknown_role() {
        let salt = STANDARD.encode([0u8; 32]);
        let json = format!(r#"{{"Role": "Operator", "MeasurementSalt": "{salt}"}}"#);
        assert_eq!(NodeState::from_json(json.as_bytes()).unwrap().role, Role::Unknown);
    }
}
