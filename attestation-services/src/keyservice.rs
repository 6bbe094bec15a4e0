// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Data keys derived from the cluster master secret.

use cvm_attestation::keys::{derive_key, KeyError, Secret};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Data key id of the measurement secret.
pub const MEASUREMENT_SECRET_CONTEXT: &str = "measurementSecret";
pub const STATE_DISK_KEY_LENGTH: usize = 32;
const DATA_KEY_INFO_PREFIX: &str = "key-";

#[derive(Error, Debug)]
pub enum KeyServiceError {
    #[error("reading master secret {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing master secret: {0}")]
    Json(#[from] serde_json::Error),
    #[error("master secret is empty")]
    Empty,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Source of data keys identified by name.
pub trait DataKeyGetter: Send + Sync {
    fn get_data_key(&self, data_key_id: &str, length: usize) -> Result<Secret, KeyServiceError>;
}

/// Cluster master secret and salt, as written at cluster creation:
/// `{"key": "<base64>", "salt": "<base64>"}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MasterSecret {
    key: Secret,
    salt: Secret,
}

impl MasterSecret {
    pub fn new(key: Secret, salt: Secret) -> Result<Self, KeyServiceError> {
        if key.is_empty() {
            return Err(KeyServiceError::Empty);
        }
        Ok(Self { key, salt })
    }

    pub fn from_json(json: &[u8]) -> Result<Self, KeyServiceError> {
        let Self { key, salt } = serde_json::from_slice(json)?;
        Self::new(key, salt)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KeyServiceError> {
        let path = path.as_ref();
        let json = zeroize::Zeroizing::new(fs::read(path).map_err(|source| KeyServiceError::Io {
            path: path.display().to_string(),
            source,
        })?);
        Self::from_json(&json)
    }
}

impl DataKeyGetter for MasterSecret {
    fn get_data_key(&self, data_key_id: &str, length: usize) -> Result<Secret, KeyServiceError> {
        let info = format!("{DATA_KEY_INFO_PREFIX}{data_key_id}");
        Ok(derive_key(
            self.key.as_bytes(),
            self.salt.as_bytes(),
            info.as_bytes(),
            length,
        )?)
    }
}
