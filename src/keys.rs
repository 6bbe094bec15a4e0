// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! HKDF-SHA256 derivations from the cluster master secret.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const DEFAULT_KEY_LENGTH: usize = 32;
pub const MEASUREMENT_SECRET_INFO: &str = "key-measurementSecret";
pub const CLUSTER_ID_INFO: &str = "key-clusterID";
const DISK_KEY_INFO_PREFIX: &str = "key-";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("cannot derive {0} bytes with HKDF-SHA256")]
    Length(usize),
    #[error("expected a {expected} byte secret, got {got}")]
    SecretLength { expected: usize, got: usize },
}

/// Key material that is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Require exactly `len` bytes.
    pub fn with_length(bytes: impl Into<Vec<u8>>, len: usize) -> Result<Self, KeyError> {
        let secret = Self::new(bytes);
        if secret.len() != len {
            return Err(KeyError::SecretLength {
                expected: len,
                got: secret.len(),
            });
        }
        Ok(secret)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Secret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.0.len())
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Zeroizing::new(STANDARD.encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        STANDARD
            .decode(encoded.as_bytes())
            .map(Secret)
            .map_err(serde::de::Error::custom)
    }
}

/// HKDF-SHA256 of `secret` with `salt` and context `info`.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Secret, KeyError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = vec![0u8; length];
    hkdf.expand(info, &mut key)
        .map_err(|_| KeyError::Length(length))?;
    Ok(Secret(key))
}

/// Secret known to every node allowed to join the cluster.
pub fn derive_measurement_secret(master_secret: &[u8], salt: &[u8]) -> Result<Secret, KeyError> {
    derive_key(
        master_secret,
        salt,
        MEASUREMENT_SECRET_INFO.as_bytes(),
        DEFAULT_KEY_LENGTH,
    )
}

/// Cluster id a bootstrapped node extends into its marker register.
pub fn derive_cluster_id(measurement_secret: &[u8], measurement_salt: &[u8]) -> Result<Secret, KeyError> {
    derive_key(
        measurement_secret,
        measurement_salt,
        CLUSTER_ID_INFO.as_bytes(),
        DEFAULT_KEY_LENGTH,
    )
}

/// State disk passphrase of the disk with the given LUKS UUID.
pub fn derive_disk_key(master_secret: &[u8], salt: &[u8], disk_uuid: &str) -> Result<Secret, KeyError> {
    let info = format!("{DISK_KEY_INFO_PREFIX}{}", disk_uuid.to_ascii_lowercase());
    derive_key(master_secret, salt, info.as_bytes(), DEFAULT_KEY_LENGTH)
}
