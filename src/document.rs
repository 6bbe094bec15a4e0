// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::error::{Error, Result};
use crate::vtpm::Quote;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Serde adapter writing byte fields as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// TPM part of a document: the AK public area, quotes over the PCR banks and
/// the measured boot event log.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TpmAttestation {
    /// Marshalled `TPMT_PUBLIC` of the attestation key.
    #[serde(with = "base64_bytes")]
    pub ak_pub: Vec<u8>,
    pub quotes: Vec<Quote>,
    #[serde(with = "base64_bytes", default)]
    pub event_log: Vec<u8>,
}

/// Wire record exchanged between issuer and validator.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AttestationDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<TpmAttestation>,
    #[serde(with = "base64_bytes", default)]
    pub instance_info: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub user_data: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub user_data_signature: Vec<u8>,
}

impl AttestationDocument {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::malformed("attestation document", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        Ok(bytes)
    }

    /// The TPM attestation, required by every TPM based variant.
    pub fn tpm(&self) -> Result<&TpmAttestation> {
        self.attestation
            .as_ref()
            .ok_or_else(|| Error::MalformedDocument("document carries no TPM attestation".into()))
    }
}

/// Binds user data to a nonce: `SHA-256(user_data || nonce)`.
pub fn extra_data(user_data: &[u8], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(user_data);
    hasher.update(nonce);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage() {
        let err = AttestationDocument::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));

        let err = AttestationDocument::from_bytes(br#"{"user_data": "%%%"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
    }

    #[test]
    fn byte_fields_are_base64() {
        let doc = AttestationDocument {
            user_data: b"Constellation".to_vec(),
            ..Default::default()
        };
        let json = String::from_utf8(doc.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"user_data\":\"Q29uc3RlbGxhdGlvbg==\""));
        assert!(!json.contains("attestation\""));

        let decoded = AttestationDocument::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(decoded, doc);
        assert!(decoded.tpm().is_err());
    }

    #[test]
    fn extra_data_depends_on_both_inputs() {
        let a = extra_data(b"user", &[1, 2, 3]);
        assert_eq!(a, extra_data(b"user", &[1, 2, 3]));
        assert_ne!(a, extra_data(b"user", &[1, 2, 4]));
        assert_ne!(a, extra_data(b"usex", &[1, 2, 3]));
    }
}
