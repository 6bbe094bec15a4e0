// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinning of the key that signed the guest's launch measurement, with
//! Microsoft Azure Attestation as fallback authority.

use crate::https::{HttpError, HttpsGetter};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const ID_KEY_DIGEST_LENGTH: usize = 48;

#[derive(Error, Debug)]
pub enum IdKeyError {
    #[error("id key digest {0} is not accepted")]
    NotAccepted(String),
    #[error("fetching MAA signing keys failed")]
    Http(#[from] HttpError),
    #[error("MAA token invalid: {0}")]
    Token(String),
    #[error("MAA token nonce does not match")]
    Nonce,
}

impl From<jsonwebtoken::errors::Error> for IdKeyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        IdKeyError::Token(err.to_string())
    }
}

/// Accepted id key digests, written as hex strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdKeyDigests(Vec<Vec<u8>>);

impl IdKeyDigests {
    pub fn new(digests: Vec<Vec<u8>>) -> Self {
        Self(digests)
    }

    pub fn contains(&self, digest: &[u8]) -> bool {
        self.0.iter().any(|d| d == digest)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for IdKeyDigests {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let hex: Vec<String> = self.0.iter().map(hex::encode).collect();
        hex.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IdKeyDigests {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        let mut digests = Vec::with_capacity(encoded.len());
        for digest in encoded {
            let bytes = hex::decode(&digest).map_err(D::Error::custom)?;
            if bytes.len() != ID_KEY_DIGEST_LENGTH {
                return Err(D::Error::custom(format!(
                    "id key digest {digest} has length {}, expected {ID_KEY_DIGEST_LENGTH}",
                    bytes.len()
                )));
            }
            digests.push(bytes);
        }
        Ok(Self(digests))
    }
}

/// What to do when a report's id key digest is not in the accepted list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Enforcement {
    /// Reject the report.
    Equal,
    /// Accept if MAA vouches for the report.
    #[default]
    MaaFallback,
    /// Accept and log.
    WarnOnly,
}

impl Serialize for Enforcement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let name = match self {
            Enforcement::Equal => "Equal",
            Enforcement::MaaFallback => "MAAFallback",
            Enforcement::WarnOnly => "WarnOnly",
        };
        serializer.serialize_str(name)
    }
}

impl<'de> Deserialize<'de> for Enforcement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Legacy(bool),
            Name(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Legacy(true) => Ok(Enforcement::Equal),
            Repr::Legacy(false) => Ok(Enforcement::WarnOnly),
            Repr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "equal" | "strictchecking" => Ok(Enforcement::Equal),
                "maafallback" => Ok(Enforcement::MaaFallback),
                "warnonly" => Ok(Enforcement::WarnOnly),
                _ => Err(D::Error::custom(format!(
                    "unknown id key enforcement policy {name:?}"
                ))),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareSignerConfig {
    #[serde(rename = "acceptedKeyDigests", default)]
    pub accepted_key_digests: IdKeyDigests,
    #[serde(rename = "enforcementPolicy", default)]
    pub enforcement_policy: Enforcement,
    #[serde(rename = "maaURL", default)]
    pub maa_url: String,
}

/// Checks MAA tokens against the signing keys the service publishes.
pub struct MaaValidator<'a> {
    getter: &'a dyn HttpsGetter,
    maa_url: &'a str,
}

impl<'a> MaaValidator<'a> {
    pub fn new(getter: &'a dyn HttpsGetter, maa_url: &'a str) -> Self {
        Self { getter, maa_url }
    }

    /// Verify `token` and that it was requested with `extra_data` as nonce.
    pub fn validate_token(&self, token: &str, extra_data: &[u8]) -> Result<(), IdKeyError> {
        let url = format!("{}/certs", self.maa_url.trim_end_matches('/'));
        let jwks: JwkSet = serde_json::from_slice(&self.getter.get(&url, &[])?)
            .map_err(|e| IdKeyError::Token(format!("parsing key set: {e}")))?;

        let header = jsonwebtoken::decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| IdKeyError::Token("token has no kid header".into()))?;
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| IdKeyError::Token(format!("no key {kid} in MAA key set")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let token = jsonwebtoken::decode::<serde_json::Value>(
            token,
            &DecodingKey::from_jwk(jwk)?,
            &validation,
        )?;

        let nonce = token
            .claims
            .pointer("/x-ms-runtime/client-payload/nonce")
            .and_then(|n| n.as_str())
            .ok_or_else(|| IdKeyError::Token("token carries no nonce claim".into()))?;
        if nonce != STANDARD.encode(extra_data) {
            return Err(IdKeyError::Nonce);
        }
        Ok(())
    }
}

/// Apply the firmware signer policy to a report's id key digest.
pub fn check_id_key(
    config: &FirmwareSignerConfig,
    digest: &[u8],
    maa_token: &str,
    extra_data: &[u8],
    getter: &dyn HttpsGetter,
) -> Result<(), IdKeyError> {
    if config.accepted_key_digests.contains(digest) {
        return Ok(());
    }
    let digest = hex::encode(digest);
    match config.enforcement_policy {
        Enforcement::Equal => Err(IdKeyError::NotAccepted(digest)),
        Enforcement::WarnOnly => {
            log::warn!("id key digest {digest} is not accepted, continuing because of WarnOnly policy");
            Ok(())
        }
        Enforcement::MaaFallback => {
            log::info!("id key digest {digest} is not accepted, falling back to MAA");
            if maa_token.is_empty() {
                return Err(IdKeyError::NotAccepted(digest));
            }
            MaaValidator::new(getter, &config.maa_url).validate_token(maa_token, extra_data)
        }
    }
}

#[cfg(any(test, feature = "simulator"))]
pub mod testutil {
    //! A stand-in attestation service signing tokens with a local key.

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use jsonwebtoken::{EncodingKey, Header};
    use openssl::rsa::Rsa;

    pub const MAA_URL: &str = "https://maa.test";
    const KID: &str = "test-signing-key";

    pub struct TestMaa {
        key: Rsa<openssl::pkey::Private>,
    }

    impl Default for TestMaa {
        fn default() -> Self {
            Self {
                key: Rsa::generate(2048).unwrap(),
            }
        }
    }

    impl TestMaa {
        pub fn certs(&self) -> Vec<u8> {
            serde_json::to_vec(&serde_json::json!({
                "keys": [{
                    "kty": "RSA",
                    "kid": KID,
                    "n": base64_url::encode(&self.key.n().to_vec()),
                    "e": base64_url::encode(&self.key.e().to_vec()),
                }]
            }))
            .unwrap()
        }

        pub fn token(&self, extra_data: &[u8]) -> String {
            let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
            header.kid = Some(KID.into());
            let exp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + 3600;
            let claims = serde_json::json!({
                "exp": exp,
                "x-ms-runtime": {
                    "client-payload": { "nonce": STANDARD.encode(extra_data) }
                }
            });
            let pem = self.key.private_key_to_pem().unwrap();
            jsonwebtoken::encode(&header, &claims, &EncodingKey::from_rsa_pem(&pem).unwrap())
                .unwrap()
        }
    }
}
