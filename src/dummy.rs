// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unattested documents for tests and local development.

use crate::document::base64_bytes;
use crate::error::{Error, Result};
use crate::variant::Variant;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DummyDocument {
    #[serde(with = "base64_bytes", default)]
    pub user_data: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub nonce: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Issuer;

impl crate::Issuer for Issuer {
    fn variant(&self) -> Variant {
        Variant::Dummy
    }

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let doc = DummyDocument {
            user_data: user_data.to_vec(),
            nonce: nonce.to_vec(),
        };
        Ok(serde_json::to_vec(&doc)?)
    }
}

/// Accepts any document that echoes the expected nonce.
#[derive(Clone, Copy, Debug, Default)]
pub struct Validator;

impl crate::Validator for Validator {
    fn variant(&self) -> Variant {
        Variant::Dummy
    }

    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let doc: DummyDocument = serde_json::from_slice(document)
            .map_err(|e| Error::malformed("dummy document", e))?;
        if doc.nonce != nonce {
            return Err(Error::BindingMismatch(format!(
                "invalid nonce: expected {}, got {}",
                hex::encode(nonce),
                hex::encode(&doc.nonce)
            )));
        }
        Ok(doc.user_data)
    }
}
