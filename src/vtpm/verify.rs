// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{Quote, TpmError};
use openssl::bn::BigNum;
use openssl::pkey::{PKey, Public as OpenSslPublic};
use openssl::rsa::Rsa;
use openssl::{hash::MessageDigest, sha::Sha256, sign::Verifier};
use std::collections::BTreeSet;
use thiserror::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{Attest, AttestInfo, Public};
use tss_esapi::traits::UnMarshall;

const DEFAULT_RSA_EXPONENT: u32 = 65537;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("tss error")]
    Tss(#[from] tss_esapi::Error),
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("quote is not signed by key")]
    SignatureMismatch,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("quote error")]
    Quote(#[from] TpmError),
    #[error("pcr selection does not match the delivered values")]
    SelectionMismatch,
    #[error("pcr mismatch")]
    PcrMismatch,
    #[error("attestation key is not an RSA key")]
    NotRsa,
}

/// RSA components of an attestation key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    n: Vec<u8>,
    e: u32,
}

impl PublicKey {
    /// Modulus, big endian.
    pub fn modulus(&self) -> &[u8] {
        &self.n
    }

    pub fn exponent(&self) -> u32 {
        self.e
    }

    pub fn to_pkey(&self) -> Result<PKey<OpenSslPublic>, VerifyError> {
        let n = BigNum::from_slice(&self.n)?;
        let e = BigNum::from_u32(self.e)?;
        let rsa = Rsa::from_public_components(n, e)?;
        Ok(PKey::from_rsa(rsa)?)
    }
}

/// Decode a marshalled `TPMT_PUBLIC` holding an RSA key.
pub fn decode_ak_pub(ak_pub: &[u8]) -> Result<PublicKey, VerifyError> {
    let public = Public::unmarshall(ak_pub)?;
    let Public::Rsa {
        parameters, unique, ..
    } = public
    else {
        return Err(VerifyError::NotRsa);
    };
    let e = match parameters.exponent().value() {
        0 => DEFAULT_RSA_EXPONENT,
        e => e,
    };
    Ok(PublicKey {
        n: unique.value().to_vec(),
        e,
    })
}

impl Quote {
    /// Verify a Quote's signature, nonce and PCR digest
    ///
    /// # Arguments
    ///
    /// * `pub_key` - A public key to verify the Quote's signature
    ///
    /// * `nonce` - A byte slice to verify the Quote's nonce
    pub fn verify(&self, pub_key: &PKey<OpenSslPublic>, nonce: &[u8]) -> Result<(), VerifyError> {
        self.verify_signature(pub_key)?;

        let quote_nonce = &self.nonce()?;
        if nonce != quote_nonce {
            return Err(VerifyError::NonceMismatch);
        }

        self.verify_pcrs()?;

        Ok(())
    }

    pub fn verify_signature(&self, pub_key: &PKey<OpenSslPublic>) -> Result<(), VerifyError> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), pub_key)?;
        verifier.update(&self.message)?;
        let is_verified = verifier.verify(&self.signature)?;
        if !is_verified {
            return Err(VerifyError::SignatureMismatch);
        }
        Ok(())
    }

    /// Verify that the quoted PCR digest matches the digest of the bundled
    /// PCR values, and that the quote selects exactly those PCRs.
    pub fn verify_pcrs(&self) -> Result<(), VerifyError> {
        let attest = Attest::unmarshall(&self.message)?;
        let AttestInfo::Quote { info } = attest.attested() else {
            return Err(VerifyError::Quote(TpmError::NotAQuote));
        };

        let mut selected = BTreeSet::new();
        for selection in info.pcr_selection().get_selections() {
            if selection.hashing_algorithm() != HashingAlgorithm::Sha256 {
                return Err(VerifyError::SelectionMismatch);
            }
            for slot in selection.selected() {
                selected.insert(u32::from(slot).trailing_zeros());
            }
        }

        let values = self.pcrs();
        if !values.keys().copied().eq(selected.iter().copied()) {
            return Err(VerifyError::SelectionMismatch);
        }

        // PCR values are hashed in ascending index order.
        let mut hasher = Sha256::new();
        for digest in values.values() {
            hasher.update(digest);
        }

        let digest = hasher.finish();
        if digest[..] != info.pcr_digest()[..] {
            return Err(VerifyError::PcrMismatch);
        }

        Ok(())
    }
}
