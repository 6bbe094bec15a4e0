// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{decode_ak_pub, HashAlg, PublicKey};
use crate::document::AttestationDocument;
use crate::error::{Error, Result};
use crate::eventlog::{self, Event};
use crate::measurements::MeasurementSet;
use crate::variant::Variant;
use crate::Validator;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;

/// Establishes trust in the key that signed a document's quote.
pub trait TrustedKeySource: Send + Sync {
    /// The key the quote must verify under. Fails when the platform evidence
    /// does not vouch for the document's attestation key.
    fn trusted_key(&self, doc: &AttestationDocument, nonce: &[u8]) -> Result<PKey<Public>>;

    /// Platform checks on the verified quote and the replayed event log.
    fn validate_cvm(&self, _doc: &AttestationDocument, _events: &[Event]) -> Result<()> {
        Ok(())
    }
}

/// Decode the attestation key carried in the document.
pub fn document_ak(doc: &AttestationDocument) -> Result<PublicKey> {
    decode_ak_pub(&doc.tpm()?.ak_pub).map_err(|e| Error::malformed("attestation key", e))
}

/// Validates documents built around a TPM quote.
pub struct TpmValidator<K> {
    variant: Variant,
    measurements: MeasurementSet,
    key_source: K,
}

impl<K: TrustedKeySource> TpmValidator<K> {
    pub fn new(variant: Variant, measurements: MeasurementSet, key_source: K) -> Self {
        Self {
            variant,
            measurements,
            key_source,
        }
    }

    pub fn measurements(&self) -> &MeasurementSet {
        &self.measurements
    }

    fn validate_document(&self, doc: &AttestationDocument, nonce: &[u8]) -> Result<()> {
        let tpm = doc.tpm()?;
        let key = self.key_source.trusted_key(doc, nonce)?;

        let quote = tpm
            .quotes
            .iter()
            .find(|q| q.hash == HashAlg::Sha256)
            .ok_or_else(|| Error::Unsupported("document carries no SHA-256 quote".into()))?;
        quote
            .verify(&key, nonce)
            .map_err(|e| Error::TpmQuoteInvalid(e.to_string()))?;
        let pcrs = quote.pcrs();

        let events = if tpm.event_log.is_empty() {
            Vec::new()
        } else {
            let events =
                eventlog::parse(&tpm.event_log).map_err(|e| Error::malformed("event log", e))?;
            eventlog::verify_against(&events, &pcrs)
                .map_err(|e| Error::TpmQuoteInvalid(e.to_string()))?;
            events
        };

        self.key_source.validate_cvm(doc, &events)?;

        let (warnings, errors) = self.measurements.compare(&pcrs);
        for warning in &warnings {
            log::warn!("{}: {warning}", self.variant);
        }
        if !errors.is_empty() {
            return Err(Error::MeasurementMismatch(errors));
        }

        let mut verifier = Verifier::new(MessageDigest::sha256(), &key)
            .map_err(|e| Error::malformed("user data signature", e))?;
        verifier
            .update(&doc.user_data)
            .map_err(|e| Error::malformed("user data signature", e))?;
        if !verifier
            .verify(&doc.user_data_signature)
            .unwrap_or(false)
        {
            return Err(Error::UserSignatureInvalid);
        }
        Ok(())
    }
}

impl<K: TrustedKeySource> Validator for TpmValidator<K> {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        log::debug!("validating {} attestation document", self.variant);
        let doc = AttestationDocument::from_bytes(document)?;
        match self.validate_document(&doc, nonce) {
            Ok(()) => {
                log::debug!("successfully validated {} attestation document", self.variant);
                Ok(doc.user_data)
            }
            Err(e) => {
                log::warn!("{} attestation document rejected: {e}", self.variant);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TpmAttestation;
    use crate::measurements::{Enforcement, Measurement};
    use crate::vtpm::issuer::{NoInstanceInfo, TpmIssuer};
    use crate::vtpm::simulator::SimulatedTpm;
    use crate::vtpm::{AkPolicy, Quote, QEMU_PCR_SELECTION};
    use crate::Issuer;

    /// Trusts whatever key the document names.
    struct DocumentKey;

    impl TrustedKeySource for DocumentKey {
        fn trusted_key(&self, doc: &AttestationDocument, _: &[u8]) -> Result<PKey<Public>> {
            document_ak(doc)?.to_pkey().map_err(|e| Error::malformed("ak", e))
        }
    }

    fn issue(sim: &SimulatedTpm, user_data: &[u8], nonce: &[u8]) -> Vec<u8> {
        TpmIssuer::new(
            Variant::QemuVtpm,
            Box::new(sim.clone()),
            AkPolicy::Generic,
            QEMU_PCR_SELECTION,
            NoInstanceInfo,
        )
        .issue(user_data, nonce)
        .unwrap()
    }

    fn measurements(sim: &SimulatedTpm) -> MeasurementSet {
        [4, 9]
            .into_iter()
            .map(|i| (i, Measurement::new(sim.pcr(i).to_vec(), Enforcement::Enforce)))
            .collect()
    }

    fn setup() -> (SimulatedTpm, TpmValidator<DocumentKey>) {
        let sim = SimulatedTpm::new();
        sim.measure(4, b"kernel");
        sim.measure(9, b"cmdline");
        let validator = TpmValidator::new(Variant::QemuVtpm, measurements(&sim), DocumentKey);
        (sim, validator)
    }

    #[test]
    fn accepts_valid_document() {
        let (sim, validator) = setup();
        let doc = issue(&sim, b"user data", b"nonce");
        assert_eq!(validator.validate(&doc, b"nonce").unwrap(), b"user data");
    }

    #[test]
    fn rejects_wrong_nonce() {
        let (sim, validator) = setup();
        let doc = issue(&sim, b"user data", b"nonce");
        let err = validator.validate(&doc, b"other").unwrap_err();
        assert!(matches!(err, Error::TpmQuoteInvalid(_)));
    }

    #[test]
    fn rejects_changed_pcr() {
        let (sim, validator) = setup();
        sim.measure(9, b"debug=1");
        let doc = issue(&sim, b"user data", b"nonce");
        let err = validator.validate(&doc, b"nonce").unwrap_err();
        assert!(matches!(err, Error::MeasurementMismatch(ref e) if e.len() == 1));
    }

    #[test]
    fn warn_only_mismatch_passes() {
        let sim = SimulatedTpm::new();
        let mut expected = MeasurementSet::new();
        expected.insert(11, Measurement::with_all_bytes(0xAA, Enforcement::WarnOnly, 32));
        let validator = TpmValidator::new(Variant::QemuVtpm, expected, DocumentKey);
        let doc = issue(&sim, b"user data", b"nonce");
        assert!(validator.validate(&doc, b"nonce").is_ok());
    }

    #[test]
    fn rejects_swapped_user_data() {
        let (sim, validator) = setup();
        let raw = issue(&sim, b"user data", b"nonce");
        let mut doc = AttestationDocument::from_bytes(&raw).unwrap();
        doc.user_data = b"attacker key".to_vec();
        let err = validator
            .validate(&doc.to_bytes().unwrap(), b"nonce")
            .unwrap_err();
        assert!(matches!(err, Error::UserSignatureInvalid));
    }

    #[test]
    fn rejects_tampered_event_log() {
        let (sim, validator) = setup();
        let raw = issue(&sim, b"user data", b"nonce");
        let mut doc = AttestationDocument::from_bytes(&raw).unwrap();

        let other = SimulatedTpm::new();
        other.measure(4, b"another kernel");
        let mut tpm = crate::vtpm::TpmOpener::open(&other).unwrap();
        doc.attestation.as_mut().unwrap().event_log = tpm.event_log().unwrap();

        let err = validator
            .validate(&doc.to_bytes().unwrap(), b"nonce")
            .unwrap_err();
        assert!(matches!(err, Error::TpmQuoteInvalid(_)));
    }

    #[test]
    fn sha1_only_is_unsupported() {
        let (sim, validator) = setup();
        let raw = issue(&sim, b"user data", b"nonce");
        let mut doc = AttestationDocument::from_bytes(&raw).unwrap();
        let tpm: &mut TpmAttestation = doc.attestation.as_mut().unwrap();
        let q = &tpm.quotes[0];
        let json = serde_json::to_value(q).unwrap();
        let mut json = json.as_object().unwrap().clone();
        json.insert("hash".into(), "SHA1".into());
        tpm.quotes = vec![serde_json::from_value::<Quote>(json.into()).unwrap()];

        let err = validator
            .validate(&doc.to_bytes().unwrap(), b"nonce")
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn rejects_garbage() {
        let (_, validator) = setup();
        let err = validator.validate(b"{", b"nonce").unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
        let err = validator.validate(b"{}", b"nonce").unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
    }
}
