// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::document::AttestationDocument;
use crate::error::{Error, Result};
use crate::measurements::MeasurementSet;
use crate::variant::Variant;
use crate::vtpm::issuer::{NoInstanceInfo, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{AkPolicy, TpmOpener, QEMU_PCR_SELECTION};
use openssl::pkey::{PKey, Public};

pub type Issuer = TpmIssuer<NoInstanceInfo>;

pub fn issuer(opener: Box<dyn TpmOpener>) -> Issuer {
    TpmIssuer::new(
        Variant::QemuVtpm,
        opener,
        AkPolicy::Generic,
        QEMU_PCR_SELECTION,
        NoInstanceInfo,
    )
}

/// The swtpm has no endorsement we could check, its AK is taken as is.
pub struct SelfAsserted;

impl TrustedKeySource for SelfAsserted {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        document_ak(doc)?
            .to_pkey()
            .map_err(|e| Error::malformed("attestation key", e))
    }
}

pub type Validator = TpmValidator<SelfAsserted>;

pub fn validator(measurements: MeasurementSet) -> Validator {
    TpmValidator::new(Variant::QemuVtpm, measurements, SelfAsserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{Enforcement, Measurement};
    use crate::vtpm::simulator::SimulatedTpm;
    use crate::{Issuer as _, Validator as _};

    fn zero_pcr11() -> MeasurementSet {
        let mut m = MeasurementSet::new();
        m.insert(11, Measurement::with_all_bytes(0x00, Enforcement::Enforce, 32));
        m
    }

    #[test]
    fn round_trip() {
        let sim = SimulatedTpm::new();
        let doc = issuer(Box::new(sim)).issue(b"Constellation", &[2, 3, 4]).unwrap();
        let v = validator(zero_pcr11());
        assert_eq!(v.validate(&doc, &[2, 3, 4]).unwrap(), b"Constellation");
    }

    #[test]
    fn wrong_nonce() {
        let sim = SimulatedTpm::new();
        let doc = issuer(Box::new(sim)).issue(b"Constellation", &[2, 3, 4]).unwrap();
        let v = validator(zero_pcr11());
        assert!(matches!(
            v.validate(&doc, &[4, 3, 2, 1]),
            Err(Error::TpmQuoteInvalid(_))
        ));
    }

    #[test]
    fn flipped_user_data_bit() {
        let sim = SimulatedTpm::new();
        let raw = issuer(Box::new(sim)).issue(b"Constellation", &[2, 3, 4]).unwrap();
        let v = validator(zero_pcr11());
        for bit in [0, 7, 42, 103] {
            let mut doc = AttestationDocument::from_bytes(&raw).unwrap();
            doc.user_data[bit / 8] ^= 1 << (bit % 8);
            assert!(matches!(
                v.validate(&doc.to_bytes().unwrap(), &[2, 3, 4]),
                Err(Error::UserSignatureInvalid)
            ));
        }
    }

    #[test]
    fn enforced_and_warn_only_pcrs() {
        let sim = SimulatedTpm::new();
        sim.measure(11, b"bootstrapped");
        let doc = issuer(Box::new(sim)).issue(b"Constellation", &[2, 3, 4]).unwrap();

        assert!(matches!(
            validator(zero_pcr11()).validate(&doc, &[2, 3, 4]),
            Err(Error::MeasurementMismatch(_))
        ));

        let mut m = MeasurementSet::new();
        m.insert(11, Measurement::with_all_bytes(0x00, Enforcement::WarnOnly, 32));
        assert!(validator(m).validate(&doc, &[2, 3, 4]).is_ok());
    }
}
