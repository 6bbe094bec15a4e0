// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::imds;
use crate::document::{base64_bytes, AttestationDocument};
use crate::error::{Error, Result};
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{AkPolicy, TpmDevice, TpmOpener, AWS_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Signed EC2 instance identity document.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityDocument {
    #[serde(with = "base64_bytes")]
    pub document: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub signature: Vec<u8>,
}

pub struct InstanceIdentity {
    getter: Arc<dyn HttpsGetter>,
}

impl InstanceInfoSource for InstanceIdentity {
    fn instance_info(&self, _: &mut dyn TpmDevice, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        let getter = self.getter.as_ref();
        let info = IdentityDocument {
            document: imds(getter, "dynamic/instance-identity/document")?,
            signature: imds(getter, "dynamic/instance-identity/signature")?,
        };
        Ok(serde_json::to_vec(&info)?)
    }
}

pub type Issuer = TpmIssuer<InstanceIdentity>;

pub fn issuer(opener: Box<dyn TpmOpener>, getter: Arc<dyn HttpsGetter>) -> Issuer {
    TpmIssuer::new(
        Variant::AwsNitroTpm,
        opener,
        AkPolicy::Generic,
        AWS_PCR_SELECTION,
        InstanceIdentity { getter },
    )
}

/// Trusts the document's attestation key as is.
pub struct UnverifiedKey;

impl TrustedKeySource for UnverifiedKey {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        log::warn!("NitroTPM attestation keys cannot be verified, trusting the key in the document");
        document_ak(doc)?
            .to_pkey()
            .map_err(|e| Error::malformed("attestation key", e))
    }
}

pub type Validator = TpmValidator<UnverifiedKey>;

pub fn validator(measurements: MeasurementSet) -> Validator {
    TpmValidator::new(Variant::AwsNitroTpm, measurements, UnverifiedKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::IMDS_URL;
    use crate::https::StaticGetter;
    use crate::measurements::{Enforcement, Measurement};
    use crate::vtpm::simulator::SimulatedTpm;
    use crate::{Issuer as _, Validator as _};

    fn imds() -> StaticGetter {
        StaticGetter::new()
            .with(
                &format!("{IMDS_URL}/dynamic/instance-identity/document"),
                r#"{"instanceId": "i-0123456789abcdef0", "region": "eu-central-1"}"#,
            )
            .with(
                &format!("{IMDS_URL}/dynamic/instance-identity/signature"),
                "c2lnbmF0dXJl",
            )
    }

    #[test]
    fn round_trip() {
        let sim = SimulatedTpm::new();
        sim.measure(4, b"kernel");
        let doc = issuer(Box::new(sim.clone()), Arc::new(imds()))
            .issue(b"user data", b"nonce")
            .unwrap();

        let parsed = AttestationDocument::from_bytes(&doc).unwrap();
        let info: IdentityDocument = serde_json::from_slice(&parsed.instance_info).unwrap();
        assert!(String::from_utf8(info.document).unwrap().contains("i-0123456789abcdef0"));

        let mut m = MeasurementSet::new();
        m.insert(4, Measurement::new(sim.pcr(4).to_vec(), Enforcement::Enforce));
        let v = validator(m);
        assert_eq!(v.validate(&doc, b"nonce").unwrap(), b"user data");

        sim.measure(4, b"other kernel");
        let doc = issuer(Box::new(sim), Arc::new(imds()))
            .issue(b"user data", b"nonce")
            .unwrap();
        assert!(matches!(
            v.validate(&doc, b"nonce"),
            Err(Error::MeasurementMismatch(_))
        ));
    }

    #[test]
    fn issuer_needs_imds() {
        let err = issuer(Box::new(SimulatedTpm::new()), Arc::new(StaticGetter::new()))
            .issue(b"user data", b"nonce")
            .unwrap_err();
        assert!(err.is_transient());
    }
}
