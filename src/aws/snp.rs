// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::document::AttestationDocument;
use crate::error::{Error, Result};
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::snp::instance::SnpInstanceInfo;
use crate::snp::{ak_digest, check_ak_binding, SnpPolicy, SnpVerifier};
use crate::tsm::ReportSource;
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{decode_ak_pub, AkPolicy, TpmDevice, TpmOpener, AWS_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use std::sync::Arc;

/// VLEK signed extended report bound to the attestation key.
pub struct VlekReport {
    reports: Box<dyn ReportSource>,
}

impl InstanceInfoSource for VlekReport {
    fn instance_info(
        &self,
        _tpm: &mut dyn TpmDevice,
        ak_pub: &[u8],
        _user_data: &[u8],
        _nonce: &[u8],
    ) -> Result<Vec<u8>> {
        let ak = decode_ak_pub(ak_pub).map_err(|e| Error::Io(format!("attestation key: {e}")))?;
        let report = self.reports.request(&ak_digest(&ak)?)?;
        SnpInstanceInfo::from_extended_report(report)?.to_bytes()
    }
}

pub type Issuer = TpmIssuer<VlekReport>;

pub fn issuer(opener: Box<dyn TpmOpener>, reports: Box<dyn ReportSource>) -> Issuer {
    TpmIssuer::new(
        Variant::AwsSevSnp,
        opener,
        AkPolicy::Generic,
        AWS_PCR_SELECTION,
        VlekReport { reports },
    )
}

pub struct VlekKeySource {
    verifier: SnpVerifier,
}

impl TrustedKeySource for VlekKeySource {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        let info = SnpInstanceInfo::from_bytes(&doc.instance_info)?;
        let report = self.verifier.verify(&info)?;
        let ak = document_ak(doc)?;
        check_ak_binding(&ak, &report)?;
        ak.to_pkey().map_err(|e| Error::malformed("attestation key", e))
    }
}

pub type Validator = TpmValidator<VlekKeySource>;

pub fn validator(
    measurements: MeasurementSet,
    policy: SnpPolicy,
    getter: Arc<dyn HttpsGetter>,
) -> Validator {
    TpmValidator::new(
        Variant::AwsSevSnp,
        measurements,
        VlekKeySource {
            verifier: SnpVerifier::new(policy, getter),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::https::StaticGetter;
    use crate::snp::certs::{guid, CertTable};
    use crate::snp::kds::cert_chain_url;
    use crate::snp::report::ReportBuilder;
    use crate::snp::testutil::TestChain;
    use crate::snp::{SigningKey, PRODUCT_MILAN};
    use crate::tsm::{TsmError, TsmReport};
    use crate::vtpm::simulator::SimulatedTpm;
    use crate::{Issuer as _, Validator as _};

    struct FakeFirmware {
        chain: Arc<TestChain>,
        with_vlek: bool,
    }

    impl ReportSource for FakeFirmware {
        fn request(&self, report_data: &[u8; 64]) -> Result<TsmReport, TsmError> {
            let report = ReportBuilder::new()
                .signing_key(SigningKey::Vlek)
                .tcb(SnpPolicy::default().minimum_tcb)
                .report_data(report_data)
                .sign(&self.chain.vcek_key);
            let vlek = self.chain.vcek.to_der().unwrap();
            let auxblob = if self.with_vlek {
                CertTable::build(&[(guid::VLEK, &vlek)])
            } else {
                Vec::new()
            };
            Ok(TsmReport {
                outblob: report,
                auxblob,
                provider: "sev_guest".into(),
            })
        }
    }

    fn setup(with_vlek: bool) -> (SimulatedTpm, Arc<TestChain>, Vec<u8>) {
        let sim = SimulatedTpm::new();
        let chain = Arc::new(TestChain::vlek(SnpPolicy::default().minimum_tcb));
        let fw = FakeFirmware {
            chain: chain.clone(),
            with_vlek,
        };
        let doc = issuer(Box::new(sim.clone()), Box::new(fw))
            .issue(b"user data", b"nonce")
            .unwrap();
        (sim, chain, doc)
    }

    fn kds(chain: &TestChain) -> StaticGetter {
        StaticGetter::new().with(
            &cert_chain_url(PRODUCT_MILAN, SigningKey::Vlek).unwrap(),
            chain.chain_pem(),
        )
    }

    fn policy(chain: &TestChain) -> SnpPolicy {
        SnpPolicy {
            ark: Some(chain.ark.clone()),
            ..Default::default()
        }
    }

    #[test]
    fn round_trip() {
        let (_, chain, doc) = setup(true);
        let v = validator(MeasurementSet::new(), policy(&chain), Arc::new(kds(&chain)));
        assert_eq!(v.validate(&doc, b"nonce").unwrap(), b"user data");
    }

    #[test]
    fn vlek_is_required() {
        let (_, chain, doc) = setup(false);
        let v = validator(MeasurementSet::new(), policy(&chain), Arc::new(kds(&chain)));
        assert!(matches!(
            v.validate(&doc, b"nonce"),
            Err(Error::MissingSignerCert(_))
        ));
    }

    #[test]
    fn swapped_attestation_key_is_rejected() {
        let (_, chain, raw) = setup(true);
        let mut doc = AttestationDocument::from_bytes(&raw).unwrap();
        doc.attestation.as_mut().unwrap().ak_pub = SimulatedTpm::new().ak_pub_area();
        let v = validator(MeasurementSet::new(), policy(&chain), Arc::new(kds(&chain)));
        assert!(matches!(
            v.validate(&doc.to_bytes().unwrap(), b"nonce"),
            Err(Error::BindingMismatch(_))
        ));
    }

    #[test]
    fn unreachable_kds_is_transient() {
        let (_, chain, doc) = setup(true);
        let v = validator(MeasurementSet::new(), policy(&chain), Arc::new(StaticGetter::new()));
        assert!(v.validate(&doc, b"nonce").unwrap_err().is_transient());
    }
}
