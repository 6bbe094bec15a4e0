// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::document::AttestationDocument;
use crate::error::{Error, Result};
use crate::eventlog::Event;
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::snp::instance::SnpInstanceInfo;
use crate::snp::{ak_digest, check_ak_binding, SnpPolicy, SnpVerifier};
use crate::tsm::ReportSource;
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{decode_ak_pub, AkPolicy, TpmDevice, TpmOpener, GCP_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use std::sync::Arc;

/// Extended SNP report bound to the attestation key plus the instance identity.
pub struct GceSnpInstanceInfo {
    reports: Box<dyn ReportSource>,
    getter: Arc<dyn HttpsGetter>,
}

impl InstanceInfoSource for GceSnpInstanceInfo {
    fn instance_info(
        &self,
        _tpm: &mut dyn TpmDevice,
        ak_pub: &[u8],
        _user_data: &[u8],
        _nonce: &[u8],
    ) -> Result<Vec<u8>> {
        let ak = decode_ak_pub(ak_pub).map_err(|e| Error::Io(format!("attestation key: {e}")))?;
        let report = self.reports.request(&ak_digest(&ak)?)?;
        let mut info = SnpInstanceInfo::from_extended_report(report)?;
        info.gcp = Some(super::instance_info(self.getter.as_ref())?);
        info.to_bytes()
    }
}

pub type Issuer = TpmIssuer<GceSnpInstanceInfo>;

pub fn issuer(
    opener: Box<dyn TpmOpener>,
    reports: Box<dyn ReportSource>,
    getter: Arc<dyn HttpsGetter>,
) -> Issuer {
    TpmIssuer::new(
        Variant::GcpSevSnp,
        opener,
        AkPolicy::Gce,
        GCP_PCR_SELECTION,
        GceSnpInstanceInfo { reports, getter },
    )
}

pub struct GceSnpKeySource {
    verifier: SnpVerifier,
}

impl TrustedKeySource for GceSnpKeySource {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        let info = SnpInstanceInfo::from_bytes(&doc.instance_info)?;
        super::trusted_key(self.verifier.getter(), info.gcp()?, doc)
    }

    fn validate_cvm(&self, doc: &AttestationDocument, _events: &[Event]) -> Result<()> {
        let info = SnpInstanceInfo::from_bytes(&doc.instance_info)?;
        let report = self.verifier.verify(&info)?;
        check_ak_binding(&document_ak(doc)?, &report)
    }
}

pub type Validator = TpmValidator<GceSnpKeySource>;

pub fn validator(
    measurements: MeasurementSet,
    policy: SnpPolicy,
    getter: Arc<dyn HttpsGetter>,
) -> Validator {
    TpmValidator::new(
        Variant::GcpSevSnp,
        measurements,
        GceSnpKeySource {
            verifier: SnpVerifier::new(policy, getter),
        },
    )
}
