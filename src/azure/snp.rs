// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{check_runtime_data, imds, read_hcl_report};
use crate::document::{extra_data, AttestationDocument};
use crate::error::{Error, Result};
use crate::hcl::ReportType;
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::snp::idkey::{check_id_key, FirmwareSignerConfig, IdKeyError};
use crate::snp::instance::{AzureInstanceInfo, SnpInstanceInfo};
use crate::snp::{SnpPolicy, SnpVerifier};
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{AkPolicy, TpmDevice, TpmOpener, AZURE_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use std::sync::Arc;

/// Collects the SNP report the paravisor stores in the vTPM.
pub struct AzureSnpInstanceInfo {
    getter: Arc<dyn HttpsGetter>,
}

impl InstanceInfoSource for AzureSnpInstanceInfo {
    fn instance_info(
        &self,
        tpm: &mut dyn TpmDevice,
        _ak_pub: &[u8],
        _user_data: &[u8],
        _nonce: &[u8],
    ) -> Result<Vec<u8>> {
        let hcl_report = read_hcl_report(tpm, ReportType::Snp)?;

        let (report_signer, cert_chain) = match imds::get_certs(self.getter.as_ref()) {
            Ok(certs) => (certs.vcek.into_bytes(), certs.amd_chain.into_bytes()),
            Err(e) => {
                log::warn!("could not get certificates from THIM, validators fall back to the KDS: {e}");
                (Vec::new(), Vec::new())
            }
        };

        SnpInstanceInfo {
            report_signer,
            cert_chain,
            attestation_report: hcl_report.hw_report().to_vec(),
            azure: Some(AzureInstanceInfo {
                runtime_data: hcl_report.var_data().to_vec(),
                maa_token: String::new(),
            }),
            gcp: None,
        }
        .to_bytes()
    }
}

pub type Issuer = TpmIssuer<AzureSnpInstanceInfo>;

pub fn issuer(opener: Box<dyn TpmOpener>, getter: Arc<dyn HttpsGetter>) -> Issuer {
    TpmIssuer::new(
        Variant::AzureSevSnp,
        opener,
        AkPolicy::AzurePersistent,
        AZURE_PCR_SELECTION,
        AzureSnpInstanceInfo { getter },
    )
}

fn id_key_error(err: IdKeyError) -> Error {
    match err {
        IdKeyError::Http(e) => Error::Transient(e.to_string()),
        other => Error::PolicyViolation(other.to_string()),
    }
}

/// Trusts the attestation key named in the runtime data of a genuine report.
pub struct AzureSnpKeySource {
    verifier: SnpVerifier,
    firmware_signer: FirmwareSignerConfig,
}

impl TrustedKeySource for AzureSnpKeySource {
    fn trusted_key(&self, doc: &AttestationDocument, nonce: &[u8]) -> Result<PKey<Public>> {
        let info = SnpInstanceInfo::from_bytes(&doc.instance_info)?;
        let azure = info.azure()?;
        let report = self.verifier.verify(&info)?;

        let ak = document_ak(doc)?;
        check_runtime_data(&ak, &azure.runtime_data, report.report_data())?;

        let extra_data = extra_data(&doc.user_data, nonce);
        check_id_key(
            &self.firmware_signer,
            report.id_key_digest(),
            &azure.maa_token,
            &extra_data,
            self.verifier.getter(),
        )
        .map_err(id_key_error)?;

        ak.to_pkey().map_err(|e| Error::malformed("attestation key", e))
    }
}

pub type Validator = TpmValidator<AzureSnpKeySource>;

pub fn validator(
    measurements: MeasurementSet,
    policy: SnpPolicy,
    firmware_signer: FirmwareSignerConfig,
    getter: Arc<dyn HttpsGetter>,
) -> Validator {
    TpmValidator::new(
        Variant::AzureSevSnp,
        measurements,
        AzureSnpKeySource {
            verifier: SnpVerifier::new(policy, getter),
            firmware_signer,
        },
    )
}
