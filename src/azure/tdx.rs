// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{check_runtime_data, imds, read_hcl_report};
use crate::document::{base64_bytes, AttestationDocument};
use crate::error::{Error, Result};
use crate::hcl::ReportType;
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::tdx::{TdxPolicy, TdxQuote, TdxQuoteVerifier, TdxVerifyError};
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{AkPolicy, TpmDevice, TpmOpener, AZURE_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TdxInstanceInfo {
    /// TDX quote over the TD report.
    #[serde(with = "base64_bytes", default)]
    pub attestation_report: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub runtime_data: Vec<u8>,
}

/// Turns the paravisor's TD report into a quote through IMDS.
pub struct AzureTdxInstanceInfo {
    getter: Arc<dyn HttpsGetter>,
}

impl InstanceInfoSource for AzureTdxInstanceInfo {
    fn instance_info(
        &self,
        tpm: &mut dyn TpmDevice,
        _ak_pub: &[u8],
        _user_data: &[u8],
        _nonce: &[u8],
    ) -> Result<Vec<u8>> {
        let hcl_report = read_hcl_report(tpm, ReportType::Tdx)?;
        let quote = imds::get_td_quote(self.getter.as_ref(), hcl_report.hw_report())
            .map_err(|e| match e {
                imds::ImdsError::Http(e) => Error::Transient(e.to_string()),
                other => Error::Io(format!("TD quote: {other}")),
            })?;
        let info = TdxInstanceInfo {
            attestation_report: quote,
            runtime_data: hcl_report.var_data().to_vec(),
        };
        Ok(serde_json::to_vec(&info)?)
    }
}

pub type Issuer = TpmIssuer<AzureTdxInstanceInfo>;

pub fn issuer(opener: Box<dyn TpmOpener>, getter: Arc<dyn HttpsGetter>) -> Issuer {
    TpmIssuer::new(
        Variant::AzureTdx,
        opener,
        AkPolicy::AzurePersistent,
        AZURE_PCR_SELECTION,
        AzureTdxInstanceInfo { getter },
    )
}

pub(crate) fn verify_error(err: TdxVerifyError) -> Error {
    match err {
        TdxVerifyError::Collateral(e) => Error::Transient(e),
        TdxVerifyError::Quote(e) => Error::ReportSignatureInvalid(e),
        TdxVerifyError::Status(_) | TdxVerifyError::Policy(_) => {
            Error::PolicyViolation(err.to_string())
        }
        TdxVerifyError::Io(e) => Error::Io(e.to_string()),
    }
}

pub struct AzureTdxKeySource {
    verifier: Box<dyn TdxQuoteVerifier>,
    policy: TdxPolicy,
}

impl TrustedKeySource for AzureTdxKeySource {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        let info: TdxInstanceInfo = serde_json::from_slice(&doc.instance_info)
            .map_err(|e| Error::malformed("instance info", e))?;
        let quote = TdxQuote::parse(&info.attestation_report)
            .map_err(|e| Error::malformed("TDX quote", e))?;

        self.verifier.verify(quote.raw()).map_err(verify_error)?;
        self.policy.check(&quote).map_err(verify_error)?;

        let ak = document_ak(doc)?;
        check_runtime_data(&ak, &info.runtime_data, &quote.body.report_data)?;
        ak.to_pkey().map_err(|e| Error::malformed("attestation key", e))
    }
}

pub type Validator = TpmValidator<AzureTdxKeySource>;

pub fn validator(
    measurements: MeasurementSet,
    policy: TdxPolicy,
    verifier: Box<dyn TdxQuoteVerifier>,
) -> Validator {
    TpmValidator::new(
        Variant::AzureTdx,
        measurements,
        AzureTdxKeySource { verifier, policy },
    )
}
