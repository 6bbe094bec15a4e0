// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TDX guests without a vTPM. The quote itself carries the measurements and
//! binds the user data through its report data.

use crate::azure::tdx::verify_error;
use crate::document::{extra_data, AttestationDocument};
use crate::error::{Error, Result};
use crate::measurements::MeasurementSet;
use crate::tdx::{TdxPolicy, TdxQuote, TdxQuoteVerifier};
use crate::tsm::ReportSource;
use crate::variant::Variant;

pub struct Issuer {
    reports: Box<dyn ReportSource>,
}

pub fn issuer(reports: Box<dyn ReportSource>) -> Issuer {
    Issuer { reports }
}

impl crate::Issuer for Issuer {
    fn variant(&self) -> Variant {
        Variant::QemuTdx
    }

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let mut report_data = [0u8; 64];
        report_data[..32].copy_from_slice(&extra_data(user_data, nonce));
        let quote = self.reports.request(&report_data)?;
        AttestationDocument {
            attestation: None,
            instance_info: quote.outblob,
            user_data: user_data.to_vec(),
            user_data_signature: Vec::new(),
        }
        .to_bytes()
    }
}

pub struct Validator {
    measurements: MeasurementSet,
    policy: TdxPolicy,
    verifier: Box<dyn TdxQuoteVerifier>,
}

pub fn validator(
    measurements: MeasurementSet,
    policy: TdxPolicy,
    verifier: Box<dyn TdxQuoteVerifier>,
) -> Validator {
    Validator {
        measurements,
        policy,
        verifier,
    }
}

impl Validator {
    fn validate_quote(&self, doc: &AttestationDocument, nonce: &[u8]) -> Result<()> {
        let quote = TdxQuote::parse(&doc.instance_info)
            .map_err(|e| Error::malformed("TDX quote", e))?;
        self.verifier.verify(quote.raw()).map_err(verify_error)?;
        self.policy.check(&quote).map_err(verify_error)?;

        if quote.body.report_data[..32] != extra_data(&doc.user_data, nonce) {
            return Err(Error::BindingMismatch(
                "quote report data does not match user data and nonce".into(),
            ));
        }

        let (warnings, errors) = self.measurements.compare(&quote.measurements());
        for warning in &warnings {
            log::warn!("{}: {warning}", Variant::QemuTdx);
        }
        if !errors.is_empty() {
            return Err(Error::MeasurementMismatch(errors));
        }
        Ok(())
    }
}

impl crate::Validator for Validator {
    fn variant(&self) -> Variant {
        Variant::QemuTdx
    }

    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        let doc = AttestationDocument::from_bytes(document)?;
        match self.validate_quote(&doc, nonce) {
            Ok(()) => Ok(doc.user_data),
            Err(e) => {
                log::warn!("{} attestation document rejected: {e}", Variant::QemuTdx);
                Err(e)
            }
        }
    }
}
