// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::document::AttestationDocument;
use crate::error::{Error, Result};
use crate::eventlog::{self, Event, GceTechnology};
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::snp::instance::GceInstanceInfo;
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{TpmValidator, TrustedKeySource};
use crate::vtpm::{AkPolicy, TpmDevice, TpmOpener, GCP_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use std::sync::Arc;

pub struct GceMetadata {
    getter: Arc<dyn HttpsGetter>,
}

impl InstanceInfoSource for GceMetadata {
    fn instance_info(&self, _: &mut dyn TpmDevice, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        let info = super::instance_info(self.getter.as_ref())?;
        Ok(serde_json::to_vec(&info)?)
    }
}

pub type Issuer = TpmIssuer<GceMetadata>;

pub fn issuer(opener: Box<dyn TpmOpener>, getter: Arc<dyn HttpsGetter>) -> Issuer {
    TpmIssuer::new(
        Variant::GcpSevEs,
        opener,
        AkPolicy::Gce,
        GCP_PCR_SELECTION,
        GceMetadata { getter },
    )
}

pub struct ShieldedIdentity {
    getter: Arc<dyn HttpsGetter>,
}

impl TrustedKeySource for ShieldedIdentity {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        let info: GceInstanceInfo = serde_json::from_slice(&doc.instance_info)
            .map_err(|e| Error::malformed("instance info", e))?;
        super::trusted_key(self.getter.as_ref(), &info, doc)
    }

    fn validate_cvm(&self, _doc: &AttestationDocument, events: &[Event]) -> Result<()> {
        let platform = eventlog::gce_platform(events);
        match platform.technology {
            Some(GceTechnology::AmdSev | GceTechnology::AmdSevEs) => {}
            other => {
                return Err(Error::PolicyViolation(format!(
                    "event log announces confidential technology {other:?}, expected AMD SEV"
                )))
            }
        }
        match platform.firmware_version {
            Some(v) if v >= 1 => Ok(()),
            other => Err(Error::PolicyViolation(format!(
                "unsupported GCE firmware version {other:?}"
            ))),
        }
    }
}

pub type Validator = TpmValidator<ShieldedIdentity>;

pub fn validator(measurements: MeasurementSet, getter: Arc<dyn HttpsGetter>) -> Validator {
    TpmValidator::new(Variant::GcpSevEs, measurements, ShieldedIdentity { getter })
}
