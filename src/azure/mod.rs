// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Azure confidential VMs. The paravisor (HCL) owns the hardware report and
//! binds the vTPM attestation key to it through the runtime data section.

pub mod imds;
pub mod snp;
pub mod tdx;
pub mod trustedlaunch;

use crate::error::{Error, Result};
use crate::hcl::{ak_pub_from_var_data, HclReport, ReportType};
use crate::vtpm::{PublicKey, TpmDevice, VTPM_HCL_REPORT_NV_INDEX};
use openssl::pkey::PKey;
use sha2::{Digest, Sha256};

/// Read the HCL report and require the given hardware report type.
pub(crate) fn read_hcl_report(tpm: &mut dyn TpmDevice, expected: ReportType) -> Result<HclReport> {
    let bytes = tpm.read_nv(VTPM_HCL_REPORT_NV_INDEX)?;
    let report = HclReport::new(bytes).map_err(|e| Error::Io(format!("HCL report: {e}")))?;
    if report.report_type() != expected {
        return Err(Error::Unsupported(format!(
            "HCL report carries a {:?} report, expected {expected:?}",
            report.report_type()
        )));
    }
    Ok(report)
}

/// Check that `runtime_data` names `ak` and that its digest is the prefix of
/// the hardware report's report data.
pub(crate) fn check_runtime_data(
    ak: &PublicKey,
    runtime_data: &[u8],
    report_data: &[u8],
) -> Result<()> {
    let jwk =
        ak_pub_from_var_data(runtime_data).map_err(|e| Error::malformed("runtime data", e))?;
    let der = jwk
        .key
        .try_to_der()
        .map_err(|e| Error::malformed("runtime data key", e))?;
    let runtime_key =
        PKey::public_key_from_der(&der).map_err(|e| Error::malformed("runtime data key", e))?;
    let ak = ak
        .to_pkey()
        .map_err(|e| Error::malformed("attestation key", e))?;
    if !runtime_key.public_eq(&ak) {
        return Err(Error::BindingMismatch(
            "runtime data does not name the attestation key".into(),
        ));
    }

    let digest = Sha256::digest(runtime_data);
    if report_data.len() < digest.len() || report_data[..digest.len()] != digest[..] {
        return Err(Error::BindingMismatch(
            "report data does not commit to the runtime data".into(),
        ));
    }
    Ok(())
}
