// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Amazon EC2. NitroTPM instances offer no way to verify the attestation
//! key, SEV-SNP instances bind it through a VLEK signed report.

pub mod nitro;
pub mod snp;

use crate::https::{HttpError, HttpsGetter};

pub const IMDS_URL: &str = "http://169.254.169.254/latest";

pub(crate) fn imds(getter: &dyn HttpsGetter, path: &str) -> Result<Vec<u8>, HttpError> {
    getter.get(&format!("{IMDS_URL}/{path}"), &[])
}
