// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::https::{HttpError, HttpsGetter};
use serde::Deserialize;
use thiserror::Error;

pub const IMDS_CERT_URL: &str = "http://169.254.169.254/metadata/THIM/amd/certification";
pub const IMDS_QUOTE_URL: &str = "http://169.254.169.254/acc/tdquote";

#[derive(Error, Debug)]
pub enum ImdsError {
    #[error("http error")]
    Http(#[from] HttpError),
    #[error("base64 error")]
    Base64(#[from] base64_url::base64::DecodeError),
    #[error("json error")]
    Json(#[from] serde_json::Error),
}

/// PEM encoded VCEK certificate and AMD certificate chain.
#[derive(Deserialize)]
pub struct Certificates {
    #[serde(rename = "vcekCert")]
    pub vcek: String,
    #[serde(rename = "certificateChain")]
    pub amd_chain: String,
}

/// Get the VCEK certificate and the certificate chain from the Azure IMDS.
/// **Note:** this can only be called from a Confidential VM.
pub fn get_certs(getter: &dyn HttpsGetter) -> Result<Certificates, ImdsError> {
    let body = getter.get(IMDS_CERT_URL, &[("Metadata", "true")])?;
    let certs: Certificates = serde_json::from_slice(&body)?;
    Ok(certs)
}

#[derive(Clone, Debug, Deserialize)]
struct QuoteResponse {
    quote: String,
}

/// Exchange a TD report for a quote signed by the host's quoting enclave.
pub fn get_td_quote(getter: &dyn HttpsGetter, td_report: &[u8]) -> Result<Vec<u8>, ImdsError> {
    let body = serde_json::json!({
        "report": base64_url::encode(td_report),
    });
    let response = getter.post_json(
        IMDS_QUOTE_URL,
        &[("Content-Type", "application/json")],
        &body,
    )?;
    let response: QuoteResponse = serde_json::from_slice(&response)?;
    let quote = base64_url::decode(&response.quote)?;
    Ok(quote)
}
