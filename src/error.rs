// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Failure classes of the issue and validate pipelines.
///
/// Every validator maps its module-level errors onto one of these, so callers
/// (TLS handshakes, the join service) can decide on retries without knowing
/// which platform produced the document.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("report signer certificate missing: {0}")]
    MissingSignerCert(String),
    #[error("certificate chain invalid: {0}")]
    CertChainInvalid(String),
    #[error("report signature invalid: {0}")]
    ReportSignatureInvalid(String),
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("report data binding mismatch: {0}")]
    BindingMismatch(String),
    #[error("tpm quote invalid: {0}")]
    TpmQuoteInvalid(String),
    #[error("measurement mismatch: {}", .0.join("; "))]
    MeasurementMismatch(Vec<String>),
    #[error("user data signature invalid")]
    UserSignatureInvalid,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device error: {0}")]
    Io(String),
}

impl Error {
    pub(crate) fn malformed(context: &str, err: impl std::fmt::Display) -> Self {
        Error::MalformedDocument(format!("{context}: {err}"))
    }

    /// A network fetch failed and the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::malformed("json", err)
    }
}

impl From<crate::https::HttpError> for Error {
    fn from(err: crate::https::HttpError) -> Self {
        Error::Transient(err.to_string())
    }
}

impl From<crate::vtpm::TpmError> for Error {
    fn from(err: crate::vtpm::TpmError) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
