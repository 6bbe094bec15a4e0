// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AMD Key Distribution Service.

use super::certs::{build_cert_chain, AmdChain, ParseError, Vcek};
use super::report::{SigningKey, Tcb};
use crate::https::{HttpError, HttpsGetter};
use thiserror::Error;

const KDS_CERT_SITE: &str = "https://kdsintf.amd.com";

#[derive(Error, Debug)]
pub enum KdsError {
    #[error("http error")]
    Http(#[from] HttpError),
    #[error("certificate parse error")]
    Parse(#[from] ParseError),
    #[error("the KDS serves no certificates for {0:?} keys")]
    Unsupported(SigningKey),
}

fn key_path(key: SigningKey) -> Result<&'static str, KdsError> {
    match key {
        SigningKey::Vcek => Ok("vcek"),
        SigningKey::Vlek => Ok("vlek"),
        other => Err(KdsError::Unsupported(other)),
    }
}

/// URL of the VCEK for a chip at a given TCB.
pub fn vcek_url(product: &str, chip_id: &[u8], tcb: &Tcb) -> String {
    format!(
        "{KDS_CERT_SITE}/vcek/v1/{product}/{}?blSPL={:02}&teeSPL={:02}&snpSPL={:02}&ucodeSPL={:02}",
        hex::encode(chip_id),
        tcb.bootloader,
        tcb.tee,
        tcb.snp,
        tcb.microcode
    )
}

/// URL of the ASK/ARK bundle for the given signing key type.
pub fn cert_chain_url(product: &str, key: SigningKey) -> Result<String, KdsError> {
    Ok(format!(
        "{KDS_CERT_SITE}/{}/v1/{product}/cert_chain",
        key_path(key)?
    ))
}

pub struct Kds<'a> {
    getter: &'a dyn HttpsGetter,
    product: &'a str,
}

impl<'a> Kds<'a> {
    pub fn new(getter: &'a dyn HttpsGetter, product: &'a str) -> Self {
        Self { getter, product }
    }

    /// Get the VCEK for a chip id and TCB. The KDS serves it DER encoded.
    pub fn vcek(&self, chip_id: &[u8], tcb: &Tcb) -> Result<Vcek, KdsError> {
        let url = vcek_url(self.product, chip_id, tcb);
        log::debug!("requesting VCEK from {url}");
        let der = self.getter.get(&url, &[])?;
        Ok(Vcek::from_der(&der)?)
    }

    /// Get ASK and ARK for the product.
    pub fn cert_chain(&self, key: SigningKey) -> Result<AmdChain, KdsError> {
        let url = cert_chain_url(self.product, key)?;
        log::debug!("requesting certificate chain from {url}");
        let bytes = self.getter.get(&url, &[])?;
        let pem = String::from_utf8_lossy(&bytes);
        Ok(build_cert_chain(&pem)?)
    }
}
