// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Trusted Launch VMs have no hardware report. Trust in the attestation key
//! comes from the AK certificate Azure provisions into the vTPM.

use crate::document::{base64_bytes, AttestationDocument};
use crate::error::{Error, Result};
use crate::https::HttpsGetter;
use crate::measurements::MeasurementSet;
use crate::variant::Variant;
use crate::vtpm::issuer::{InstanceInfoSource, TpmIssuer};
use crate::vtpm::validator::{document_ak, TpmValidator, TrustedKeySource};
use crate::vtpm::{AkPolicy, TpmDevice, TpmOpener, AZURE_PCR_SELECTION};
use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use x509_parser::oid_registry;
use x509_parser::prelude::{FromDer as _, GeneralName, ParsedExtension, X509Certificate};

/// NV index of the AK certificate on Azure vTPMs.
pub const AK_CERT_NV_INDEX: u32 = 0x01c101d0;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrustedLaunchInstanceInfo {
    #[serde(rename = "AKCert", alias = "EKCert", with = "base64_bytes")]
    pub ak_cert: Vec<u8>,
    /// Intermediate certificates, DER encoded.
    #[serde(rename = "CertChain", default)]
    pub cert_chain: Vec<Base64Cert>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct Base64Cert(#[serde(with = "base64_bytes")] pub Vec<u8>);

/// The NV area is larger than the certificate, cut off the padding.
fn trim_der(bytes: &[u8]) -> Result<&[u8]> {
    let (rest, _) = X509Certificate::from_der(bytes)
        .map_err(|e| Error::Io(format!("AK certificate: {e}")))?;
    Ok(&bytes[..bytes.len() - rest.len()])
}

/// URLs of the issuing certificate named in the AIA extension.
fn issuer_urls(cert_der: &[u8]) -> Result<Vec<String>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::Io(format!("AK certificate: {e}")))?;
    let extension = cert
        .get_extension_unique(&oid_registry::OID_PKIX_AUTHORITY_INFO_ACCESS)
        .map_err(|e| Error::Io(format!("AK certificate: {e}")))?;
    let Some(extension) = extension else {
        return Ok(Vec::new());
    };
    let ParsedExtension::AuthorityInfoAccess(aia) = extension.parsed_extension() else {
        return Err(Error::Io("AK certificate: bad AuthorityInfoAccess extension".into()));
    };
    let urls = aia
        .as_hashmap()
        .get(&oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS)
        .map(|names| {
            names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) => Some(uri.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(urls)
}

/// Certificates may be served as DER or PEM.
fn parse_cert(bytes: &[u8]) -> std::result::Result<X509, openssl::error::ErrorStack> {
    X509::from_der(bytes).or_else(|_| X509::from_pem(bytes))
}

/// Reads the AK certificate and fetches its issuer.
pub struct AkCertInstanceInfo {
    getter: Arc<dyn HttpsGetter>,
}

impl AkCertInstanceInfo {
    fn fetch_issuer(&self, cert_der: &[u8]) -> Result<Option<Vec<u8>>> {
        let urls = issuer_urls(cert_der)?;
        if urls.is_empty() {
            return Ok(None);
        }
        let mut last_err = None;
        for url in &urls {
            let fetched = self
                .getter
                .get(url, &[])
                .map_err(Error::from)
                .and_then(|body| {
                    parse_cert(&body)
                        .and_then(|c| c.to_der())
                        .map_err(|e| Error::malformed("issuing certificate", e))
                });
            match fetched {
                Ok(der) => return Ok(Some(der)),
                Err(e) => {
                    log::debug!("fetching issuing certificate from {url} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Transient("no issuing certificate".into())))
    }
}

impl InstanceInfoSource for AkCertInstanceInfo {
    fn instance_info(
        &self,
        tpm: &mut dyn TpmDevice,
        _ak_pub: &[u8],
        _user_data: &[u8],
        _nonce: &[u8],
    ) -> Result<Vec<u8>> {
        let nv = tpm.read_nv(AK_CERT_NV_INDEX)?;
        let ak_cert = trim_der(&nv)?.to_vec();

        let mut cert_chain = Vec::new();
        if let Some(intermediate) = self.fetch_issuer(&ak_cert)? {
            cert_chain.push(Base64Cert(intermediate));
        } else {
            log::warn!("AK certificate names no issuer, sending it without a chain");
        }

        let info = TrustedLaunchInstanceInfo {
            ak_cert,
            cert_chain,
        };
        Ok(serde_json::to_vec(&info)?)
    }
}

pub type Issuer = TpmIssuer<AkCertInstanceInfo>;

pub fn issuer(opener: Box<dyn TpmOpener>, getter: Arc<dyn HttpsGetter>) -> Issuer {
    TpmIssuer::new(
        Variant::AzureTrustedLaunch,
        opener,
        AkPolicy::AzurePersistent,
        AZURE_PCR_SELECTION,
        AkCertInstanceInfo { getter },
    )
}

/// Trusts the key of an AK certificate chaining to one of the roots.
pub struct AkCertKeySource {
    roots: Vec<X509>,
}

impl AkCertKeySource {
    fn verify_chain(&self, leaf: &X509, intermediates: &[X509]) -> Result<()> {
        let invalid = |e: openssl::error::ErrorStack| Error::CertChainInvalid(e.to_string());
        let mut store = X509StoreBuilder::new().map_err(invalid)?;
        for root in &self.roots {
            store.add_cert(root.clone()).map_err(invalid)?;
        }
        let store = store.build();

        let mut chain = Stack::new().map_err(invalid)?;
        for cert in intermediates {
            chain.push(cert.clone()).map_err(invalid)?;
        }

        let mut ctx = X509StoreContext::new().map_err(invalid)?;
        let result = ctx
            .init(&store, leaf, &chain, |ctx| {
                let valid = ctx.verify_cert()?;
                Ok((valid, ctx.error()))
            })
            .map_err(invalid)?;
        match result {
            (true, _) => Ok(()),
            (false, err) => Err(Error::CertChainInvalid(format!(
                "AK certificate: {}",
                err.error_string()
            ))),
        }
    }
}

impl TrustedKeySource for AkCertKeySource {
    fn trusted_key(&self, doc: &AttestationDocument, _nonce: &[u8]) -> Result<PKey<Public>> {
        let info: TrustedLaunchInstanceInfo = serde_json::from_slice(&doc.instance_info)
            .map_err(|e| Error::malformed("instance info", e))?;
        let leaf = X509::from_der(&info.ak_cert).map_err(|e| Error::malformed("AK certificate", e))?;
        let intermediates = info
            .cert_chain
            .iter()
            .map(|c| X509::from_der(&c.0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::malformed("certificate chain", e))?;
        self.verify_chain(&leaf, &intermediates)?;

        let cert_key = leaf
            .public_key()
            .map_err(|e| Error::malformed("AK certificate key", e))?;
        let ak = document_ak(doc)?
            .to_pkey()
            .map_err(|e| Error::malformed("attestation key", e))?;
        if !cert_key.public_eq(&ak) {
            return Err(Error::BindingMismatch(
                "AK certificate does not certify the attestation key".into(),
            ));
        }
        Ok(ak)
    }
}

pub type Validator = TpmValidator<AkCertKeySource>;

pub fn validator(measurements: MeasurementSet, roots: Vec<X509>) -> Validator {
    if roots.is_empty() {
        log::warn!("no AK root certificates configured, every Trusted Launch document is rejected");
    }
    TpmValidator::new(
        Variant::AzureTrustedLaunch,
        measurements,
        AkCertKeySource { roots },
    )
}
