// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::report::Tcb;
pub use openssl::x509::X509;
use openssl::nid::Nid;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

const OID_BL_SPL: &str = "1.3.6.1.4.1.3704.1.3.1";
const OID_TEE_SPL: &str = "1.3.6.1.4.1.3704.1.3.2";
const OID_SNP_SPL: &str = "1.3.6.1.4.1.3704.1.3.3";
const OID_UCODE_SPL: &str = "1.3.6.1.4.1.3704.1.3.8";
const OID_HWID: &str = "1.3.6.1.4.1.3704.1.4";

/// AMD Root Key of the Milan product line, as served by the KDS at
/// `/vcek/v1/Milan/cert_chain`.
pub const MILAN_ARK_PEM: &str = "\
-----BEGIN CERTIFICATE-----
MIIGYzCCBBKgAwIBAgIDAQAAMEYGCSqGSIb3DQEBCjA5oA8wDQYJYIZIAWUDBAIC
BQChHDAaBgkqhkiG9w0BAQgwDQYJYIZIAWUDBAICBQCiAwIBMKMDAgEBMHsxFDAS
BgNVBAsMC0VuZ2luZWVyaW5nMQswCQYDVQQGEwJVUzEUMBIGA1UEBwwLU2FudGEg
Q2xhcmExCzAJBgNVBAgMAkNBMR8wHQYDVQQKDBZBZHZhbmNlZCBNaWNybyBEZXZp
Y2VzMRIwEAYDVQQDDAlBUkstTWlsYW4wHhcNMjAxMDIyMTcyMzA1WhcNNDUxMDIy
MTcyMzA1WjB7MRQwEgYDVQQLDAtFbmdpbmVlcmluZzELMAkGA1UEBhMCVVMxFDAS
BgNVBAcMC1NhbnRhIENsYXJhMQswCQYDVQQIDAJDQTEfMB0GA1UECgwWQWR2YW5j
ZWQgTWljcm8gRGV2aWNlczESMBAGA1UEAwwJQVJLLU1pbGFuMIICIjANBgkqhkiG
9w0BAQEFAAOCAg8AMIICCgKCAgEA0Ld52RJOdeiJlqK2JdsVmD7FktuotWwX1fNg
W41XY9Xz1HEhSUmhLz9Cu9DHRlvgJSNxbeYYsnJfvyjx1MfU0V5tkKiU1EesNFta
1kTA0szNisdYc9isqk7mXT5+KfGRbfc4V/9zRIcE8jlHN61S1ju8X93+6dxDUrG2
SzxqJ4BhqyYmUDruPXJSX4vUc01P7j98MpqOS95rORdGHeI52Naz5m2B+O+vjsC0
60d37jY9LFeuOP4Meri8qgfi2S5kKqg/aF6aPtuAZQVR7u3KFYXP59XmJgtcog05
gmI0T/OitLhuzVvpZcLph0odh/1IPXqx3+MnjD97A7fXpqGd/y8KxX7jksTEzAOg
bKAeam3lm+3yKIcTYMlsRMXPcjNbIvmsBykD//xSniusuHBkgnlENEWx1UcbQQrs
+gVDkuVPhsnzIRNgYvM48Y+7LGiJYnrmE8xcrexekBxrva2V9TJQqnN3Q53kt5vi
Qi3+gCfmkwC0F0tirIZbLkXPrPwzZ0M9eNxhIySb2npJfgnqz55I0u33wh4r0ZNQ
eTGfw03MBUtyuzGesGkcw+loqMaq1qR4tjGbPYxCvpCq7+OgpCCoMNit2uLo9M18
fHz10lOMT8nWAUvRZFzteXCm+7PHdYPlmQwUw3LvenJ/ILXoQPHfbkH0CyPfhl1j
WhJFZasCAwEAAaN+MHwwDgYDVR0PAQH/BAQDAgEGMB0GA1UdDgQWBBSFrBrRQ/fI
rFXUxR1BSKvVeErUUzAPBgNVHRMBAf8EBTADAQH/MDoGA1UdHwQzMDEwL6AtoCuG
KWh0dHBzOi8va2RzaW50Zi5hbWQuY29tL3ZjZWsvdjEvTWlsYW4vY3JsMEYGCSqG
SIb3DQEBCjA5oA8wDQYJYIZIAWUDBAICBQChHDAaBgkqhkiG9w0BAQgwDQYJYIZI
AWUDBAICBQCiAwIBMKMDAgEBA4ICAQC6m0kDp6zv4Ojfgy+zleehsx6ol0ocgVel
ETobpx+EuCsqVFRPK1jZ1sp/lyd9+0fQ0r66n7kagRk4Ca39g66WGTJMeJdqYriw
STjjDCKVPSesWXYPVAyDhmP5n2v+BYipZWhpvqpaiO+EGK5IBP+578QeW/sSokrK
dHaLAxG2LhZxj9aF73fqC7OAJZ5aPonw4RE299FVarh1Tx2eT3wSgkDgutCTB1Yq
zT5DuwvAe+co2CIVIzMDamYuSFjPN0BCgojl7V+bTou7dMsqIu/TW/rPCX9/EUcp
KGKqPQ3P+N9r1hjEFY1plBg93t53OOo49GNI+V1zvXPLI6xIFVsh+mto2RtgEX/e
pmMKTNN6psW88qg7c1hTWtN6MbRuQ0vm+O+/2tKBF2h8THb94OvvHHoFDpbCELlq
HnIYhxy0YKXGyaW1NjfULxrrmxVW4wcn5E8GddmvNa6yYm8scJagEi13mhGu4Jqh
3QU3sf8iUSUr09xQDwHtOQUVIqx4maBZPBtSMf+qUDtjXSSq8lfWcd8bLr9mdsUn
JZJ0+tuPMKmBnSH860llKk+VpVQsgqbzDIvOLvD6W1Umq25boxCYJ+TuBoa4s+HH
CViAvgT9kf/rBq1d+ivj6skkHxuzcxbk1xv6ZGxrteJxVH7KlX7YRdZ6eARKwLe4
AFZEAwoKCQ==
-----END CERTIFICATE-----
";

/// The trusted Milan ARK.
pub fn milan_ark() -> Result<X509, openssl::error::ErrorStack> {
    X509::from_pem(MILAN_ARK_PEM.as_bytes())
}

/// ASK and ARK of one product line.
#[derive(Clone)]
pub struct AmdChain {
    pub ask: X509,
    pub ark: X509,
}

#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("ARK is not self-signed")]
    ArkNotSelfSigned,
    #[error("ASK is not signed by ARK")]
    AskNotSignedByArk,
    #[error("VCEK is not signed by ASK")]
    VcekNotSignedByAsk,
    #[error("ARK does not match the configured root key")]
    UnexpectedArk,
}

impl AmdChain {
    pub fn validate(&self) -> Result<(), ValidateError> {
        let ark_pubkey = self.ark.public_key()?;

        let ark_signed = self.ark.verify(&ark_pubkey)?;
        if !ark_signed {
            return Err(ValidateError::ArkNotSelfSigned);
        }

        let ask_signed = self.ask.verify(&ark_pubkey)?;
        if !ask_signed {
            return Err(ValidateError::AskNotSignedByArk);
        }

        Ok(())
    }
}

/// Report signing certificate, a VCEK or a VLEK.
#[derive(Clone)]
pub struct Vcek(pub X509);

impl Vcek {
    pub fn from_pem(pem: &str) -> Result<Self, ParseError> {
        let cert = X509::from_pem(pem.as_bytes())?;
        Ok(Self(cert))
    }

    pub fn from_der(der: &[u8]) -> Result<Self, ParseError> {
        let cert = X509::from_der(der)?;
        Ok(Self(cert))
    }

    pub fn validate(&self, amd_chain: &AmdChain) -> Result<(), ValidateError> {
        let ask_pubkey = amd_chain.ask.public_key()?;
        let vcek_signed = self.0.verify(&ask_pubkey)?;
        if !vcek_signed {
            return Err(ValidateError::VcekNotSignedByAsk);
        }

        Ok(())
    }

    /// Compare the TCB and hardware id extensions with the report. Missing
    /// extensions are skipped, VLEKs carry no hardware id.
    pub fn check_extensions(&self, tcb: &Tcb, chip_id: &[u8]) -> Result<(), ParseError> {
        let der = self.0.to_der()?;
        let (_, cert) =
            X509Certificate::from_der(&der).map_err(|e| ParseError::Der(e.to_string()))?;

        for ext in cert.extensions() {
            let oid = ext.oid.to_id_string();
            let expected = match oid.as_str() {
                OID_BL_SPL => tcb.bootloader,
                OID_TEE_SPL => tcb.tee,
                OID_SNP_SPL => tcb.snp,
                OID_UCODE_SPL => tcb.microcode,
                OID_HWID => {
                    if hwid_value(ext.value) != chip_id {
                        return Err(ParseError::Extension("hwID does not match chip id".into()));
                    }
                    continue;
                }
                _ => continue,
            };
            let value = der_integer(ext.value)
                .ok_or_else(|| ParseError::Extension(format!("malformed {oid}")))?;
            if value != u64::from(expected) {
                return Err(ParseError::Extension(format!(
                    "{oid} is {value}, report says {expected}"
                )));
            }
        }
        Ok(())
    }
}

fn der_integer(value: &[u8]) -> Option<u64> {
    let (&tag, rest) = value.split_first()?;
    let (&len, bytes) = rest.split_first()?;
    if tag != 0x02 || len as usize != bytes.len() || bytes.len() > 9 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

// the hwID is either the raw 64 bytes or wrapped in an OCTET STRING
fn hwid_value(value: &[u8]) -> &[u8] {
    match value {
        [0x04, 0x40, rest @ ..] if rest.len() == 64 => rest,
        _ => value,
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("wrong amount of certificates (expected {0:?}, found {1:?})")]
    WrongAmount(usize, usize),
    #[error("unexpected certificate {0:?} in chain")]
    UnexpectedCertificate(String),
    #[error("DER error: {0}")]
    Der(String),
    #[error("{0}")]
    Extension(String),
}

fn common_name(cert: &X509) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// ASK and ARK found in a PEM bundle, either may be missing.
#[derive(Default)]
pub struct PartialChain {
    pub ask: Option<X509>,
    pub ark: Option<X509>,
}

/// Sort the certificates of a multi-pem string into ASK and ARK by common
/// name. At most one of each is accepted.
pub fn parse_chain(pem: &str) -> Result<PartialChain, ParseError> {
    let mut chain = PartialChain::default();
    if pem.trim().is_empty() {
        return Ok(chain);
    }
    let certs = X509::stack_from_pem(pem.as_bytes())?;
    if certs.len() > 2 {
        return Err(ParseError::WrongAmount(2, certs.len()));
    }
    for cert in certs {
        let cn = common_name(&cert);
        let slot = if cn.starts_with("ARK-") {
            &mut chain.ark
        } else if cn.starts_with("SEV-") {
            &mut chain.ask
        } else {
            return Err(ParseError::UnexpectedCertificate(cn));
        };
        if slot.is_some() {
            return Err(ParseError::UnexpectedCertificate(cn));
        }
        *slot = Some(cert);
    }
    Ok(chain)
}

/// build ASK + ARK certificate chain from a multi-pem string
pub fn build_cert_chain(pem: &str) -> Result<AmdChain, ParseError> {
    let partial = parse_chain(pem)?;
    match (partial.ask, partial.ark) {
        (Some(ask), Some(ark)) => Ok(AmdChain { ask, ark }),
        (ask, ark) => Err(ParseError::WrongAmount(
            2,
            usize::from(ask.is_some()) + usize::from(ark.is_some()),
        )),
    }
}

/// GUIDs of the GHCB extended report certificate table.
pub mod guid {
    pub const VCEK: &str = "63da758d-e664-4564-adc5-f4b93be8accd";
    pub const VLEK: &str = "a8074bc2-a25a-483e-aae6-39c045a0b8a1";
    pub const ASK: &str = "4ab7b379-bbac-4fe4-a02f-05aef327c782";
    pub const ARK: &str = "c0b406a4-a803-4952-9743-3fb6014cd0ae";
}

// the table stores GUIDs in the mixed endian EFI layout
fn guid_bytes(guid: &str) -> Option<[u8; 16]> {
    let hex: String = guid.chars().filter(|c| *c != '-').collect();
    let mut bytes: [u8; 16] = hex::decode(hex).ok()?.try_into().ok()?;
    bytes[0..4].reverse();
    bytes[4..6].reverse();
    bytes[6..8].reverse();
    Some(bytes)
}

/// Certificates returned next to an extended report.
#[derive(Default, Debug, Clone)]
pub struct CertTable {
    entries: Vec<([u8; 16], Vec<u8>)>,
}

impl CertTable {
    /// Parse `{guid, offset, length}` entries terminated by an all-zero entry.
    /// Offsets are relative to the start of the table.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut entries = Vec::new();
        let truncated = || ParseError::Der("certificate table truncated".into());
        for entry in bytes.chunks(24) {
            if entry.len() < 24 {
                return Err(truncated());
            }
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&entry[..16]);
            if guid == [0u8; 16] {
                return Ok(Self { entries });
            }
            let offset = u32::from_le_bytes([entry[16], entry[17], entry[18], entry[19]]) as usize;
            let length = u32::from_le_bytes([entry[20], entry[21], entry[22], entry[23]]) as usize;
            let cert = bytes
                .get(offset..offset.saturating_add(length))
                .ok_or_else(truncated)?;
            entries.push((guid, cert.to_vec()));
        }
        if entries.is_empty() {
            return Ok(Self { entries });
        }
        Err(truncated())
    }

    pub fn get(&self, guid: &str) -> Option<&[u8]> {
        let guid = guid_bytes(guid)?;
        self.entries
            .iter()
            .find(|(g, _)| *g == guid)
            .map(|(_, der)| der.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(any(test, feature = "simulator"))]
    pub fn build(certs: &[(&str, &[u8])]) -> Vec<u8> {
        let header_len = (certs.len() + 1) * 24;
        let mut table = Vec::new();
        let mut data = Vec::new();
        for (guid, der) in certs {
            table.extend_from_slice(&guid_bytes(guid).unwrap_or_default());
            table.extend_from_slice(&((header_len + data.len()) as u32).to_le_bytes());
            table.extend_from_slice(&(der.len() as u32).to_le_bytes());
            data.extend_from_slice(der);
        }
        table.extend_from_slice(&[0u8; 24]);
        table.extend_from_slice(&data);
        table
    }
}
