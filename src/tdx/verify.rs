// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::TdxQuote;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_PCCS_URL: &str = "https://api.trustedservices.intel.com/tdx/certification/v4";
/// Intel's SGX/TDX provisioning vendor id.
pub const INTEL_QE_VENDOR_ID: [u8; 16] = [
    0x93, 0x9a, 0x72, 0x33, 0xf7, 0x9c, 0x4c, 0xa9, 0x94, 0x0a, 0x0d, 0xb3, 0x95, 0x7f, 0x06, 0x07,
];

#[derive(Error, Debug)]
pub enum TdxVerifyError {
    #[error("failed to fetch collateral: {0}")]
    Collateral(String),
    #[error("quote verification failed: {0}")]
    Quote(String),
    #[error("tcb status {0} not allowed")]
    Status(String),
    #[error("{0}")]
    Policy(String),
    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Verifies a quote's signature chain up to the Intel root.
pub trait TdxQuoteVerifier: Send + Sync {
    fn verify(&self, quote: &[u8]) -> Result<(), TdxVerifyError>;
}

/// DCAP verification with collateral from a PCCS.
pub struct DcapVerifier {
    pccs_url: String,
    allowed_status: Vec<String>,
    root: Option<X509>,
}

impl Default for DcapVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_PCCS_URL)
    }
}

impl DcapVerifier {
    pub fn new(pccs_url: &str) -> Self {
        Self {
            pccs_url: pccs_url.to_string(),
            allowed_status: vec!["UpToDate".into(), "SWHardeningNeeded".into()],
            root: None,
        }
    }

    /// Require the collateral to chain to `root`.
    pub fn with_root(mut self, root: X509) -> Self {
        self.root = Some(root);
        self
    }

    fn check_root(&self, issuer_chain: &str) -> Result<(), TdxVerifyError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let chain = X509::stack_from_pem(issuer_chain.as_bytes())
            .map_err(|e| TdxVerifyError::Collateral(e.to_string()))?;
        let der = |c: &X509| c.to_der().map_err(|e| TdxVerifyError::Quote(e.to_string()));
        match chain.last() {
            Some(last) if der(last)? == der(root)? => Ok(()),
            _ => Err(TdxVerifyError::Quote(
                "collateral does not chain to the configured Intel root".into(),
            )),
        }
    }

    pub fn with_allowed_status(mut self, status: Vec<String>) -> Self {
        self.allowed_status = status;
        self
    }
}

impl TdxQuoteVerifier for DcapVerifier {
    fn verify(&self, quote: &[u8]) -> Result<(), TdxVerifyError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let collateral = runtime
            .block_on(dcap_qvl::collateral::get_collateral(&self.pccs_url, quote))
            .map_err(|e| TdxVerifyError::Collateral(e.to_string()))?;
        self.check_root(&collateral.tcb_info_issuer_chain)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TdxVerifyError::Quote(e.to_string()))?
            .as_secs();
        let verified = dcap_qvl::verify::verify(quote, &collateral, now)
            .map_err(|e| TdxVerifyError::Quote(e.to_string()))?;

        let status = verified.status;
        if !self
            .allowed_status
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&status))
        {
            return Err(TdxVerifyError::Status(status));
        }
        log::debug!("TDX quote verified with tcb status {status}");
        Ok(())
    }
}

pub(crate) mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Platform requirements on the quote header and the TDX module.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TdxPolicy {
    #[serde(rename = "qeSVN", alias = "qeSvn", default)]
    pub qe_svn: u16,
    #[serde(rename = "pceSVN", alias = "pceSvn", default)]
    pub pce_svn: u16,
    #[serde(rename = "teeTCBSVN", alias = "teeTcbSvn", default, with = "hex_opt")]
    pub tee_tcb_svn: Option<Vec<u8>>,
    #[serde(rename = "qeVendorID", alias = "qeVendorId", default, with = "hex_opt")]
    pub qe_vendor_id: Option<Vec<u8>>,
    #[serde(rename = "mrSeam", default, with = "hex_opt")]
    pub mr_seam: Option<Vec<u8>>,
    #[serde(rename = "xfam", default, with = "hex_opt")]
    pub xfam: Option<Vec<u8>>,
}

impl TdxPolicy {
    pub fn check(&self, quote: &TdxQuote) -> Result<(), TdxVerifyError> {
        let policy = |msg: String| Err(TdxVerifyError::Policy(msg));
        if quote.is_debug() {
            return policy("TD is debuggable".into());
        }
        if quote.header.qe_svn < self.qe_svn {
            return policy(format!(
                "QE SVN {} below minimum {}",
                quote.header.qe_svn, self.qe_svn
            ));
        }
        if quote.header.pce_svn < self.pce_svn {
            return policy(format!(
                "PCE SVN {} below minimum {}",
                quote.header.pce_svn, self.pce_svn
            ));
        }
        if let Some(min) = &self.tee_tcb_svn {
            let below = quote
                .body
                .tee_tcb_svn
                .iter()
                .zip(min)
                .any(|(have, want)| have < want);
            if below {
                return policy("TEE TCB SVN below minimum".into());
            }
        }
        if let Some(vendor) = &self.qe_vendor_id {
            if quote.header.qe_vendor_id[..] != vendor[..] {
                return policy("unexpected QE vendor id".into());
            }
        }
        if let Some(mr_seam) = &self.mr_seam {
            if quote.body.mr_seam[..] != mr_seam[..] {
                return policy("unexpected MRSEAM".into());
            }
        }
        if let Some(xfam) = &self.xfam {
            if quote.body.xfam[..] != xfam[..] {
                return policy("unexpected XFAM".into());
            }
        }
        Ok(())
    }
}

/// Accepts every quote. Only for simulated platforms.
#[cfg(any(test, feature = "simulator"))]
pub struct AcceptingVerifier;

#[cfg(any(test, feature = "simulator"))]
impl TdxQuoteVerifier for AcceptingVerifier {
    fn verify(&self, _quote: &[u8]) -> Result<(), TdxVerifyError> {
        Ok(())
    }
}
