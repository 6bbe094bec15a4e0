// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Types are based on "Architecture Specification: Intel Trust Domain Extensions
// Module 1.0", Feb 2023, Section 22.6 and the "Intel TDX DCAP Quoting Library
// API", Appendix A.

use crate::measurements::TDX_MEASUREMENT_LENGTH;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zerocopy::AsBytes;

pub(crate) mod verify;

#[cfg(any(test, feature = "simulator"))]
pub use verify::AcceptingVerifier;
pub use verify::{
    DcapVerifier, TdxPolicy, TdxQuoteVerifier, TdxVerifyError, DEFAULT_PCCS_URL,
    INTEL_QE_VENDOR_ID,
};

pub const TEE_TYPE_TDX: u32 = 0x81;
const QUOTE_VERSION_4: u16 = 4;
const QUOTE_HEADER_SIZE: usize = std::mem::size_of::<QuoteHeader>();
const QUOTE_BODY_SIZE: usize = std::mem::size_of::<TdQuoteBody>();
/// TD attribute bit marking an off-TD debuggable guest.
const TD_ATTRIBUTE_DEBUG: u8 = 0x01;
const MEASUREMENTS_PATH: &str = "/sys/class/misc/tdx_guest/measurements";

#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportType {
    pub r#type: u8,
    pub subtype: u8,
    pub version: u8,
    pub _reserved: u8,
}

#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportMac {
    pub reporttype: ReportType,
    pub _reserved_1: [u8; 12],
    pub cpusvn: [u8; 16],
    #[serde(with = "BigArray")]
    pub tee_tcb_info_hash: [u8; 48],
    #[serde(with = "BigArray")]
    pub tee_info_hash: [u8; 48],
    #[serde(with = "BigArray")]
    pub reportdata: [u8; 64],
    pub _reserved_2: [u8; 32],
    pub mac: [u8; 32],
}

#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rtmr {
    #[serde(with = "BigArray")]
    pub register_data: [u8; 48],
}

#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TdInfo {
    pub attributes: [u8; 8],
    pub xfam: [u8; 8],
    #[serde(with = "BigArray")]
    pub mrtd: [u8; 48],
    #[serde(with = "BigArray")]
    pub mrconfigid: [u8; 48],
    #[serde(with = "BigArray")]
    pub mrowner: [u8; 48],
    #[serde(with = "BigArray")]
    pub mrownerconfig: [u8; 48],
    pub rtrm: [Rtmr; 4],
    #[serde(with = "BigArray")]
    pub _reserved: [u8; 112],
}

/// TDREPORT as returned by the TDX module, the input to quote generation.
#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TdReport {
    pub report_mac: ReportMac,
    #[serde(with = "BigArray")]
    pub tee_tcb_info: [u8; 239],
    pub _reserved: [u8; 17],
    pub tdinfo: TdInfo,
}

#[derive(Error, Debug)]
pub enum QuoteError {
    #[error("quote too short")]
    TooShort,
    #[error("unsupported quote version {0}")]
    Version(u16),
    #[error("not a TDX quote (tee type {0:#x})")]
    TeeType(u32),
    #[error("binary parse error")]
    Parse(#[from] bincode::Error),
}

#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QuoteHeader {
    pub version: u16,
    pub att_key_type: u16,
    pub tee_type: u32,
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

#[repr(C)]
#[derive(AsBytes, Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TdQuoteBody {
    pub tee_tcb_svn: [u8; 16],
    #[serde(with = "BigArray")]
    pub mr_seam: [u8; 48],
    #[serde(with = "BigArray")]
    pub mr_signer_seam: [u8; 48],
    pub seam_attributes: [u8; 8],
    pub td_attributes: [u8; 8],
    pub xfam: [u8; 8],
    #[serde(with = "BigArray")]
    pub mr_td: [u8; 48],
    #[serde(with = "BigArray")]
    pub mr_config_id: [u8; 48],
    #[serde(with = "BigArray")]
    pub mr_owner: [u8; 48],
    #[serde(with = "BigArray")]
    pub mr_owner_config: [u8; 48],
    pub rtmr: [Rtmr; 4],
    #[serde(with = "BigArray")]
    pub report_data: [u8; 64],
}

/// A version 4 TDX quote. The signature section is kept in `raw` and only
/// interpreted by a [`TdxQuoteVerifier`].
#[derive(Clone, Debug, PartialEq)]
pub struct TdxQuote {
    pub header: QuoteHeader,
    pub body: TdQuoteBody,
    raw: Vec<u8>,
}

impl TdxQuote {
    pub fn parse(bytes: &[u8]) -> Result<Self, QuoteError> {
        if bytes.len() < QUOTE_HEADER_SIZE + QUOTE_BODY_SIZE {
            return Err(QuoteError::TooShort);
        }
        let header: QuoteHeader = bincode::deserialize(&bytes[..QUOTE_HEADER_SIZE])?;
        if header.version != QUOTE_VERSION_4 {
            return Err(QuoteError::Version(header.version));
        }
        if header.tee_type != TEE_TYPE_TDX {
            return Err(QuoteError::TeeType(header.tee_type));
        }
        let body: TdQuoteBody = bincode::deserialize(
            &bytes[QUOTE_HEADER_SIZE..QUOTE_HEADER_SIZE + QUOTE_BODY_SIZE],
        )?;
        Ok(Self {
            header,
            body,
            raw: bytes.to_vec(),
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_debug(&self) -> bool {
        self.body.td_attributes[0] & TD_ATTRIBUTE_DEBUG != 0
    }

    /// MRTD at index 0 followed by RTMR0-3 at indices 1-4.
    pub fn measurements(&self) -> BTreeMap<u32, Vec<u8>> {
        std::iter::once(self.body.mr_td.to_vec())
            .chain(self.body.rtmr.iter().map(|r| r.register_data.to_vec()))
            .enumerate()
            .map(|(i, m)| (i as u32, m))
            .collect()
    }
}

/// Serialize a quote with an opaque signature section. Used to build test
/// quotes and by simulated platforms.
#[cfg(any(test, feature = "simulator"))]
pub fn build_quote(header: &QuoteHeader, body: &TdQuoteBody, signature: &[u8]) -> Vec<u8> {
    let mut quote = header.as_bytes().to_vec();
    quote.extend_from_slice(body.as_bytes());
    quote.extend_from_slice(&(signature.len() as u32).to_le_bytes());
    quote.extend_from_slice(signature);
    quote
}

#[cfg(any(test, feature = "simulator"))]
pub fn empty_quote_parts() -> (QuoteHeader, TdQuoteBody) {
    let header = QuoteHeader {
        version: QUOTE_VERSION_4,
        att_key_type: 2,
        tee_type: TEE_TYPE_TDX,
        qe_svn: 0,
        pce_svn: 0,
        qe_vendor_id: [0; 16],
        user_data: [0; 20],
    };
    let rtmr = Rtmr {
        register_data: [0; 48],
    };
    let body = TdQuoteBody {
        tee_tcb_svn: [0; 16],
        mr_seam: [0; 48],
        mr_signer_seam: [0; 48],
        seam_attributes: [0; 8],
        td_attributes: [0; 8],
        xfam: [0; 8],
        mr_td: [0; 48],
        mr_config_id: [0; 48],
        mr_owner: [0; 48],
        mr_owner_config: [0; 48],
        rtmr: [rtmr; 4],
        report_data: [0; 64],
    };
    (header, body)
}

#[derive(Error, Debug)]
pub enum RtmrError {
    #[error("rtmr index {0} out of range")]
    Index(u32),
    #[error("unexpected rtmr length {0}")]
    Length(usize),
    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// Runtime measurement registers exposed by the TDX guest driver.
pub struct Rtmrs {
    root: PathBuf,
}

impl Default for Rtmrs {
    fn default() -> Self {
        Self::new(MEASUREMENTS_PATH)
    }
}

impl Rtmrs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, index: u32) -> Result<PathBuf, RtmrError> {
        if index > 3 {
            return Err(RtmrError::Index(index));
        }
        Ok(self.root.join(format!("rtmr{index}:sha384")))
    }

    pub fn read(&self, index: u32) -> Result<Vec<u8>, RtmrError> {
        let value = fs::read(self.path(index)?)?;
        if value.len() != TDX_MEASUREMENT_LENGTH {
            return Err(RtmrError::Length(value.len()));
        }
        Ok(value)
    }

    /// Extend `digest` into the register.
    pub fn extend(&self, index: u32, digest: &[u8; TDX_MEASUREMENT_LENGTH]) -> Result<(), RtmrError> {
        fs::write(self.path(index)?, digest)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quote() {
        let (header, mut body) = empty_quote_parts();
        body.mr_td = [0x11; 48];
        body.rtmr[2].register_data = [0x22; 48];
        body.report_data[..4].copy_from_slice(b"data");
        body.td_attributes[0] = TD_ATTRIBUTE_DEBUG;
        let raw = build_quote(&header, &body, &[0xAB; 64]);

        let quote = TdxQuote::parse(&raw).unwrap();
        assert_eq!(quote.body, body);
        assert_eq!(quote.raw(), &raw[..]);
        assert!(quote.is_debug());

        let m = quote.measurements();
        assert_eq!(m.len(), 5);
        assert_eq!(m[&0], vec![0x11; 48]);
        assert_eq!(m[&3], vec![0x22; 48]);
    }

    #[test]
    fn rejects_wrong_quotes() {
        let (mut header, body) = empty_quote_parts();
        assert!(matches!(
            TdxQuote::parse(&[0u8; 100]),
            Err(QuoteError::TooShort)
        ));

        header.version = 5;
        let raw = build_quote(&header, &body, &[]);
        assert!(matches!(TdxQuote::parse(&raw), Err(QuoteError::Version(5))));

        header.version = 4;
        header.tee_type = 0;
        let raw = build_quote(&header, &body, &[]);
        assert!(matches!(TdxQuote::parse(&raw), Err(QuoteError::TeeType(0))));
    }

    #[test]
    fn layout() {
        assert_eq!(QUOTE_HEADER_SIZE, 48);
        assert_eq!(QUOTE_BODY_SIZE, 584);
        assert_eq!(std::mem::size_of::<TdReport>(), 1024);
    }

    #[test]
    fn rtmr_files() {
        let root = std::env::temp_dir().join(format!("rtmr-test-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        let rtmrs = Rtmrs::new(&root);
        rtmrs.extend(2, &[7u8; 48]).unwrap();
        assert_eq!(rtmrs.read(2).unwrap(), vec![7u8; 48]);
        assert!(matches!(rtmrs.read(4), Err(RtmrError::Index(4))));
        fs::write(root.join("rtmr0:sha384"), [1, 2]).unwrap();
        assert!(matches!(rtmrs.read(0), Err(RtmrError::Length(2))));
        fs::remove_dir_all(&root).unwrap();
    }
}
