// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reports produced by the Azure paravisor (HCL). The blob wraps a hardware
//! report whose report data commits to a JSON "runtime data" section holding
//! the vTPM attestation key.

use crate::tdx::TdReport;
use jsonwebkey::JsonWebKey;
use memoffset::offset_of;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sev::firmware::guest::AttestationReport as SnpReport;
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::mem::size_of;
use std::ops::Range;
use thiserror::Error;

const TD_REPORT_SIZE: usize = size_of::<TdReport>();
pub const SNP_REPORT_SIZE: usize = size_of::<SnpReport>();
const fn max(a: usize, b: usize) -> usize {
    if a > b {
        return a;
    }
    b
}
const MAX_REPORT_SIZE: usize = max(SNP_REPORT_SIZE, TD_REPORT_SIZE);
const SNP_REPORT_TYPE: u32 = 2;
const TDX_REPORT_TYPE: u32 = 4;
const HW_REPORT_OFFSET: usize = offset_of!(AttestationReport, hw_report);
const VAR_DATA_OFFSET: usize =
    offset_of!(AttestationReport, hcl_data) + offset_of!(IgvmRequestData, variable_data);
const fn report_range(report_size: usize) -> Range<usize> {
    HW_REPORT_OFFSET..(HW_REPORT_OFFSET + report_size)
}
const TD_REPORT_RANGE: Range<usize> = report_range(TD_REPORT_SIZE);
const SNP_REPORT_RANGE: Range<usize> = report_range(SNP_REPORT_SIZE);

#[derive(Error, Debug)]
pub enum HclError {
    #[error("invalid report type")]
    InvalidReportType,
    #[error("AkPub not found")]
    AkPubNotFound,
    #[error("unsupported report data hash {0:?}")]
    UnsupportedHash(IgvmHashType),
    #[error("variable data exceeds report")]
    Truncated,
    #[error("binary parse error")]
    BinaryParseError(#[from] bincode::Error),
    #[error("JSON parse error")]
    JsonParseError(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug)]
struct VarDataKeys {
    keys: Vec<JsonWebKey>,
}

/// The vTPM attestation key of a runtime data section, always its first key.
/// The paravisor publishes it as `HCLAkPub`.
pub fn ak_pub_from_var_data(var_data: &[u8]) -> Result<JsonWebKey, HclError> {
    let VarDataKeys { keys } = serde_json::from_slice(var_data)?;
    keys.into_iter().next().ok_or(HclError::AkPubNotFound)
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum IgvmHashType {
    Invalid = 0,
    Sha256,
    Sha384,
    Sha512,
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct IgvmRequestData {
    data_size: u32,
    version: u32,
    report_type: u32,
    report_data_hash_type: IgvmHashType,
    variable_data_size: u32,
    variable_data: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct AttestationHeader {
    signature: u32,
    version: u32,
    report_size: u32,
    request_type: u32,
    status: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct AttestationReport {
    header: AttestationHeader,
    #[serde(with = "BigArray")]
    hw_report: [u8; MAX_REPORT_SIZE],
    hcl_data: IgvmRequestData,
}

pub struct HclReport {
    bytes: Vec<u8>,
    attestation_report: AttestationReport,
    report_type: ReportType,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReportType {
    Tdx,
    Snp,
}

impl HclReport {
    /// Parse a HCL report from a byte slice.
    pub fn new(bytes: Vec<u8>) -> Result<Self, HclError> {
        let attestation_report: AttestationReport = bincode::deserialize(&bytes)?;
        let report_type = match attestation_report.hcl_data.report_type {
            TDX_REPORT_TYPE => ReportType::Tdx,
            SNP_REPORT_TYPE => ReportType::Snp,
            _ => return Err(HclError::InvalidReportType),
        };
        let var_data_end =
            VAR_DATA_OFFSET + attestation_report.hcl_data.variable_data_size as usize;
        if var_data_end > bytes.len() {
            return Err(HclError::Truncated);
        }

        let report = Self {
            bytes,
            attestation_report,
            report_type,
        };
        Ok(report)
    }

    /// Get the type of the nested hardware report
    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    /// Raw bytes of the nested hardware report.
    pub fn hw_report(&self) -> &[u8] {
        match self.report_type {
            ReportType::Tdx => self.bytes[TD_REPORT_RANGE].as_ref(),
            ReportType::Snp => self.bytes[SNP_REPORT_RANGE].as_ref(),
        }
    }

    /// Get the SHA256 hash of the VarData section
    pub fn var_data_sha256(&self) -> Result<[u8; 32], HclError> {
        let hash_type = self.attestation_report.hcl_data.report_data_hash_type;
        if hash_type != IgvmHashType::Sha256 {
            return Err(HclError::UnsupportedHash(hash_type));
        }
        Ok(Sha256::digest(self.var_data()).into())
    }

    /// Get the slice of the VarData section
    pub fn var_data(&self) -> &[u8] {
        let hcl_data = &self.attestation_report.hcl_data;
        let var_data_end = VAR_DATA_OFFSET + hcl_data.variable_data_size as usize;
        &self.bytes[VAR_DATA_OFFSET..var_data_end]
    }

    /// Get the vTPM's AKpub from the VarData section
    pub fn ak_pub(&self) -> Result<JsonWebKey, HclError> {
        ak_pub_from_var_data(self.var_data())
    }
}

impl TryFrom<&HclReport> for TdReport {
    type Error = HclError;

    fn try_from(hcl_report: &HclReport) -> Result<Self, Self::Error> {
        if hcl_report.report_type != ReportType::Tdx {
            return Err(HclError::InvalidReportType);
        }
        let bytes = hcl_report.hw_report();
        let td_report = bincode::deserialize::<TdReport>(bytes)?;
        Ok(td_report)
    }
}

/// Assemble an HCL blob around a hardware report.
#[cfg(any(test, feature = "simulator"))]
pub fn build_report(report_type: ReportType, hw_report: &[u8], var_data: &[u8]) -> Vec<u8> {
    let report_type = match report_type {
        ReportType::Tdx => TDX_REPORT_TYPE,
        ReportType::Snp => SNP_REPORT_TYPE,
    };
    let mut bytes = vec![0u8; VAR_DATA_OFFSET];
    let len = hw_report.len().min(MAX_REPORT_SIZE);
    bytes[HW_REPORT_OFFSET..HW_REPORT_OFFSET + len].copy_from_slice(&hw_report[..len]);

    let hcl_data = offset_of!(AttestationReport, hcl_data);
    let fields = [
        (VAR_DATA_OFFSET - hcl_data + var_data.len()) as u32,
        1,
        report_type,
        IgvmHashType::Sha256 as u32,
        var_data.len() as u32,
    ];
    for (i, field) in fields.iter().enumerate() {
        let at = hcl_data + i * 4;
        bytes[at..at + 4].copy_from_slice(&field.to_le_bytes());
    }
    bytes.extend_from_slice(var_data);
    bytes
}

/// Runtime data section naming `modulus` as the vTPM attestation key.
#[cfg(any(test, feature = "simulator"))]
pub fn runtime_data(modulus: &[u8]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "keys": [{
            "kid": "HCLAkPub",
            "kty": "RSA",
            "e": "AQAB",
            "n": base64_url::encode(modulus),
        }],
        "vm-configuration": {
            "secure-boot": true,
            "tpm-enabled": true,
        },
    }))
    .unwrap_or_default()
}
