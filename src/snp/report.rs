// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Layout follows "SEV Secure Nested Paging Firmware ABI Specification",
// Table 22 (ATTESTATION_REPORT structure).

use openssl::x509::X509;
use openssl::{ecdsa::EcdsaSig, sha::Sha384};
use serde::{Deserialize, Serialize};
use sev::firmware::guest::AttestationReport;
use std::fmt;
use thiserror::Error;

pub const REPORT_SIZE: usize = 0x4a0;
const SIGNED_LEN: usize = 0x2a0;
const POLICY_OFFSET: usize = 0x08;
const POLICY_DEBUG_BIT: u64 = 1 << 19;
const VMPL_OFFSET: usize = 0x30;
const CURRENT_TCB_OFFSET: usize = 0x38;
const SIGNER_INFO_OFFSET: usize = 0x48;
const REPORT_DATA_OFFSET: usize = 0x50;
const MEASUREMENT_OFFSET: usize = 0x90;
const ID_KEY_DIGEST_OFFSET: usize = 0xe0;
const REPORTED_TCB_OFFSET: usize = 0x180;
const CHIP_ID_OFFSET: usize = 0x1a0;
const COMMITTED_TCB_OFFSET: usize = 0x1e0;
const LAUNCH_TCB_OFFSET: usize = 0x1f0;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report is {0} bytes, expected at least {REPORT_SIZE}")]
    Length(usize),
    #[error("deserialization error")]
    Parse(#[from] Box<bincode::ErrorKind>),
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("Measurement signature is not valid")]
    MeasurementSignature,
}

/// Security version numbers of the firmware components.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tcb {
    pub bootloader: u8,
    pub tee: u8,
    pub snp: u8,
    pub microcode: u8,
}

impl Tcb {
    fn from_bytes(b: &[u8]) -> Self {
        Self {
            bootloader: b[0],
            tee: b[1],
            snp: b[6],
            microcode: b[7],
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        [self.bootloader, self.tee, 0, 0, 0, 0, self.snp, self.microcode]
    }

    /// Component-wise comparison.
    pub fn at_least(&self, min: &Tcb) -> bool {
        self.bootloader >= min.bootloader
            && self.tee >= min.tee
            && self.snp >= min.snp
            && self.microcode >= min.microcode
    }
}

impl fmt::Display for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bootloader {} tee {} snp {} microcode {}",
            self.bootloader, self.tee, self.snp, self.microcode
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SigningKey {
    Vcek,
    Vlek,
    Unknown(u8),
}

/// An SNP attestation report together with its raw bytes.
#[derive(Clone, Debug)]
pub struct SnpReport {
    raw: Vec<u8>,
    parsed: AttestationReport,
}

impl SnpReport {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReportError> {
        if bytes.len() < REPORT_SIZE {
            return Err(ReportError::Length(bytes.len()));
        }
        let raw = bytes[..REPORT_SIZE].to_vec();
        let parsed = bincode::deserialize::<AttestationReport>(&raw)?;
        Ok(Self { raw, parsed })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.raw[offset..offset + 4]);
        u32::from_le_bytes(b)
    }

    fn policy(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw[POLICY_OFFSET..POLICY_OFFSET + 8]);
        u64::from_le_bytes(b)
    }

    pub fn debug_allowed(&self) -> bool {
        self.policy() & POLICY_DEBUG_BIT != 0
    }

    pub fn vmpl(&self) -> u32 {
        self.u32_at(VMPL_OFFSET)
    }

    pub fn signing_key(&self) -> SigningKey {
        match (self.u32_at(SIGNER_INFO_OFFSET) >> 2) & 0x7 {
            0 => SigningKey::Vcek,
            1 => SigningKey::Vlek,
            other => SigningKey::Unknown(other as u8),
        }
    }

    pub fn current_tcb(&self) -> Tcb {
        Tcb::from_bytes(&self.raw[CURRENT_TCB_OFFSET..])
    }

    pub fn reported_tcb(&self) -> Tcb {
        Tcb::from_bytes(&self.raw[REPORTED_TCB_OFFSET..])
    }

    pub fn committed_tcb(&self) -> Tcb {
        Tcb::from_bytes(&self.raw[COMMITTED_TCB_OFFSET..])
    }

    pub fn launch_tcb(&self) -> Tcb {
        Tcb::from_bytes(&self.raw[LAUNCH_TCB_OFFSET..])
    }

    pub fn report_data(&self) -> &[u8] {
        &self.raw[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + 64]
    }

    pub fn measurement(&self) -> &[u8] {
        &self.raw[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + 48]
    }

    pub fn id_key_digest(&self) -> &[u8] {
        &self.raw[ID_KEY_DIGEST_OFFSET..ID_KEY_DIGEST_OFFSET + 48]
    }

    pub fn chip_id(&self) -> &[u8] {
        &self.raw[CHIP_ID_OFFSET..CHIP_ID_OFFSET + 64]
    }

    /// Verify the report signature with the VCEK or VLEK.
    pub fn verify_signature(&self, signer: &X509) -> Result<(), ReportError> {
        let report_sig: EcdsaSig = (&self.parsed.signature).try_into()?;
        let signer_pubkey = signer.public_key()?.ec_key()?;

        let mut hasher = Sha384::new();
        hasher.update(&self.raw[..SIGNED_LEN]);
        let base_message_digest = hasher.finish();

        if !report_sig.verify(&base_message_digest, &signer_pubkey)? {
            return Err(ReportError::MeasurementSignature);
        }
        Ok(())
    }
}

/// Builder for synthetic reports.
#[cfg(any(test, feature = "simulator"))]
pub struct ReportBuilder {
    raw: Vec<u8>,
}

#[cfg(any(test, feature = "simulator"))]
impl Default for ReportBuilder {
    fn default() -> Self {
        let mut raw = vec![0u8; REPORT_SIZE];
        raw[0] = 2; // version
        raw[0x34] = 1; // ECDSA P-384 with SHA-384
        Self { raw }
    }
}

#[cfg(any(test, feature = "simulator"))]
impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.raw[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn debug(self, debug: bool) -> Self {
        let debug_bit = if debug { POLICY_DEBUG_BIT } else { 0 };
        // reserved bit 17 is always set
        let policy: u64 = debug_bit | (1 << 17);
        self.put(POLICY_OFFSET, &policy.to_le_bytes())
    }

    pub fn vmpl(self, vmpl: u32) -> Self {
        self.put(VMPL_OFFSET, &vmpl.to_le_bytes())
    }

    pub fn signing_key(self, key: SigningKey) -> Self {
        let sel: u32 = match key {
            SigningKey::Vcek => 0,
            SigningKey::Vlek => 1,
            SigningKey::Unknown(v) => v.into(),
        };
        self.put(SIGNER_INFO_OFFSET, &(sel << 2).to_le_bytes())
    }

    /// Set current, reported, committed and launch TCB alike.
    pub fn tcb(self, tcb: Tcb) -> Self {
        let b = tcb.to_bytes();
        self.put(CURRENT_TCB_OFFSET, &b)
            .put(REPORTED_TCB_OFFSET, &b)
            .put(COMMITTED_TCB_OFFSET, &b)
            .put(LAUNCH_TCB_OFFSET, &b)
    }

    pub fn launch_tcb(self, tcb: Tcb) -> Self {
        self.put(LAUNCH_TCB_OFFSET, &tcb.to_bytes())
    }

    pub fn reported_tcb(self, tcb: Tcb) -> Self {
        self.put(REPORTED_TCB_OFFSET, &tcb.to_bytes())
    }

    pub fn report_data(self, data: &[u8]) -> Self {
        self.put(REPORT_DATA_OFFSET, &data[..data.len().min(64)])
    }

    pub fn id_key_digest(self, digest: &[u8; 48]) -> Self {
        self.put(ID_KEY_DIGEST_OFFSET, digest)
    }

    pub fn chip_id(self, chip_id: &[u8; 64]) -> Self {
        self.put(CHIP_ID_OFFSET, chip_id)
    }

    /// Sign with `key`, storing r and s little endian as the firmware does.
    pub fn sign(mut self, key: &openssl::ec::EcKeyRef<openssl::pkey::Private>) -> Vec<u8> {
        let mut hasher = Sha384::new();
        hasher.update(&self.raw[..SIGNED_LEN]);
        let digest = hasher.finish();
        let sig = EcdsaSig::sign(&digest, key).unwrap_or_else(|e| panic!("sign report: {e}"));
        for (offset, component) in [(0x2a0, sig.r()), (0x2e8, sig.s())] {
            let mut le = component.to_vec();
            le.reverse();
            self.raw[offset..offset + le.len()].copy_from_slice(&le);
        }
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snp::testutil::TestChain;

    #[test]
    fn field_accessors() {
        let tcb = Tcb {
            bootloader: 3,
            tee: 0,
            snp: 8,
            microcode: 115,
        };
        let chain = TestChain::new(tcb, &[9; 64]);
        let raw = ReportBuilder::new()
            .debug(true)
            .vmpl(1)
            .signing_key(SigningKey::Vlek)
            .tcb(tcb)
            .chip_id(&[9; 64])
            .report_data(&[5; 64])
            .sign(&chain.vcek_key);
        let report = SnpReport::from_bytes(&raw).unwrap();
        assert!(report.debug_allowed());
        assert_eq!(report.vmpl(), 1);
        assert_eq!(report.signing_key(), SigningKey::Vlek);
        assert_eq!(report.committed_tcb(), tcb);
        assert_eq!(report.launch_tcb(), tcb);
        assert_eq!(report.chip_id(), &[9; 64][..]);
        assert_eq!(report.report_data(), &[5; 64][..]);
    }

    #[test]
    fn signature() {
        let chain = TestChain::new(Tcb::default(), &[1; 64]);
        let raw = ReportBuilder::new().sign(&chain.vcek_key);
        let report = SnpReport::from_bytes(&raw).unwrap();
        assert!(report.verify_signature(&chain.vcek).is_ok());

        let mut tampered = raw.clone();
        tampered[REPORT_DATA_OFFSET] ^= 1;
        let report = SnpReport::from_bytes(&tampered).unwrap();
        assert!(matches!(
            report.verify_signature(&chain.vcek),
            Err(ReportError::MeasurementSignature)
        ));

        let other = TestChain::new(Tcb::default(), &[1; 64]);
        let report = SnpReport::from_bytes(&raw).unwrap();
        assert!(report.verify_signature(&other.vcek).is_err());
    }

    #[test]
    fn short_report() {
        assert!(matches!(
            SnpReport::from_bytes(&[0u8; 100]),
            Err(ReportError::Length(100))
        ));
    }

    #[test]
    fn tcb_ordering() {
        let min = Tcb {
            bootloader: 2,
            tee: 0,
            snp: 6,
            microcode: 93,
        };
        assert!(min.at_least(&min));
        assert!(!Tcb { snp: 5, ..min }.at_least(&min));
        assert!(Tcb { microcode: 200, ..min }.at_least(&min));
    }
}
