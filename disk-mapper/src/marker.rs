// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One-way "bootstrapped" marker.
//!
//! A node counts as bootstrapped once its cluster id was extended into TPM
//! PCR 12 or, on TDX guests without a vTPM, into RTMR 2. A register that was
//! extended at least once can never return to all zeroes before a reboot.

use cvm_attestation::measurements::{PCR_INDEX_CLUSTER_ID, RTMR_INDEX_CLUSTER_ID};
use cvm_attestation::vtpm::{DeviceOpener, TpmError, TpmOpener};
use sha2::{Digest, Sha256, Sha384};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TPM_DEVICE_PATH: &str = "/dev/tpmrm0";
/// sysfs directory of the TDX guest driver's measurement registers.
pub const TDX_MEASUREMENTS_PATH: &str = "/sys/class/misc/tdx_guest/measurements";
const RTMR_LENGTH: usize = 48;

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error("accessing {path}: {source}")]
    Rtmr {
        path: String,
        source: std::io::Error,
    },
    #[error("neither a TPM nor TDX measurement registers are available")]
    NoDevice,
}

/// RTMRs exposed by the TDX guest driver. Writing a SHA-384 digest to a
/// register file extends it.
pub struct TdxRegisters {
    root: PathBuf,
}

impl Default for TdxRegisters {
    fn default() -> Self {
        Self::new(TDX_MEASUREMENTS_PATH)
    }
}

impl TdxRegisters {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, index: u32) -> PathBuf {
        self.root.join(format!("rtmr{index}:sha384"))
    }

    pub fn read(&self, index: u32) -> Result<Vec<u8>, MarkerError> {
        let path = self.path(index);
        fs::read(&path).map_err(|source| MarkerError::Rtmr {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn extend(&self, index: u32, digest: &[u8; RTMR_LENGTH]) -> Result<(), MarkerError> {
        let path = self.path(index);
        fs::write(&path, digest).map_err(|source| MarkerError::Rtmr {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Device holding the marker register.
pub enum Device {
    Tpm(Box<dyn TpmOpener>),
    Tdx(TdxRegisters),
}

impl Device {
    /// Picks the TDX registers when the guest driver exposes them, the TPM
    /// otherwise.
    pub fn probe() -> Result<Self, MarkerError> {
        if Path::new(TDX_MEASUREMENTS_PATH).is_dir() {
            log::debug!("using RTMR {RTMR_INDEX_CLUSTER_ID} as bootstrapped marker");
            return Ok(Device::Tdx(TdxRegisters::default()));
        }
        if Path::new(TPM_DEVICE_PATH).exists() {
            log::debug!("using PCR {PCR_INDEX_CLUSTER_ID} as bootstrapped marker");
            return Ok(Device::Tpm(Box::new(DeviceOpener)));
        }
        Err(MarkerError::NoDevice)
    }

    fn register(&self) -> Result<Vec<u8>, MarkerError> {
        match self {
            Device::Tpm(opener) => {
                let mut tpm = opener.open()?;
                let mut pcrs = tpm.read_pcrs(&[PCR_INDEX_CLUSTER_ID])?;
                Ok(pcrs.remove(&PCR_INDEX_CLUSTER_ID).unwrap_or_default())
            }
            Device::Tdx(rtmrs) => rtmrs.read(RTMR_INDEX_CLUSTER_ID),
        }
    }

    pub fn is_bootstrapped(&self) -> Result<bool, MarkerError> {
        Ok(self.register()?.iter().any(|b| *b != 0))
    }

    /// Extends the marker register with a digest of `cluster_id`.
    pub fn mark_bootstrapped(&self, cluster_id: &[u8]) -> Result<(), MarkerError> {
        match self {
            Device::Tpm(opener) => {
                let digest: [u8; 32] = Sha256::digest(cluster_id).into();
                opener.open()?.extend_pcr(PCR_INDEX_CLUSTER_ID, &digest)?;
            }
            Device::Tdx(rtmrs) => {
                let mut digest = [0u8; RTMR_LENGTH];
                digest.copy_from_slice(&Sha384::digest(cluster_id));
                rtmrs.extend(RTMR_INDEX_CLUSTER_ID, &digest)?;
            }
        }
        log::info!("marked node as bootstrapped");
        Ok(())
    }
}
