// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process TPM producing genuine quotes and signatures with a software key.

use super::{ak_template, AkPolicy, HashAlg, PcrValue, Quote, TpmDevice, TpmError, TpmOpener};
use crate::eventlog::EventLogBuilder;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tss_esapi::structures::PublicKeyRsa;
use tss_esapi::traits::Marshall;

const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;
const TPM_ALG_SHA256: u16 = 0x000b;
const EV_IPL: u32 = 0xd;
const PCR_COUNT: usize = 24;

struct State {
    key: PKey<Private>,
    ak_pub: Vec<u8>,
    pcrs: [[u8; 32]; PCR_COUNT],
    nv: BTreeMap<u32, Vec<u8>>,
    log: EventLogBuilder,
    open_devices: usize,
    clock: u64,
}

/// Shared simulator state. Clones observe the same PCRs, NV and key.
#[derive(Clone)]
pub struct SimulatedTpm {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    pub fn new() -> Self {
        Self::try_new().unwrap_or_else(|e| panic!("simulated TPM setup failed: {e}"))
    }

    fn try_new() -> Result<Self, TpmError> {
        let rsa = Rsa::generate(2048)?;
        let modulus = PublicKeyRsa::try_from(rsa.n().to_vec())?;
        let ak_pub = ak_template(Some(modulus))?.marshall()?;
        let state = State {
            key: PKey::from_rsa(rsa)?,
            ak_pub,
            pcrs: [[0u8; 32]; PCR_COUNT],
            nv: BTreeMap::new(),
            log: EventLogBuilder::new(),
            open_devices: 0,
            clock: 0,
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_nv(self, index: u32, data: impl Into<Vec<u8>>) -> Self {
        self.lock().nv.insert(index, data.into());
        self
    }

    /// Measure `data` into `pcr` and record it in the event log.
    pub fn measure(&self, pcr: u32, data: &[u8]) {
        let mut state = self.lock();
        let digest = state.log.measure(pcr, EV_IPL, data);
        extend(&mut state.pcrs[pcr as usize], &digest);
    }

    /// Record the platform events GCE firmware writes into PCR 0.
    pub fn measure_gce_platform(&self, technology: u8, firmware_version: u32) {
        let mut state = self.lock();
        let digest = state.log.gce_nonhost_info(technology);
        extend(&mut state.pcrs[0], &digest);
        let digest = state.log.gce_firmware(firmware_version);
        extend(&mut state.pcrs[0], &digest);
    }

    pub fn pcr(&self, index: u32) -> [u8; 32] {
        self.lock().pcrs[index as usize]
    }

    pub fn ak_pub_area(&self) -> Vec<u8> {
        self.lock().ak_pub.clone()
    }

    pub fn ak_public_key(&self) -> PKey<Public> {
        let state = self.lock();
        let der = state
            .key
            .public_key_to_der()
            .unwrap_or_else(|e| panic!("export simulated AK: {e}"));
        PKey::public_key_from_der(&der).unwrap_or_else(|e| panic!("import simulated AK: {e}"))
    }

    /// Number of devices currently open.
    pub fn open_devices(&self) -> usize {
        self.lock().open_devices
    }
}

impl TpmOpener for SimulatedTpm {
    fn open(&self) -> Result<Box<dyn TpmDevice>, TpmError> {
        self.lock().open_devices += 1;
        Ok(Box::new(SimulatedDevice {
            tpm: self.clone(),
            ak_loaded: false,
        }))
    }
}

fn extend(pcr: &mut [u8; 32], digest: &[u8; 32]) {
    let mut hasher = Sha256::new();
    hasher.update(*pcr);
    hasher.update(digest);
    *pcr = hasher.finalize().into();
}

pub struct SimulatedDevice {
    tpm: SimulatedTpm,
    ak_loaded: bool,
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let mut state = self.tpm.lock();
        state.open_devices = state.open_devices.saturating_sub(1);
    }
}

impl SimulatedDevice {
    fn sign_with_ak(&self, state: &State, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        if !self.ak_loaded {
            return Err(TpmError::NoAttestationKey);
        }
        let mut signer = Signer::new(MessageDigest::sha256(), &state.key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }
}

impl TpmDevice for SimulatedDevice {
    fn load_ak(&mut self, _policy: AkPolicy) -> Result<Vec<u8>, TpmError> {
        self.ak_loaded = true;
        Ok(self.tpm.ak_pub_area())
    }

    fn quote(&mut self, nonce: &[u8], pcrs: &[u32]) -> Result<Quote, TpmError> {
        if nonce.len() > 64 {
            return Err(TpmError::DataTooLarge);
        }
        let values = self.read_pcrs(pcrs)?;
        let mut state = self.tpm.lock();
        state.clock += 1;

        let mut bitmap = [0u8; 3];
        let mut hasher = Sha256::new();
        for (index, digest) in &values {
            bitmap[*index as usize / 8] |= 1 << (index % 8);
            hasher.update(digest);
        }
        let pcr_digest = hasher.finalize();

        let signer_name: Vec<u8> = TPM_ALG_SHA256
            .to_be_bytes()
            .into_iter()
            .chain(Sha256::digest(&state.ak_pub))
            .collect();

        // TPMS_ATTEST
        let mut message = Vec::new();
        message.extend_from_slice(&TPM_GENERATED_VALUE.to_be_bytes());
        message.extend_from_slice(&TPM_ST_ATTEST_QUOTE.to_be_bytes());
        message.extend_from_slice(&(signer_name.len() as u16).to_be_bytes());
        message.extend_from_slice(&signer_name);
        message.extend_from_slice(&(nonce.len() as u16).to_be_bytes());
        message.extend_from_slice(nonce);
        message.extend_from_slice(&state.clock.to_be_bytes());
        message.extend_from_slice(&0u32.to_be_bytes()); // reset count
        message.extend_from_slice(&0u32.to_be_bytes()); // restart count
        message.push(1); // safe
        message.extend_from_slice(&0u64.to_be_bytes()); // firmware version
        message.extend_from_slice(&1u32.to_be_bytes());
        message.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        message.push(bitmap.len() as u8);
        message.extend_from_slice(&bitmap);
        message.extend_from_slice(&(pcr_digest.len() as u16).to_be_bytes());
        message.extend_from_slice(&pcr_digest);

        let signature = self.sign_with_ak(&state, &message)?;
        let pcrs = values
            .into_iter()
            .map(|(index, digest)| PcrValue { index, digest })
            .collect();
        Ok(Quote::new(HashAlg::Sha256, signature, message, pcrs))
    }

    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        let state = self.tpm.lock();
        self.sign_with_ak(&state, data)
    }

    fn read_pcrs(&mut self, pcrs: &[u32]) -> Result<BTreeMap<u32, Vec<u8>>, TpmError> {
        let state = self.tpm.lock();
        pcrs.iter()
            .map(|i| {
                state
                    .pcrs
                    .get(*i as usize)
                    .map(|v| (*i, v.to_vec()))
                    .ok_or(TpmError::InvalidPcr(*i))
            })
            .collect()
    }

    fn extend_pcr(&mut self, pcr: u32, digest: &[u8; 32]) -> Result<(), TpmError> {
        let mut state = self.tpm.lock();
        let value = state
            .pcrs
            .get_mut(pcr as usize)
            .ok_or(TpmError::InvalidPcr(pcr))?;
        extend(value, digest);
        Ok(())
    }

    fn read_nv(&mut self, index: u32) -> Result<Vec<u8>, TpmError> {
        self.tpm
            .lock()
            .nv
            .get(&index)
            .cloned()
            .ok_or(TpmError::NvIndexNotFound(index))
    }

    fn event_log(&mut self) -> Result<Vec<u8>, TpmError> {
        Ok(self.tpm.lock().log.build())
    }
}
