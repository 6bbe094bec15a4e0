// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::document::base64_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tss_esapi::abstraction::{nv, pcr};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::{KeyHandle, NvIndexTpmHandle, PcrHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, RsaSchemeAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::pcr_selection_list::PcrSelectionListBuilder;
use tss_esapi::structures::pcr_slot::PcrSlot;
use tss_esapi::structures::{
    Attest, AttestInfo, Data, DigestValues, MaxBuffer, Public, PublicBuilder, PublicKeyRsa,
    PublicRsaParametersBuilder, RsaExponent, RsaScheme, Signature, SignatureScheme,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context;

pub mod issuer;
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;
pub mod validator;
mod verify;

pub use verify::{decode_ak_pub, PublicKey, VerifyError};

/// NV index the Azure hypervisor fills with the HCL report.
pub const VTPM_HCL_REPORT_NV_INDEX: u32 = 0x01400001;
/// NV index holding the TPM endorsement key certificate (RSA).
pub const EK_CERT_NV_INDEX: u32 = 0x01c00002;
const GCE_AK_TEMPLATE_NV_INDEX: u32 = 0x01c10001;
const AZURE_AK_HANDLE: u32 = 0x81000003;
const TPM_DEVICE_PATH: &str = "/dev/tpmrm0";

/// PCRs quoted on Azure. PCR 0 and 6 change with host firmware updates.
pub const AZURE_PCR_SELECTION: &[u32] = &[
    1, 2, 3, 4, 5, 7, 8, 9, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
];
pub const GCP_PCR_SELECTION: &[u32] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
];
pub const AWS_PCR_SELECTION: &[u32] = &[
    0, 2, 3, 4, 5, 6, 7, 8, 9, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
];
pub const QEMU_PCR_SELECTION: &[u32] = &[
    0, 2, 3, 4, 5, 6, 7, 8, 9, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
];

const VTPM_PCR_SLOTS: [PcrSlot; 24] = [
    PcrSlot::Slot0,
    PcrSlot::Slot1,
    PcrSlot::Slot2,
    PcrSlot::Slot3,
    PcrSlot::Slot4,
    PcrSlot::Slot5,
    PcrSlot::Slot6,
    PcrSlot::Slot7,
    PcrSlot::Slot8,
    PcrSlot::Slot9,
    PcrSlot::Slot10,
    PcrSlot::Slot11,
    PcrSlot::Slot12,
    PcrSlot::Slot13,
    PcrSlot::Slot14,
    PcrSlot::Slot15,
    PcrSlot::Slot16,
    PcrSlot::Slot17,
    PcrSlot::Slot18,
    PcrSlot::Slot19,
    PcrSlot::Slot20,
    PcrSlot::Slot21,
    PcrSlot::Slot22,
    PcrSlot::Slot23,
];

// one TPM user per process
static TPM_LOCK: Mutex<()> = Mutex::new(());

fn to_pcr_handle(pcr: u32) -> Result<PcrHandle, TpmError> {
    match pcr {
        0 => Ok(PcrHandle::Pcr0),
        1 => Ok(PcrHandle::Pcr1),
        2 => Ok(PcrHandle::Pcr2),
        3 => Ok(PcrHandle::Pcr3),
        4 => Ok(PcrHandle::Pcr4),
        5 => Ok(PcrHandle::Pcr5),
        6 => Ok(PcrHandle::Pcr6),
        7 => Ok(PcrHandle::Pcr7),
        8 => Ok(PcrHandle::Pcr8),
        9 => Ok(PcrHandle::Pcr9),
        10 => Ok(PcrHandle::Pcr10),
        11 => Ok(PcrHandle::Pcr11),
        12 => Ok(PcrHandle::Pcr12),
        13 => Ok(PcrHandle::Pcr13),
        14 => Ok(PcrHandle::Pcr14),
        15 => Ok(PcrHandle::Pcr15),
        16 => Ok(PcrHandle::Pcr16),
        17 => Ok(PcrHandle::Pcr17),
        18 => Ok(PcrHandle::Pcr18),
        19 => Ok(PcrHandle::Pcr19),
        20 => Ok(PcrHandle::Pcr20),
        21 => Ok(PcrHandle::Pcr21),
        22 => Ok(PcrHandle::Pcr22),
        23 => Ok(PcrHandle::Pcr23),
        _ => Err(TpmError::InvalidPcr(pcr)),
    }
}

fn to_pcr_slots(pcrs: &[u32]) -> Result<Vec<PcrSlot>, TpmError> {
    pcrs.iter()
        .map(|i| {
            VTPM_PCR_SLOTS
                .get(*i as usize)
                .copied()
                .ok_or(TpmError::InvalidPcr(*i))
        })
        .collect()
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TpmError {
    #[error("tpm error")]
    Tpm(#[from] tss_esapi::Error),
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("invalid pcr number {0} (expected 0-23)")]
    InvalidPcr(u32),
    #[error("data too large")]
    DataTooLarge,
    #[error("no attestation key loaded")]
    NoAttestationKey,
    #[error("Not a quote, that should not occur")]
    NotAQuote,
    #[error("Wrong signature, that should not occur")]
    WrongSignature,
    #[error("PCR bank not found")]
    PcrBankNotFound,
    #[error("PCR reading error")]
    PcrRead,
    #[error("nv index {0:#x} not defined")]
    NvIndexNotFound(u32),
}

/// How an issuer obtains its attestation key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AkPolicy {
    /// Recreate the key from the template GCE provisions in NV.
    Gce,
    /// Persistent Azure key at `0x81000003`, created on first use.
    AzurePersistent,
    /// Restricted RSA 2048 signing key below the owner hierarchy.
    Generic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlg {
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA384")]
    Sha384,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcrValue {
    pub index: u32,
    #[serde(with = "base64_bytes")]
    pub digest: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Quote {
    pub hash: HashAlg,
    #[serde(with = "base64_bytes")]
    signature: Vec<u8>,
    /// Marshalled `TPMS_ATTEST`.
    #[serde(with = "base64_bytes")]
    message: Vec<u8>,
    pcrs: Vec<PcrValue>,
}

impl Quote {
    pub fn new(hash: HashAlg, signature: Vec<u8>, message: Vec<u8>, pcrs: Vec<PcrValue>) -> Self {
        Self {
            hash,
            signature,
            message,
            pcrs,
        }
    }

    /// PCR values delivered alongside the quote, keyed by index
    pub fn pcrs(&self) -> BTreeMap<u32, Vec<u8>> {
        self.pcrs
            .iter()
            .map(|p| (p.index, p.digest.clone()))
            .collect()
    }

    /// Extract nonce from a Quote
    pub fn nonce(&self) -> Result<Vec<u8>, TpmError> {
        let attest = Attest::unmarshall(&self.message)?;
        let nonce = attest.extra_data().to_vec();
        Ok(nonce)
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    #[cfg(test)]
    pub(crate) fn pcrs_mut(&mut self) -> &mut Vec<PcrValue> {
        &mut self.pcrs
    }
}

/// A TPM as seen by issuers and the node bootstrapper.
///
/// Dropping the device releases the underlying handle.
pub trait TpmDevice {
    /// Load the attestation key according to `policy` and return its
    /// marshalled public area. Later calls to `quote` and `sign` use this key.
    fn load_ak(&mut self, policy: AkPolicy) -> Result<Vec<u8>, TpmError>;

    /// Quote the SHA-256 bank over `pcrs` with `nonce` as qualifying data.
    fn quote(&mut self, nonce: &[u8], pcrs: &[u32]) -> Result<Quote, TpmError>;

    /// PKCS#1 v1.5 signature over `SHA-256(data)`.
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, TpmError>;

    fn read_pcrs(&mut self, pcrs: &[u32]) -> Result<BTreeMap<u32, Vec<u8>>, TpmError>;

    fn extend_pcr(&mut self, pcr: u32, digest: &[u8; 32]) -> Result<(), TpmError>;

    fn read_nv(&mut self, index: u32) -> Result<Vec<u8>, TpmError>;

    fn event_log(&mut self) -> Result<Vec<u8>, TpmError>;
}

pub trait TpmOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn TpmDevice>, TpmError>;
}

/// Opens the kernel resource manager device.
#[derive(Default, Clone, Copy)]
pub struct DeviceOpener;

impl TpmOpener for DeviceOpener {
    fn open(&self) -> Result<Box<dyn TpmDevice>, TpmError> {
        Ok(Box::new(TssDevice::open()?))
    }
}

/// Template of a restricted RSA 2048 signing key using RSASSA with SHA-256.
pub(crate) fn ak_template(unique: Option<PublicKeyRsa>) -> Result<Public, tss_esapi::Error> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_restricted(true)
        .with_sign_encrypt(true)
        .build()?;

    let parameters = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::create(
            RsaSchemeAlgorithm::RsaSsa,
            Some(HashingAlgorithm::Sha256),
        )?)
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(RsaExponent::default())
        .with_is_signing_key(true)
        .with_is_decryption_key(false)
        .with_restricted(true)
        .build()?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_rsa_parameters(parameters)
        .with_rsa_unique_identifier(unique.unwrap_or_default())
        .build()
}

struct LoadedKey {
    handle: KeyHandle,
    transient: bool,
}

/// TPM accessed through tss-esapi.
pub struct TssDevice {
    context: Context,
    ak: Option<LoadedKey>,
    _lock: MutexGuard<'static, ()>,
}

impl TssDevice {
    pub fn open() -> Result<Self, TpmError> {
        let lock = TPM_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let conf = TctiNameConf::Device(DeviceConfig::from_str(TPM_DEVICE_PATH)?);
        let context = Context::new(conf)?;
        Ok(Self {
            context,
            ak: None,
            _lock: lock,
        })
    }

    fn with_password_session<T>(
        &mut self,
        f: impl FnOnce(&mut Context) -> tss_esapi::Result<T>,
    ) -> Result<T, TpmError> {
        self.context
            .set_sessions((Some(AuthSession::Password), None, None));
        let result = f(&mut self.context);
        self.context.clear_sessions();
        Ok(result?)
    }

    fn create_primary(&mut self, hierarchy: Hierarchy, public: Public) -> Result<KeyHandle, TpmError> {
        let result = self.with_password_session(|ctx| {
            ctx.create_primary(hierarchy, public, None, None, None, None)
        })?;
        Ok(result.key_handle)
    }

    fn persistent_ak(&mut self) -> Result<KeyHandle, TpmError> {
        let tpm_handle: TpmHandle = AZURE_AK_HANDLE.try_into()?;
        let key_handle = self
            .context
            .execute_without_session(|c| c.tr_from_tpm_public(tpm_handle))?;
        Ok(key_handle.into())
    }

    fn create_persistent_ak(&mut self) -> Result<KeyHandle, TpmError> {
        log::info!("creating attestation key at {AZURE_AK_HANDLE:#x}");
        let transient = self.create_primary(Hierarchy::Owner, ak_template(None)?)?;
        let persistent = Persistent::Persistent(PersistentTpmHandle::new(AZURE_AK_HANDLE)?);
        let handle = self.with_password_session(|ctx| {
            ctx.evict_control(Provision::Owner, transient.into(), persistent)
        })?;
        self.context.flush_context(transient.into())?;
        Ok(handle.into())
    }

    fn loaded_ak(&self) -> Result<KeyHandle, TpmError> {
        self.ak
            .as_ref()
            .map(|k| k.handle)
            .ok_or(TpmError::NoAttestationKey)
    }
}

impl Drop for TssDevice {
    fn drop(&mut self) {
        if let Some(LoadedKey {
            handle,
            transient: true,
        }) = self.ak.take()
        {
            if let Err(e) = self.context.flush_context(handle.into()) {
                log::warn!("failed to flush attestation key: {e}");
            }
        }
    }
}

impl TpmDevice for TssDevice {
    fn load_ak(&mut self, policy: AkPolicy) -> Result<Vec<u8>, TpmError> {
        let key = match policy {
            AkPolicy::AzurePersistent => {
                let handle = match self.persistent_ak() {
                    Ok(handle) => handle,
                    Err(_) => self.create_persistent_ak()?,
                };
                LoadedKey {
                    handle,
                    transient: false,
                }
            }
            AkPolicy::Gce => {
                let template = self.read_nv(GCE_AK_TEMPLATE_NV_INDEX)?;
                let public = Public::unmarshall(&template)?;
                LoadedKey {
                    handle: self.create_primary(Hierarchy::Endorsement, public)?,
                    transient: true,
                }
            }
            AkPolicy::Generic => LoadedKey {
                handle: self.create_primary(Hierarchy::Owner, ak_template(None)?)?,
                transient: true,
            },
        };
        let handle = key.handle;
        self.ak = Some(key);

        let (public, _, _) = self.context.read_public(handle)?;
        Ok(public.marshall()?)
    }

    fn quote(&mut self, nonce: &[u8], pcrs: &[u32]) -> Result<Quote, TpmError> {
        if nonce.len() > Data::MAX_SIZE {
            return Err(TpmError::DataTooLarge);
        }
        let key_handle = self.loaded_ak()?;
        let quote_data: Data = nonce.try_into()?;
        let hash_algo = HashingAlgorithm::Sha256;
        let selection_list = PcrSelectionListBuilder::new()
            .with_selection(hash_algo, &to_pcr_slots(pcrs)?)
            .build()?;

        let (attest, signature) = self.with_password_session(|ctx| {
            ctx.quote(
                key_handle,
                quote_data,
                SignatureScheme::Null,
                selection_list.clone(),
            )
        })?;

        let AttestInfo::Quote { .. } = attest.attested() else {
            return Err(TpmError::NotAQuote);
        };
        let Signature::RsaSsa(rsa_sig) = signature else {
            return Err(TpmError::WrongSignature);
        };

        let signature = rsa_sig.signature().to_vec();
        let message = attest.marshall()?;
        let values = self.read_pcrs(pcrs)?;
        let pcrs = values
            .into_iter()
            .map(|(index, digest)| PcrValue { index, digest })
            .collect();

        Ok(Quote::new(HashAlg::Sha256, signature, message, pcrs))
    }

    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        let key_handle = self.loaded_ak()?;
        let buffer = MaxBuffer::try_from(data.to_vec()).map_err(|_| TpmError::DataTooLarge)?;
        let (digest, ticket) = self.context.execute_without_session(|ctx| {
            ctx.hash(buffer, HashingAlgorithm::Sha256, Hierarchy::Owner)
        })?;
        let signature = self.with_password_session(|ctx| {
            ctx.sign(key_handle, digest, SignatureScheme::Null, ticket)
        })?;
        let Signature::RsaSsa(rsa_sig) = signature else {
            return Err(TpmError::WrongSignature);
        };
        Ok(rsa_sig.signature().to_vec())
    }

    fn read_pcrs(&mut self, pcrs: &[u32]) -> Result<BTreeMap<u32, Vec<u8>>, TpmError> {
        let hash_algo = HashingAlgorithm::Sha256;
        let selection_list = PcrSelectionListBuilder::new()
            .with_selection(hash_algo, &to_pcr_slots(pcrs)?)
            .build()?;
        let pcr_data = pcr::read_all(&mut self.context, selection_list)?;
        let pcr_bank = pcr_data
            .pcr_bank(hash_algo)
            .ok_or(TpmError::PcrBankNotFound)?;

        let mut indices = pcrs.to_vec();
        indices.sort_unstable();
        indices.dedup();
        let digests: Vec<Vec<u8>> = pcr_bank
            .into_iter()
            .map(|(_, digest)| digest.to_vec())
            .collect();
        if digests.len() != indices.len() {
            return Err(TpmError::PcrRead);
        }
        Ok(indices.into_iter().zip(digests).collect())
    }

    fn extend_pcr(&mut self, pcr: u32, digest: &[u8; 32]) -> Result<(), TpmError> {
        let pcr_handle = to_pcr_handle(pcr)?;
        let mut vals = DigestValues::new();
        let sha256_digest = digest.to_vec().try_into()?;
        vals.set(HashingAlgorithm::Sha256, sha256_digest);
        self.with_password_session(|ctx| ctx.pcr_extend(pcr_handle, vals))
    }

    fn read_nv(&mut self, index: u32) -> Result<Vec<u8>, TpmError> {
        let nv_index = NvIndexTpmHandle::new(index)?;
        let list = nv::list(&mut self.context)?;
        if !list.iter().any(|(public, _)| public.nv_index() == nv_index) {
            return Err(TpmError::NvIndexNotFound(index));
        }
        self.with_password_session(|ctx| nv::read_full(ctx, NvAuth::Owner, nv_index))
    }

    fn event_log(&mut self) -> Result<Vec<u8>, TpmError> {
        match std::fs::read(crate::eventlog::EVENT_LOG_PATH) {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
