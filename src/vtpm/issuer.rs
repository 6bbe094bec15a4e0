// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{AkPolicy, TpmDevice, TpmOpener};
use crate::document::{AttestationDocument, TpmAttestation};
use crate::error::Result;
use crate::variant::Variant;
use crate::Issuer;

/// Platform specific evidence collected next to the TPM quote.
pub trait InstanceInfoSource: Send + Sync {
    /// Serialized instance info. `ak_pub` is the marshalled public area of
    /// the key that signs the quote.
    fn instance_info(
        &self,
        tpm: &mut dyn TpmDevice,
        ak_pub: &[u8],
        user_data: &[u8],
        nonce: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Platforms without extra evidence.
pub struct NoInstanceInfo;

impl InstanceInfoSource for NoInstanceInfo {
    fn instance_info(&self, _: &mut dyn TpmDevice, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Issues documents built around a TPM quote.
pub struct TpmIssuer<I> {
    variant: Variant,
    opener: Box<dyn TpmOpener>,
    policy: AkPolicy,
    pcrs: &'static [u32],
    instance_info: I,
}

impl<I: InstanceInfoSource> TpmIssuer<I> {
    pub fn new(
        variant: Variant,
        opener: Box<dyn TpmOpener>,
        policy: AkPolicy,
        pcrs: &'static [u32],
        instance_info: I,
    ) -> Self {
        Self {
            variant,
            opener,
            policy,
            pcrs,
            instance_info,
        }
    }
}

impl<I: InstanceInfoSource> Issuer for TpmIssuer<I> {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        log::debug!("issuing {} attestation document", self.variant);
        // the device is released when `tpm` goes out of scope, on every path
        let mut tpm = self.opener.open()?;
        let ak_pub = tpm.load_ak(self.policy)?;
        let quote = tpm.quote(nonce, self.pcrs)?;
        let event_log = tpm.event_log()?;
        let instance_info =
            self.instance_info
                .instance_info(tpm.as_mut(), &ak_pub, user_data, nonce)?;
        let user_data_signature = tpm.sign(user_data)?;

        let document = AttestationDocument {
            attestation: Some(TpmAttestation {
                ak_pub,
                quotes: vec![quote],
                event_log,
            }),
            instance_info,
            user_data: user_data.to_vec(),
            user_data_signature,
        };
        log::debug!("issued {} attestation document", self.variant);
        document.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::vtpm::simulator::SimulatedTpm;
    use crate::vtpm::QEMU_PCR_SELECTION;

    struct FailingInfo;

    impl InstanceInfoSource for FailingInfo {
        fn instance_info(&self, _: &mut dyn TpmDevice, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Transient("metadata server unreachable".into()))
        }
    }

    #[test]
    fn document_contents() {
        let sim = SimulatedTpm::new();
        let issuer = TpmIssuer::new(
            Variant::QemuVtpm,
            Box::new(sim.clone()),
            AkPolicy::Generic,
            QEMU_PCR_SELECTION,
            NoInstanceInfo,
        );
        let raw = issuer.issue(b"user data", b"nonce").unwrap();
        let doc = AttestationDocument::from_bytes(&raw).unwrap();
        let tpm = doc.tpm().unwrap();
        assert_eq!(doc.user_data, b"user data");
        assert_eq!(tpm.ak_pub, sim.ak_pub_area());
        assert_eq!(tpm.quotes.len(), 1);
        assert_eq!(tpm.quotes[0].nonce().unwrap(), b"nonce");
        assert!(doc.instance_info.is_empty());
        assert_eq!(sim.open_devices(), 0);
    }

    #[test]
    fn device_released_on_error() {
        let sim = SimulatedTpm::new();
        let issuer = TpmIssuer::new(
            Variant::QemuVtpm,
            Box::new(sim.clone()),
            AkPolicy::Generic,
            QEMU_PCR_SELECTION,
            FailingInfo,
        );
        assert!(issuer.issue(b"user data", b"nonce").unwrap_err().is_transient());
        assert_eq!(sim.open_devices(), 0);

        let issuer = TpmIssuer::new(
            Variant::QemuVtpm,
            Box::new(sim.clone()),
            AkPolicy::Generic,
            QEMU_PCR_SELECTION,
            NoInstanceInfo,
        );
        let err = issuer.issue(b"user data", &[0u8; 65]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(sim.open_devices(), 0);
    }
}
