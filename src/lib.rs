// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  Remote attestation for confidential VM clusters.
//!
//!  An [`Issuer`] produces an attestation document that binds caller chosen
//!  user data and a verifier chosen nonce to the measured state of the VM: a
//!  vTPM quote, a hardware report (SEV-SNP, TDX) or both. A [`Validator`]
//!  checks such a document against the expected [measurements](measurements::MeasurementSet)
//!  and platform policy of its [variant](variant::Variant) and hands back the
//!  user data.
//!
//!  #
//!  ```no_run
//!  use cvm_attestation::choose::{issuer_for, validator_for};
//!  use cvm_attestation::config::AttestationConfig;
//!  use cvm_attestation::variant::Variant;
//!  use cvm_attestation::{Issuer, Validator};
//!  use std::error::Error;
//!
//!  fn main() -> Result<(), Box<dyn Error>> {
//!    let issuer = issuer_for(Variant::AzureSevSnp)?;
//!    let document = issuer.issue(b"public key hash", b"nonce")?;
//!
//!    let config = AttestationConfig::from_file("/var/config/attestationConfig")?;
//!    let validator = validator_for(&config)?;
//!    let user_data = validator.validate(&document, b"nonce")?;
//!    assert_eq!(user_data, b"public key hash");
//!
//!    Ok(())
//!  }
//!  ```

pub use error::{Error, Result};
use variant::{Oid, Variant};

/// Creates attestation documents on the machine being attested.
pub trait Issuer: Send + Sync {
    fn variant(&self) -> Variant;

    fn oid(&self) -> Oid {
        self.variant().oid()
    }

    /// Serialized attestation document carrying `user_data`, fresh for `nonce`.
    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>>;
}

/// Verifies attestation documents of one variant.
pub trait Validator: Send + Sync {
    fn variant(&self) -> Variant;

    fn oid(&self) -> Oid {
        self.variant().oid()
    }

    /// Returns the user data of `document` if it was issued for `nonce` by a
    /// machine in the expected state.
    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>>;
}

pub mod atls;
pub mod aws;
pub mod azure;
pub mod choose;
pub mod config;
pub mod document;
pub mod dummy;
mod error;
pub mod eventlog;
pub mod gcp;
pub mod hcl;
pub mod https;
pub mod keys;
pub mod measurements;
pub mod qemu;
pub mod rpc;
pub mod snp;
pub mod tdx;
pub mod tsm;
pub mod updatable;
pub mod variant;
pub mod vtpm;
