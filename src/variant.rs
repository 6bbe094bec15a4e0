// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attestation variants and their object identifiers.
//!
//! OIDs below `1.3.9900` are reserved and need no registration. The second
//! arc groups variants by provider: `1` test, `2` AWS, `3` GCP, `4` Azure,
//! `5` QEMU. An identifier is never reused once a variant is retired.

use crate::measurements::{PCR_MEASUREMENT_LENGTH, TDX_MEASUREMENT_LENGTH};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VariantError {
    #[error("unknown attestation variant: {0:?}")]
    UnknownName(String),
    #[error("unknown OID: {0}")]
    UnknownOid(String),
    #[error("unknown cloud provider: {0:?}")]
    UnknownProvider(String),
}

/// An ASN.1 object identifier in arc form.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Oid(&'static [u64]);

impl Oid {
    pub const fn arcs(&self) -> &'static [u64] {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Variant {
    Dummy,
    AwsNitroTpm,
    AwsSevSnp,
    GcpSevEs,
    GcpSevSnp,
    AzureSevSnp,
    AzureTrustedLaunch,
    AzureTdx,
    QemuVtpm,
    QemuTdx,
}

const ALL: [Variant; 10] = [
    Variant::Dummy,
    Variant::AwsNitroTpm,
    Variant::AwsSevSnp,
    Variant::GcpSevEs,
    Variant::GcpSevSnp,
    Variant::AzureSevSnp,
    Variant::AzureTrustedLaunch,
    Variant::AzureTdx,
    Variant::QemuVtpm,
    Variant::QemuTdx,
];

impl Variant {
    pub fn all() -> &'static [Variant] {
        &ALL
    }

    pub fn name(&self) -> &'static str {
        match self {
            Variant::Dummy => "dummy",
            Variant::AwsNitroTpm => "aws-nitro-tpm",
            Variant::AwsSevSnp => "aws-sev-snp",
            Variant::GcpSevEs => "gcp-sev-es",
            Variant::GcpSevSnp => "gcp-sev-snp",
            Variant::AzureSevSnp => "azure-sev-snp",
            Variant::AzureTrustedLaunch => "azure-trustedlaunch",
            Variant::AzureTdx => "azure-tdx",
            Variant::QemuVtpm => "qemu-vtpm",
            Variant::QemuTdx => "qemu-tdx",
        }
    }

    pub fn oid(&self) -> Oid {
        match self {
            Variant::Dummy => Oid(&[1, 3, 9900, 1, 1]),
            Variant::AwsNitroTpm => Oid(&[1, 3, 9900, 2, 1]),
            Variant::AwsSevSnp => Oid(&[1, 3, 9900, 2, 2]),
            Variant::GcpSevEs => Oid(&[1, 3, 9900, 3, 1]),
            Variant::GcpSevSnp => Oid(&[1, 3, 9900, 3, 2]),
            Variant::AzureSevSnp => Oid(&[1, 3, 9900, 4, 1]),
            Variant::AzureTrustedLaunch => Oid(&[1, 3, 9900, 4, 2]),
            Variant::AzureTdx => Oid(&[1, 3, 9900, 4, 3]),
            Variant::QemuVtpm => Oid(&[1, 3, 9900, 5, 1]),
            // experimental, kept outside the regular numbering
            Variant::QemuTdx => Oid(&[1, 3, 9900, 5, 99]),
        }
    }

    /// Look up the variant for an OID given in dotted form.
    pub fn from_oid(oid: &str) -> Result<Variant, VariantError> {
        ALL.iter()
            .copied()
            .find(|v| v.oid().to_string() == oid)
            .ok_or_else(|| VariantError::UnknownOid(oid.to_string()))
    }

    pub fn provider(&self) -> Provider {
        match self {
            Variant::Dummy => Provider::Unknown,
            Variant::AwsNitroTpm | Variant::AwsSevSnp => Provider::Aws,
            Variant::GcpSevEs | Variant::GcpSevSnp => Provider::Gcp,
            Variant::AzureSevSnp | Variant::AzureTrustedLaunch | Variant::AzureTdx => {
                Provider::Azure
            }
            Variant::QemuVtpm | Variant::QemuTdx => Provider::Qemu,
        }
    }

    /// Digest length of the registers this variant measures into.
    pub fn measurement_length(&self) -> usize {
        match self {
            Variant::QemuTdx => TDX_MEASUREMENT_LENGTH,
            _ => PCR_MEASUREMENT_LENGTH,
        }
    }

    /// Whether documents of this variant carry a TPM quote.
    pub fn uses_tpm(&self) -> bool {
        !matches!(self, Variant::QemuTdx | Variant::Dummy)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = VariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .copied()
            .find(|v| v.name() == s)
            .ok_or_else(|| VariantError::UnknownName(s.to_string()))
    }
}

impl Serialize for Variant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    Unknown,
    Aws,
    Azure,
    Gcp,
    OpenStack,
    Qemu,
}

impl Provider {
    /// Variants available on this provider, preferred one first.
    pub fn default_variants(&self) -> &'static [Variant] {
        match self {
            Provider::Aws => &[Variant::AwsSevSnp, Variant::AwsNitroTpm],
            Provider::Azure => &[
                Variant::AzureSevSnp,
                Variant::AzureTdx,
                Variant::AzureTrustedLaunch,
            ],
            Provider::Gcp => &[Variant::GcpSevEs, Variant::GcpSevSnp],
            Provider::Qemu | Provider::OpenStack => &[Variant::QemuVtpm],
            Provider::Unknown => &[],
        }
    }

    pub fn default_variant(&self) -> Variant {
        self.default_variants()
            .first()
            .copied()
            .unwrap_or(Variant::Dummy)
    }

    pub fn is_valid_variant(&self, variant: Variant) -> bool {
        self.default_variants().contains(&variant)
    }
}

impl FromStr for Provider {
    type Err = VariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "azure" => Ok(Provider::Azure),
            "gcp" => Ok(Provider::Gcp),
            "openstack" => Ok(Provider::OpenStack),
            "qemu" => Ok(Provider::Qemu),
            _ => Err(VariantError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Unknown => "unknown",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::OpenStack => "openstack",
            Provider::Qemu => "qemu",
        };
        f.write_str(name)
    }
}
