// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attestation configuration: the expected measurements of a variant plus the
//! knobs its validator needs.

use crate::measurements::{MeasurementError, MeasurementSet};
use crate::snp::idkey::{Enforcement, FirmwareSignerConfig};
use crate::snp::certs::milan_ark;
use crate::snp::{SnpPolicy, Tcb, PRODUCT_MILAN};
use crate::tdx::verify::hex_opt;
use crate::tdx::{DcapVerifier, TdxPolicy, DEFAULT_PCCS_URL, INTEL_QE_VENDOR_ID};
use crate::variant::{Provider, Variant, VariantError};
use openssl::x509::X509;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use thiserror::Error;

/// Expected measurements, kept up to date by the operator.
pub const MEASUREMENTS_PATH: &str = "/var/config/measurements";
pub const ATTESTATION_CONFIG_PATH: &str = "/var/config/attestationConfig";
/// Environment variable naming the cloud provider.
pub const CSP_ENV: &str = "CONSTEL_CSP";
/// Environment variable naming the attestation variant.
pub const VARIANT_ENV: &str = "AttestationVariant";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid attestation config")]
    Json(#[from] serde_json::Error),
    #[error("invalid measurements")]
    Measurements(#[from] MeasurementError),
    #[error(transparent)]
    Variant(#[from] VariantError),
    #[error("attestation config is for {found}, expected {expected}")]
    WrongVariant { expected: Variant, found: Variant },
    #[error("variant {variant} is not available on {provider}")]
    Provider { provider: Provider, variant: Variant },
    #[error("io error")]
    Io(#[from] std::io::Error),
}

mod pem_opt {
    use super::*;

    pub fn serialize<S: Serializer>(cert: &Option<X509>, s: S) -> Result<S::Ok, S::Error> {
        match cert {
            Some(cert) => {
                let pem = cert.to_pem().map_err(S::Error::custom)?;
                s.serialize_str(&String::from_utf8_lossy(&pem))
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<X509>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(pem) if !pem.trim().is_empty() => X509::from_pem(pem.as_bytes())
                .map(Some)
                .map_err(D::Error::custom),
            _ => Ok(None),
        }
    }
}

mod pem_list {
    use super::*;

    pub fn serialize<S: Serializer>(certs: &[X509], s: S) -> Result<S::Ok, S::Error> {
        let mut encoded = Vec::with_capacity(certs.len());
        for cert in certs {
            let pem = cert.to_pem().map_err(S::Error::custom)?;
            encoded.push(String::from_utf8_lossy(&pem).into_owned());
        }
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<X509>, D::Error> {
        let encoded = Vec::<String>::deserialize(d)?;
        let mut certs = Vec::with_capacity(encoded.len());
        for pem in encoded {
            // a single entry may hold a bundle
            certs.extend(X509::stack_from_pem(pem.as_bytes()).map_err(D::Error::custom)?);
        }
        Ok(certs)
    }
}

/// Variants whose validator needs nothing but measurements.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MeasurementsConfig {
    #[serde(default)]
    pub measurements: MeasurementSet,
}

fn default_amd_root_key() -> Option<X509> {
    milan_ark().ok()
}

fn snp_policy(tcb: Tcb, ark: &Option<X509>, ask: &Option<X509>) -> SnpPolicy {
    SnpPolicy {
        product: PRODUCT_MILAN.into(),
        minimum_tcb: tcb,
        ark: ark.clone(),
        ask: ask.clone(),
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SnpConfig {
    #[serde(default)]
    pub measurements: MeasurementSet,
    pub bootloader_version: u8,
    pub tee_version: u8,
    pub snp_version: u8,
    pub microcode_version: u8,
    #[serde(
        default = "default_amd_root_key",
        with = "pem_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub amd_root_key: Option<X509>,
    /// Cached ASK, saves a KDS round trip.
    #[serde(default, with = "pem_opt", skip_serializing_if = "Option::is_none")]
    pub amd_signing_key: Option<X509>,
}

impl Default for SnpConfig {
    fn default() -> Self {
        let tcb = SnpPolicy::default().minimum_tcb;
        Self {
            measurements: MeasurementSet::new(),
            bootloader_version: tcb.bootloader,
            tee_version: tcb.tee,
            snp_version: tcb.snp,
            microcode_version: tcb.microcode,
            amd_root_key: default_amd_root_key(),
            amd_signing_key: None,
        }
    }
}

impl SnpConfig {
    pub fn minimum_tcb(&self) -> Tcb {
        Tcb {
            bootloader: self.bootloader_version,
            tee: self.tee_version,
            snp: self.snp_version,
            microcode: self.microcode_version,
        }
    }

    pub fn policy(&self) -> SnpPolicy {
        snp_policy(self.minimum_tcb(), &self.amd_root_key, &self.amd_signing_key)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AzureSnpConfig {
    #[serde(default)]
    pub measurements: MeasurementSet,
    pub bootloader_version: u8,
    pub tee_version: u8,
    pub snp_version: u8,
    pub microcode_version: u8,
    #[serde(
        default = "default_amd_root_key",
        with = "pem_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub amd_root_key: Option<X509>,
    #[serde(default, with = "pem_opt", skip_serializing_if = "Option::is_none")]
    pub amd_signing_key: Option<X509>,
    #[serde(default)]
    pub firmware_signer_config: FirmwareSignerConfig,
}

impl Default for AzureSnpConfig {
    fn default() -> Self {
        let snp = SnpConfig::default();
        Self {
            measurements: snp.measurements,
            bootloader_version: snp.bootloader_version,
            tee_version: snp.tee_version,
            snp_version: snp.snp_version,
            microcode_version: snp.microcode_version,
            amd_root_key: default_amd_root_key(),
            amd_signing_key: None,
            firmware_signer_config: FirmwareSignerConfig {
                enforcement_policy: Enforcement::MaaFallback,
                ..Default::default()
            },
        }
    }
}

impl AzureSnpConfig {
    pub fn policy(&self) -> SnpPolicy {
        let tcb = Tcb {
            bootloader: self.bootloader_version,
            tee: self.tee_version,
            snp: self.snp_version,
            microcode: self.microcode_version,
        };
        snp_policy(tcb, &self.amd_root_key, &self.amd_signing_key)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TdxConfig {
    #[serde(default)]
    pub measurements: MeasurementSet,
    #[serde(rename = "qeSVN", default)]
    pub qe_svn: u16,
    #[serde(rename = "pceSVN", default)]
    pub pce_svn: u16,
    #[serde(rename = "teeTCBSVN", default, with = "hex_opt")]
    pub tee_tcb_svn: Option<Vec<u8>>,
    #[serde(rename = "qeVendorID", default, with = "hex_opt")]
    pub qe_vendor_id: Option<Vec<u8>>,
    #[serde(rename = "mrSeam", default, with = "hex_opt")]
    pub mr_seam: Option<Vec<u8>>,
    #[serde(default, with = "hex_opt")]
    pub xfam: Option<Vec<u8>>,
    #[serde(
        rename = "intelRootKey",
        default,
        with = "pem_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub intel_root_key: Option<X509>,
    #[serde(rename = "pccsURL", default, skip_serializing_if = "Option::is_none")]
    pub pccs_url: Option<String>,
}

impl TdxConfig {
    fn with_intel_vendor() -> Self {
        Self {
            qe_vendor_id: Some(INTEL_QE_VENDOR_ID.to_vec()),
            ..Default::default()
        }
    }

    pub fn policy(&self) -> TdxPolicy {
        TdxPolicy {
            qe_svn: self.qe_svn,
            pce_svn: self.pce_svn,
            tee_tcb_svn: self.tee_tcb_svn.clone(),
            qe_vendor_id: self.qe_vendor_id.clone(),
            mr_seam: self.mr_seam.clone(),
            xfam: self.xfam.clone(),
        }
    }

    /// Quote verifier fetching collateral from the configured PCCS.
    pub fn verifier(&self) -> DcapVerifier {
        let verifier = DcapVerifier::new(self.pccs_url.as_deref().unwrap_or(DEFAULT_PCCS_URL));
        match &self.intel_root_key {
            Some(root) => verifier.with_root(root.clone()),
            None => {
                log::warn!("no Intel root key configured, trusting the PCCS issuer chain");
                verifier
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TrustedLaunchConfig {
    #[serde(default)]
    pub measurements: MeasurementSet,
    /// Roots the vTPM AK certificates chain to.
    #[serde(rename = "rootCA", default, with = "pem_list")]
    pub root_ca: Vec<X509>,
}

/// Attestation config of one variant. On the wire the variant name sits next
/// to the variant specific fields under the `variant` key.
#[derive(Clone, Debug)]
pub enum AttestationConfig {
    AwsNitroTpm(MeasurementsConfig),
    AwsSevSnp(SnpConfig),
    AzureSevSnp(AzureSnpConfig),
    AzureTdx(TdxConfig),
    AzureTrustedLaunch(TrustedLaunchConfig),
    GcpSevEs(MeasurementsConfig),
    GcpSevSnp(SnpConfig),
    QemuVtpm(MeasurementsConfig),
    QemuTdx(TdxConfig),
    Dummy(MeasurementsConfig),
}

impl AttestationConfig {
    /// Config with default knobs and no measurements.
    pub fn default_for(variant: Variant) -> Self {
        match variant {
            Variant::AwsNitroTpm => Self::AwsNitroTpm(Default::default()),
            Variant::AwsSevSnp => Self::AwsSevSnp(Default::default()),
            Variant::AzureSevSnp => Self::AzureSevSnp(Default::default()),
            Variant::AzureTdx => Self::AzureTdx(TdxConfig::with_intel_vendor()),
            Variant::AzureTrustedLaunch => Self::AzureTrustedLaunch(Default::default()),
            Variant::GcpSevEs => Self::GcpSevEs(Default::default()),
            Variant::GcpSevSnp => Self::GcpSevSnp(Default::default()),
            Variant::QemuVtpm => Self::QemuVtpm(Default::default()),
            Variant::QemuTdx => Self::QemuTdx(TdxConfig::with_intel_vendor()),
            Variant::Dummy => Self::Dummy(Default::default()),
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Self::AwsNitroTpm(_) => Variant::AwsNitroTpm,
            Self::AwsSevSnp(_) => Variant::AwsSevSnp,
            Self::AzureSevSnp(_) => Variant::AzureSevSnp,
            Self::AzureTdx(_) => Variant::AzureTdx,
            Self::AzureTrustedLaunch(_) => Variant::AzureTrustedLaunch,
            Self::GcpSevEs(_) => Variant::GcpSevEs,
            Self::GcpSevSnp(_) => Variant::GcpSevSnp,
            Self::QemuVtpm(_) => Variant::QemuVtpm,
            Self::QemuTdx(_) => Variant::QemuTdx,
            Self::Dummy(_) => Variant::Dummy,
        }
    }

    pub fn measurements(&self) -> &MeasurementSet {
        match self {
            Self::AwsNitroTpm(c) | Self::GcpSevEs(c) | Self::QemuVtpm(c) | Self::Dummy(c) => {
                &c.measurements
            }
            Self::AwsSevSnp(c) | Self::GcpSevSnp(c) => &c.measurements,
            Self::AzureSevSnp(c) => &c.measurements,
            Self::AzureTdx(c) | Self::QemuTdx(c) => &c.measurements,
            Self::AzureTrustedLaunch(c) => &c.measurements,
        }
    }

    /// Replace the expected measurements. Fails if their length does not fit
    /// the variant.
    pub fn set_measurements(&mut self, measurements: MeasurementSet) -> Result<(), ConfigError> {
        measurements.check_length(self.variant().measurement_length())?;
        let slot = match self {
            Self::AwsNitroTpm(c) | Self::GcpSevEs(c) | Self::QemuVtpm(c) | Self::Dummy(c) => {
                &mut c.measurements
            }
            Self::AwsSevSnp(c) | Self::GcpSevSnp(c) => &mut c.measurements,
            Self::AzureSevSnp(c) => &mut c.measurements,
            Self::AzureTdx(c) | Self::QemuTdx(c) => &mut c.measurements,
            Self::AzureTrustedLaunch(c) => &mut c.measurements,
        };
        *slot = measurements;
        Ok(())
    }

    /// Parse a config and check its measurements fit the variant.
    pub fn load(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(json)?;
        config
            .measurements()
            .check_length(config.variant().measurement_length())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(&std::fs::read(path)?)
    }

    fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::AwsNitroTpm(c) | Self::GcpSevEs(c) | Self::QemuVtpm(c) | Self::Dummy(c) => {
                serde_json::to_value(c)
            }
            Self::AwsSevSnp(c) | Self::GcpSevSnp(c) => serde_json::to_value(c),
            Self::AzureSevSnp(c) => serde_json::to_value(c),
            Self::AzureTdx(c) | Self::QemuTdx(c) => serde_json::to_value(c),
            Self::AzureTrustedLaunch(c) => serde_json::to_value(c),
        }
    }

    fn from_value(variant: Variant, value: serde_json::Value) -> serde_json::Result<Self> {
        use serde_json::from_value;
        Ok(match variant {
            Variant::AwsNitroTpm => Self::AwsNitroTpm(from_value(value)?),
            Variant::AwsSevSnp => Self::AwsSevSnp(from_value(value)?),
            Variant::AzureSevSnp => Self::AzureSevSnp(from_value(value)?),
            Variant::AzureTdx => Self::AzureTdx(from_value(value)?),
            Variant::AzureTrustedLaunch => Self::AzureTrustedLaunch(from_value(value)?),
            Variant::GcpSevEs => Self::GcpSevEs(from_value(value)?),
            Variant::GcpSevSnp => Self::GcpSevSnp(from_value(value)?),
            Variant::QemuVtpm => Self::QemuVtpm(from_value(value)?),
            Variant::QemuTdx => Self::QemuTdx(from_value(value)?),
            Variant::Dummy => Self::Dummy(from_value(value)?),
        })
    }
}

// Internally tagged serde enums buffer their content, which breaks the
// integer keys of the measurement map, so the tag is handled by hand.
impl Serialize for AttestationConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut value = self.to_value().map_err(S::Error::custom)?;
        if let Some(fields) = value.as_object_mut() {
            fields.insert("variant".into(), self.variant().name().into());
        }
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttestationConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = serde_json::Value::deserialize(deserializer)?;
        let variant = value
            .as_object_mut()
            .and_then(|fields| fields.remove("variant"))
            .ok_or_else(|| D::Error::missing_field("variant"))?;
        let variant: Variant = serde_json::from_value(variant).map_err(D::Error::custom)?;
        Self::from_value(variant, value).map_err(D::Error::custom)
    }
}

/// Pick the variant from the process environment values. An explicit variant
/// wins and must be available on the provider, otherwise the provider's
/// preferred variant is used.
pub fn select_variant(csp: Option<&str>, variant: Option<&str>) -> Result<Variant, ConfigError> {
    let provider = csp
        .filter(|c| !c.is_empty())
        .map(str::parse::<Provider>)
        .transpose()?;
    let variant = variant
        .filter(|v| !v.is_empty())
        .map(str::parse::<Variant>)
        .transpose()?;
    match (provider, variant) {
        (Some(provider), Some(variant))
            if variant != Variant::Dummy && !provider.is_valid_variant(variant) =>
        {
            Err(ConfigError::Provider { provider, variant })
        }
        (_, Some(variant)) => Ok(variant),
        (Some(provider), None) => Ok(provider.default_variant()),
        (None, None) => Ok(Variant::Dummy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{Enforcement, Measurement};
    use crate::snp::testutil::TestChain;

    #[test]
    fn azure_snp_config() {
        let chain = TestChain::new(Tcb::default(), &[0; 64]);
        let json = serde_json::json!({
            "variant": "azure-sev-snp",
            "measurements": {
                "4": {"expected": "11".repeat(32), "warnOnly": false},
                "9": {"expected": "22".repeat(32), "warnOnly": true},
            },
            "bootloaderVersion": 3,
            "teeVersion": 0,
            "snpVersion": 8,
            "microcodeVersion": 115,
            "amdRootKey": chain.ark_pem(),
            "firmwareSignerConfig": {
                "acceptedKeyDigests": ["57".repeat(48)],
                "enforcementPolicy": "WarnOnly",
                "maaURL": "https://maa.test",
            },
        });
        let config = AttestationConfig::load(json.to_string().as_bytes()).unwrap();
        assert_eq!(config.variant(), Variant::AzureSevSnp);
        assert_eq!(config.measurements().len(), 2);
        assert_eq!(
            config.measurements().get(9).unwrap().enforcement,
            Enforcement::WarnOnly
        );

        let AttestationConfig::AzureSevSnp(snp) = &config else {
            panic!("wrong variant");
        };
        let policy = snp.policy();
        assert_eq!(policy.minimum_tcb.snp, 8);
        assert_eq!(policy.minimum_tcb.microcode, 115);
        assert!(policy.ark.is_some());
        assert!(policy.ask.is_none());
        assert_eq!(
            snp.firmware_signer_config.enforcement_policy,
            crate::snp::idkey::Enforcement::WarnOnly
        );
        assert!(snp
            .firmware_signer_config
            .accepted_key_digests
            .contains(&[0x57; 48]));

        let again: AttestationConfig =
            serde_json::from_slice(&serde_json::to_vec(&config).unwrap()).unwrap();
        assert_eq!(again.measurements(), config.measurements());
        assert_eq!(again.variant(), Variant::AzureSevSnp);
    }

    #[test]
    fn defaults() {
        for variant in Variant::all() {
            let config = AttestationConfig::default_for(*variant);
            assert_eq!(config.variant(), *variant);
            let json = serde_json::to_vec(&config).unwrap();
            assert_eq!(AttestationConfig::load(&json).unwrap().variant(), *variant);
        }
        let AttestationConfig::AwsSevSnp(snp) = AttestationConfig::default_for(Variant::AwsSevSnp)
        else {
            panic!("wrong variant");
        };
        assert_eq!(
            snp.minimum_tcb(),
            Tcb {
                bootloader: 2,
                tee: 0,
                snp: 6,
                microcode: 93
            }
        );
        let AttestationConfig::AzureSevSnp(azure) =
            AttestationConfig::default_for(Variant::AzureSevSnp)
        else {
            panic!("wrong variant");
        };
        assert_eq!(
            azure.firmware_signer_config.enforcement_policy,
            crate::snp::idkey::Enforcement::MaaFallback
        );
        assert!(azure.firmware_signer_config.accepted_key_digests.is_empty());

        let milan = milan_ark().unwrap().to_der().unwrap();
        for root in [&snp.amd_root_key, &azure.amd_root_key] {
            assert_eq!(root.as_ref().unwrap().to_der().unwrap(), milan);
        }
    }

    #[test]
    fn amd_root_key_defaults_to_milan() {
        let json = br#"{"variant": "gcp-sev-snp", "bootloaderVersion": 2, "teeVersion": 0, "snpVersion": 6, "microcodeVersion": 93}"#;
        let AttestationConfig::GcpSevSnp(snp) = AttestationConfig::load(json).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(
            snp.policy().ark.unwrap().to_der().unwrap(),
            milan_ark().unwrap().to_der().unwrap()
        );

        // an explicitly empty root leaves nothing to trust
        let json = br#"{"variant": "gcp-sev-snp", "bootloaderVersion": 2, "teeVersion": 0, "snpVersion": 6, "microcodeVersion": 93, "amdRootKey": ""}"#;
        let AttestationConfig::GcpSevSnp(snp) = AttestationConfig::load(json).unwrap() else {
            panic!("wrong variant");
        };
        assert!(snp.policy().ark.is_none());
    }

    #[test]
    fn tdx_config() {
        let json = format!(
            r#"{{"variant": "qemu-tdx", "measurements": {{"0": "{}"}}, "qeSVN": 2, "mrSeam": "{}"}}"#,
            "aa".repeat(48),
            "bb".repeat(48)
        );
        let config = AttestationConfig::load(json.as_bytes()).unwrap();
        let AttestationConfig::QemuTdx(tdx) = &config else {
            panic!("wrong variant");
        };
        let policy = tdx.policy();
        assert_eq!(policy.qe_svn, 2);
        assert_eq!(policy.mr_seam, Some(vec![0xbb; 48]));
        assert!(policy.xfam.is_none());
    }

    #[test]
    fn rejects_wrong_measurement_length() {
        let json = format!(
            r#"{{"variant": "qemu-tdx", "measurements": {{"0": "{}"}}}}"#,
            "aa".repeat(32)
        );
        assert!(matches!(
            AttestationConfig::load(json.as_bytes()),
            Err(ConfigError::Measurements(_))
        ));

        let mut config = AttestationConfig::default_for(Variant::QemuVtpm);
        let mut m = MeasurementSet::new();
        m.insert(4, Measurement::with_all_bytes(0, Enforcement::Enforce, 48));
        assert!(config.set_measurements(m).is_err());
        assert!(config.measurements().is_empty());
    }

    #[test]
    fn rejects_unknown_variant() {
        assert!(AttestationConfig::load(br#"{"variant": "ibm-se"}"#).is_err());
        assert!(AttestationConfig::load(br#"{"measurements": {}}"#).is_err());
    }

    #[test]
    fn variant_from_environment() {
        assert_eq!(select_variant(Some("azure"), None).unwrap(), Variant::AzureSevSnp);
        assert_eq!(
            select_variant(Some("gcp"), Some("gcp-sev-snp")).unwrap(),
            Variant::GcpSevSnp
        );
        assert_eq!(select_variant(None, Some("qemu-vtpm")).unwrap(), Variant::QemuVtpm);
        assert_eq!(select_variant(None, None).unwrap(), Variant::Dummy);
        assert!(matches!(
            select_variant(Some("aws"), Some("azure-tdx")),
            Err(ConfigError::Provider { .. })
        ));
        assert!(select_variant(Some("mars"), None).is_err());
    }
}
