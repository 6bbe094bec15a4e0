// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registry from variants to issuers and validators.

use crate::config::AttestationConfig;
use crate::error::{Error, Result};
use crate::https::{HttpsGetter, UreqGetter};
use crate::tsm::{ReportSource, Tsm};
use crate::variant::Variant;
use crate::vtpm::{DeviceOpener, TpmOpener};
use crate::{aws, azure, dummy, gcp, qemu, Issuer, Validator};
use std::sync::Arc;

/// Issuer for `variant` on this machine's devices.
pub fn issuer_for(variant: Variant) -> Result<Box<dyn Issuer>> {
    issuer_with(
        variant,
        Box::new(DeviceOpener),
        Box::new(Tsm::default()),
        Arc::new(UreqGetter::default()),
    )
}

/// Issuer for `variant` on the given devices. Variants ignore the parts they
/// have no use for.
pub fn issuer_with(
    variant: Variant,
    tpm: Box<dyn TpmOpener>,
    reports: Box<dyn ReportSource>,
    getter: Arc<dyn HttpsGetter>,
) -> Result<Box<dyn Issuer>> {
    log::debug!("creating {variant} issuer");
    let issuer: Box<dyn Issuer> = match variant {
        Variant::AwsNitroTpm => Box::new(aws::nitro::issuer(tpm, getter)),
        Variant::AwsSevSnp => Box::new(aws::snp::issuer(tpm, reports)),
        Variant::AzureSevSnp => Box::new(azure::snp::issuer(tpm, getter)),
        Variant::AzureTdx => Box::new(azure::tdx::issuer(tpm, getter)),
        Variant::AzureTrustedLaunch => Box::new(azure::trustedlaunch::issuer(tpm, getter)),
        Variant::GcpSevEs => Box::new(gcp::es::issuer(tpm, getter)),
        Variant::GcpSevSnp => Box::new(gcp::snp::issuer(tpm, reports, getter)),
        Variant::QemuVtpm => Box::new(qemu::vtpm::issuer(tpm)),
        Variant::QemuTdx => Box::new(qemu::tdx::issuer(reports)),
        Variant::Dummy => Box::new(dummy::Issuer),
    };
    Ok(issuer)
}

/// Validator for the variant and expectations in `config`.
pub fn validator_for(config: &AttestationConfig) -> Result<Box<dyn Validator>> {
    validator_with(config, Arc::new(UreqGetter::default()))
}

pub fn validator_with(
    config: &AttestationConfig,
    getter: Arc<dyn HttpsGetter>,
) -> Result<Box<dyn Validator>> {
    log::debug!("creating {} validator", config.variant());
    let validator: Box<dyn Validator> = match config {
        AttestationConfig::AwsNitroTpm(c) => Box::new(aws::nitro::validator(c.measurements.clone())),
        AttestationConfig::AwsSevSnp(c) => Box::new(aws::snp::validator(
            c.measurements.clone(),
            c.policy(),
            getter,
        )),
        AttestationConfig::AzureSevSnp(c) => Box::new(azure::snp::validator(
            c.measurements.clone(),
            c.policy(),
            c.firmware_signer_config.clone(),
            getter,
        )),
        AttestationConfig::AzureTdx(c) => Box::new(azure::tdx::validator(
            c.measurements.clone(),
            c.policy(),
            Box::new(c.verifier()),
        )),
        AttestationConfig::AzureTrustedLaunch(c) => Box::new(azure::trustedlaunch::validator(
            c.measurements.clone(),
            c.root_ca.clone(),
        )),
        AttestationConfig::GcpSevEs(c) => {
            Box::new(gcp::es::validator(c.measurements.clone(), getter))
        }
        AttestationConfig::GcpSevSnp(c) => Box::new(gcp::snp::validator(
            c.measurements.clone(),
            c.policy(),
            getter,
        )),
        AttestationConfig::QemuVtpm(c) => Box::new(qemu::vtpm::validator(c.measurements.clone())),
        AttestationConfig::QemuTdx(c) => Box::new(qemu::tdx::validator(
            c.measurements.clone(),
            c.policy(),
            Box::new(c.verifier()),
        )),
        AttestationConfig::Dummy(_) => Box::new(dummy::Validator),
    };
    Ok(validator)
}

/// Variant advertised under the OID of a peer certificate extension.
pub fn variant_from_oid(oid: &str) -> Result<Variant> {
    Variant::from_oid(oid).map_err(|e| Error::Unsupported(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::https::StaticGetter;
    use crate::measurements::{Enforcement, Measurement, MeasurementSet};
    use crate::vtpm::simulator::SimulatedTpm;

    fn getter() -> Arc<dyn HttpsGetter> {
        Arc::new(StaticGetter::new())
    }

    #[test]
    fn every_variant_is_registered() {
        for variant in Variant::all() {
            let issuer = issuer_with(
                *variant,
                Box::new(SimulatedTpm::new()),
                Box::new(Tsm::new("/nonexistent")),
                getter(),
            )
            .unwrap();
            assert_eq!(issuer.variant(), *variant);
            assert_eq!(issuer.oid(), variant.oid());

            let validator =
                validator_with(&AttestationConfig::default_for(*variant), getter()).unwrap();
            assert_eq!(validator.variant(), *variant);
            assert_eq!(variant_from_oid(&validator.oid().to_string()).unwrap(), *variant);
        }
    }

    #[test]
    fn qemu_round_trip_through_registry() {
        let sim = SimulatedTpm::new();
        let issuer = issuer_with(
            Variant::QemuVtpm,
            Box::new(sim),
            Box::new(Tsm::new("/nonexistent")),
            getter(),
        )
        .unwrap();
        let doc = issuer.issue(b"Constellation", &[2, 3, 4]).unwrap();

        let mut config = AttestationConfig::default_for(Variant::QemuVtpm);
        let mut m = MeasurementSet::new();
        m.insert(11, Measurement::with_all_bytes(0x00, Enforcement::Enforce, 32));
        config.set_measurements(m).unwrap();
        let validator = validator_with(&config, getter()).unwrap();
        assert_eq!(validator.validate(&doc, &[2, 3, 4]).unwrap(), b"Constellation");
    }

    #[test]
    fn unknown_oid() {
        assert!(matches!(
            variant_from_oid("1.3.9900.9.9"),
            Err(Error::Unsupported(_))
        ));
    }
}
