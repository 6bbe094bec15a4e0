// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::certs::{milan_ark, parse_chain, AmdChain, Vcek};
use super::instance::SnpInstanceInfo;
use super::kds::{Kds, KdsError};
use super::report::{SigningKey, SnpReport, Tcb};
use crate::error::{Error, Result};
use crate::https::HttpsGetter;
use openssl::x509::X509;
use std::sync::Arc;

/// Minimum requirements on an SNP report and the roots it must chain to.
#[derive(Clone)]
pub struct SnpPolicy {
    pub product: String,
    pub minimum_tcb: Tcb,
    /// Trust anchor every resolved ARK must equal. Reports are rejected
    /// when it is unset.
    pub ark: Option<X509>,
    /// Cached ASK used when the document carries none.
    pub ask: Option<X509>,
}

impl Default for SnpPolicy {
    fn default() -> Self {
        Self {
            product: super::PRODUCT_MILAN.into(),
            minimum_tcb: Tcb {
                bootloader: 2,
                tee: 0,
                snp: 6,
                microcode: 93,
            },
            ark: milan_ark().ok(),
            ask: None,
        }
    }
}

fn kds_error(err: KdsError) -> Error {
    match err {
        KdsError::Http(e) => Error::Transient(e.to_string()),
        KdsError::Parse(e) => Error::malformed("certificate from KDS", e),
        KdsError::Unsupported(key) => Error::Unsupported(format!("signing key {key:?}")),
    }
}

/// Resolves the certificates for an SNP report, checks its signature and
/// applies the TCB policy.
pub struct SnpVerifier {
    policy: SnpPolicy,
    getter: Arc<dyn HttpsGetter>,
}

impl SnpVerifier {
    pub fn new(policy: SnpPolicy, getter: Arc<dyn HttpsGetter>) -> Self {
        Self { policy, getter }
    }

    pub fn getter(&self) -> &dyn HttpsGetter {
        self.getter.as_ref()
    }

    fn kds(&self) -> Kds<'_> {
        Kds::new(self.getter.as_ref(), &self.policy.product)
    }

    fn signer(&self, report: &SnpReport, info: &SnpInstanceInfo) -> Result<Vcek> {
        let supplied = if info.report_signer.is_empty() {
            None
        } else {
            let pem = String::from_utf8_lossy(&info.report_signer);
            Some(Vcek::from_pem(&pem).map_err(|e| Error::malformed("report signer", e))?)
        };
        match (report.signing_key(), supplied) {
            (SigningKey::Vlek, Some(vlek)) => Ok(vlek),
            (SigningKey::Vlek, None) => Err(Error::MissingSignerCert(
                "report is signed by a VLEK but the document carries none".into(),
            )),
            (SigningKey::Vcek, Some(vcek)) => Ok(vcek),
            (SigningKey::Vcek, None) => {
                log::debug!("document carries no VCEK, fetching it from the KDS");
                self.kds()
                    .vcek(report.chip_id(), &report.reported_tcb())
                    .map_err(kds_error)
            }
            (SigningKey::Unknown(key), _) => {
                Err(Error::Unsupported(format!("unknown report signing key {key}")))
            }
        }
    }

    // document chain, then cached certificates, then the KDS
    fn chain(&self, report: &SnpReport, info: &SnpInstanceInfo) -> Result<AmdChain> {
        let pem = String::from_utf8_lossy(&info.cert_chain);
        let mut partial = parse_chain(&pem).map_err(|e| Error::malformed("certificate chain", e))?;
        if partial.ask.is_none() {
            partial.ask = self.policy.ask.clone();
        }
        if partial.ark.is_none() {
            partial.ark = self.policy.ark.clone();
        }
        match (partial.ask, partial.ark) {
            (Some(ask), Some(ark)) => Ok(AmdChain { ask, ark }),
            (ask, ark) => {
                let fetched = self
                    .kds()
                    .cert_chain(report.signing_key())
                    .map_err(kds_error)?;
                Ok(AmdChain {
                    ask: ask.unwrap_or(fetched.ask),
                    ark: ark.unwrap_or(fetched.ark),
                })
            }
        }
    }

    fn check_root(&self, chain: &AmdChain) -> Result<()> {
        let Some(trusted) = &self.policy.ark else {
            return Err(Error::CertChainInvalid("no AMD root key configured".into()));
        };
        let der = |cert: &X509| cert.to_der().map_err(|e| Error::malformed("ARK", e));
        if der(trusted)? != der(&chain.ark)? {
            return Err(Error::CertChainInvalid(
                "ARK does not match the configured AMD root key".into(),
            ));
        }
        Ok(())
    }

    fn check_policy(&self, report: &SnpReport) -> Result<()> {
        let min = &self.policy.minimum_tcb;
        if report.debug_allowed() {
            return Err(Error::PolicyViolation("debugging is allowed".into()));
        }
        if report.vmpl() != 0 {
            return Err(Error::PolicyViolation(format!(
                "report was generated at VMPL {}",
                report.vmpl()
            )));
        }
        let committed = report.committed_tcb();
        if !committed.at_least(min) {
            return Err(Error::PolicyViolation(format!(
                "committed TCB ({committed}) below minimum ({min})"
            )));
        }
        let launch = report.launch_tcb();
        if !launch.at_least(min) {
            return Err(Error::PolicyViolation(format!(
                "launch TCB ({launch}) below minimum ({min})"
            )));
        }
        let reported = report.reported_tcb();
        if !reported.at_least(&committed) {
            return Err(Error::PolicyViolation(format!(
                "reported TCB ({reported}) below committed TCB ({committed})"
            )));
        }
        Ok(())
    }

    /// Verify the report in `info` and return it.
    pub fn verify(&self, info: &SnpInstanceInfo) -> Result<SnpReport> {
        let report = SnpReport::from_bytes(&info.attestation_report)
            .map_err(|e| Error::malformed("attestation report", e))?;

        let signer = self.signer(&report, info)?;
        let chain = self.chain(&report, info)?;
        self.check_root(&chain)?;
        chain
            .validate()
            .map_err(|e| Error::CertChainInvalid(e.to_string()))?;
        signer
            .validate(&chain)
            .map_err(|e| Error::CertChainInvalid(e.to_string()))?;
        signer
            .check_extensions(&report.reported_tcb(), report.chip_id())
            .map_err(|e| Error::CertChainInvalid(e.to_string()))?;

        report
            .verify_signature(&signer.0)
            .map_err(|e| Error::ReportSignatureInvalid(e.to_string()))?;
        self.check_policy(&report)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::https::StaticGetter;
    use crate::snp::kds::{cert_chain_url, vcek_url};
    use crate::snp::report::ReportBuilder;
    use crate::snp::testutil::TestChain;

    const CHIP: [u8; 64] = [0x5a; 64];

    fn tcb() -> Tcb {
        SnpPolicy::default().minimum_tcb
    }

    fn info(chain: &TestChain, report: Vec<u8>) -> SnpInstanceInfo {
        SnpInstanceInfo {
            report_signer: chain.vcek_pem().into_bytes(),
            cert_chain: chain.chain_pem().into_bytes(),
            attestation_report: report,
            ..Default::default()
        }
    }

    fn verifier(chain: &TestChain, getter: StaticGetter) -> SnpVerifier {
        let policy = SnpPolicy {
            ark: Some(chain.ark.clone()),
            ..Default::default()
        };
        SnpVerifier::new(policy, Arc::new(getter))
    }

    fn report(chain: &TestChain, tcb: Tcb) -> Vec<u8> {
        ReportBuilder::new()
            .debug(false)
            .tcb(tcb)
            .chip_id(&CHIP)
            .report_data(&[3; 64])
            .sign(&chain.vcek_key)
    }

    #[test]
    fn accepts_complete_document() {
        let chain = TestChain::new(tcb(), &CHIP);
        let verified = verifier(&chain, StaticGetter::new())
            .verify(&info(&chain, report(&chain, tcb())))
            .unwrap();
        assert_eq!(verified.report_data(), &[3; 64][..]);
    }

    #[test]
    fn tcb_policy_is_monotonic() {
        let min = tcb();
        let lowered = [
            Tcb { bootloader: min.bootloader - 1, ..min },
            Tcb { snp: min.snp - 1, ..min },
            Tcb { microcode: min.microcode - 1, ..min },
        ];
        for low in lowered {
            let chain = TestChain::new(low, &CHIP);
            let err = verifier(&chain, StaticGetter::new())
                .verify(&info(&chain, report(&chain, low)))
                .unwrap_err();
            assert!(matches!(err, Error::PolicyViolation(_)), "{low}: {err}");
        }

        let raised = Tcb { snp: min.snp + 1, tee: min.tee + 1, ..min };
        let chain = TestChain::new(raised, &CHIP);
        assert!(verifier(&chain, StaticGetter::new())
            .verify(&info(&chain, report(&chain, raised)))
            .is_ok());
    }

    #[test]
    fn launch_and_reported_tcb() {
        let min = tcb();
        let chain = TestChain::new(min, &CHIP);
        let raw = ReportBuilder::new()
            .tcb(min)
            .launch_tcb(Tcb { snp: min.snp - 1, ..min })
            .chip_id(&CHIP)
            .sign(&chain.vcek_key);
        let err = verifier(&chain, StaticGetter::new()).verify(&info(&chain, raw)).unwrap_err();
        assert!(matches!(err, Error::PolicyViolation(_)));

        // committed above reported means provisional firmware was rolled back
        let reported = min;
        let committed = Tcb { snp: min.snp + 1, ..min };
        let chain = TestChain::new(reported, &CHIP);
        let raw = ReportBuilder::new()
            .tcb(committed)
            .reported_tcb(reported)
            .chip_id(&CHIP)
            .sign(&chain.vcek_key);
        let err = verifier(&chain, StaticGetter::new()).verify(&info(&chain, raw)).unwrap_err();
        assert!(matches!(err, Error::PolicyViolation(_)));
    }

    #[test]
    fn debug_and_vmpl() {
        let chain = TestChain::new(tcb(), &CHIP);
        let debug = ReportBuilder::new()
            .debug(true)
            .tcb(tcb())
            .chip_id(&CHIP)
            .sign(&chain.vcek_key);
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&info(&chain, debug)),
            Err(Error::PolicyViolation(_))
        ));

        let vmpl = ReportBuilder::new()
            .vmpl(2)
            .tcb(tcb())
            .chip_id(&CHIP)
            .sign(&chain.vcek_key);
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&info(&chain, vmpl)),
            Err(Error::PolicyViolation(_))
        ));
    }

    #[test]
    fn vlek_must_be_supplied() {
        let chain = TestChain::vlek(tcb());
        let raw = ReportBuilder::new()
            .signing_key(SigningKey::Vlek)
            .tcb(tcb())
            .sign(&chain.vcek_key);
        let mut document = info(&chain, raw);
        assert!(verifier(&chain, StaticGetter::new()).verify(&document).is_ok());

        document.report_signer.clear();
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&document),
            Err(Error::MissingSignerCert(_))
        ));
    }

    #[test]
    fn fetches_missing_certificates() {
        let chain = TestChain::new(tcb(), &CHIP);
        let getter = StaticGetter::new()
            .with(
                &vcek_url("Milan", &CHIP, &tcb()),
                chain.vcek.to_der().unwrap(),
            )
            .with(
                &cert_chain_url("Milan", SigningKey::Vcek).unwrap(),
                chain.chain_pem(),
            );
        let document = SnpInstanceInfo {
            attestation_report: report(&chain, tcb()),
            ..Default::default()
        };
        verifier(&chain, getter.clone()).verify(&document).unwrap();
        assert_eq!(getter.requests().len(), 2);

        let err = verifier(&chain, StaticGetter::new()).verify(&document).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn cached_ask_and_configured_ark() {
        let chain = TestChain::new(tcb(), &CHIP);
        let policy = SnpPolicy {
            ark: Some(chain.ark.clone()),
            ask: Some(chain.ask.clone()),
            ..Default::default()
        };
        let mut document = info(&chain, report(&chain, tcb()));
        document.cert_chain.clear();
        let getter = StaticGetter::new();
        SnpVerifier::new(policy, Arc::new(getter.clone()))
            .verify(&document)
            .unwrap();
        assert!(getter.requests().is_empty());

        // a self-consistent chain under a different root
        let other = TestChain::new(tcb(), &CHIP);
        let policy = SnpPolicy {
            ark: Some(other.ark.clone()),
            ..Default::default()
        };
        let document = info(&chain, report(&chain, tcb()));
        assert!(matches!(
            SnpVerifier::new(policy, Arc::new(StaticGetter::new())).verify(&document),
            Err(Error::CertChainInvalid(_))
        ));
    }

    #[test]
    fn broken_chain_and_signature() {
        let chain = TestChain::new(tcb(), &CHIP);
        let other = TestChain::new(tcb(), &CHIP);

        let mut document = info(&chain, report(&chain, tcb()));
        document.cert_chain = other.chain_pem().into_bytes();
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&document),
            Err(Error::CertChainInvalid(_))
        ));

        let document = info(&chain, report(&other, tcb()));
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&document),
            Err(Error::ReportSignatureInvalid(_))
        ));

        let document = info(&chain, vec![0; 10]);
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&document),
            Err(Error::MalformedDocument(_))
        ));
    }

    #[test]
    fn vcek_must_match_report() {
        let chain = TestChain::new(tcb(), &[0x11; 64]);
        let document = info(&chain, report(&chain, tcb()));
        assert!(matches!(
            verifier(&chain, StaticGetter::new()).verify(&document),
            Err(Error::CertChainInvalid(_))
        ));
    }

    #[test]
    fn default_policy_trusts_only_amd() {
        assert!(SnpPolicy::default().ark.is_some());

        let chain = TestChain::new(tcb(), &CHIP);
        let document = info(&chain, report(&chain, tcb()));
        assert!(matches!(
            SnpVerifier::new(SnpPolicy::default(), Arc::new(StaticGetter::new())).verify(&document),
            Err(Error::CertChainInvalid(_))
        ));

        let unset = SnpPolicy {
            ark: None,
            ..Default::default()
        };
        assert!(matches!(
            SnpVerifier::new(unset, Arc::new(StaticGetter::new())).verify(&document),
            Err(Error::CertChainInvalid(_))
        ));
    }
}
