// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AMD SEV-SNP reports, their certificate chains and the validation shared by
//! every SNP based variant.

pub mod certs;
pub mod idkey;
pub mod instance;
pub mod kds;
pub mod report;
pub mod validate;

pub use report::{SigningKey, SnpReport, Tcb};
pub use validate::{SnpPolicy, SnpVerifier};

use crate::error::{Error, Result};
use crate::vtpm::PublicKey;
use sha2::{Digest, Sha512};

/// Product line all validation defaults to.
pub const PRODUCT_MILAN: &str = "Milan";

/// Report data binding an attestation key: SHA-512 of its DER encoded
/// SubjectPublicKeyInfo.
pub fn ak_digest(ak: &PublicKey) -> Result<[u8; 64]> {
    let der = ak
        .to_pkey()
        .and_then(|k| Ok(k.public_key_to_der()?))
        .map_err(|e| Error::malformed("attestation key", e))?;
    Ok(Sha512::digest(der).into())
}

/// Require the report data to commit to `ak`.
pub(crate) fn check_ak_binding(ak: &PublicKey, report: &SnpReport) -> Result<()> {
    if report.report_data() != ak_digest(ak)?.as_slice() {
        return Err(Error::BindingMismatch(
            "report data does not commit to the attestation key".into(),
        ));
    }
    Ok(())
}

#[cfg(any(test, feature = "simulator"))]
pub mod testutil {
    //! Throwaway AMD style certificate hierarchies.

    use super::report::Tcb;
    use openssl::asn1::{Asn1Integer, Asn1Object, Asn1OctetString, Asn1Time};
    use openssl::bn::BigNum;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, PKeyRef, Private};
    use openssl::x509::{X509Builder, X509Extension, X509Name, X509NameRef, X509};

    pub struct TestChain {
        pub ark: X509,
        pub ark_key: PKey<Private>,
        pub ask: X509,
        pub ask_key: PKey<Private>,
        pub vcek: X509,
        pub vcek_key: EcKey<Private>,
    }

    fn ec_key() -> EcKey<Private> {
        let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
        EcKey::generate(&group).unwrap()
    }

    fn name(cn: &str) -> X509Name {
        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_text("OU", "Engineering").unwrap();
        name.append_entry_by_text("O", "Advanced Micro Devices").unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        name.build()
    }

    fn integer_ext(oid: &str, value: u8) -> X509Extension {
        let oid = Asn1Object::from_str(oid).unwrap();
        let der = Asn1OctetString::new_from_bytes(&[0x02, 0x01, value]).unwrap();
        X509Extension::new_from_der(&oid, false, &der).unwrap()
    }

    fn hwid_ext(chip_id: &[u8; 64]) -> X509Extension {
        let oid = Asn1Object::from_str("1.3.6.1.4.1.3704.1.4").unwrap();
        let der = Asn1OctetString::new_from_bytes(chip_id).unwrap();
        X509Extension::new_from_der(&oid, false, &der).unwrap()
    }

    fn cert(
        subject: &X509Name,
        issuer: &X509NameRef,
        key: &PKeyRef<Private>,
        signer: &PKeyRef<Private>,
        extensions: Vec<X509Extension>,
    ) -> X509 {
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(rand::random::<u32>() >> 1).unwrap();
        builder
            .set_serial_number(&Asn1Integer::from_bn(&serial).unwrap())
            .unwrap();
        builder.set_subject_name(subject).unwrap();
        builder.set_issuer_name(issuer).unwrap();
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        for ext in extensions {
            builder.append_extension(ext).unwrap();
        }
        builder.sign(signer, MessageDigest::sha384()).unwrap();
        builder.build()
    }

    impl TestChain {
        /// ARK, ASK and a VCEK carrying `tcb` and `chip_id` in its extensions.
        pub fn new(tcb: Tcb, chip_id: &[u8; 64]) -> Self {
            Self::build(tcb, Some(chip_id))
        }

        /// Same hierarchy with a VLEK leaf, which has no hardware id.
        pub fn vlek(tcb: Tcb) -> Self {
            Self::build(tcb, None)
        }

        fn build(tcb: Tcb, chip_id: Option<&[u8; 64]>) -> Self {
            let ark_key = PKey::from_ec_key(ec_key()).unwrap();
            let ask_key = PKey::from_ec_key(ec_key()).unwrap();
            let vcek_key = ec_key();
            let vcek_pkey = PKey::from_ec_key(vcek_key.clone()).unwrap();

            let ark_name = name("ARK-Milan");
            let ask_name = name("SEV-Milan");
            let ark = cert(&ark_name, &ark_name, &ark_key, &ark_key, vec![]);
            let ask = cert(&ask_name, &ark_name, &ask_key, &ark_key, vec![]);

            let mut extensions = vec![
                integer_ext("1.3.6.1.4.1.3704.1.3.1", tcb.bootloader),
                integer_ext("1.3.6.1.4.1.3704.1.3.2", tcb.tee),
                integer_ext("1.3.6.1.4.1.3704.1.3.3", tcb.snp),
                integer_ext("1.3.6.1.4.1.3704.1.3.8", tcb.microcode),
            ];
            let leaf_cn = match chip_id {
                Some(chip_id) => {
                    extensions.push(hwid_ext(chip_id));
                    "SEV-VCEK"
                }
                None => "SEV-VLEK",
            };
            let vcek = cert(&name(leaf_cn), &ask_name, &vcek_pkey, &ask_key, extensions);

            Self {
                ark,
                ark_key,
                ask,
                ask_key,
                vcek,
                vcek_key,
            }
        }

        /// ASK followed by ARK, the order the KDS serves them in.
        pub fn chain_pem(&self) -> String {
            let mut pem = String::from_utf8(self.ask.to_pem().unwrap()).unwrap();
            pem.push_str(&String::from_utf8(self.ark.to_pem().unwrap()).unwrap());
            pem
        }

        pub fn vcek_pem(&self) -> String {
            String::from_utf8(self.vcek.to_pem().unwrap()).unwrap()
        }

        pub fn ark_pem(&self) -> String {
            String::from_utf8(self.ark.to_pem().unwrap()).unwrap()
        }
    }
}
