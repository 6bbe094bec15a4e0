// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attested TLS.
//!
//! Both sides of a connection present a fresh self-signed certificate that
//! carries an attestation document in a critical extension keyed by the
//! issuer's variant OID. The document's user data is the SHA-256 digest of
//! the certificate's SubjectPublicKeyInfo and its nonce is chosen by the peer:
//! the client sends its nonce in the SNI of the ClientHello, the server sends
//! its nonce back as the common name of the only acceptable client CA.

use crate::error::Error;
use crate::{Issuer, Validator};
use openssl::asn1::{Asn1Integer, Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Verifier};
use openssl::x509::{X509Extension, X509NameBuilder, X509};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, DistinguishedName,
    OtherError, ServerConfig, ServerConnection, SignatureScheme, StreamOwned,
};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

/// Common name of every aTLS certificate.
pub const CERTIFICATE_CN: &str = "Constellation";
pub const NONCE_LENGTH: usize = 32;

const NONCE_SUFFIX: &str = ".nonce";
const VALIDITY_SECS: i64 = 2 * 60 * 60;

#[derive(Error, Debug)]
pub enum AtlsError {
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("certificate does not contain compatible attestation documents")]
    NoCompatibleDocument,
    #[error(transparent)]
    Validation(#[from] Error),
    #[error("certificate public key hash does not match user data")]
    UserDataMismatch,
    #[error("invalid nonce: {0}")]
    Nonce(String),
    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AtlsError {
    fn into_rustls(self) -> rustls::Error {
        match self {
            AtlsError::Tls(e) => e,
            e => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(e)))),
        }
    }
}

fn random_nonce() -> Vec<u8> {
    rand::random::<[u8; NONCE_LENGTH]>().to_vec()
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Creates a self-signed P-256 certificate and its PKCS#8 key. With an issuer
/// the certificate carries an attestation document for `nonce`.
pub fn create_certificate(
    issuer: Option<&dyn Issuer>,
    nonce: &[u8],
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), AtlsError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
    let spki = key.public_key_to_der()?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, CERTIFICATE_CN)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AtlsError::Certificate(e.to_string()))?
        .as_secs() as i64;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial: Asn1Integer = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before: Asn1Time = Asn1Time::from_unix(now - VALIDITY_SECS)?;
    let not_after: Asn1Time = Asn1Time::from_unix(now + VALIDITY_SECS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&key)?;

    if let Some(issuer) = issuer {
        let doc = issuer.issue(&Sha256::digest(&spki), nonce)?;
        let oid = Asn1Object::from_str(&issuer.oid().to_string())?;
        let value = Asn1OctetString::new_from_bytes(&doc)?;
        builder.append_extension(X509Extension::new_from_der(&oid, true, &value)?)?;
    }
    builder.sign(&key, MessageDigest::sha256())?;

    let cert = CertificateDer::from(builder.build().to_der()?);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_key_to_pkcs8()?));
    Ok((cert, key))
}

fn certified_key(issuer: Option<&dyn Issuer>, nonce: &[u8]) -> Result<CertifiedKey, AtlsError> {
    let (cert, key) = create_certificate(issuer, nonce)?;
    let signer = ring::sign::any_ecdsa_type(&key)?;
    Ok(CertifiedKey::new(vec![cert], signer))
}

/// Checks the self signature and validity window, returns the SHA-256
/// digest of the certificate's public key.
fn check_self_signed(cert_der: &[u8]) -> Result<[u8; 32], AtlsError> {
    let cert = X509::from_der(cert_der)?;
    let key = cert.public_key()?;
    if !cert.verify(&key)? {
        return Err(AtlsError::Certificate("self signature does not verify".into()));
    }
    let (_, parsed) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| AtlsError::Certificate(e.to_string()))?;
    if !parsed.validity().is_valid() {
        return Err(AtlsError::Certificate("outside validity period".into()));
    }
    Ok(Sha256::digest(key.public_key_to_der()?).into())
}

/// Validates the attestation document embedded in an aTLS certificate and
/// returns the user data it carried.
pub fn verify_certificate(
    cert_der: &[u8],
    validators: &[Arc<dyn Validator>],
    nonce: &[u8],
) -> Result<Vec<u8>, AtlsError> {
    let key_hash = check_self_signed(cert_der)?;
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| AtlsError::Certificate(e.to_string()))?;

    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        let Some(validator) = validators.iter().find(|v| v.oid().to_string() == oid) else {
            continue;
        };
        log::debug!("validating {} attestation document", validator.variant());
        let user_data = validator.validate(ext.value, nonce)?;
        if user_data != key_hash {
            return Err(AtlsError::UserDataMismatch);
        }
        return Ok(user_data);
    }
    Err(AtlsError::NoCompatibleDocument)
}

fn verify_signature(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> Result<HandshakeSignatureValid, rustls::Error> {
    let check = || -> Result<bool, AtlsError> {
        let key = X509::from_der(cert.as_ref())?.public_key()?;
        let (digest, pss) = match dss.scheme {
            SignatureScheme::ECDSA_NISTP256_SHA256 => (MessageDigest::sha256(), false),
            SignatureScheme::ECDSA_NISTP384_SHA384 => (MessageDigest::sha384(), false),
            SignatureScheme::RSA_PSS_SHA256 => (MessageDigest::sha256(), true),
            SignatureScheme::RSA_PKCS1_SHA256 => (MessageDigest::sha256(), false),
            other => {
                return Err(AtlsError::Certificate(format!(
                    "unsupported signature scheme {other:?}"
                )))
            }
        };
        let mut verifier = Verifier::new(digest, &key)?;
        if pss {
            verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
            verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        verifier.update(message)?;
        Ok(verifier.verify(dss.signature())?)
    };
    match check() {
        Ok(true) => Ok(HandshakeSignatureValid::assertion()),
        Ok(false) => Err(rustls::Error::InvalidCertificate(CertificateError::BadSignature)),
        Err(e) => Err(e.into_rustls()),
    }
}

fn supported_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PKCS1_SHA256,
    ]
}

fn variants(validators: &[Arc<dyn Validator>]) -> Vec<String> {
    validators.iter().map(|v| v.variant().to_string()).collect()
}

/// Verifies a server's aTLS certificate against the client's nonce.
pub struct AttestationServerVerifier {
    validators: Vec<Arc<dyn Validator>>,
    nonce: Vec<u8>,
}

impl fmt::Debug for AttestationServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationServerVerifier")
            .field("validators", &variants(&self.validators))
            .field("nonce", &hex::encode(&self.nonce))
            .finish()
    }
}

impl ServerCertVerifier for AttestationServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.validators.is_empty() {
            check_self_signed(end_entity).map_err(AtlsError::into_rustls)?;
            log::warn!("no validators configured, accepting server certificate without attestation");
            return Ok(ServerCertVerified::assertion());
        }
        match verify_certificate(end_entity, &self.validators, &self.nonce) {
            Ok(_) => Ok(ServerCertVerified::assertion()),
            Err(e) => {
                log::warn!("server attestation rejected: {e}");
                Err(e.into_rustls())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Verifies a client's aTLS certificate against the server's nonce.
pub struct AttestationClientVerifier {
    validators: Vec<Arc<dyn Validator>>,
    nonce: Vec<u8>,
    hints: Vec<DistinguishedName>,
}

impl AttestationClientVerifier {
    pub fn new(validators: Vec<Arc<dyn Validator>>, nonce: Vec<u8>) -> Result<Self, AtlsError> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &hex::encode(&nonce))?;
        let hint = DistinguishedName::from(name.build().to_der()?);
        Ok(Self {
            validators,
            nonce,
            hints: vec![hint],
        })
    }
}

impl fmt::Debug for AttestationClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationClientVerifier")
            .field("validators", &variants(&self.validators))
            .field("nonce", &hex::encode(&self.nonce))
            .finish()
    }
}

impl ClientCertVerifier for AttestationClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match verify_certificate(end_entity, &self.validators, &self.nonce) {
            Ok(_) => Ok(ClientCertVerified::assertion()),
            Err(e) => {
                log::warn!("client attestation rejected: {e}");
                Err(e.into_rustls())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Encodes a nonce as a DNS name: two 32 character hex labels under `.nonce`.
pub fn nonce_to_server_name(nonce: &[u8]) -> Result<ServerName<'static>, AtlsError> {
    let encoded = hex::encode(nonce);
    if encoded.len() != 2 * NONCE_LENGTH {
        return Err(AtlsError::Nonce(format!("expected {NONCE_LENGTH} bytes")));
    }
    let (a, b) = encoded.split_at(NONCE_LENGTH);
    ServerName::try_from(format!("{a}.{b}{NONCE_SUFFIX}")).map_err(|e| AtlsError::Nonce(e.to_string()))
}

pub fn nonce_from_server_name(name: &str) -> Result<Vec<u8>, AtlsError> {
    let labels = name
        .strip_suffix(NONCE_SUFFIX)
        .ok_or_else(|| AtlsError::Nonce(format!("unexpected server name {name}")))?;
    let nonce = hex::decode(labels.replace('.', "")).map_err(|e| AtlsError::Nonce(e.to_string()))?;
    if nonce.len() != NONCE_LENGTH {
        return Err(AtlsError::Nonce(format!("expected {NONCE_LENGTH} bytes")));
    }
    Ok(nonce)
}

fn nonce_from_hints(hints: &[&[u8]]) -> Result<Vec<u8>, AtlsError> {
    let hint = hints
        .first()
        .ok_or_else(|| AtlsError::Nonce("server sent no acceptable CAs".into()))?;
    let (_, name) = X509Name::from_der(hint).map_err(|e| AtlsError::Nonce(e.to_string()))?;
    let cn = name
        .iter_common_name()
        .next()
        .ok_or_else(|| AtlsError::Nonce("acceptable CA has no common name".into()))?
        .as_str()
        .map_err(|e| AtlsError::Nonce(e.to_string()))?;
    hex::decode(cn).map_err(|e| AtlsError::Nonce(e.to_string()))
}

/// Builds the server certificate for the nonce in the ClientHello.
struct ServerCertResolver {
    issuer: Option<Arc<dyn Issuer>>,
}

impl fmt::Debug for ServerCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCertResolver")
            .field("issuer", &self.issuer.as_ref().map(|i| i.variant()))
            .finish()
    }
}

impl ResolvesServerCert for ServerCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let resolved = client_hello
            .server_name()
            .ok_or_else(|| AtlsError::Nonce("client hello carries no server name".into()))
            .and_then(nonce_from_server_name)
            .and_then(|nonce| certified_key(self.issuer.as_deref(), &nonce));
        match resolved {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                log::warn!("creating aTLS server certificate: {e}");
                None
            }
        }
    }
}

/// Builds the client certificate for the nonce in the CertificateRequest.
struct ClientCertResolver {
    issuer: Arc<dyn Issuer>,
}

impl fmt::Debug for ClientCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertResolver")
            .field("issuer", &self.issuer.variant())
            .finish()
    }
}

impl ResolvesClientCert for ClientCertResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let resolved = nonce_from_hints(root_hint_subjects)
            .and_then(|nonce| certified_key(Some(self.issuer.as_ref()), &nonce));
        match resolved {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                log::warn!("creating aTLS client certificate: {e}");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Client configuration for one connection. The returned server name carries
/// the client's nonce and must be used to connect.
///
/// Without validators the server certificate is accepted unattested. Without
/// an issuer the client cannot take part in mutual aTLS.
pub fn client_config(
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<(Arc<ClientConfig>, ServerName<'static>), AtlsError> {
    let nonce = random_nonce();
    let name = nonce_to_server_name(&nonce)?;
    let verifier = Arc::new(AttestationServerVerifier { validators, nonce });
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    let config = match issuer {
        Some(issuer) => builder.with_client_cert_resolver(Arc::new(ClientCertResolver { issuer })),
        None => builder.with_no_client_auth(),
    };
    Ok((Arc::new(config), name))
}

/// Server configuration for one connection. With validators the client must
/// present an attested certificate.
pub fn server_config(
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<Arc<ServerConfig>, AtlsError> {
    let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
    let builder = if validators.is_empty() {
        builder.with_no_client_auth()
    } else {
        let verifier = AttestationClientVerifier::new(validators, random_nonce())?;
        builder.with_client_cert_verifier(Arc::new(verifier))
    };
    let config = builder.with_cert_resolver(Arc::new(ServerCertResolver { issuer }));
    Ok(Arc::new(config))
}

pub type ClientStream = StreamOwned<ClientConnection, TcpStream>;
pub type ServerStream = StreamOwned<ServerConnection, TcpStream>;

/// Connects to `addr` and completes the aTLS handshake.
pub fn connect(
    addr: impl ToSocketAddrs,
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<ClientStream, AtlsError> {
    let mut sock = TcpStream::connect(addr)?;
    connect_stream(&mut sock, issuer, validators).map(|conn| StreamOwned::new(conn, sock))
}

/// Completes the client side of the aTLS handshake on a connected socket.
pub fn connect_stream(
    sock: &mut TcpStream,
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<ClientConnection, AtlsError> {
    let (config, name) = client_config(issuer, validators)?;
    let mut conn = ClientConnection::new(config, name)?;
    while conn.is_handshaking() {
        conn.complete_io(sock)?;
    }
    Ok(conn)
}

/// Completes the server side of the aTLS handshake on an accepted socket.
pub fn accept(
    mut sock: TcpStream,
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
) -> Result<ServerStream, AtlsError> {
    let mut conn = ServerConnection::new(server_config(issuer, validators)?)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)?;
    }
    Ok(StreamOwned::new(conn, sock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy;
    use crate::measurements::MeasurementSet;
    use crate::qemu;
    use crate::variant::Variant;
    use crate::vtpm::simulator::SimulatedTpm;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn dummy_validators() -> Vec<Arc<dyn Validator>> {
        vec![Arc::new(dummy::Validator)]
    }

    #[test]
    fn certificate_round_trip() {
        let (cert, _) = create_certificate(Some(&dummy::Issuer), b"nonce").unwrap();
        let user_data = verify_certificate(&cert, &dummy_validators(), b"nonce").unwrap();
        assert_eq!(user_data.len(), 32);

        let parsed = X509::from_der(&cert).unwrap();
        let spki = parsed.public_key().unwrap().public_key_to_der().unwrap();
        assert_eq!(user_data, Sha256::digest(spki).to_vec());
    }

    #[test]
    fn certificate_extension_is_critical() {
        let (cert, _) = create_certificate(Some(&dummy::Issuer), b"nonce").unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(&cert).unwrap();
        let ext = parsed
            .extensions()
            .iter()
            .find(|e| e.oid.to_id_string() == Variant::Dummy.oid().to_string())
            .unwrap();
        assert!(ext.critical);
        assert_eq!(
            parsed.subject().iter_common_name().next().unwrap().as_str().unwrap(),
            CERTIFICATE_CN
        );
    }

    #[test]
    fn wrong_nonce() {
        let (cert, _) = create_certificate(Some(&dummy::Issuer), b"nonce").unwrap();
        assert!(matches!(
            verify_certificate(&cert, &dummy_validators(), b"other"),
            Err(AtlsError::Validation(Error::BindingMismatch(_)))
        ));
    }

    #[test]
    fn no_compatible_validator() {
        let (cert, _) = create_certificate(Some(&dummy::Issuer), b"nonce").unwrap();
        let validators: Vec<Arc<dyn Validator>> =
            vec![Arc::new(qemu::vtpm::validator(MeasurementSet::new()))];
        let err = verify_certificate(&cert, &validators, b"nonce").unwrap_err();
        assert!(matches!(err, AtlsError::NoCompatibleDocument));
        assert_eq!(
            err.to_string(),
            "certificate does not contain compatible attestation documents"
        );

        let (plain, _) = create_certificate(None, b"nonce").unwrap();
        assert!(matches!(
            verify_certificate(&plain, &dummy_validators(), b"nonce"),
            Err(AtlsError::NoCompatibleDocument)
        ));
    }

    /// Issues documents for fixed user data instead of the key hash.
    struct FixedUserData;

    impl Issuer for FixedUserData {
        fn variant(&self) -> Variant {
            Variant::Dummy
        }

        fn issue(&self, _user_data: &[u8], nonce: &[u8]) -> crate::error::Result<Vec<u8>> {
            dummy::Issuer.issue(&[0u8; 32], nonce)
        }
    }

    #[test]
    fn user_data_must_match_key() {
        let (cert, _) = create_certificate(Some(&FixedUserData), b"nonce").unwrap();
        assert!(matches!(
            verify_certificate(&cert, &dummy_validators(), b"nonce"),
            Err(AtlsError::UserDataMismatch)
        ));
    }

    #[test]
    fn nonce_server_name() {
        let nonce = random_nonce();
        let name = nonce_to_server_name(&nonce).unwrap();
        let ServerName::DnsName(dns) = &name else {
            panic!("expected dns name");
        };
        assert!(dns.as_ref().ends_with(".nonce"));
        assert_eq!(nonce_from_server_name(dns.as_ref()).unwrap(), nonce);
        assert!(nonce_from_server_name("example.com").is_err());
        assert!(nonce_to_server_name(b"short").is_err());
    }

    fn serve(
        issuer: Option<Arc<dyn Issuer>>,
        validators: Vec<Arc<dyn Validator>>,
    ) -> (std::net::SocketAddr, thread::JoinHandle<Result<(), AtlsError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (sock, _) = listener.accept()?;
            let mut tls = accept(sock, issuer, validators)?;
            tls.write_all(b"ok")?;
            tls.flush()?;
            Ok(())
        });
        (addr, handle)
    }

    fn read_ok(tls: &mut ClientStream) -> std::io::Result<()> {
        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf)?;
        assert_eq!(&buf, b"ok");
        Ok(())
    }

    #[test]
    fn handshake_with_dummy_attestation() {
        let (addr, server) = serve(Some(Arc::new(dummy::Issuer)), Vec::new());
        let mut tls = connect(addr, None, dummy_validators()).unwrap();
        read_ok(&mut tls).unwrap();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn mutual_handshake() {
        let (addr, server) = serve(Some(Arc::new(dummy::Issuer)), dummy_validators());
        let mut tls = connect(addr, Some(Arc::new(dummy::Issuer)), dummy_validators()).unwrap();
        read_ok(&mut tls).unwrap();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn handshake_with_qemu_vtpm() {
        let sim = SimulatedTpm::new();
        let mut expected = MeasurementSet::new();
        expected.insert(
            4,
            crate::measurements::Measurement::new(
                sim.pcr(4).to_vec(),
                crate::measurements::Enforcement::Enforce,
            ),
        );
        let issuer: Arc<dyn Issuer> = Arc::new(qemu::vtpm::issuer(Box::new(sim)));
        let validators: Vec<Arc<dyn Validator>> = vec![Arc::new(qemu::vtpm::validator(expected))];

        let (addr, server) = serve(Some(issuer), Vec::new());
        let mut tls = connect(addr, None, validators).unwrap();
        read_ok(&mut tls).unwrap();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn unattested_server_is_rejected() {
        let (addr, server) = serve(None, Vec::new());
        assert!(connect(addr, None, dummy_validators()).is_err());
        assert!(server.join().unwrap().is_err());
    }

    #[test]
    fn unattested_client_is_rejected() {
        let (addr, server) = serve(Some(Arc::new(dummy::Issuer)), dummy_validators());
        let client = connect(addr, None, dummy_validators())
            .map_err(|e| e.to_string())
            .and_then(|mut tls| read_ok(&mut tls).map_err(|e| e.to_string()));
        assert!(client.is_err());
        assert!(server.join().unwrap().is_err());
    }

    #[test]
    fn accepts_unattested_server_without_validators() {
        let (addr, server) = serve(None, Vec::new());
        let mut tls = connect(addr, None, Vec::new()).unwrap();
        read_ok(&mut tls).unwrap();
        server.join().unwrap().unwrap();
    }
}
