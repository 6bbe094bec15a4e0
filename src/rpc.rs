// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Node RPCs over aTLS.
//!
//! Every connection carries one request and one response, each a JSON
//! document prefixed with its big-endian `u32` length.

use crate::atls::{self, AtlsError};
use crate::document::base64_bytes;
use crate::keys::Secret;
use crate::{Issuer, Validator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

pub const RECOVERY_PORT: u16 = 9999;
pub const JOIN_SERVICE_PORT: u16 = 30090;
pub const VERIFY_SERVICE_PORT: u16 = 30081;

pub const MAX_MESSAGE_SIZE: usize = 16 << 20;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("encoding message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error(transparent)]
    Atls(#[from] AtlsError),
    #[error("{0}")]
    Status(Status),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error("cannot resolve {0}")]
    Address(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    NotFound,
    Unavailable,
    Internal,
}

/// Error reply of a handler.
#[derive(Error, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetAttestationRequest {
    #[serde(with = "base64_bytes", default)]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub user_data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetAttestationResponse {
    #[serde(with = "base64_bytes", default)]
    pub attestation: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushStateDiskKeyRequest {
    pub state_disk_key: Secret,
    pub measurement_secret: Secret,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssueRejoinTicketRequest {
    pub disk_uuid: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssueRejoinTicketResponse {
    pub state_disk_key: Secret,
    pub measurement_secret: Secret,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    GetAttestation(GetAttestationRequest),
    PushStateDiskKey(PushStateDiskKeyRequest),
    IssueRejoinTicket(IssueRejoinTicketRequest),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetAttestation(_) => "GetAttestation",
            Request::PushStateDiskKey(_) => "PushStateDiskKey",
            Request::IssueRejoinTicket(_) => "IssueRejoinTicket",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "result", content = "value")]
pub enum Response {
    Attestation(GetAttestationResponse),
    StateDiskKeyPushed,
    RejoinTicket(IssueRejoinTicketResponse),
    Error(Status),
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), RpcError> {
    let body = Zeroizing::new(serde_json::to_vec(message)?);
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| len as usize <= MAX_MESSAGE_SIZE)
        .ok_or(RpcError::TooLarge(body.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, RpcError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RpcError::TooLarge(len));
    }
    let mut body = Zeroizing::new(vec![0u8; len]);
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Serves requests of one kind.
pub trait Handler: Send + Sync {
    fn handle(&self, request: Request) -> Result<Response, Status>;
}

/// aTLS server running one handler per connection.
pub struct Server {
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
    handler: Arc<dyn Handler>,
    timeout: Duration,
}

impl Server {
    /// Without validators clients connect unattested.
    pub fn new(
        issuer: Option<Arc<dyn Issuer>>,
        validators: Vec<Arc<dyn Validator>>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            issuer,
            validators,
            handler,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Accepts connections until `stop` is set.
    pub fn serve(&self, listener: TcpListener, stop: &AtomicBool) -> Result<(), RpcError> {
        listener.set_nonblocking(true)?;
        log::info!("serving on {}", listener.local_addr()?);
        while !stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((sock, peer)) => {
                    sock.set_nonblocking(false)?;
                    let issuer = self.issuer.clone();
                    let validators = self.validators.clone();
                    let handler = self.handler.clone();
                    let timeout = self.timeout;
                    thread::spawn(move || {
                        if let Err(e) = serve_connection(sock, issuer, validators, handler, timeout) {
                            log::warn!("connection from {peer}: {e}");
                        }
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) => return Err(e.into()),
            }
        }
        log::info!("server stopped");
        Ok(())
    }
}

fn serve_connection(
    sock: TcpStream,
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
    handler: Arc<dyn Handler>,
    timeout: Duration,
) -> Result<(), RpcError> {
    sock.set_read_timeout(Some(timeout))?;
    sock.set_write_timeout(Some(timeout))?;
    let mut tls = atls::accept(sock, issuer, validators)?;
    let request: Request = read_message(&mut tls)?;
    let method = request.method();
    let response = handler.handle(request).unwrap_or_else(|status| {
        log::info!("{method} failed: {status}");
        Response::Error(status)
    });
    write_message(&mut tls, &response)?;
    tls.conn.send_close_notify();
    tls.flush()?;
    Ok(())
}

/// aTLS client issuing one request per connection.
#[derive(Clone)]
pub struct Client {
    issuer: Option<Arc<dyn Issuer>>,
    validators: Vec<Arc<dyn Validator>>,
    timeout: Duration,
}

impl Client {
    pub fn new(issuer: Option<Arc<dyn Issuer>>, validators: Vec<Arc<dyn Validator>>) -> Self {
        Self {
            issuer,
            validators,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `request` to `endpoint` (`host:port`). Error replies are returned
    /// as [`RpcError::Status`].
    pub fn call(&self, endpoint: &str, request: &Request) -> Result<Response, RpcError> {
        let addr: SocketAddr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::Address(endpoint.to_string()))?;
        let mut sock = TcpStream::connect_timeout(&addr, self.timeout)?;
        sock.set_read_timeout(Some(self.timeout))?;
        sock.set_write_timeout(Some(self.timeout))?;
        let conn = atls::connect_stream(&mut sock, self.issuer.clone(), self.validators.clone())?;
        let mut tls = rustls::StreamOwned::new(conn, sock);
        write_message(&mut tls, request)?;
        match read_message(&mut tls)? {
            Response::Error(status) => Err(RpcError::Status(status)),
            response => Ok(response),
        }
    }

    pub fn get_attestation(
        &self,
        endpoint: &str,
        request: GetAttestationRequest,
    ) -> Result<GetAttestationResponse, RpcError> {
        match self.call(endpoint, &Request::GetAttestation(request))? {
            Response::Attestation(response) => Ok(response),
            _ => Err(RpcError::UnexpectedResponse("GetAttestation")),
        }
    }

    pub fn push_state_disk_key(
        &self,
        endpoint: &str,
        request: PushStateDiskKeyRequest,
    ) -> Result<(), RpcError> {
        match self.call(endpoint, &Request::PushStateDiskKey(request))? {
            Response::StateDiskKeyPushed => Ok(()),
            _ => Err(RpcError::UnexpectedResponse("PushStateDiskKey")),
        }
    }

    pub fn issue_rejoin_ticket(
        &self,
        endpoint: &str,
        request: IssueRejoinTicketRequest,
    ) -> Result<IssueRejoinTicketResponse, RpcError> {
        match self.call(endpoint, &Request::IssueRejoinTicket(request))? {
            Response::RejoinTicket(response) => Ok(response),
            _ => Err(RpcError::UnexpectedResponse("IssueRejoinTicket")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy;
    use std::io::Cursor;

    #[test]
    fn framing() {
        let request = Request::IssueRejoinTicket(IssueRejoinTicketRequest {
            disk_uuid: "8a1b3f52-0000-4000-8000-000000000001".into(),
        });
        let mut buf = Vec::new();
        write_message(&mut buf, &request).unwrap();
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let json: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(json["method"], "IssueRejoinTicket");
        assert_eq!(json["params"]["diskUuid"], "8a1b3f52-0000-4000-8000-000000000001");

        let read: Request = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, request);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut buf = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(matches!(
            read_message::<_, Request>(&mut Cursor::new(buf)),
            Err(RpcError::TooLarge(_))
        ));
    }

    #[test]
    fn truncated_message() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(matches!(
            read_message::<_, Request>(&mut Cursor::new(buf)),
            Err(RpcError::Io(_))
        ));
    }

    #[test]
    fn secrets_are_not_logged() {
        let request = PushStateDiskKeyRequest {
            state_disk_key: Secret::new([0x42; 32]),
            measurement_secret: Secret::new([0x43; 32]),
        };
        let debug = format!("{request:?}");
        assert!(!debug.contains("66"));
        assert!(debug.contains("REDACTED"));
    }

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, request: Request) -> Result<Response, Status> {
            match request {
                Request::GetAttestation(req) if req.nonce.is_empty() => {
                    Err(Status::invalid_argument("empty nonce"))
                }
                Request::GetAttestation(req) => Ok(Response::Attestation(GetAttestationResponse {
                    attestation: req.user_data,
                })),
                _ => Err(Status::new(Code::Unavailable, "not served here")),
            }
        }
    }

    fn start(validators: Vec<Arc<dyn Validator>>) -> (String, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let server = Server::new(Some(Arc::new(dummy::Issuer)), validators, Arc::new(Echo));
        let flag = stop.clone();
        let handle = thread::spawn(move || server.serve(listener, &flag).unwrap());
        (endpoint, stop, handle)
    }

    #[test]
    fn request_and_error_reply() {
        let (endpoint, stop, handle) = start(Vec::new());
        let client = Client::new(None, vec![Arc::new(dummy::Validator)]);

        let response = client
            .get_attestation(
                &endpoint,
                GetAttestationRequest {
                    nonce: b"nonce".to_vec(),
                    user_data: b"payload".to_vec(),
                },
            )
            .unwrap();
        assert_eq!(response.attestation, b"payload");

        let err = client
            .get_attestation(&endpoint, GetAttestationRequest::default())
            .unwrap_err();
        assert!(matches!(err, RpcError::Status(Status { code: Code::InvalidArgument, .. })));

        let err = client
            .issue_rejoin_ticket(
                &endpoint,
                IssueRejoinTicketRequest {
                    disk_uuid: "uuid".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::Status(Status { code: Code::Unavailable, .. })));

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn mutual_attestation_is_required() {
        let (endpoint, stop, handle) = start(vec![Arc::new(dummy::Validator)]);
        let request = GetAttestationRequest {
            nonce: b"nonce".to_vec(),
            user_data: b"payload".to_vec(),
        };

        let unattested = Client::new(None, vec![Arc::new(dummy::Validator)]);
        assert!(unattested.get_attestation(&endpoint, request.clone()).is_err());

        let attested = Client::new(Some(Arc::new(dummy::Issuer)), vec![Arc::new(dummy::Validator)]);
        assert_eq!(
            attested.get_attestation(&endpoint, request).unwrap().attestation,
            b"payload"
        );

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
