// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Verify service: attestation documents on demand, for operators and
//! external auditors.

use cvm_attestation::rpc::{self, GetAttestationResponse, Handler, Request, Response, Status};
use cvm_attestation::Issuer;
use std::sync::Arc;

pub struct VerifyService {
    issuer: Arc<dyn Issuer>,
}

impl VerifyService {
    pub fn new(issuer: Arc<dyn Issuer>) -> Self {
        Self { issuer }
    }

    /// aTLS server open to unattested clients.
    pub fn server(self) -> rpc::Server {
        let issuer = self.issuer.clone();
        rpc::Server::new(Some(issuer), Vec::new(), Arc::new(self))
    }
}

impl Handler for VerifyService {
    fn handle(&self, request: Request) -> Result<Response, Status> {
        let method = request.method();
        let Request::GetAttestation(req) = request else {
            return Err(Status::not_found(format!("{method} is not served by the verify service")));
        };
        if req.nonce.is_empty() {
            return Err(Status::invalid_argument("nonce is required to issue attestation"));
        }
        let attestation = self.issuer.issue(&req.user_data, &req.nonce).map_err(|e| {
            log::error!("issuing attestation: {e}");
            Status::internal(format!("issuing attestation: {e}"))
        })?;
        Ok(Response::Attestation(GetAttestationResponse { attestation }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_attestation::choose::issuer_with;
    use cvm_attestation::https::StaticGetter;
    use cvm_attestation::qemu;
    use cvm_attestation::rpc::{Code, GetAttestationRequest, IssueRejoinTicketRequest};
    use cvm_attestation::tsm::Tsm;
    use cvm_attestation::variant::Variant;
    use cvm_attestation::vtpm::simulator::SimulatedTpm;
    use cvm_attestation::{dummy, Validator};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn request(nonce: &[u8]) -> Request {
        Request::GetAttestation(GetAttestationRequest {
            nonce: nonce.to_vec(),
            user_data: b"auditor".to_vec(),
        })
    }

    #[test]
    fn issues_attestation() {
        let service = VerifyService::new(Arc::new(dummy::Issuer));
        let Response::Attestation(response) = service.handle(request(b"nonce")).unwrap() else {
            panic!("unexpected response");
        };
        assert_eq!(
            dummy::Validator.validate(&response.attestation, b"nonce").unwrap(),
            b"auditor"
        );
    }

    #[test]
    fn rejected_requests() {
        let service = VerifyService::new(Arc::new(dummy::Issuer));
        assert_eq!(service.handle(request(b"")).unwrap_err().code, Code::InvalidArgument);

        let rejoin = Request::IssueRejoinTicket(IssueRejoinTicketRequest {
            disk_uuid: "uuid".into(),
        });
        assert_eq!(service.handle(rejoin).unwrap_err().code, Code::NotFound);
    }

    #[test]
    fn issuer_failures_are_internal() {
        // QEMU TDX needs a TSM report interface that does not exist here
        let issuer = issuer_with(
            Variant::QemuTdx,
            Box::new(SimulatedTpm::new()),
            Box::new(Tsm::new(std::env::temp_dir().join("no-such-tsm"))),
            Arc::new(StaticGetter::new()),
        )
        .unwrap();
        let service = VerifyService::new(Arc::from(issuer));
        assert_eq!(service.handle(request(b"nonce")).unwrap_err().code, Code::Internal);
    }

    #[test]
    fn serve_vtpm_attestation() {
        let issuer: Arc<dyn Issuer> = Arc::new(qemu::vtpm::issuer(Box::new(SimulatedTpm::new())));
        let validator = qemu::vtpm::validator(Default::default());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let server = VerifyService::new(issuer).server();
        let stop = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| server.serve(listener, &stop).unwrap());

            let client = rpc::Client::new(None, vec![Arc::new(qemu::vtpm::validator(Default::default()))]);
            let response = client
                .get_attestation(
                    &endpoint,
                    GetAttestationRequest {
                        nonce: b"fresh nonce".to_vec(),
                        user_data: b"auditor".to_vec(),
                    },
                )
                .unwrap();
            assert_eq!(
                validator.validate(&response.attestation, b"fresh nonce").unwrap(),
                b"auditor"
            );
            assert!(validator.validate(&response.attestation, b"other nonce").is_err());

            stop.store(true, Ordering::SeqCst);
        });
    }
}
