// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Join service: hands the state disk key back to attested nodes that
//! rejoin the cluster.

use crate::keyservice::{DataKeyGetter, MEASUREMENT_SECRET_CONTEXT, STATE_DISK_KEY_LENGTH};
use cvm_attestation::keys::DEFAULT_KEY_LENGTH;
use cvm_attestation::rpc::{self, Handler, IssueRejoinTicketResponse, Request, Response, Status};
use cvm_attestation::{Issuer, Validator};
use std::sync::Arc;

pub struct JoinService {
    keys: Arc<dyn DataKeyGetter>,
}

impl JoinService {
    pub fn new(keys: Arc<dyn DataKeyGetter>) -> Self {
        Self { keys }
    }

    /// aTLS server that only admits nodes passing `validator`.
    pub fn server(self, issuer: Arc<dyn Issuer>, validator: Arc<dyn Validator>) -> rpc::Server {
        rpc::Server::new(Some(issuer), vec![validator], Arc::new(self))
    }
}

impl Handler for JoinService {
    fn handle(&self, request: Request) -> Result<Response, Status> {
        let method = request.method();
        let Request::IssueRejoinTicket(req) = request else {
            return Err(Status::not_found(format!("{method} is not served by the join service")));
        };
        if req.disk_uuid.is_empty() {
            return Err(Status::invalid_argument("missing disk UUID"));
        }
        log::info!("IssueRejoinTicket called for disk {}", req.disk_uuid);

        let measurement_secret = self
            .keys
            .get_data_key(MEASUREMENT_SECRET_CONTEXT, DEFAULT_KEY_LENGTH)
            .map_err(|e| {
                log::error!("unable to get measurement secret: {e}");
                Status::internal(format!("unable to get measurement secret: {e}"))
            })?;
        let state_disk_key = self
            .keys
            .get_data_key(&req.disk_uuid.to_ascii_lowercase(), STATE_DISK_KEY_LENGTH)
            .map_err(|e| {
                log::error!("unable to get key for stateful disk: {e}");
                Status::internal(format!("unable to get key for stateful disk: {e}"))
            })?;

        log::info!("IssueRejoinTicket successful");
        Ok(Response::RejoinTicket(IssueRejoinTicketResponse {
            state_disk_key,
            measurement_secret,
        }))
    }
}
