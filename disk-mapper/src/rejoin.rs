// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rejoin client: asks the control plane's join services for the state disk
//! key of this node.

use crate::recovery::{CancelToken, RecoveredKeys, Rejoin};
use crate::state::Role;
use cvm_attestation::https::{HttpError, HttpsGetter};
use cvm_attestation::rpc::{self, IssueRejoinTicketRequest, JOIN_SERVICE_PORT};
use cvm_attestation::Issuer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Metadata API of the QEMU development setup.
pub const QEMU_METADATA_URL: &str = "http://10.42.0.1:8080";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("parsing metadata: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "ProviderID", default)]
    pub provider_id: String,
    #[serde(default)]
    pub role: Role,
    #[serde(rename = "VPCIP", default)]
    pub vpc_ip: String,
}

/// Cloud metadata needed to find the join services.
pub trait MetadataApi: Send + Sync {
    fn self_instance(&self) -> Result<InstanceMetadata, MetadataError>;
    fn list(&self) -> Result<Vec<InstanceMetadata>, MetadataError>;
    /// Host of the control plane load balancer.
    fn load_balancer_endpoint(&self) -> Result<String, MetadataError>;
}

/// Join service endpoints: the load balancer and every control plane node,
/// except `node` itself.
pub fn join_service_endpoints(
    api: &dyn MetadataApi,
    node: &InstanceMetadata,
    port: u16,
) -> Result<Vec<String>, MetadataError> {
    let mut endpoints = vec![format!("{}:{port}", api.load_balancer_endpoint()?)];
    endpoints.extend(
        api.list()?
            .into_iter()
            .filter(|instance| instance.role == Role::ControlPlane)
            .map(|instance| format!("{}:{port}", instance.vpc_ip)),
    );
    Ok(remove_self(&node.vpc_ip, endpoints))
}

fn remove_self(self_ip: &str, endpoints: Vec<String>) -> Vec<String> {
    endpoints
        .into_iter()
        .filter(|endpoint| endpoint.rsplit_once(':').map(|(host, _)| host) != Some(self_ip))
        .collect()
}

/// Metadata served to QEMU guests by the host.
pub struct QemuMetadata {
    getter: Box<dyn HttpsGetter>,
    base_url: String,
}

impl QemuMetadata {
    pub fn new(getter: Box<dyn HttpsGetter>) -> Self {
        Self::with_url(getter, QEMU_METADATA_URL)
    }

    pub fn with_url(getter: Box<dyn HttpsGetter>, base_url: impl Into<String>) -> Self {
        Self {
            getter,
            base_url: base_url.into(),
        }
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, MetadataError> {
        let body = self.getter.get(&format!("{}/{path}", self.base_url), &[])?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl MetadataApi for QemuMetadata {
    fn self_instance(&self) -> Result<InstanceMetadata, MetadataError> {
        self.get("self")
    }

    fn list(&self) -> Result<Vec<InstanceMetadata>, MetadataError> {
        self.get("peers")
    }

    fn load_balancer_endpoint(&self) -> Result<String, MetadataError> {
        self.get("endpoint")
    }
}

/// Requests rejoin tickets over aTLS, attesting this node with `issuer`.
pub struct RejoinClient {
    metadata: Box<dyn MetadataApi>,
    client: rpc::Client,
    interval: Duration,
    port: u16,
}

impl RejoinClient {
    pub fn new(issuer: Arc<dyn Issuer>, metadata: Box<dyn MetadataApi>) -> Self {
        Self {
            metadata,
            client: rpc::Client::new(Some(issuer), Vec::new()).with_timeout(DEFAULT_CALL_TIMEOUT),
            interval: DEFAULT_INTERVAL,
            port: JOIN_SERVICE_PORT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn request_ticket(&self, disk_uuid: &str, node: &InstanceMetadata, token: &CancelToken) -> Option<RecoveredKeys> {
        let endpoints = match join_service_endpoints(self.metadata.as_ref(), node, self.port) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                log::warn!("failed to get join service endpoints: {e}");
                return None;
            }
        };
        for endpoint in endpoints {
            if token.is_cancelled() {
                return None;
            }
            log::info!("requesting rejoin ticket from {endpoint}");
            let request = IssueRejoinTicketRequest {
                disk_uuid: disk_uuid.to_string(),
            };
            match self.client.issue_rejoin_ticket(&endpoint, request) {
                Ok(ticket) => {
                    return Some(RecoveredKeys {
                        passphrase: ticket.state_disk_key,
                        measurement_secret: ticket.measurement_secret,
                    })
                }
                Err(e) => log::warn!("rejoin ticket request to {endpoint} failed: {e}"),
            }
        }
        None
    }
}

impl Rejoin for RejoinClient {
    fn start(&self, disk_uuid: &str, token: &CancelToken) -> Option<RecoveredKeys> {
        log::info!("starting rejoin client for disk {disk_uuid}");
        let mut node = None;
        loop {
            if token.is_cancelled() {
                break;
            }
            if node.is_none() {
                match self.metadata.self_instance() {
                    Ok(info) => node = Some(info),
                    Err(e) => log::warn!("failed to get own instance metadata: {e}"),
                }
            }
            if let Some(info) = &node {
                if let Some(keys) = self.request_ticket(disk_uuid, info, token) {
                    return Some(keys);
                }
            }
            if token.sleep(self.interval) {
                break;
            }
        }
        log::info!("rejoin client stopped");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_attestation::dummy;
    use cvm_attestation::https::StaticGetter;
    use cvm_attestation::keys::Secret;
    use cvm_attestation::rpc::{Handler, IssueRejoinTicketResponse, Request, Response, Status};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct StubMetadata {
        self_instance: InstanceMetadata,
        instances: Vec<InstanceMetadata>,
        lb_endpoint: String,
        list_err: bool,
        lb_err: bool,
    }

    fn not_found(what: &str) -> MetadataError {
        HttpError::NotFound(what.to_string()).into()
    }

    impl MetadataApi for StubMetadata {
        fn self_instance(&self) -> Result<InstanceMetadata, MetadataError> {
            Ok(self.self_instance.clone())
        }

        fn list(&self) -> Result<Vec<InstanceMetadata>, MetadataError> {
            if self.list_err {
                return Err(not_found("peers"));
            }
            Ok(self.instances.clone())
        }

        fn load_balancer_endpoint(&self) -> Result<String, MetadataError> {
            if self.lb_err {
                return Err(not_found("endpoint"));
            }
            Ok(self.lb_endpoint.clone())
        }
    }

    fn instance(role: Role, vpc_ip: &str) -> InstanceMetadata {
        InstanceMetadata {
            role,
            vpc_ip: vpc_ip.to_string(),
            ..Default::default()
        }
    }

    fn test_instances() -> Vec<InstanceMetadata> {
        vec![
            instance(Role::ControlPlane, "192.0.2.2"),
            instance(Role::ControlPlane, "192.0.2.3"),
            instance(Role::ControlPlane, "192.0.2.4"),
            instance(Role::Worker, "192.0.2.12"),
            instance(Role::Worker, "192.0.2.13"),
            instance(Role::Worker, "192.0.2.14"),
        ]
    }

    #[test]
    fn endpoints() {
        let meta = StubMetadata {
            instances: test_instances(),
            lb_endpoint: "192.0.2.100".into(),
            ..Default::default()
        };

        let cases = [
            (instance(Role::Worker, "192.0.2.1"), 4),
            (instance(Role::ControlPlane, "192.0.2.1"), 4),
            (instance(Role::ControlPlane, "192.0.2.2"), 3),
        ];
        for (node, want) in cases {
            let endpoints = join_service_endpoints(&meta, &node, JOIN_SERVICE_PORT).unwrap();
            assert_eq!(endpoints.len(), want, "{node:?}");
            assert_eq!(endpoints[0], "192.0.2.100:30090");
            assert!(endpoints.iter().all(|e| !e.starts_with(&format!("{}:", node.vpc_ip))));
            assert!(!endpoints.contains(&"192.0.2.12:30090".to_string()));
        }
    }

    #[test]
    fn endpoint_errors() {
        let node = instance(Role::ControlPlane, "192.0.2.1");
        let list_err = StubMetadata {
            list_err: true,
            ..Default::default()
        };
        assert!(join_service_endpoints(&list_err, &node, JOIN_SERVICE_PORT).is_err());

        let lb_err = StubMetadata {
            instances: test_instances(),
            lb_err: true,
            ..Default::default()
        };
        assert!(join_service_endpoints(&lb_err, &node, JOIN_SERVICE_PORT).is_err());
    }

    #[test]
    fn removes_self() {
        let endpoints: Vec<String> = (2..=6).map(|i| format!("192.0.2.{i}:30090")).collect();
        let mut with_self = endpoints.clone();
        with_self.push("192.0.2.1:30090".into());

        assert_eq!(remove_self("192.0.2.1", endpoints.clone()), endpoints);
        assert_eq!(remove_self("192.0.2.1", with_self), endpoints);
        assert_eq!(remove_self("192.0.2.10", endpoints.clone()).len(), 5);
    }

    #[test]
    fn qemu_metadata() {
        let getter = StaticGetter::new()
            .with(
                "http://meta/self",
                r#"{"Name": "worker-0", "ProviderID": "", "Role": "Worker", "VPCIP": "192.0.100.2"}"#,
            )
            .with(
                "http://meta/peers",
                r#"[{"Name": "control-plane-0", "Role": "ControlPlane", "VPCIP": "192.0.100.1"},
                    {"Name": "worker-0", "Role": "Worker", "VPCIP": "192.0.100.2"}]"#,
            )
            .with("http://meta/endpoint", r#""192.0.100.1""#);
        let meta = QemuMetadata::with_url(Box::new(getter), "http://meta");

        let node = meta.self_instance().unwrap();
        assert_eq!(node.name, "worker-0");
        assert_eq!(node.role, Role::Worker);
        assert_eq!(
            join_service_endpoints(&meta, &node, JOIN_SERVICE_PORT).unwrap(),
            ["192.0.100.1:30090", "192.0.100.1:30090"]
        );
    }

    #[test]
    fn start_stops_on_cancel() {
        let closed = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let meta = StubMetadata {
            self_instance: instance(Role::Worker, "192.0.2.1"),
            instances: vec![instance(Role::ControlPlane, "127.0.0.1")],
            lb_endpoint: "127.0.0.1".into(),
            ..Default::default()
        };
        let client = RejoinClient::new(Arc::new(dummy::Issuer), Box::new(meta))
            .with_interval(Duration::from_secs(60))
            .with_port(port);

        let token = CancelToken::new();
        let start = Instant::now();
        let result = thread::scope(|s| {
            let handle = s.spawn(|| client.start("uuid", &token));
            thread::sleep(Duration::from_millis(200));
            token.cancel();
            handle.join().unwrap()
        });
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    struct JoinService {
        uuids: Mutex<Vec<String>>,
    }

    impl Handler for JoinService {
        fn handle(&self, request: Request) -> Result<Response, Status> {
            let Request::IssueRejoinTicket(req) = request else {
                return Err(Status::not_found("unexpected method"));
            };
            self.uuids.lock().unwrap().push(req.disk_uuid);
            Ok(Response::RejoinTicket(IssueRejoinTicketResponse {
                state_disk_key: Secret::new(vec![3; 32]),
                measurement_secret: Secret::new(vec![4; 32]),
            }))
        }
    }

    #[test]
    fn rejoin_over_atls() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let service = Arc::new(JoinService {
            uuids: Mutex::new(Vec::new()),
        });
        let server = rpc::Server::new(
            Some(Arc::new(dummy::Issuer)),
            vec![Arc::new(dummy::Validator)],
            service.clone(),
        );
        let stop = AtomicBool::new(false);

        let meta = StubMetadata {
            self_instance: instance(Role::Worker, "192.0.2.1"),
            instances: vec![instance(Role::ControlPlane, "127.0.0.1")],
            lb_endpoint: "127.0.0.1".into(),
            ..Default::default()
        };
        let client = RejoinClient::new(Arc::new(dummy::Issuer), Box::new(meta)).with_port(port);

        let keys = thread::scope(|s| {
            s.spawn(|| server.serve(listener, &stop).unwrap());
            let keys = client.start("3f6a9c2e-uuid", &CancelToken::new());
            stop.store(true, Ordering::SeqCst);
            keys
        })
        .unwrap();

        assert_eq!(keys.passphrase.as_bytes(), &[3; 32]);
        assert_eq!(keys.measurement_secret.as_bytes(), &[4; 32]);
        assert_eq!(*service.uuids.lock().unwrap(), ["3f6a9c2e-uuid"]);
    }
}
