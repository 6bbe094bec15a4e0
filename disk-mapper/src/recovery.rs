// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Recovering the state disk key of a rebooted node.
//!
//! Two tasks race for the keys: a server waiting for an operator to push
//! them and a client asking the running control plane for a rejoin ticket.
//! The first result wins and cancels the other task.

use cvm_attestation::keys::{Secret, DEFAULT_KEY_LENGTH};
use cvm_attestation::rpc::{self, Handler, Request, Response, RpcError, Status};
use cvm_attestation::Issuer;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("recovery server: {0}")]
    Server(#[from] RpcError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("recovery ended without keys")]
    NoKeys,
}

/// Cooperative cancellation shared by the racing tasks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.claim();
    }

    /// Cancels the token and returns whether this call cancelled it. A task
    /// may only hand out its result after winning the claim.
    pub fn claim(&self) -> bool {
        let _guard = self.0.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let won = self
            .0
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.0.wake.notify_all();
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Flag for loops polling a stop condition.
    pub fn flag(&self) -> &AtomicBool {
        &self.0.cancelled
    }

    /// Sleeps for `duration` unless cancelled first. Returns whether the
    /// token is cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.0.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .0
            .wake
            .wait_timeout_while(guard, duration, |_| !self.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_cancelled()
    }
}

/// Keys needed to map the state disk and re-taint the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredKeys {
    pub passphrase: Secret,
    pub measurement_secret: Secret,
}

/// Waits for keys pushed by an operator.
pub trait ServeRecovery: Send + Sync {
    /// Serves on `listener` until keys arrive or `token` is cancelled. Keys
    /// are only accepted after claiming `token`.
    fn serve(
        &self,
        listener: TcpListener,
        disk_uuid: &str,
        token: &CancelToken,
    ) -> Result<Option<RecoveredKeys>, RecoveryError>;
}

/// Requests keys from the running cluster.
pub trait Rejoin: Send + Sync {
    /// Retries until keys are received or `token` is cancelled.
    fn start(&self, disk_uuid: &str, token: &CancelToken) -> Option<RecoveredKeys>;
}

struct PushHandler {
    keys: OnceLock<RecoveredKeys>,
    token: CancelToken,
}

impl Handler for PushHandler {
    fn handle(&self, request: Request) -> Result<Response, Status> {
        let method = request.method();
        let Request::PushStateDiskKey(push) = request else {
            return Err(Status::not_found(format!(
                "{method} is not served by the recovery server"
            )));
        };
        if push.state_disk_key.len() != DEFAULT_KEY_LENGTH
            || push.measurement_secret.len() != DEFAULT_KEY_LENGTH
        {
            return Err(Status::invalid_argument(format!(
                "state disk key and measurement secret must be {DEFAULT_KEY_LENGTH} bytes"
            )));
        }
        let keys = RecoveredKeys {
            passphrase: push.state_disk_key,
            measurement_secret: push.measurement_secret,
        };
        if !self.token.claim() || self.keys.set(keys).is_err() {
            log::warn!("refusing state disk key push, keys were already received");
            return Err(Status::failed_precondition("keys already received"));
        }
        log::info!("received state disk key from operator");
        Ok(Response::StateDiskKeyPushed)
    }
}

/// aTLS server accepting a single PushStateDiskKey request. Clients verify
/// the node's attestation before they send the keys.
pub struct RecoveryServer {
    issuer: Arc<dyn Issuer>,
    timeout: Duration,
}

impl RecoveryServer {
    pub fn new(issuer: Arc<dyn Issuer>) -> Self {
        Self {
            issuer,
            timeout: rpc::DEFAULT_TIMEOUT,
        }
    }
}

impl ServeRecovery for RecoveryServer {
    fn serve(
        &self,
        listener: TcpListener,
        disk_uuid: &str,
        token: &CancelToken,
    ) -> Result<Option<RecoveredKeys>, RecoveryError> {
        log::info!("waiting for the key of state disk {disk_uuid}");
        let handler = Arc::new(PushHandler {
            keys: OnceLock::new(),
            token: token.clone(),
        });
        rpc::Server::new(Some(self.issuer.clone()), Vec::new(), handler.clone())
            .with_timeout(self.timeout)
            .serve(listener, token.flag())?;
        Ok(handler.keys.get().cloned())
    }
}

/// Runs the recovery server and the rejoin client against each other.
pub struct NodeRecoverer {
    server: Box<dyn ServeRecovery>,
    rejoin: Box<dyn Rejoin>,
}

impl NodeRecoverer {
    pub fn new(server: Box<dyn ServeRecovery>, rejoin: Box<dyn Rejoin>) -> Self {
        Self { server, rejoin }
    }

    /// Returns the first keys either task obtains, once both have exited.
    /// Server errors caused by cancellation are not reported.
    pub fn recover(&self, disk_uuid: &str, listener: TcpListener) -> Result<RecoveredKeys, RecoveryError> {
        let token = CancelToken::new();
        let slot = OnceLock::new();

        thread::scope(|s| {
            s.spawn(|| {
                if let Some(keys) = self.rejoin.start(disk_uuid, &token) {
                    if token.claim() && slot.set(keys).is_ok() {
                        log::info!("received keys from the join service");
                    } else {
                        log::warn!("discarding rejoin ticket, keys were already pushed by an operator");
                    }
                }
                token.cancel();
            });

            let served = match self.server.serve(listener, disk_uuid, &token) {
                Ok(Some(keys)) => {
                    if slot.set(keys).is_err() {
                        log::warn!("discarding pushed keys, node already rejoined");
                    }
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) if token.is_cancelled() => {
                    log::debug!("recovery server stopped: {e}");
                    Ok(())
                }
                Err(e) => Err(e),
            };
            token.cancel();
            served
        })?;

        slot.into_inner().ok_or(RecoveryError::NoKeys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm_attestation::dummy;
    use cvm_attestation::rpc::{Code, PushStateDiskKeyRequest};
    use std::time::Instant;

    fn keys(b: u8) -> RecoveredKeys {
        RecoveredKeys {
            passphrase: Secret::new(vec![b; 32]),
            measurement_secret: Secret::new(vec![b + 1; 32]),
        }
    }

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    struct SlowServer {
        delay: Duration,
        result: Option<RecoveredKeys>,
        cancelled: Arc<AtomicBool>,
    }

    impl ServeRecovery for SlowServer {
        fn serve(
            &self,
            _: TcpListener,
            _: &str,
            token: &CancelToken,
        ) -> Result<Option<RecoveredKeys>, RecoveryError> {
            if token.sleep(self.delay) || !token.claim() {
                self.cancelled.store(true, Ordering::SeqCst);
                return Ok(None);
            }
            Ok(self.result.clone())
        }
    }

    struct SlowRejoin {
        delay: Duration,
        result: Option<RecoveredKeys>,
        cancelled: Arc<AtomicBool>,
    }

    impl Rejoin for SlowRejoin {
        fn start(&self, _: &str, token: &CancelToken) -> Option<RecoveredKeys> {
            if token.sleep(self.delay) {
                self.cancelled.store(true, Ordering::SeqCst);
                return None;
            }
            self.result.clone()
        }
    }

    struct FailingServer;

    impl ServeRecovery for FailingServer {
        fn serve(&self, _: TcpListener, _: &str, _: &CancelToken) -> Result<Option<RecoveredKeys>, RecoveryError> {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "port taken").into())
        }
    }

    #[test]
    fn cancel_wakes_sleepers() {
        let token = CancelToken::new();
        assert!(!token.sleep(Duration::from_millis(1)));

        let sleeper = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(60)));
        thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(token.flag().load(Ordering::SeqCst));
    }

    #[test]
    fn rejoin_client_wins() {
        let server_cancelled = Arc::new(AtomicBool::new(false));
        let recoverer = NodeRecoverer::new(
            Box::new(SlowServer {
                delay: Duration::from_secs(2),
                result: Some(keys(1)),
                cancelled: server_cancelled.clone(),
            }),
            Box::new(SlowRejoin {
                delay: Duration::from_millis(500),
                result: Some(keys(10)),
                cancelled: Arc::new(AtomicBool::new(false)),
            }),
        );

        let start = Instant::now();
        assert_eq!(recoverer.recover("uuid", listener()).unwrap(), keys(10));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(server_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn recovery_server_wins() {
        let rejoin_cancelled = Arc::new(AtomicBool::new(false));
        let recoverer = NodeRecoverer::new(
            Box::new(SlowServer {
                delay: Duration::from_millis(500),
                result: Some(keys(1)),
                cancelled: Arc::new(AtomicBool::new(false)),
            }),
            Box::new(SlowRejoin {
                delay: Duration::from_secs(2),
                result: Some(keys(10)),
                cancelled: rejoin_cancelled.clone(),
            }),
        );

        assert_eq!(recoverer.recover("uuid", listener()).unwrap(), keys(1));
        assert!(rejoin_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn server_errors_are_surfaced() {
        let rejoin_cancelled = Arc::new(AtomicBool::new(false));
        let recoverer = NodeRecoverer::new(
            Box::new(FailingServer),
            Box::new(SlowRejoin {
                delay: Duration::from_secs(60),
                result: Some(keys(10)),
                cancelled: rejoin_cancelled.clone(),
            }),
        );

        assert!(matches!(
            recoverer.recover("uuid", listener()),
            Err(RecoveryError::Io(_))
        ));
        assert!(rejoin_cancelled.load(Ordering::SeqCst));
    }

    /// Ignores cancellation and always comes back with keys.
    struct LateRejoin {
        delay: Duration,
    }

    impl Rejoin for LateRejoin {
        fn start(&self, _: &str, _: &CancelToken) -> Option<RecoveredKeys> {
            thread::sleep(self.delay);
            Some(keys(10))
        }
    }

    #[test]
    fn late_rejoin_ticket_is_discarded() {
        let recoverer = NodeRecoverer::new(
            Box::new(SlowServer {
                delay: Duration::ZERO,
                result: Some(keys(1)),
                cancelled: Arc::new(AtomicBool::new(false)),
            }),
            Box::new(LateRejoin {
                delay: Duration::from_millis(200),
            }),
        );
        assert_eq!(recoverer.recover("uuid", listener()).unwrap(), keys(1));
    }

    #[test]
    fn claim_is_won_once() {
        let token = CancelToken::new();
        let racers: Vec<_> = (0..8)
            .map(|_| {
                let token = token.clone();
                thread::spawn(move || token.claim())
            })
            .collect();
        let won = racers
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(won, 1);
        assert!(token.is_cancelled());
        assert!(!token.claim());
    }

    #[test]
    fn push_after_rejoin_is_refused() {
        let token = CancelToken::new();
        assert!(token.claim());
        let handler = PushHandler {
            keys: OnceLock::new(),
            token,
        };
        let status = handler.handle(push(32, 32)).unwrap_err();
        assert_eq!(status.code, Code::FailedPrecondition);
        assert!(handler.keys.get().is_none());
    }

    fn push(state_disk_key: usize, measurement_secret: usize) -> Request {
        Request::PushStateDiskKey(PushStateDiskKeyRequest {
            state_disk_key: Secret::new(vec![1; state_disk_key]),
            measurement_secret: Secret::new(vec![2; measurement_secret]),
        })
    }

    #[test]
    fn push_handler_accepts_one_push() {
        let token = CancelToken::new();
        let handler = PushHandler {
            keys: OnceLock::new(),
            token: token.clone(),
        };

        for (key, secret) in [(16, 32), (32, 0), (33, 32)] {
            let status = handler.handle(push(key, secret)).unwrap_err();
            assert_eq!(status.code, Code::InvalidArgument);
        }
        assert!(!token.is_cancelled());

        assert_eq!(handler.handle(push(32, 32)).unwrap(), Response::StateDiskKeyPushed);
        assert!(token.is_cancelled());
        assert_eq!(handler.keys.get().unwrap().passphrase.as_bytes(), &[1; 32]);

        let status = handler.handle(push(32, 32)).unwrap_err();
        assert_eq!(status.code, Code::FailedPrecondition);
        assert_eq!(status.message, "keys already received");
    }

    #[test]
    fn operator_push_over_atls() {
        let listener = listener();
        let endpoint = listener.local_addr().unwrap().to_string();
        let recoverer = NodeRecoverer::new(
            Box::new(RecoveryServer::new(Arc::new(dummy::Issuer))),
            Box::new(SlowRejoin {
                delay: Duration::from_secs(60),
                result: None,
                cancelled: Arc::new(AtomicBool::new(false)),
            }),
        );

        let recovered = thread::scope(|s| {
            let handle = s.spawn(|| recoverer.recover("uuid", listener));
            let client = rpc::Client::new(None, vec![Arc::new(dummy::Validator)]);
            client
                .push_state_disk_key(
                    &endpoint,
                    PushStateDiskKeyRequest {
                        state_disk_key: Secret::new(vec![7; 32]),
                        measurement_secret: Secret::new(vec![8; 32]),
                    },
                )
                .unwrap();
            handle.join().unwrap()
        })
        .unwrap();

        assert_eq!(recovered.passphrase.as_bytes(), &[7; 32]);
        assert_eq!(recovered.measurement_secret.as_bytes(), &[8; 32]);
    }
}
