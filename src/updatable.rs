// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A validator whose expected measurements follow a file on disk.

use crate::choose;
use crate::config::{AttestationConfig, ConfigError};
use crate::error::{Error, Result};
use crate::https::HttpsGetter;
use crate::measurements::{MeasurementError, MeasurementSet};
use crate::variant::Variant;
use crate::Validator;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("reading {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid measurements")]
    Measurements(#[from] MeasurementError),
    #[error("invalid attestation config")]
    Config(#[from] ConfigError),
    #[error("creating validator")]
    Validator(#[from] Error),
}

struct Current {
    validator: Box<dyn Validator>,
    config: AttestationConfig,
}

/// Validator that can be swapped at runtime. Validations and swaps are
/// mutually exclusive, so no validation sees a half updated validator.
pub struct UpdatableValidator {
    variant: Variant,
    measurements_path: PathBuf,
    config_path: PathBuf,
    getter: Arc<dyn HttpsGetter>,
    current: Mutex<Current>,
    // serializes updates end to end: the last update to start wins
    updating: Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking validator leaves the state intact, keep serving
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UpdatableValidator {
    /// Load the initial validator. `config_path` may be missing, the variant
    /// defaults are used then.
    pub fn new(
        variant: Variant,
        measurements_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        getter: Arc<dyn HttpsGetter>,
    ) -> Result<Self, UpdateError> {
        let measurements_path = measurements_path.into();
        let config_path = config_path.into();
        let config = load_config(variant, &measurements_path, &config_path)?;
        let validator = choose::validator_with(&config, getter.clone())?;
        Ok(Self {
            variant,
            measurements_path,
            config_path,
            getter,
            current: Mutex::new(Current { validator, config }),
            updating: Mutex::new(()),
        })
    }

    /// Reload measurements and config. On failure the previous validator
    /// stays in place.
    pub fn update(&self) -> Result<(), UpdateError> {
        let _updating = lock(&self.updating);
        log::info!("updating expected measurements");
        let config = load_config(self.variant, &self.measurements_path, &self.config_path)?;
        let validator = choose::validator_with(&config, self.getter.clone())?;
        *lock(&self.current) = Current { validator, config };
        log::info!("updated expected measurements");
        Ok(())
    }

    /// The measurements currently enforced.
    pub fn measurements(&self) -> MeasurementSet {
        lock(&self.current).config.measurements().clone()
    }

    pub fn measurements_path(&self) -> &Path {
        &self.measurements_path
    }
}

fn load_config(
    variant: Variant,
    measurements_path: &Path,
    config_path: &Path,
) -> Result<AttestationConfig, UpdateError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| UpdateError::Read {
            path: path.to_path_buf(),
            source,
        })
    };
    let mut config = match std::fs::read(config_path) {
        Ok(json) => AttestationConfig::load(&json)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!(
                "no attestation config at {}, using {variant} defaults",
                config_path.display()
            );
            AttestationConfig::default_for(variant)
        }
        Err(source) => {
            return Err(UpdateError::Read {
                path: config_path.to_path_buf(),
                source,
            })
        }
    };
    if config.variant() != variant {
        return Err(ConfigError::WrongVariant {
            expected: variant,
            found: config.variant(),
        }
        .into());
    }
    let measurements =
        MeasurementSet::load(&read(measurements_path)?, variant.measurement_length())?;
    config.set_measurements(measurements)?;
    Ok(config)
}

impl Validator for UpdatableValidator {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn validate(&self, document: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        lock(&self.current).validator.validate(document, nonce)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Write,
    Chmod,
    Remove,
    /// The path now names a different file.
    Rename,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub path: PathBuf,
    pub kind: EventKind,
}

#[derive(Error, Debug)]
#[error("watching {path}")]
pub struct WatchError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FileState {
    ino: u64,
    len: u64,
    mode: u32,
    modified: Option<SystemTime>,
}

fn stat(path: &Path) -> std::io::Result<Option<FileState>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(FileState {
            ino: meta.ino(),
            len: meta.len(),
            mode: meta.mode(),
            modified: meta.modified().ok(),
        })),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn change(before: Option<FileState>, after: Option<FileState>) -> Option<EventKind> {
    match (before, after) {
        (None, Some(_)) => Some(EventKind::Create),
        (Some(_), None) => Some(EventKind::Remove),
        (Some(b), Some(a)) if b.ino != a.ino => Some(EventKind::Rename),
        (Some(b), Some(a)) if b.len != a.len || b.modified != a.modified => Some(EventKind::Write),
        (Some(b), Some(a)) if b.mode != a.mode => Some(EventKind::Chmod),
        _ => None,
    }
}

type Watched = Arc<Mutex<BTreeMap<PathBuf, Option<FileState>>>>;

/// File watcher that polls the metadata of the watched paths.
pub struct PollingWatcher {
    watched: Watched,
    events: Receiver<Event>,
    errors: Receiver<WatchError>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        let watched: Watched = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let (event_tx, events) = mpsc::channel();
        let (error_tx, errors) = mpsc::channel();
        let handle = {
            let watched = watched.clone();
            let stop = stop.clone();
            thread::spawn(move || poll(&watched, &stop, interval, &event_tx, &error_tx))
        };
        Self {
            watched,
            events,
            errors,
            stop,
            handle: Some(handle),
        }
    }

    /// Watch `path`, or forget its last seen state if already watched.
    pub fn add(&self, path: impl Into<PathBuf>) -> Result<(), WatchError> {
        let path = path.into();
        let state = stat(&path).map_err(|source| WatchError {
            path: path.clone(),
            source,
        })?;
        lock(&self.watched).insert(path, state);
        Ok(())
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn errors(&self) -> &Receiver<WatchError> {
        &self.errors
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll(
    watched: &Watched,
    stop: &AtomicBool,
    interval: Duration,
    events: &Sender<Event>,
    errors: &Sender<WatchError>,
) {
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(interval);
        let mut watched = lock(watched);
        for (path, last) in watched.iter_mut() {
            let now = match stat(path) {
                Ok(now) => now,
                Err(source) => {
                    let _ = errors.send(WatchError {
                        path: path.clone(),
                        source,
                    });
                    continue;
                }
            };
            if let Some(kind) = change(*last, now) {
                *last = now;
                let event = Event {
                    path: path.clone(),
                    kind,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        }
    }
}

/// Update `validator` whenever its measurements file changes, until `stop`
/// is set. Update failures are logged and the previous validator is kept.
pub fn watch_measurements(
    validator: &UpdatableValidator,
    watcher: &PollingWatcher,
    stop: &AtomicBool,
) -> Result<(), WatchError> {
    watcher.add(validator.measurements_path())?;
    while !stop.load(Ordering::SeqCst) {
        while let Ok(err) = watcher.errors().try_recv() {
            log::warn!("file watcher: {err}: {}", err.source);
        }
        let event = match watcher.events().recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        log::debug!("{:?} event on {}", event.kind, event.path.display());
        match event.kind {
            EventKind::Remove => continue,
            EventKind::Rename => watcher.add(&event.path)?,
            EventKind::Create | EventKind::Write | EventKind::Chmod => {}
        }
        if let Err(e) = validator.update() {
            log::error!("updating validator: {e}");
        }
    }
    Ok(())
}
