// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Formatting, mapping and mounting of the state disk.

use crate::mapper::{DiskMapper, MapperError, Mounter};
use crate::marker::{Device, MarkerError};
use crate::recovery::{RecoveredKeys, RecoveryError};
use crate::state::{NodeState, StateError, NODE_STATE_PATH};
use crate::systemd::{ConfigWriter, UNIT_DIR};
use cvm_attestation::keys::{derive_cluster_id, KeyError, Secret, DEFAULT_KEY_LENGTH};
use nix::mount::MsFlags;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const KEY_DIR: &str = "/run/cryptsetup-keys.d";
pub const KEY_FILE: &str = "state.key";
pub const STATE_DISK_MOUNT_PATH: &str = "/var/run/state";
pub const MAPPED_NAME: &str = "state";
pub const CRYPTSETUP_OPTIONS: &str = "cipher=aes-xts-plain64,integrity=hmac-sha256";

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Mapper(#[from] MapperError),
    #[error("failed to perform recovery: {0}")]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("deriving cluster id: {0}")]
    Key(#[from] KeyError),
    #[error("marking node as bootstrapped: {0}")]
    Marker(#[from] MarkerError),
    #[error("writing {path}: {source}")]
    Io { path: String, source: io::Error },
}

/// Obtains the keys of an existing state disk.
pub trait RecoveryDoer {
    fn recover(&self, disk_uuid: &str) -> Result<RecoveredKeys, RecoveryError>;
}

impl<F> RecoveryDoer for F
where
    F: Fn(&str) -> Result<RecoveredKeys, RecoveryError>,
{
    fn recover(&self, disk_uuid: &str) -> Result<RecoveredKeys, RecoveryError> {
        self(disk_uuid)
    }
}

pub struct SetupManager {
    disk_path: PathBuf,
    mapper: Box<dyn DiskMapper>,
    mounter: Box<dyn Mounter>,
    marker: Device,
    config: ConfigWriter,
    key_dir: PathBuf,
    mount_path: PathBuf,
}

impl SetupManager {
    pub fn new(
        disk_path: impl Into<PathBuf>,
        mapper: Box<dyn DiskMapper>,
        mounter: Box<dyn Mounter>,
        marker: Device,
    ) -> Self {
        Self {
            disk_path: disk_path.into(),
            mapper,
            mounter,
            marker,
            config: ConfigWriter::new(UNIT_DIR),
            key_dir: PathBuf::from(KEY_DIR),
            mount_path: PathBuf::from(STATE_DISK_MOUNT_PATH),
        }
    }

    /// Overrides the key, unit and mount directories.
    pub fn with_paths(
        mut self,
        key_dir: impl Into<PathBuf>,
        unit_dir: impl Into<PathBuf>,
        mount_path: impl Into<PathBuf>,
    ) -> Self {
        self.key_dir = key_dir.into();
        self.config = ConfigWriter::new(unit_dir);
        self.mount_path = mount_path.into();
        self
    }

    pub fn is_luks(&self) -> bool {
        self.mapper.is_luks()
    }

    pub fn key_file(&self) -> PathBuf {
        self.key_dir.join(KEY_FILE)
    }

    /// Maps a previously used state disk with recovered keys and marks the
    /// node as bootstrapped again.
    pub fn prepare_existing_disk(&self, recovery: &dyn RecoveryDoer) -> Result<(), SetupError> {
        let uuid = self.mapper.uuid()?;
        log::info!("preparing existing state disk {uuid}");

        let keys = recovery.recover(&uuid)?;
        self.mapper.map(MAPPED_NAME, &keys.passphrase)?;

        self.mounter.mkdir_all(&self.mount_path)?;
        // errors from here on fail the boot, so the mount is not cleaned up
        let mapped = Path::new("/dev/mapper").join(MAPPED_NAME);
        self.mounter
            .mount(&mapped, &self.mount_path, "ext4", MsFlags::MS_RDONLY)?;

        let state = NodeState::from_file(self.mount_path.join(NODE_STATE_PATH))?;
        let cluster_id = derive_cluster_id(keys.measurement_secret.as_bytes(), &state.measurement_salt)?;
        self.marker.mark_bootstrapped(cluster_id.as_bytes())?;

        self.save_configuration(&keys.passphrase)?;
        self.mounter.unmount(&self.mount_path)?;
        Ok(())
    }

    /// Formats the state disk with a random passphrase and maps it.
    pub fn prepare_new_disk(&self) -> Result<(), SetupError> {
        log::info!("preparing new state disk {}", self.disk_path.display());
        let mut passphrase = vec![0u8; DEFAULT_KEY_LENGTH];
        OsRng.fill_bytes(&mut passphrase);
        let passphrase = Secret::new(passphrase);

        self.save_configuration(&passphrase)?;
        self.mapper.format(&passphrase)?;
        self.mapper.map(MAPPED_NAME, &passphrase)?;
        Ok(())
    }

    /// Writes the key file and the systemd-cryptsetup unit that maps the
    /// disk with it.
    fn save_configuration(&self, passphrase: &Secret) -> Result<(), SetupError> {
        let key_file = self.key_file();
        let io_err = |source: io::Error| SetupError::Io {
            path: key_file.display().to_string(),
            source,
        };
        fs::create_dir_all(&self.key_dir).map_err(io_err)?;
        match fs::remove_file(&key_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(&key_file)
            .and_then(|mut f| f.write_all(passphrase.as_bytes()))
            .map_err(io_err)?;

        self.config
            .generate(
                MAPPED_NAME,
                &self.disk_path.display().to_string(),
                &key_file.display().to_string(),
                CRYPTSETUP_OPTIONS,
            )
            .map_err(|source| SetupError::Io {
                path: ConfigWriter::unit_name(MAPPED_NAME),
                source,
            })?;
        Ok(())
    }
}
