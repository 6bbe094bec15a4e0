// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! LUKS2 state disk handling through the cryptsetup CLI, and mounting.

use cvm_attestation::keys::Secret;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

const CRYPTSETUP: &str = "cryptsetup";

#[derive(Error, Debug)]
pub enum MapperError {
    #[error("running {command}: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("mount {target}: {source}")]
    Mount {
        target: String,
        source: nix::errno::Errno,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// LUKS operations on the state disk.
pub trait DiskMapper: Send + Sync {
    /// Whether the device carries a LUKS header.
    fn is_luks(&self) -> bool;
    /// UUID from the LUKS header, lowercase.
    fn uuid(&self) -> Result<String, MapperError>;
    fn format(&self, passphrase: &Secret) -> Result<(), MapperError>;
    fn map(&self, name: &str, passphrase: &Secret) -> Result<(), MapperError>;
    fn unmap(&self, name: &str) -> Result<(), MapperError>;
}

/// Key derivation parameters for new LUKS2 headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pbkdf {
    pub iterations: u32,
    pub memory_kib: u32,
    pub parallel: u32,
}

impl Default for Pbkdf {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory_kib: 64 * 1024,
            parallel: 4,
        }
    }
}

pub struct Cryptsetup {
    device: PathBuf,
    pbkdf: Pbkdf,
}

impl Cryptsetup {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            pbkdf: Pbkdf::default(),
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    fn format_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "luksFormat",
            "--batch-mode",
            "--type",
            "luks2",
            "--cipher",
            "aes-xts-plain64",
            "--integrity",
            "hmac-sha256",
            "--sector-size",
            "4096",
            "--pbkdf",
            "argon2id",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "--pbkdf-force-iterations".to_string(),
            self.pbkdf.iterations.to_string(),
            "--pbkdf-memory".to_string(),
            self.pbkdf.memory_kib.to_string(),
            "--pbkdf-parallel".to_string(),
            self.pbkdf.parallel.to_string(),
            "--key-file".to_string(),
            "-".to_string(),
            self.device.display().to_string(),
        ]);
        args
    }

    fn map_args(&self, name: &str) -> Vec<String> {
        vec![
            "open".into(),
            "--type".into(),
            "luks2".into(),
            "--key-file".into(),
            "-".into(),
            self.device.display().to_string(),
            name.into(),
        ]
    }
}

/// Runs cryptsetup, writing `stdin` to the child, and returns its stdout.
fn run(args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>, MapperError> {
    let command = format!("{CRYPTSETUP} {}", args.first().map(String::as_str).unwrap_or_default());
    let mut child = Command::new(CRYPTSETUP)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| MapperError::Spawn {
            command: command.clone(),
            source,
        })?;
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(MapperError::Command {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

impl DiskMapper for Cryptsetup {
    fn is_luks(&self) -> bool {
        run(&["isLuks".into(), self.device.display().to_string()], None).is_ok()
    }

    fn uuid(&self) -> Result<String, MapperError> {
        let out = run(&["luksUUID".into(), self.device.display().to_string()], None)?;
        Ok(String::from_utf8_lossy(&out).trim().to_ascii_lowercase())
    }

    fn format(&self, passphrase: &Secret) -> Result<(), MapperError> {
        log::info!("formatting {} as LUKS2", self.device.display());
        run(&self.format_args(), Some(passphrase.as_bytes())).map(|_| ())
    }

    fn map(&self, name: &str, passphrase: &Secret) -> Result<(), MapperError> {
        log::info!("mapping {} to /dev/mapper/{name}", self.device.display());
        run(&self.map_args(name), Some(passphrase.as_bytes())).map(|_| ())
    }

    fn unmap(&self, name: &str) -> Result<(), MapperError> {
        run(&["close".into(), name.into()], None).map(|_| ())
    }
}

pub trait Mounter: Send + Sync {
    fn mkdir_all(&self, path: &Path) -> Result<(), MapperError>;
    fn mount(&self, source: &Path, target: &Path, fstype: &str, flags: MsFlags) -> Result<(), MapperError>;
    fn unmount(&self, target: &Path) -> Result<(), MapperError>;
}

/// mount(2) and umount2(2).
#[derive(Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mkdir_all(&self, path: &Path) -> Result<(), MapperError> {
        Ok(fs::create_dir_all(path)?)
    }

    fn mount(&self, source: &Path, target: &Path, fstype: &str, flags: MsFlags) -> Result<(), MapperError> {
        mount(Some(source), target, Some(fstype), flags, None::<&str>).map_err(|source| {
            MapperError::Mount {
                target: target.display().to_string(),
                source,
            }
        })
    }

    fn unmount(&self, target: &Path) -> Result<(), MapperError> {
        umount2(target, MntFlags::empty()).map_err(|source| MapperError::Mount {
            target: target.display().to_string(),
            source,
        })
    }
}
