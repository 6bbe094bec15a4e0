// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! systemd-cryptsetup units for mapping the state disk at boot.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

pub const UNIT_DIR: &str = "/run/systemd/system";
const CRYPTSETUP_BIN: &str = "/usr/lib/systemd/systemd-cryptsetup";

/// Writes a `systemd-cryptsetup@<volume>.service` unit and links it into the
/// targets that require it.
pub struct ConfigWriter {
    unit_dir: PathBuf,
}

impl Default for ConfigWriter {
    fn default() -> Self {
        Self::new(UNIT_DIR)
    }
}

impl ConfigWriter {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    pub fn unit_name(volume: &str) -> String {
        format!("systemd-cryptsetup@{volume}.service")
    }

    /// Writes the unit and its symlinks, replacing whatever was there.
    pub fn generate(
        &self,
        volume: &str,
        device: &str,
        key_file: &str,
        options: &str,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.unit_dir)?;
        let unit_name = Self::unit_name(volume);
        let unit_path = self.unit_dir.join(&unit_name);
        fs::write(&unit_path, unit(volume, device, key_file, options))?;

        let mapper_device = format!("{}.device", escape_path(&format!("/dev/mapper/{volume}")));
        for target in ["cryptsetup.target".to_string(), mapper_device] {
            let dir = self.unit_dir.join(format!("{target}.requires"));
            fs::create_dir_all(&dir)?;
            replace_symlink(Path::new("..").join(&unit_name), dir.join(&unit_name))?;
        }
        log::info!("wrote {}", unit_path.display());
        Ok(unit_path)
    }
}

fn replace_symlink(original: PathBuf, link: PathBuf) -> io::Result<()> {
    match fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink(original, link)
}

/// Unit name escaping of `systemd-escape --path`.
pub fn escape_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let mut escaped = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.char_indices() {
        match c {
            '/' => escaped.push('-'),
            '.' if i == 0 => escaped.push_str("\\x2e"),
            c if c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.') => escaped.push(c),
            c => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    escaped.push_str(&format!("\\x{b:02x}"));
                }
            }
        }
    }
    escaped
}

fn unit(volume: &str, device: &str, key_file: &str, options: &str) -> String {
    let device_unit = format!("{}.device", escape_path(device));
    let mapper_unit = escape_path(&format!("/dev/mapper/{volume}"));
    format!(
        "[Unit]
Description=Cryptography Setup for %I
Documentation=man:crypttab(5) man:systemd-cryptsetup-generator(8) man:systemd-cryptsetup@.service(8)
DefaultDependencies=no
IgnoreOnIsolate=true
After=cryptsetup-pre.target systemd-udevd-kernel.socket
Before=blockdev@{mapper_unit}.target
Wants=blockdev@{mapper_unit}.target
Conflicts=umount.target
Before=cryptsetup.target
BindsTo={device_unit}
After={device_unit}
Before=umount.target

[Service]
Type=oneshot
RemainAfterExit=yes
TimeoutSec=0
KeyringMode=shared
OOMScoreAdjust=500
ExecStart={CRYPTSETUP_BIN} attach '{volume}' '{device}' '{key_file}' '{options}'
ExecStop={CRYPTSETUP_BIN} detach '{volume}'
"
    )
}
