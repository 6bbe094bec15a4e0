// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware reports through the kernel's configfs-tsm interface, shared by
//! the SEV-SNP and TDX guest drivers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const TSM_REPORT_PATH: &str = "/sys/kernel/config/tsm/report";

static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum TsmError {
    #[error("configfs-tsm not available at {0}")]
    Unavailable(String),
    #[error("report entry was modified concurrently")]
    Raced,
    #[error("io error")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct TsmReport {
    /// Hardware report (SNP report or TDX quote).
    pub outblob: Vec<u8>,
    /// Provider specific auxiliary data, the certificate table on SNP.
    pub auxblob: Vec<u8>,
    pub provider: String,
}

// configfs entries are removed with rmdir, regular directories need their
// files removed first
struct EntryGuard {
    path: PathBuf,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if fs::remove_dir(&self.path).is_err() {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Source of hardware reports binding 64 bytes of caller data.
pub trait ReportSource: Send + Sync {
    fn request(&self, report_data: &[u8; 64]) -> Result<TsmReport, TsmError>;
}

pub struct Tsm {
    root: PathBuf,
}

impl Default for Tsm {
    fn default() -> Self {
        Self::new(TSM_REPORT_PATH)
    }
}

impl Tsm {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ReportSource for Tsm {
    /// Request a report binding `report_data`.
    fn request(&self, report_data: &[u8; 64]) -> Result<TsmReport, TsmError> {
        if !self.root.is_dir() {
            return Err(TsmError::Unavailable(self.root.display().to_string()));
        }
        let name = format!(
            "cvm_{}_{}",
            std::process::id(),
            ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = self.root.join(name);
        fs::create_dir(&path)?;
        let guard = EntryGuard { path };

        fs::write(guard.path.join("inblob"), report_data)?;
        let generation = read_generation(&guard.path)?;
        let outblob = fs::read(guard.path.join("outblob"))?;
        let auxblob = fs::read(guard.path.join("auxblob")).unwrap_or_default();
        let provider = fs::read_to_string(guard.path.join("provider"))
            .map(|p| p.trim().to_string())
            .unwrap_or_default();
        if read_generation(&guard.path)? != generation {
            return Err(TsmError::Raced);
        }
        log::debug!(
            "received {} byte report from configfs-tsm provider {provider:?}",
            outblob.len()
        );

        Ok(TsmReport {
            outblob,
            auxblob,
            provider,
        })
    }
}

fn read_generation(entry: &Path) -> Result<Option<u64>, TsmError> {
    match fs::read_to_string(entry.join("generation")) {
        Ok(s) => Ok(s.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl From<TsmError> for crate::error::Error {
    fn from(err: TsmError) -> Self {
        crate::error::Error::Io(format!("hardware report: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface() {
        let tsm = Tsm::new("/nonexistent/tsm/report");
        assert!(matches!(
            tsm.request(&[0u8; 64]),
            Err(TsmError::Unavailable(_))
        ));
    }

    #[test]
    fn entry_removed_on_failure() {
        let root = std::env::temp_dir().join(format!("tsm-test-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        let tsm = Tsm::new(&root);

        // a plain directory produces no outblob
        assert!(matches!(tsm.request(&[1u8; 64]), Err(TsmError::Io(_))));
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        fs::remove_dir_all(&root).unwrap();
    }
}
