// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crypto agile TCG2 event log as exposed by
//! `/sys/kernel/security/tpm0/binary_bios_measurements`.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

const EV_NO_ACTION: u32 = 0x3;
const EV_S_CRTM_VERSION: u32 = 0x8;
const EV_NONHOST_INFO: u32 = 0x11;
const TPM_ALG_SHA1: u16 = 0x0004;
const TPM_ALG_SHA256: u16 = 0x000b;
const SPEC_ID_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";
const STARTUP_LOCALITY_SIGNATURE: &[u8; 16] = b"StartupLocality\0";
const GCE_NONHOST_INFO_SIGNATURE: &[u8; 16] = b"GCE NonHostInfo\0";
const GCE_FIRMWARE_PREFIX: &str = "GCE Virtual Firmware v";
const SHA1_DIGEST_SIZE: usize = 20;

pub const EVENT_LOG_PATH: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventLogError {
    #[error("event log truncated at offset {0}")]
    Truncated(usize),
    #[error("first event is not a spec id event")]
    MissingSpecId,
    #[error("event log has no SHA-256 bank")]
    NoSha256Bank,
    #[error("unknown digest algorithm {0:#06x}")]
    UnknownAlgorithm(u16),
    #[error("replayed PCR {index} does not match quoted value")]
    ReplayMismatch { index: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub pcr_index: u32,
    pub event_type: u32,
    pub sha256: Option<[u8; 32]>,
    pub data: Vec<u8>,
}

/// Confidential technology announced by GCE firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GceTechnology {
    None,
    AmdSev,
    AmdSevEs,
    IntelTdx,
    AmdSevSnp,
    Unknown(u8),
}

impl From<u8> for GceTechnology {
    fn from(value: u8) -> Self {
        match value {
            0 => GceTechnology::None,
            1 => GceTechnology::AmdSev,
            2 => GceTechnology::AmdSevEs,
            3 => GceTechnology::IntelTdx,
            4 => GceTechnology::AmdSevSnp,
            other => GceTechnology::Unknown(other),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GcePlatform {
    pub technology: Option<GceTechnology>,
    pub firmware_version: Option<u32>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], EventLogError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(EventLogError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EventLogError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EventLogError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, EventLogError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Parse a crypto agile event log. Only the SHA-256 digest of each event is kept.
pub fn parse(bytes: &[u8]) -> Result<Vec<Event>, EventLogError> {
    let mut r = Reader { bytes, pos: 0 };

    // header event in the legacy SHA-1 format
    let _pcr = r.u32()?;
    let event_type = r.u32()?;
    r.take(SHA1_DIGEST_SIZE)?;
    let size = r.u32()? as usize;
    let spec_id = r.take(size)?;
    if event_type != EV_NO_ACTION || spec_id.len() < 28 || &spec_id[..16] != SPEC_ID_SIGNATURE {
        return Err(EventLogError::MissingSpecId);
    }

    let mut spec = Reader {
        bytes: spec_id,
        pos: 24,
    };
    let algorithms = spec.u32()?;
    let mut digest_sizes = BTreeMap::new();
    for _ in 0..algorithms {
        let alg = spec.u16()?;
        let size = spec.u16()?;
        digest_sizes.insert(alg, size as usize);
    }
    if !digest_sizes.contains_key(&TPM_ALG_SHA256) {
        return Err(EventLogError::NoSha256Bank);
    }

    let mut events = Vec::new();
    while !r.is_empty() {
        let pcr_index = r.u32()?;
        let event_type = r.u32()?;
        let count = r.u32()?;
        let mut sha256 = None;
        for _ in 0..count {
            let alg = r.u16()?;
            let size = *digest_sizes
                .get(&alg)
                .ok_or(EventLogError::UnknownAlgorithm(alg))?;
            let digest = r.take(size)?;
            if alg == TPM_ALG_SHA256 {
                let mut d = [0u8; 32];
                d.copy_from_slice(digest);
                sha256 = Some(d);
            }
        }
        let size = r.u32()? as usize;
        let data = r.take(size)?.to_vec();
        events.push(Event {
            pcr_index,
            event_type,
            sha256,
            data,
        });
    }
    Ok(events)
}

/// Replay the SHA-256 bank. Only PCRs touched by the log are returned.
pub fn replay(events: &[Event]) -> BTreeMap<u32, [u8; 32]> {
    let mut pcrs: BTreeMap<u32, [u8; 32]> = BTreeMap::new();
    for event in events {
        if event.event_type == EV_NO_ACTION {
            if event.data.len() > 16 && &event.data[..16] == STARTUP_LOCALITY_SIGNATURE {
                let mut initial = [0u8; 32];
                initial[31] = event.data[16];
                pcrs.insert(event.pcr_index, initial);
            }
            continue;
        }
        let Some(digest) = event.sha256 else {
            continue;
        };
        let pcr = pcrs.entry(event.pcr_index).or_insert([0u8; 32]);
        let mut hasher = Sha256::new();
        hasher.update(*pcr);
        hasher.update(digest);
        *pcr = hasher.finalize().into();
    }
    pcrs
}

/// Check a quoted SHA-256 bank against the log. PCRs the log does not touch
/// or the quote does not cover are skipped.
pub fn verify_against(
    events: &[Event],
    quoted: &BTreeMap<u32, Vec<u8>>,
) -> Result<(), EventLogError> {
    for (index, value) in replay(events) {
        match quoted.get(&index) {
            Some(q) if q.as_slice() != value.as_slice() => {
                return Err(EventLogError::ReplayMismatch { index })
            }
            _ => {}
        }
    }
    Ok(())
}

/// Extract the platform details GCE firmware records in PCR 0.
pub fn gce_platform(events: &[Event]) -> GcePlatform {
    let mut platform = GcePlatform::default();
    for event in events.iter().filter(|e| e.pcr_index == 0) {
        match event.event_type {
            EV_NONHOST_INFO
                if event.data.len() > 16 && &event.data[..16] == GCE_NONHOST_INFO_SIGNATURE =>
            {
                platform.technology = Some(event.data[16].into());
            }
            EV_S_CRTM_VERSION => {
                platform.firmware_version = parse_gce_firmware(&event.data);
            }
            _ => {}
        }
    }
    platform
}

// the version string is UCS-2 encoded and NUL terminated
fn parse_gce_firmware(data: &[u8]) -> Option<u32> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    let version = String::from_utf16(&units).ok()?;
    version.strip_prefix(GCE_FIRMWARE_PREFIX)?.parse().ok()
}

/// Writes crypto agile logs with a SHA-256 bank, mirroring what firmware produces.
#[cfg(any(test, feature = "simulator"))]
#[derive(Default)]
pub struct EventLogBuilder {
    events: Vec<Event>,
}

#[cfg(any(test, feature = "simulator"))]
impl EventLogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measurement of `data` into `pcr`. Returns the digest that has
    /// to be extended into the PCR.
    pub fn measure(&mut self, pcr: u32, event_type: u32, data: &[u8]) -> [u8; 32] {
        let digest: [u8; 32] = Sha256::digest(data).into();
        self.events.push(Event {
            pcr_index: pcr,
            event_type,
            sha256: Some(digest),
            data: data.to_vec(),
        });
        digest
    }

    pub fn gce_nonhost_info(&mut self, technology: u8) -> [u8; 32] {
        let mut data = GCE_NONHOST_INFO_SIGNATURE.to_vec();
        data.push(technology);
        data.extend_from_slice(&[0u8; 15]);
        self.measure(0, EV_NONHOST_INFO, &data)
    }

    pub fn gce_firmware(&mut self, version: u32) -> [u8; 32] {
        let text = format!("{GCE_FIRMWARE_PREFIX}{version}");
        let mut data: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        data.extend_from_slice(&[0, 0]);
        self.measure(0, EV_S_CRTM_VERSION, &data)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut spec_id = SPEC_ID_SIGNATURE.to_vec();
        spec_id.extend_from_slice(&0u32.to_le_bytes()); // platform class
        spec_id.extend_from_slice(&[0, 2, 0, 2]); // minor, major, errata, uintn size
        spec_id.extend_from_slice(&2u32.to_le_bytes());
        spec_id.extend_from_slice(&TPM_ALG_SHA1.to_le_bytes());
        spec_id.extend_from_slice(&(SHA1_DIGEST_SIZE as u16).to_le_bytes());
        spec_id.extend_from_slice(&TPM_ALG_SHA256.to_le_bytes());
        spec_id.extend_from_slice(&32u16.to_le_bytes());
        spec_id.push(0); // vendor info size

        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&EV_NO_ACTION.to_le_bytes());
        out.extend_from_slice(&[0u8; SHA1_DIGEST_SIZE]);
        out.extend_from_slice(&(spec_id.len() as u32).to_le_bytes());
        out.extend_from_slice(&spec_id);

        for event in &self.events {
            let sha256 = event.sha256.unwrap_or_default();
            out.extend_from_slice(&event.pcr_index.to_le_bytes());
            out.extend_from_slice(&event.event_type.to_le_bytes());
            out.extend_from_slice(&2u32.to_le_bytes());
            out.extend_from_slice(&TPM_ALG_SHA1.to_le_bytes());
            out.extend_from_slice(&[0u8; SHA1_DIGEST_SIZE]);
            out.extend_from_slice(&TPM_ALG_SHA256.to_le_bytes());
            out.extend_from_slice(&sha256);
            out.extend_from_slice(&(event.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&event.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extend(pcr: [u8; 32], digest: [u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(pcr);
        hasher.update(digest);
        hasher.finalize().into()
    }

    #[test]
    fn parse_and_replay() {
        let mut builder = EventLogBuilder::new();
        let d0 = builder.measure(0, 0x1, b"firmware");
        let d1 = builder.measure(4, 0x80000003, b"bootloader");
        let d2 = builder.measure(4, 0x80000003, b"kernel");
        let events = parse(&builder.build()).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].data, b"bootloader");

        let pcrs = replay(&events);
        assert_eq!(pcrs[&0], extend([0; 32], d0));
        assert_eq!(pcrs[&4], extend(extend([0; 32], d1), d2));
        assert!(!pcrs.contains_key(&7));
    }

    #[test]
    fn replay_must_match_quote() {
        let mut builder = EventLogBuilder::new();
        let d = builder.measure(9, 0xd, b"initrd");
        let events = parse(&builder.build()).unwrap();

        let mut quoted = BTreeMap::new();
        quoted.insert(9, extend([0; 32], d).to_vec());
        quoted.insert(11, vec![0u8; 32]);
        assert!(verify_against(&events, &quoted).is_ok());

        quoted.insert(9, vec![1u8; 32]);
        assert_eq!(
            verify_against(&events, &quoted),
            Err(EventLogError::ReplayMismatch { index: 9 })
        );
    }

    #[test]
    fn gce_info() {
        let mut builder = EventLogBuilder::new();
        builder.gce_firmware(1);
        builder.gce_nonhost_info(2);
        let events = parse(&builder.build()).unwrap();
        let platform = gce_platform(&events);
        assert_eq!(platform.technology, Some(GceTechnology::AmdSevEs));
        assert_eq!(platform.firmware_version, Some(1));
    }

    #[test]
    fn truncated() {
        let mut builder = EventLogBuilder::new();
        builder.measure(0, 0x1, b"firmware");
        let bytes = builder.build();
        assert!(matches!(
            parse(&bytes[..bytes.len() - 3]),
            Err(EventLogError::Truncated(_))
        ));
        assert_eq!(parse(&[0u8; 64]), Err(EventLogError::MissingSpecId));
    }
}
