use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ConfigError;

mod sip;

pub use sip::render_options;

/// IPv6 最小 MTU 1280 - IPv6 头 - UDP 头
pub const MAX_PAYLOAD_LEN: usize = 1280 - 40 - 8;

/// Where a payload comes from, as written on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    Sip(String),
    File(PathBuf),
    Hex(Vec<u8>),
}

impl FromStr for PayloadSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadPayloadSource(s.to_string());
        let (kind, value) = s.split_once(':').ok_or_else(bad)?;
        if value.is_empty() {
            return Err(bad());
        }
        match kind {
            // sip:sip:alice@host 也接受
            "sip" => Ok(PayloadSource::Sip(value.to_string())),
            "file" => Ok(PayloadSource::File(PathBuf::from(value))),
            "hex" => decode_hex(value).map(PayloadSource::Hex).ok_or_else(bad),
            _ => Err(bad()),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !matches!(b, b' ' | b':' | b'-'))
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSpec {
    ProtocolShaped(Vec<u8>),
    Custom(Vec<u8>),
}

impl PayloadSpec {
    pub fn load(source: &PayloadSource) -> Result<Self, ConfigError> {
        match source {
            PayloadSource::Sip(target) => Ok(PayloadSpec::ProtocolShaped(render_options(target))),
            PayloadSource::File(path) => std::fs::read(path)
                .map(PayloadSpec::Custom)
                .map_err(|source| ConfigError::PayloadFile {
                    path: path.clone(),
                    source,
                }),
            PayloadSource::Hex(bytes) => Ok(PayloadSpec::Custom(bytes.clone())),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            PayloadSpec::ProtocolShaped(b) | PayloadSpec::Custom(b) => b,
        }
    }
}

/// Fixed, ordered set of decoy payloads handed out round-robin.
#[derive(Debug)]
pub struct PayloadRotation {
    entries: Vec<PayloadSpec>,
    cursor: AtomicUsize,
}

impl PayloadRotation {
    pub fn new(entries: Vec<PayloadSpec>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::EmptyPayloadRotation);
        }
        for (index, entry) in entries.iter().enumerate() {
            let len = entry.bytes().len();
            if len == 0 {
                return Err(ConfigError::EmptyPayload { index });
            }
            if len > MAX_PAYLOAD_LEN {
                return Err(ConfigError::PayloadTooLarge {
                    index,
                    len,
                    max: MAX_PAYLOAD_LEN,
                });
            }
        }
        Ok(Self {
            entries,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn from_sources(sources: &[PayloadSource]) -> Result<Self, ConfigError> {
        let entries = sources
            .iter()
            .map(PayloadSpec::load)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries)
    }

    pub fn next(&self) -> &[u8] {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        self.entries[i].bytes()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
