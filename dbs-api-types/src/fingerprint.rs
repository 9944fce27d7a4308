use std::fmt::{self, Display};

use anyhow::{bail, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest fingerprint width the engine can store (bytes).
pub const MAX_FINGERPRINT_SIZE: usize = 32;

/// Default fingerprint width (bytes).
pub const DEFAULT_FINGERPRINT_SIZE: usize = 20;

/// Content fingerprint of a chunk.
///
/// An opaque, prefix-ordered byte string of up to 32 bytes, produced by the
/// external fingerprinting pipeline. The all-zero fingerprint of a given
/// width is the distinguished empty-data fingerprint used to pad block
/// mappings; it never enters the chunk index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    size: u8,
    bytes: [u8; MAX_FINGERPRINT_SIZE],
}

impl Fingerprint {
    pub fn new(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() || data.len() > MAX_FINGERPRINT_SIZE {
            bail!("invalid fingerprint size {}", data.len());
        }
        let mut bytes = [0u8; MAX_FINGERPRINT_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            size: data.len() as u8,
            bytes,
        })
    }

    /// The empty-data fingerprint of the given width (all zero bytes).
    pub fn empty_data(size: usize) -> Self {
        assert!(size > 0 && size <= MAX_FINGERPRINT_SIZE);
        Self {
            size: size as u8,
            bytes: [0u8; MAX_FINGERPRINT_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty_data(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// First 8 bytes as big-endian integer, preserving prefix order.
    ///
    /// Used for lock striping, sampling and the in-combat table.
    pub fn prefix(&self) -> u64 {
        let mut buf = [0u8; 8];
        let take = self.size().min(8);
        buf[..take].copy_from_slice(&self.bytes[..take]);
        u64::from_be_bytes(buf)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s)?;
        Fingerprint::new(&bytes)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.as_bytes()))
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprint_prefix_preserves_order() {
        let a = Fingerprint::new(&[0x01; 20]).unwrap();
        let b = Fingerprint::new(&[0x02; 20]).unwrap();
        assert!(a < b);
        assert!(a.prefix() < b.prefix());
    }

    #[test]
    fn empty_data_detection() {
        assert!(Fingerprint::empty_data(20).is_empty_data());
        assert!(!Fingerprint::new(&[1u8; 20]).unwrap().is_empty_data());
    }

    #[test]
    fn serde_roundtrip() {
        let fp = Fingerprint::new(&[0xab; 20]).unwrap();
        let text = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&text).unwrap();
        assert_eq!(fp, back);
        assert_eq!(back.size(), 20);
    }
}
