//! Change-log positions.
//!
//! SQL Server exposes CDC positions as fixed-width big-endian `binary(10)`
//! values, so ordering the raw bytes lexicographically is the same as
//! ordering the positions numerically. Positions are persisted as lowercase
//! hex text.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Width in bytes of a SQL Server LSN or sequence value.
pub const LSN_WIDTH: usize = 10;

/// An opaque, totally ordered change-log position.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(Bytes);

impl Lsn {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The sentinel used for synthetic snapshot rows.
    pub fn zero() -> Self {
        Self(Bytes::from_static(&[0u8; LSN_WIDTH]))
    }

    /// Builds a full-width position from an integer, mostly useful in tests
    /// and in-memory sources.
    pub fn from_u64(value: u64) -> Self {
        let mut buf = vec![0u8; LSN_WIDTH];
        buf[LSN_WIDTH - 8..].copy_from_slice(&value.to_be_bytes());
        Self(Bytes::from(buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// The immediate successor of this position (big-endian increment).
    ///
    /// Saturates at the all-ones value.
    pub fn next(&self) -> Self {
        let mut buf = self.0.to_vec();
        for byte in buf.iter_mut().rev() {
            if *byte == u8::MAX {
                *byte = 0;
            } else {
                *byte += 1;
                return Self(Bytes::from(buf));
            }
        }
        self.clone()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let text = text.trim();
        let text = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if text.is_empty() {
            return Err(Error::InvalidPosition {
                message: "empty position".to_string(),
            });
        }
        hex::decode(text)
            .map(|bytes| Self(Bytes::from(bytes)))
            .map_err(|e| Error::InvalidPosition {
                message: format!("'{}' is not valid hex: {}", text, e),
            })
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn(0x{})", self.to_hex())
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Lsn::from_hex(&text).map_err(serde::de::Error::custom)
    }
}
