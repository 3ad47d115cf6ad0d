//! SHA-256 content digests
//!
//! Digests are computed outside this workspace; here they are only parsed,
//! compared and stored. The textual form is 64 hexadecimal characters
//! (accepted in any case, always rendered lowercase); the stored form is the
//! raw 32 bytes.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CommonError, Result};

/// Length of a SHA-256 digest in bytes.
pub const SHA256_LEN: usize = 32;

/// Length of a SHA-256 digest in hexadecimal characters.
pub const SHA256_HEX_LEN: usize = SHA256_LEN * 2;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Digest([u8; SHA256_LEN]);

impl Sha256Digest {
    pub const fn from_bytes(bytes: [u8; SHA256_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_LEN] {
        &self.0
    }

    /// Lowercase hexadecimal rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hexadecimal digest, ignoring case.
    pub fn from_hex(input: &str) -> Result<Self> {
        if input.len() != SHA256_HEX_LEN {
            return Err(CommonError::DigestLength {
                expected: SHA256_HEX_LEN,
                actual: input.chars().count(),
            });
        }
        if let Some(bad) = input.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(CommonError::DigestCharacter(bad));
        }

        let mut bytes = [0u8; SHA256_LEN];
        hex::decode_to_slice(input, &mut bytes).map_err(|_| CommonError::DigestLength {
            expected: SHA256_HEX_LEN,
            actual: input.len(),
        })?;
        Ok(Self(bytes))
    }
}

impl FromStr for Sha256Digest {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<&[u8]> for Sha256Digest {
    type Error = CommonError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SHA256_LEN] =
            bytes.try_into().map_err(|_| CommonError::DigestBytes {
                expected: SHA256_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }
}

impl TryFrom<Vec<u8>> for Sha256Digest {
    type Error = CommonError;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl Serialize for Sha256Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
