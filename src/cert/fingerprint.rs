//! SHA-256 certificate fingerprints

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 fingerprint of a DER-encoded certificate
///
/// Displayed and persisted as lowercase hex with colon-separated bytes,
/// e.g. `ab:cd:...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a DER certificate
    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 32 {
            return Err(format!("expected 32 colon-separated bytes, got {}", parts.len()));
        }
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| format!("invalid byte {part:?}"))?;
        }
        Ok(Self(bytes))
    }
}
