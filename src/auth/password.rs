//! Salted password storage and constant-time verification

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const DEFAULT_ITERATIONS: u32 = 100_000;

/// A salted PBKDF2-HMAC-SHA256 password hash
///
/// Verification is constant-time over the stored hash length; callers that
/// want to hide whether a user exists verify against
/// [`PasswordHash::dummy`] when there is no real hash to check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    /// Per-user random salt
    pub salt: Vec<u8>,
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// Derived key
    pub hash: Vec<u8>,
}

impl PasswordHash {
    /// Hash a new password with a fresh random salt
    pub fn create(password: &str) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut hash = vec![0u8; HASH_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, DEFAULT_ITERATIONS, &mut hash);
        Self {
            salt,
            iterations: DEFAULT_ITERATIONS,
            hash,
        }
    }

    /// A fixed hash used to equalize timing when the username is unknown
    pub fn dummy() -> Self {
        Self {
            salt: vec![0x5a; SALT_LEN],
            iterations: DEFAULT_ITERATIONS,
            hash: vec![0; HASH_LEN],
        }
    }

    /// Verify a candidate password in constant time
    pub fn verify(&self, password: &str) -> bool {
        let mut candidate = vec![0u8; self.hash.len().max(1)];
        pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            &self.salt,
            self.iterations.max(1),
            &mut candidate,
        );
        candidate.ct_eq(&self.hash).into()
    }

    /// Render as `iterations$salt$hash` with base64 fields
    pub fn encode(&self) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        format!(
            "{}${}${}",
            self.iterations,
            STANDARD.encode(&self.salt),
            STANDARD.encode(&self.hash)
        )
    }

    /// Parse the [`encode`](Self::encode) form
    pub fn decode(s: &str) -> Option<Self> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let mut parts = s.splitn(3, '$');
        let iterations: u32 = parts.next()?.parse().ok()?;
        let salt = STANDARD.decode(parts.next()?).ok()?;
        let hash = STANDARD.decode(parts.next()?).ok()?;
        if salt.is_empty() || hash.is_empty() {
            return None;
        }
        Some(Self {
            salt,
            iterations,
            hash,
        })
    }
}
