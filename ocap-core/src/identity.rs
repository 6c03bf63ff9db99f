//! Identity types for remote peers.
//!
//! - [`PeerId`]: stable identifier derived from a kernel's identity seed
//! - [`IncarnationId`]: 128-bit token identifying one run of a kernel process
//!
//! A peer keeps its [`PeerId`] across restarts; its [`IncarnationId`] changes
//! every time the remote comms layer is initialized. Comparing incarnations is
//! how a restart is told apart from ordinary connection churn.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::RandomProvider;

/// Domain separator mixed into the seed before hashing.
const PEER_ID_DOMAIN: &[u8] = b"ocap-remote/peer-id/v1";

/// Errors produced while deriving identities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The identity seed was empty.
    #[error("identity seed must not be empty")]
    EmptySeed,

    /// A peer id string was not a valid hex digest.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Stable peer identifier.
///
/// Derived from the SHA-256 of the identity seed, so re-initializing with the
/// same seed always yields the same id.
///
/// # Examples
///
/// ```
/// use ocap_core::PeerId;
///
/// let a = PeerId::from_seed(b"alice").expect("seed");
/// let again = PeerId::from_seed(b"alice").expect("seed");
/// assert_eq!(a, again);
/// assert_ne!(a, PeerId::from_seed(b"bob").expect("seed"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Derive the peer id for an identity seed.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EmptySeed`] if `seed` is empty.
    pub fn from_seed(seed: &[u8]) -> Result<Self, IdentityError> {
        if seed.is_empty() {
            return Err(IdentityError::EmptySeed);
        }
        let mut hasher = Sha256::new();
        hasher.update(PEER_ID_DOMAIN);
        hasher.update(seed);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Parse a peer id received from the wire or from an address suffix.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidPeerId`] unless `s` is 64 lowercase hex digits.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let valid = s.len() == 64
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(IdentityError::InvalidPeerId(s.to_string()))
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 128-bit token identifying one run of a kernel.
///
/// Generated randomly each time remote comms are initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncarnationId {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl IncarnationId {
    /// Create an incarnation id with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Draw a fresh incarnation id from a random provider.
    pub fn random<R: RandomProvider>(random: &R) -> Self {
        Self {
            first: random.random(),
            second: random.random(),
        }
    }
}

impl std::fmt::Display for IncarnationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChaChaRandomProvider;

    #[test]
    fn test_peer_id_is_deterministic() {
        let seed = [7u8; 32];
        let first = PeerId::from_seed(&seed).expect("derive");
        let second = PeerId::from_seed(&seed).expect("derive");
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn test_distinct_seeds_give_distinct_ids() {
        let ids: std::collections::HashSet<PeerId> = (0u8..64)
            .map(|i| PeerId::from_seed(&[i; 16]).expect("derive"))
            .collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_empty_seed_rejected() {
        assert_eq!(PeerId::from_seed(b""), Err(IdentityError::EmptySeed));
    }

    #[test]
    fn test_parse_accepts_derived_ids_only() {
        let id = PeerId::from_seed(b"kernel-a").expect("derive");
        assert_eq!(PeerId::parse(id.as_str()).expect("parse"), id);
        assert!(PeerId::parse("not-a-peer").is_err());
        assert!(PeerId::parse(&id.as_str().to_uppercase()).is_err());
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::from_seed(b"kernel-a").expect("derive");
        let json = serde_json::to_string(&id).expect("encode");
        assert_eq!(json, format!("\"{}\"", id));
        let decoded: PeerId = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, id);
        assert!(serde_json::from_str::<PeerId>("\"\u{e9}\"").is_err());
    }

    #[test]
    fn test_incarnations_differ_between_draws() {
        let random = ChaChaRandomProvider::new(42);
        let a = IncarnationId::random(&random);
        let b = IncarnationId::random(&random);
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }
}
