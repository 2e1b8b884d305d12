//! Chord identifier space and node addressing.
//!
//! Identifiers live on a modular ring of size `2^RING_BITS`. Both node
//! addresses and application keys are hashed onto the ring, and every
//! ownership or routing question ultimately reduces to [`in_range`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod node;
pub mod protocol;
pub mod remote;

/// Number of bits in a ring identifier.
pub const RING_BITS: usize = 24;
/// Size of the identifier ring (`2^RING_BITS`).
pub const RING_SIZE: u64 = 1 << RING_BITS;

/// A position on the identifier ring, always `< RING_SIZE`.
pub type Id = u64;

/// Is `c` inside the half-open arc `[a, b)`, walking clockwise?
///
/// All operands are reduced modulo the ring size first. When `a == b` the
/// arc covers the whole ring and the answer is `true` for every `c`.
pub fn in_range(c: Id, a: Id, b: Id) -> bool {
    let a = a % RING_SIZE;
    let b = b % RING_SIZE;
    let c = c % RING_SIZE;

    if a < b {
        a <= c && c < b
    } else {
        a <= c || c < b
    }
}

/// Hashes arbitrary bytes onto the ring.
pub fn hash_bytes(data: &[u8]) -> Id {
    let digest = md5::compute(data);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(raw) % RING_SIZE
}

/// Ring position of an application key.
pub fn key_id(key: &str) -> Id {
    hash_bytes(key.as_bytes())
}

/// A network endpoint, identified on the ring by the hash of `"host:port"`.
///
/// Equality, ordering and hashing all go through the ring identifier: two
/// distinct endpoints that collide on the ring are treated as the same node
/// for routing purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Ring identifier of this endpoint, shifted by `offset`.
    ///
    /// `offset` selects either the identifier itself (`0`) or a derived
    /// comparison point; migration uses `id(1)` to build the half-open
    /// ownership arc `(predecessor, self]`.
    pub fn id(&self, offset: u64) -> Id {
        (hash_bytes(format!("{}:{}", self.host, self.port).as_bytes()) + offset) % RING_SIZE
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid address {s:?}: expected host:port"))?;
        if host.is_empty() {
            return Err(format!("invalid address {s:?}: empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid address {s:?}: bad port"))?;
        Ok(Address::new(host, port))
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.id(0) == other.id(0)
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id(0).cmp(&other.id(0))
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id(0).hash(state);
    }
}
