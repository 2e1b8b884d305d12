//! A peer-to-peer distributed hash table on a Chord overlay.
//!
//! Nodes organise themselves into an identifier ring and collectively serve
//! a `get`/`set` interface; any key is locatable in `O(log N)` hops. The
//! crate is usable both as a library (experiment drivers start several
//! [`Dht`] instances in one process) and through the `dht-node` binary.

pub mod chord;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod dht;
pub mod error;
pub mod metrics;
pub mod network;

pub use chord::{in_range, key_id, Address, Id, RING_BITS, RING_SIZE};
pub use config::Config;
pub use dht::Dht;
pub use error::{DhtError, Result};
