//! Client-side proxy for a peer's Chord primitives.

use serde_json::Value;

use super::protocol::{Request, Response};
use super::{Address, Id, RING_SIZE};
use crate::error::{DhtError, Result};
use crate::network;

/// A known peer, addressed by its endpoint.
///
/// Every method is one framed round trip on a fresh connection. The peer's
/// ring identifier is a pure function of its address, so [`Remote::id`]
/// never touches the network.
#[derive(Debug, Clone)]
pub struct Remote {
    addr: Address,
}

impl Remote {
    pub fn new(addr: Address) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Ring identifier of the peer, shifted by `offset`.
    pub fn id(&self, offset: u64) -> Id {
        (self.addr.id(0) + offset) % RING_SIZE
    }

    fn call(&self, request: &Request) -> Result<Response> {
        let reply = network::call(&self.addr, &request.to_wire())?;
        Response::parse(&reply)
    }

    fn expect_node(&self, request: &Request) -> Result<Address> {
        match self.call(request)? {
            Response::Node(Some(node)) => Ok(node),
            other => Err(DhtError::Unexpected(format!(
                "{} from {}: {other:?}",
                request.to_wire(),
                self.addr
            ))),
        }
    }

    /// The peer's current immediate successor.
    pub fn successor(&self) -> Result<Address> {
        self.expect_node(&Request::Successor)
    }

    /// The peer's current predecessor, if it has one.
    pub fn predecessor(&self) -> Result<Option<Address>> {
        match self.call(&Request::Predecessor)? {
            Response::Node(node) => Ok(node),
            other => Err(DhtError::Unexpected(format!(
                "predecessor from {}: {other:?}",
                self.addr
            ))),
        }
    }

    /// The peer's successor list, nearest first.
    pub fn successor_list(&self) -> Result<Vec<Address>> {
        match self.call(&Request::SuccessorList)? {
            Response::Nodes(nodes) => Ok(nodes),
            other => Err(DhtError::Unexpected(format!(
                "successor_list from {}: {other:?}",
                self.addr
            ))),
        }
    }

    /// Asks the peer to locate the successor of `id`.
    pub fn find_successor(&self, id: Id) -> Result<Address> {
        self.expect_node(&Request::FindSuccessor { id })
    }

    /// Asks the peer for its best finger strictly preceding `id`.
    pub fn closest_preceding_finger(&self, id: Id) -> Result<Address> {
        self.expect_node(&Request::ClosestPrecedingFinger { id })
    }

    /// Tells the peer that `node` may be its new predecessor.
    pub fn notify(&self, node: &Address) -> Result<()> {
        match self.call(&Request::Notify { node: node.clone() })? {
            Response::Ack => Ok(()),
            other => Err(DhtError::Unexpected(format!(
                "notify from {}: {other:?}",
                self.addr
            ))),
        }
    }

    /// Liveness probe.
    pub fn ping(&self) -> bool {
        matches!(self.call(&Request::Ping), Ok(Response::Ack))
    }

    /// Fetches a value from the peer's shard.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.call(&Request::Get {
            key: key.to_string(),
        })? {
            Response::Data(data) => Ok(data),
            Response::Failed => Err(DhtError::Unexpected(format!(
                "get {key:?} failed on {}",
                self.addr
            ))),
            other => Err(DhtError::Unexpected(format!(
                "get from {}: {other:?}",
                self.addr
            ))),
        }
    }

    /// Stores a value on the peer.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        match self.call(&Request::Set {
            key: key.to_string(),
            value,
        })? {
            Response::Ack => Ok(()),
            Response::Failed => Err(DhtError::Unexpected(format!(
                "set {key:?} failed on {}",
                self.addr
            ))),
            other => Err(DhtError::Unexpected(format!(
                "set from {}: {other:?}",
                self.addr
            ))),
        }
    }
}
