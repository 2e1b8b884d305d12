//! Wire protocol for node-to-node RPCs.
//!
//! A request frame is a command word, optionally followed by a single space
//! and a JSON object payload (`find_successor {"id":12345}`). A response
//! frame is one JSON object carrying at least a `status` field. The command
//! set is closed: anything unrecognised is answered with
//! `{"status":"failed"}` by the serving side.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{Address, Id};
use crate::error::{DhtError, Result};

/// An inbound or outbound RPC request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Successor,
    Predecessor,
    SuccessorList,
    FindSuccessor { id: Id },
    ClosestPrecedingFinger { id: Id },
    Notify { node: Address },
    Ping,
    Get { key: String },
    Set { key: String, value: Value },
}

#[derive(Deserialize)]
struct IdPayload {
    id: Id,
}

#[derive(Deserialize)]
struct KeyPayload {
    key: String,
}

#[derive(Deserialize)]
struct KeyValuePayload {
    key: String,
    value: Value,
}

impl Request {
    /// Parses one request frame.
    pub fn parse(line: &str) -> Result<Self> {
        let (command, payload) = match line.split_once(' ') {
            Some((command, payload)) => (command, Some(payload)),
            None => (line, None),
        };

        fn body<'a>(command: &str, payload: Option<&'a str>) -> Result<&'a str> {
            payload.ok_or_else(|| DhtError::Malformed(format!("{command}: missing payload")))
        }

        match command {
            "successor" => Ok(Self::Successor),
            "predecessor" => Ok(Self::Predecessor),
            "successor_list" => Ok(Self::SuccessorList),
            "ping" => Ok(Self::Ping),
            "find_successor" => {
                let p: IdPayload = serde_json::from_str(body(command, payload)?)?;
                Ok(Self::FindSuccessor { id: p.id })
            }
            "closest_preceding_finger" => {
                let p: IdPayload = serde_json::from_str(body(command, payload)?)?;
                Ok(Self::ClosestPrecedingFinger { id: p.id })
            }
            "notify" => {
                let node: Address = serde_json::from_str(body(command, payload)?)?;
                Ok(Self::Notify { node })
            }
            "get" => {
                let p: KeyPayload = serde_json::from_str(body(command, payload)?)?;
                Ok(Self::Get { key: p.key })
            }
            "set" => {
                let p: KeyValuePayload = serde_json::from_str(body(command, payload)?)?;
                Ok(Self::Set {
                    key: p.key,
                    value: p.value,
                })
            }
            other => Err(DhtError::UnknownCommand(other.to_string())),
        }
    }

    /// Renders this request as one wire frame (without the terminator).
    pub fn to_wire(&self) -> String {
        match self {
            Self::Successor => "successor".to_string(),
            Self::Predecessor => "predecessor".to_string(),
            Self::SuccessorList => "successor_list".to_string(),
            Self::Ping => "ping".to_string(),
            Self::FindSuccessor { id } => format!("find_successor {}", json!({ "id": id })),
            Self::ClosestPrecedingFinger { id } => {
                format!("closest_preceding_finger {}", json!({ "id": id }))
            }
            Self::Notify { node } => {
                format!("notify {}", json!({ "host": node.host, "port": node.port }))
            }
            Self::Get { key } => format!("get {}", json!({ "key": key })),
            Self::Set { key, value } => format!("set {}", json!({ "key": key, "value": value })),
        }
    }
}

/// An RPC response.
///
/// `Node(None)` carries an explicit `"node":null` (a node with no
/// predecessor). `Data(None)` serialises as `"data":null`, and so does a
/// stored JSON `null` — the two are indistinguishable once they cross a
/// hop, so `parse` collapses both to `Data(None)` and a remote `get` of a
/// stored `null` reads as a miss.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ack,
    Node(Option<Address>),
    Nodes(Vec<Address>),
    Data(Option<Value>),
    Failed,
}

impl Response {
    /// Parses one response frame.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        let obj = value
            .as_object()
            .ok_or_else(|| DhtError::Malformed(format!("response is not an object: {line}")))?;

        match obj.get("status").and_then(Value::as_str) {
            Some("ok") => {}
            Some("failed") => return Ok(Self::Failed),
            _ => {
                return Err(DhtError::Malformed(format!(
                    "response has no usable status: {line}"
                )))
            }
        }

        if let Some(node) = obj.get("node") {
            if node.is_null() {
                return Ok(Self::Node(None));
            }
            let addr: Address = serde_json::from_value(node.clone())?;
            return Ok(Self::Node(Some(addr)));
        }
        if let Some(nodes) = obj.get("nodes") {
            let addrs: Vec<Address> = serde_json::from_value(nodes.clone())?;
            return Ok(Self::Nodes(addrs));
        }
        if let Some(data) = obj.get("data") {
            if data.is_null() {
                return Ok(Self::Data(None));
            }
            return Ok(Self::Data(Some(data.clone())));
        }
        Ok(Self::Ack)
    }

    /// Renders this response as one wire frame (without the terminator).
    pub fn to_wire(&self) -> String {
        match self {
            Self::Ack => json!({ "status": "ok" }).to_string(),
            Self::Node(node) => json!({ "status": "ok", "node": node }).to_string(),
            Self::Nodes(nodes) => json!({ "status": "ok", "nodes": nodes }).to_string(),
            Self::Data(data) => json!({ "status": "ok", "data": data }).to_string(),
            Self::Failed => json!({ "status": "failed" }).to_string(),
        }
    }
}
