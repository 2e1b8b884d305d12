//! The distributed hash table facade: one local node bound to one storage
//! shard, with a migration daemon relocating keys the node no longer owns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, info};
use serde_json::Value;

use crate::chord::node::Node;
use crate::chord::protocol::{Request, Response};
use crate::chord::remote::Remote;
use crate::chord::{in_range, key_id, Address};
use crate::config::Config;
use crate::daemon;
use crate::error::Result;
use crate::metrics;

struct Inner {
    node: Arc<Node>,
    data: Mutex<HashMap<String, Value>>,
}

/// A DHT participant: `get`/`set` served locally where possible and routed
/// through the Chord overlay otherwise.
///
/// Writes are stored locally and handed off asynchronously by the migration
/// sweep, so a read racing a write to a remote-owned key may observe `None`
/// until the next sweep lands. That window is part of the contract.
pub struct Dht {
    inner: Arc<Inner>,
    migrate: Mutex<Option<JoinHandle<()>>>,
}

impl Dht {
    /// Starts a node with the default cadences.
    pub fn new(addr: Address, bootstrap: Option<Address>) -> Result<Self> {
        Self::with_config(addr, bootstrap, Config::default())
    }

    /// Starts a node, joining through `bootstrap` when given.
    pub fn with_config(addr: Address, bootstrap: Option<Address>, config: Config) -> Result<Self> {
        let migrate_interval = config.migrate_interval;
        let node = Node::new(addr, bootstrap, config)?;

        let inner = Arc::new(Inner {
            node: Arc::clone(&node),
            data: Mutex::new(HashMap::new()),
        });

        let handler = Arc::clone(&inner);
        node.register_data_handler(Arc::new(move |request: &Request| handler.handle_data(request)));
        node.start();

        let sweeper = Arc::clone(&inner);
        let migrate = daemon::spawn(
            "migrate",
            migrate_interval,
            node.shutdown_signal(),
            move || {
                sweeper.migrate_tick();
                true
            },
        );

        Ok(Self {
            inner,
            migrate: Mutex::new(Some(migrate)),
        })
    }

    pub fn addr(&self) -> &Address {
        self.inner.node.addr()
    }

    /// The underlying Chord node, for ring introspection.
    pub fn node(&self) -> &Arc<Node> {
        &self.inner.node
    }

    /// Looks a key up, locally first, then through the overlay.
    ///
    /// Any failure along the way — unreachable owner, failed response,
    /// nobody holding the key — comes back as `None`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key)
    }

    /// Stores a value on this node, unconditionally.
    ///
    /// The migration sweep relocates it if another node owns the key.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.set(key.into(), value.into());
    }

    /// Keys currently held in the local shard.
    pub fn local_keys(&self) -> Vec<String> {
        self.inner.data.lock().unwrap().keys().cloned().collect()
    }

    /// Stops the migration sweep and the node. Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.node.shutdown();
        if let Some(handle) = self.migrate.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn get(&self, key: &str) -> Option<Value> {
        let registry = metrics::registry();
        {
            let data = self.data.lock().unwrap();
            if let Some(value) = data.get(key) {
                registry.increment("dht.get.local_hits", 1);
                return Some(value.clone());
            }
        }

        registry.increment("dht.get.remote_lookups", 1);
        let owner = self.node.find_successor(key_id(key));
        if owner == *self.node.addr() {
            // We are the owner and we do not have it.
            registry.increment("dht.get.miss", 1);
            return None;
        }

        let start = Instant::now();
        match Remote::new(owner).get(key) {
            Ok(value) => {
                registry.record_latency("dht.rpc.get", start.elapsed());
                registry.increment("dht.rpc.get.success", 1);
                value
            }
            Err(e) => {
                registry.record_latency("dht.rpc.get.failed", start.elapsed());
                registry.increment("dht.rpc.get.failure", 1);
                debug!("{}: remote get {key:?} failed: {e}", self.node.addr());
                None
            }
        }
    }

    fn set(&self, key: String, value: Value) {
        self.data.lock().unwrap().insert(key, value);
    }

    fn handle_data(&self, request: &Request) -> Response {
        match request {
            Request::Get { key } => Response::Data(self.get(key)),
            Request::Set { key, value } => {
                self.set(key.clone(), value.clone());
                Response::Ack
            }
            _ => Response::Failed,
        }
    }

    /// One migration sweep: hand misplaced keys to their owners, then drop
    /// the ones that were accepted.
    ///
    /// A key may briefly exist on two nodes (sent but not yet deleted),
    /// never on none.
    fn migrate_tick(&self) {
        // Without a predecessor the lower ownership boundary is unknown;
        // leave everything in place until stabilisation provides one.
        let Some(predecessor) = self.node.predecessor() else {
            return;
        };
        let lo = predecessor.id(1);
        let hi = self.node.id(1);

        let snapshot: Vec<(String, Value)> = {
            let data = self.data.lock().unwrap();
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let registry = metrics::registry();
        let mut to_remove = Vec::new();
        for (key, value) in snapshot {
            let id = key_id(&key);
            if in_range(id, lo, hi) {
                continue;
            }
            let owner = self.node.find_successor(id);
            if owner == *self.node.addr() {
                // Routing disagrees with the ownership arc mid-churn; try
                // again next sweep.
                continue;
            }
            let start = Instant::now();
            match Remote::new(owner.clone()).set(&key, value) {
                Ok(()) => {
                    registry.record_latency("dht.rpc.set", start.elapsed());
                    registry.increment("dht.rpc.set.success", 1);
                    info!("{}: migrated {key:?} to {owner}", self.node.addr());
                    to_remove.push(key);
                }
                Err(e) => {
                    registry.record_latency("dht.rpc.set.failed", start.elapsed());
                    registry.increment("dht.rpc.set.failure", 1);
                    debug!(
                        "{}: migration of {key:?} to {owner} failed: {e}",
                        self.node.addr()
                    );
                }
            }
        }

        if !to_remove.is_empty() {
            let mut data = self.data.lock().unwrap();
            for key in to_remove {
                data.remove(&key);
            }
        }
    }
}
