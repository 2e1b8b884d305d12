//! The local Chord node: routing state, inbound RPC service and the
//! maintenance daemons that keep the ring stitched together.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use super::protocol::{Request, Response};
use super::remote::Remote;
use super::{in_range, Address, Id, RING_BITS, RING_SIZE};
use crate::config::Config;
use crate::daemon::{self, Shutdown};
use crate::error::Result;
use crate::network;

/// Entries kept in the successor list for ring repair after node failures.
pub const SUCCESSOR_LIST_LEN: usize = 5;

/// Handler for the data-plane commands (`get`/`set`), registered by the
/// layer that owns the storage shard.
pub type DataHandler = dyn Fn(&Request) -> Response + Send + Sync;

/// Routing state behind the node's single routing mutex.
///
/// `fingers[0]` is the immediate successor and always present. Entries that
/// would point back at the local node are stored as `None` so the table
/// never aliases self while other peers are known.
struct Routing {
    fingers: Vec<Option<Address>>,
    successors: Vec<Address>,
    predecessor: Option<Address>,
}

pub struct Node {
    addr: Address,
    config: Config,
    routing: Mutex<Routing>,
    next_finger: AtomicUsize,
    shutdown: Arc<Shutdown>,
    listener: Mutex<Option<TcpListener>>,
    data_handler: Mutex<Option<Arc<DataHandler>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Binds the listening socket and joins the ring.
    ///
    /// Without a bootstrap address the node forms a ring of one. With one,
    /// it asks the bootstrap peer for the successor of its own identifier;
    /// it does not announce itself — the first stabilise tick does that.
    pub fn new(addr: Address, bootstrap: Option<Address>, config: Config) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port))?;

        let mut fingers = vec![None; RING_BITS];
        fingers[0] = Some(addr.clone());
        let mut routing = Routing {
            fingers,
            successors: vec![addr.clone()],
            predecessor: None,
        };

        if let Some(bootstrap) = bootstrap {
            let successor = Remote::new(bootstrap.clone()).find_successor(addr.id(0))?;
            info!("{addr}: joining ring via {bootstrap}, successor is {successor}");
            let mut successors = vec![successor.clone()];
            if successor != addr {
                if let Ok(list) = Remote::new(successor.clone()).successor_list() {
                    successors.extend(list.into_iter().take(SUCCESSOR_LIST_LEN - 1));
                }
            }
            routing.fingers[0] = Some(successor);
            routing.successors = successors;
        } else {
            info!("{addr}: starting a new ring");
        }

        Ok(Arc::new(Self {
            addr,
            config,
            routing: Mutex::new(routing),
            next_finger: AtomicUsize::new(1),
            shutdown: Arc::new(Shutdown::new()),
            listener: Mutex::new(Some(listener)),
            data_handler: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }))
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Ring identifier of this node, shifted by `offset`.
    pub fn id(&self, offset: u64) -> Id {
        self.addr.id(offset)
    }

    /// Shutdown signal shared with daemons layered on top of this node.
    pub fn shutdown_signal(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Registers the handler serving inbound `get`/`set` commands.
    pub fn register_data_handler(&self, handler: Arc<DataHandler>) {
        *self.data_handler.lock().unwrap() = Some(handler);
    }

    /// Starts the listener and the three maintenance daemons.
    pub fn start(self: &Arc<Self>) {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .expect("node started twice");

        let mut threads = self.threads.lock().unwrap();

        let node = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name(format!("listener-{}", self.addr.port))
                .spawn(move || node.serve(listener))
                .expect("failed to spawn listener thread"),
        );

        let node = Arc::clone(self);
        threads.push(daemon::spawn(
            "stabilize",
            self.config.stabilize_interval,
            self.shutdown_signal(),
            move || {
                node.stabilize();
                true
            },
        ));

        let node = Arc::clone(self);
        threads.push(daemon::spawn(
            "fix-fingers",
            self.config.fix_fingers_interval,
            self.shutdown_signal(),
            move || {
                node.fix_fingers();
                true
            },
        ));

        let node = Arc::clone(self);
        threads.push(daemon::spawn(
            "check-predecessor",
            self.config.check_predecessor_interval,
            self.shutdown_signal(),
            move || {
                node.check_predecessor();
                true
            },
        ));
    }

    /// Trips the shutdown flag, wakes the listener and joins every thread.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        info!("{}: shutting down", self.addr);
        // Wake the accept loop so it observes the flag.
        let _ = network::connect(&self.addr);
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        // The data handler closes a reference cycle through the facade;
        // nothing can dispatch to it once the listener is gone.
        *self.data_handler.lock().unwrap() = None;
    }

    // -- routing reads ----------------------------------------------------

    /// Current predecessor, if any.
    pub fn predecessor(&self) -> Option<Address> {
        self.routing.lock().unwrap().predecessor.clone()
    }

    /// First live entry among the immediate successor and the successor
    /// list; falls back to self when everything is unreachable.
    pub fn successor(&self) -> Address {
        let candidates: Vec<Address> = {
            let routing = self.routing.lock().unwrap();
            routing.fingers[0]
                .iter()
                .chain(routing.successors.iter())
                .cloned()
                .collect()
        };
        for candidate in candidates {
            if candidate == self.addr || Remote::new(candidate.clone()).ping() {
                return candidate;
            }
        }
        // Everyone we knew is gone; shrink back to a ring of one.
        self.addr.clone()
    }

    /// Snapshot of the successor list, nearest first.
    pub fn successor_list(&self) -> Vec<Address> {
        self.routing.lock().unwrap().successors.clone()
    }

    // -- lookup -----------------------------------------------------------

    /// Locates the successor of `id`.
    ///
    /// Walks the ring through closest-preceding-finger hops, at most
    /// `RING_BITS` of them; a dead end or an exhausted hop budget yields
    /// the best candidate seen so far rather than an error.
    pub fn find_successor(&self, id: Id) -> Address {
        let mut node = self.addr.clone();
        let mut successor = self.successor();
        let mut best = successor.clone();

        for _ in 0..RING_BITS {
            if in_range(id, node.id(1), successor.id(1)) {
                return successor;
            }
            let next = if node == self.addr {
                self.closest_preceding_finger(id)
            } else {
                match Remote::new(node.clone()).closest_preceding_finger(id) {
                    Ok(next) => next,
                    Err(e) => {
                        debug!("{}: lookup hop via {node} failed: {e}", self.addr);
                        break;
                    }
                }
            };
            if next == node {
                // No finger gets us closer; the candidate successor is the
                // answer.
                return successor;
            }
            node = next;
            successor = if node == self.addr {
                self.successor()
            } else {
                match Remote::new(node.clone()).successor() {
                    Ok(successor) => successor,
                    Err(e) => {
                        debug!("{}: lookup hop via {node} failed: {e}", self.addr);
                        break;
                    }
                }
            };
            best = successor.clone();
        }
        debug!("{}: lookup for {id} settled on {best}", self.addr);
        best
    }

    /// Best local finger strictly inside `(self.id, id)`, or self.
    ///
    /// Candidates are probed for liveness outside the routing lock; dead
    /// entries are cleared so later scans skip them.
    pub fn closest_preceding_finger(&self, id: Id) -> Address {
        let snapshot: Vec<(usize, Address)> = {
            let routing = self.routing.lock().unwrap();
            routing
                .fingers
                .iter()
                .enumerate()
                .rev()
                .filter_map(|(i, entry)| entry.clone().map(|addr| (i, addr)))
                .collect()
        };

        for (i, entry) in snapshot {
            if entry == self.addr || !in_range(entry.id(0), self.id(1), id) {
                continue;
            }
            if Remote::new(entry.clone()).ping() {
                return entry;
            }
            let mut routing = self.routing.lock().unwrap();
            if i > 0 && routing.fingers[i].as_ref() == Some(&entry) {
                routing.fingers[i] = None;
            }
        }
        self.addr.clone()
    }

    // -- inbound state changes --------------------------------------------

    /// Inbound claim that `candidate` may be our predecessor.
    pub fn notify(&self, candidate: Address) {
        if candidate == self.addr {
            return;
        }
        let mut routing = self.routing.lock().unwrap();
        let adopt = match &routing.predecessor {
            None => true,
            Some(predecessor) => in_range(candidate.id(0), predecessor.id(1), self.id(0)),
        };
        if adopt {
            debug!("{}: predecessor is now {candidate}", self.addr);
            routing.predecessor = Some(candidate.clone());
        }
        // A singleton ring adopts its first caller as successor too; this is
        // what closes the two-node ring.
        if routing.fingers[0].as_ref() == Some(&self.addr) {
            routing.fingers[0] = Some(candidate);
        }
    }

    // -- maintenance ticks ------------------------------------------------

    /// One stabilise tick: adopt a closer successor if our successor knows
    /// one, announce ourselves, refresh the successor list.
    fn stabilize(&self) {
        let successor = self.successor();
        {
            let mut routing = self.routing.lock().unwrap();
            if routing.fingers[0].as_ref() != Some(&successor) {
                routing.fingers[0] = Some(successor.clone());
            }
        }
        if successor == self.addr {
            // Ring of one; nothing to ask and nobody to notify.
            return;
        }

        let mut successor = successor;
        match Remote::new(successor.clone()).predecessor() {
            Ok(Some(x))
                if x != self.addr
                    && in_range(x.id(0), self.id(1), successor.id(0))
                    && Remote::new(x.clone()).ping() =>
            {
                debug!("{}: successor is now {x}", self.addr);
                self.routing.lock().unwrap().fingers[0] = Some(x.clone());
                successor = x;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{}: stabilize probe of {successor} failed: {e}", self.addr);
            }
        }

        let remote = Remote::new(successor.clone());
        if let Err(e) = remote.notify(&self.addr) {
            debug!("{}: notify of {successor} failed: {e}", self.addr);
        }
        match remote.successor_list() {
            Ok(list) => {
                let mut successors = vec![successor];
                successors.extend(list.into_iter().take(SUCCESSOR_LIST_LEN - 1));
                self.routing.lock().unwrap().successors = successors;
            }
            Err(e) => {
                debug!("{}: successor list refresh failed: {e}", self.addr);
            }
        }
    }

    /// One fix-fingers tick: repair the entry under the cursor.
    ///
    /// Entry 0 belongs to stabilise, so the cursor cycles over `[1, m)`.
    fn fix_fingers(&self) {
        let next = self.next_finger.load(Ordering::Relaxed);
        let after = if next + 1 >= RING_BITS { 1 } else { next + 1 };
        self.next_finger.store(after, Ordering::Relaxed);

        let target = (self.id(0) + (1u64 << next)) % RING_SIZE;
        let found = self.find_successor(target);
        let entry = if found == self.addr { None } else { Some(found) };
        self.routing.lock().unwrap().fingers[next] = entry;
    }

    /// One check-predecessor tick: drop the predecessor if it stopped
    /// answering; a later notify will repopulate it.
    fn check_predecessor(&self) {
        let Some(predecessor) = self.predecessor() else {
            return;
        };
        if Remote::new(predecessor.clone()).ping() {
            return;
        }
        warn!("{}: predecessor {predecessor} is unreachable", self.addr);
        let mut routing = self.routing.lock().unwrap();
        if routing.predecessor.as_ref() == Some(&predecessor) {
            routing.predecessor = None;
        }
    }

    // -- inbound service --------------------------------------------------

    fn serve(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.shutdown.is_triggered() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let node = Arc::clone(&self);
                    thread::spawn(move || node.handle_connection(stream));
                }
                Err(e) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                    warn!("{}: accept failed: {e}", self.addr);
                }
            }
        }
        debug!("{}: listener stopped", self.addr);
    }

    fn handle_connection(&self, mut stream: TcpStream) {
        let _ = stream.set_read_timeout(Some(network::IO_TIMEOUT));
        let _ = stream.set_write_timeout(Some(network::IO_TIMEOUT));

        let line = match network::read_frame(&mut stream) {
            Ok(line) => line,
            Err(e) => {
                debug!("{}: dropping connection: {e}", self.addr);
                return;
            }
        };

        let response = match Request::parse(&line) {
            Ok(request) => self.dispatch(request),
            Err(e) => {
                debug!("{}: rejecting request {line:?}: {e}", self.addr);
                Response::Failed
            }
        };

        if let Err(e) = network::send_frame(&mut stream, &response.to_wire()) {
            debug!("{}: reply failed: {e}", self.addr);
        }
    }

    fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Successor => Response::Node(Some(self.successor())),
            Request::Predecessor => Response::Node(self.predecessor()),
            Request::SuccessorList => Response::Nodes(self.successor_list()),
            Request::FindSuccessor { id } => Response::Node(Some(self.find_successor(id))),
            Request::ClosestPrecedingFinger { id } => {
                Response::Node(Some(self.closest_preceding_finger(id)))
            }
            Request::Notify { node } => {
                self.notify(node);
                Response::Ack
            }
            Request::Ping => Response::Ack,
            request @ (Request::Get { .. } | Request::Set { .. }) => {
                let handler = self.data_handler.lock().unwrap().clone();
                match handler {
                    Some(handler) => handler(&request),
                    None => Response::Failed,
                }
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
