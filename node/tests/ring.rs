//! Multi-node ring scenarios: membership, routing and handoff, all running
//! real nodes on loopback ports.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use dht_node::{key_id, metrics, network, Address, Config, Dht, RING_SIZE};
use serde_json::Value;

// The metrics registry and the network profile are process-wide, so ring
// tests take this guard to keep their readings clean.
static RING_GUARD: Mutex<()> = Mutex::new(());

fn ring_guard() -> MutexGuard<'static, ()> {
    let guard = RING_GUARD.lock().unwrap_or_else(|e| e.into_inner());
    metrics::registry().reset();
    network::reset_profile();
    guard
}

fn fast_config() -> Config {
    Config {
        stabilize_interval: Duration::from_millis(200),
        fix_fingers_interval: Duration::from_millis(150),
        check_predecessor_interval: Duration::from_millis(300),
        migrate_interval: Duration::from_millis(400),
    }
}

fn local(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Follows successor pointers from the first node: a closed ring visits
/// every node exactly once and comes home, and everyone has a predecessor.
fn ring_is_closed(nodes: &[Dht]) -> bool {
    let want: HashSet<u64> = nodes.iter().map(|n| n.addr().id(0)).collect();
    let mut seen = HashSet::new();
    let mut current = nodes[0].addr().clone();
    for _ in 0..nodes.len() {
        let Some(node) = nodes.iter().find(|n| *n.addr() == current) else {
            return false;
        };
        seen.insert(current.id(0));
        current = node.node().successor();
    }
    current == *nodes[0].addr()
        && seen == want
        && nodes.iter().all(|n| n.node().predecessor().is_some())
}

fn spawn_ring(base_port: u16, n: usize) -> Vec<Dht> {
    let bootstrap = local(base_port);
    let mut nodes = vec![Dht::with_config(bootstrap.clone(), None, fast_config()).unwrap()];
    for i in 1..n {
        nodes.push(
            Dht::with_config(local(base_port + i as u16), Some(bootstrap.clone()), fast_config())
                .unwrap(),
        );
        thread::sleep(Duration::from_millis(150));
    }
    assert!(
        wait_until(Duration::from_secs(20), || ring_is_closed(&nodes)),
        "{n}-node ring on port {base_port} never closed"
    );
    nodes
}

/// The node that owns `key`: the one with the smallest identifier at or
/// clockwise-after the key's hash.
fn expected_owner<'a>(nodes: &'a [Dht], key: &str) -> &'a Dht {
    let h = key_id(key);
    nodes
        .iter()
        .min_by_key(|n| (n.addr().id(0) + RING_SIZE - h) % RING_SIZE)
        .unwrap()
}

/// Every key lives on exactly one node, and that node is its owner.
fn keys_settled(nodes: &[Dht], keys: &[String]) -> bool {
    keys.iter().all(|key| {
        let holders: Vec<_> = nodes
            .iter()
            .filter(|n| n.local_keys().contains(key))
            .collect();
        holders.len() == 1 && *holders[0].addr() == *expected_owner(nodes, key).addr()
    })
}

fn shutdown_all(nodes: &[Dht]) {
    for node in nodes {
        node.shutdown();
    }
}

#[test]
fn singleton_serves_local_hits_and_misses() {
    let _guard = ring_guard();
    let node = Dht::with_config(local(5600), None, fast_config()).unwrap();

    node.set("k", "v");
    assert_eq!(node.get("k"), Some(Value::String("v".to_string())));
    assert_eq!(node.get("missing"), None);

    let registry = metrics::registry();
    assert!(registry.counter("dht.get.local_hits") >= 1);
    assert!(registry.counter("dht.get.miss") >= 1);

    node.shutdown();
}

#[test]
fn two_node_ring_converges() {
    let _guard = ring_guard();
    let a = Dht::with_config(local(5610), None, fast_config()).unwrap();
    let b = Dht::with_config(local(5611), Some(local(5610)), fast_config()).unwrap();

    let converged = wait_until(Duration::from_secs(10), || {
        a.node().successor() == *b.addr()
            && b.node().successor() == *a.addr()
            && a.node().predecessor().as_ref() == Some(b.addr())
            && b.node().predecessor().as_ref() == Some(a.addr())
    });
    assert!(converged, "two-node ring did not converge");

    shutdown_all(&[a, b]);
}

#[test]
fn four_node_ring_closes_and_partitions_ownership() {
    let _guard = ring_guard();
    let nodes = spawn_ring(5620, 4);

    // Ownership partition: sampled identifiers have exactly one owner, the
    // node whose arc (predecessor, self] contains them.
    let samples: Vec<u64> = (0..32)
        .map(|i| key_id(&format!("sample_{i}")))
        .chain(nodes.iter().map(|n| n.addr().id(0)))
        .collect();
    for id in samples {
        let owners = nodes
            .iter()
            .filter(|n| {
                let pred = n.node().predecessor().unwrap();
                dht_node::in_range(id, pred.id(1), n.addr().id(1))
            })
            .count();
        assert_eq!(owners, 1, "identifier {id} has {owners} owners");
    }

    // Lookups are idempotent while the ring is stable.
    for i in 0..8 {
        let id = key_id(&format!("probe_{i}"));
        let first = nodes[0].node().find_successor(id);
        let second = nodes[0].node().find_successor(id);
        assert_eq!(first, second, "lookup for {id} flapped");
    }

    shutdown_all(&nodes);
}

#[test]
fn handoff_places_each_key_on_its_owner() {
    let _guard = ring_guard();
    let nodes = spawn_ring(5630, 2);

    let keys: Vec<String> = (0..10).map(|i| format!("key_{i}")).collect();
    for key in &keys {
        nodes[0].set(key.clone(), format!("value_for_{key}"));
    }

    assert!(
        wait_until(Duration::from_secs(10), || keys_settled(&nodes, &keys)),
        "keys never settled on their owners"
    );

    shutdown_all(&nodes);
}

#[test]
fn routed_gets_return_values_from_any_node() {
    let _guard = ring_guard();
    let nodes = spawn_ring(5640, 4);

    let keys: Vec<String> = (0..10).map(|i| format!("key_{i}")).collect();
    for key in &keys {
        nodes[0].set(key.clone(), format!("value_for_{key}"));
    }
    assert!(
        wait_until(Duration::from_secs(15), || keys_settled(&nodes, &keys)),
        "keys never settled on their owners"
    );

    for node in &nodes {
        for key in &keys {
            assert_eq!(
                node.get(key),
                Some(Value::String(format!("value_for_{key}"))),
                "get {key:?} at {} returned the wrong value",
                node.addr()
            );
        }
    }

    shutdown_all(&nodes);
}

#[test]
fn survivors_keep_serving_after_churn() {
    let _guard = ring_guard();
    let mut nodes = spawn_ring(5650, 8);

    let keys: Vec<String> = (0..20).map(|i| format!("key_{i}")).collect();
    for key in &keys {
        nodes[0].set(key.clone(), format!("value_for_{key}"));
    }
    assert!(
        wait_until(Duration::from_secs(25), || keys_settled(&nodes, &keys)),
        "keys never settled on their owners"
    );

    // Take down two non-bootstrap nodes and split the key set by the fate
    // of its owner.
    let dead: Vec<Dht> = nodes.split_off(6);
    let dead_addrs: Vec<Address> = dead.iter().map(|n| n.addr().clone()).collect();
    let (lost, kept): (Vec<&String>, Vec<&String>) = {
        let all: Vec<&Dht> = nodes.iter().chain(dead.iter()).collect();
        keys.iter().partition(|key| {
            let owner = {
                let h = key_id(key);
                all.iter()
                    .min_by_key(|n| (n.addr().id(0) + RING_SIZE - h) % RING_SIZE)
                    .unwrap()
                    .addr()
                    .clone()
            };
            dead_addrs.contains(&owner)
        })
    };
    shutdown_all(&dead);
    drop(dead);

    let repaired = wait_until(Duration::from_secs(10), || {
        nodes.iter().all(|node| {
            kept.iter().all(|key| {
                node.get(key.as_str()) == Some(Value::String(format!("value_for_{key}")))
            })
        })
    });
    assert!(repaired, "survivors never recovered the surviving keys");

    for key in &lost {
        assert_eq!(nodes[0].get(key.as_str()), None, "{key:?} outlived its owner");
    }

    shutdown_all(&nodes);
}

#[test]
fn shutdown_stops_every_daemon_promptly() {
    let _guard = ring_guard();
    let node = Dht::with_config(local(5690), None, fast_config()).unwrap();
    node.set("k", "v");

    let start = Instant::now();
    node.shutdown();
    // shutdown joins the listener and all daemons before returning.
    assert!(start.elapsed() < Duration::from_secs(5));

    // A second shutdown is a no-op.
    node.shutdown();
}
