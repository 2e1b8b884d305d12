//! Migration convergence and simulated-WAN scenarios.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use dht_node::{key_id, metrics, network, Address, Config, Dht, RING_SIZE};
use serde_json::Value;

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
        "{n}-node ring on port {base_port} never stabilised"
    );
    nodes
}

fn owner_index(nodes: &[Dht], key: &str) -> usize {
    let h = key_id(key);
    (0..nodes.len())
        .min_by_key(|&i| (nodes[i].addr().id(0) + RING_SIZE - h) % RING_SIZE)
        .unwrap()
}

fn keys_settled(nodes: &[Dht], keys: &[String]) -> bool {
    keys.iter().all(|key| {
        let holders = nodes
            .iter()
            .filter(|n| n.local_keys().contains(key))
            .count();
        holders == 1 && nodes[owner_index(nodes, key)].local_keys().contains(key)
    })
}

fn shutdown_all(nodes: &[Dht]) {
    for node in nodes {
        node.shutdown();
    }
}

#[test]
fn migration_converges_from_arbitrary_placement() {
    let _guard = ring_guard();
    let nodes = spawn_ring(5700, 4);

    // Scatter writes across every node so most keys start misplaced.
    let keys: Vec<String> = (0..12).map(|i| format!("key_{i}")).collect();
    for (i, key) in keys.iter().enumerate() {
        nodes[i % nodes.len()].set(key.clone(), format!("value_for_{key}"));
    }

    assert!(
        wait_until(Duration::from_secs(15), || keys_settled(&nodes, &keys)),
        "keys never converged onto their owners"
    );

    // Convergence is stable: another sweep moves nothing.
    thread::sleep(Duration::from_millis(900));
    assert!(keys_settled(&nodes, &keys));

    shutdown_all(&nodes);
}

#[test]
fn wan_profile_slows_remote_reads_by_two_hops() {
    let _guard = ring_guard();
    let nodes = spawn_ring(5710, 4);

    let keys: Vec<String> = (0..10).map(|i| format!("key_{i}")).collect();
    for key in &keys {
        nodes[0].set(key.clone(), format!("value_for_{key}"));
    }
    assert!(
        wait_until(Duration::from_secs(15), || keys_settled(&nodes, &keys)),
        "keys never settled before the WAN run"
    );

    metrics::registry().reset();
    network::configure_profile(10.0, 3.0, 0.0, &[]);

    // Twenty mixed operations, 7:3 reads to writes. Writes go to the owner
    // so the data set stays settled; reads go to a non-owner so every one
    // crosses the wire.
    let mut latest: HashMap<String, Value> = keys
        .iter()
        .map(|key| (key.clone(), Value::String(format!("value_for_{key}"))))
        .collect();
    for i in 0..20 {
        let key = &keys[i % keys.len()];
        let owner = owner_index(&nodes, key);
        if i % 10 < 7 {
            let reader = &nodes[(owner + 1) % nodes.len()];
            assert_eq!(
                reader.get(key).as_ref(),
                Some(&latest[key]),
                "routed get for {key:?} under the WAN profile"
            );
        } else {
            let value = Value::String(format!("updated_value_{i}"));
            nodes[owner].set(key.clone(), value.clone());
            latest.insert(key.clone(), value);
        }
    }

    let snapshot = metrics::registry().snapshot();
    network::reset_profile();

    let gets = snapshot
        .latencies
        .get("dht.rpc.get")
        .expect("no remote gets were recorded");
    assert_eq!(gets.count, 14);
    // Request and response frames each sleep at least delay - jitter.
    assert!(
        gets.mean >= Duration::from_millis(14),
        "mean remote-get latency {:?} is below two one-way hops",
        gets.mean
    );
    assert_eq!(metrics::registry().counter("dht.rpc.get.success"), 14);

    shutdown_all(&nodes);
}
