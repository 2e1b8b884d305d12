//! Framed transport over TCP, with simulated network conditions.
//!
//! Every RPC is one request frame followed by one response frame on a fresh
//! connection; frames are UTF-8 text terminated by `CR LF`. A process-wide
//! [`NetworkProfile`] lets experiments inject latency, jitter, packet loss
//! and partitions without touching the callers.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;

use crate::chord::Address;
use crate::error::{DhtError, Result};

/// Limit on establishing an outbound connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Limit on any single read or write on an established connection.
pub const IO_TIMEOUT: Duration = Duration::from_secs(2);

const FRAME_END: &[u8] = b"\r\n";

/// Simulated network conditions applied to every outbound frame.
#[derive(Debug, Clone, Default)]
pub struct NetworkProfile {
    /// Base latency added to each send, in milliseconds.
    pub delay_ms: f64,
    /// Uniform random variation around the base latency, in milliseconds.
    pub jitter_ms: f64,
    /// Probability in `[0, 1]` that a send is dropped.
    pub drop_rate: f64,
    /// Ports cut off from the rest of the network.
    pub isolated_ports: HashSet<u16>,
}

static PROFILE: Lazy<Mutex<NetworkProfile>> = Lazy::new(|| Mutex::new(NetworkProfile::default()));

/// Replaces the process-wide simulation profile atomically.
///
/// Out-of-range inputs are clamped rather than rejected so experiment
/// drivers can sweep parameters freely.
pub fn configure_profile(delay_ms: f64, jitter_ms: f64, drop_rate: f64, isolated_ports: &[u16]) {
    let mut profile = PROFILE.lock().unwrap();
    profile.delay_ms = delay_ms.max(0.0);
    profile.jitter_ms = jitter_ms.max(0.0);
    profile.drop_rate = drop_rate.clamp(0.0, 1.0);
    profile.isolated_ports = isolated_ports.iter().copied().collect();
}

/// Restores the undisturbed-network profile.
pub fn reset_profile() {
    configure_profile(0.0, 0.0, 0.0, &[]);
}

fn resolve(addr: &Address) -> Result<SocketAddr> {
    (addr.host.as_str(), addr.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            DhtError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cannot resolve {addr}"),
            ))
        })
}

/// Opens a connection to `addr` with bounded connect and I/O timeouts.
pub fn connect(addr: &Address) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&resolve(addr)?, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(stream)
}

fn isolated(stream: &TcpStream, profile: &NetworkProfile) -> bool {
    if profile.isolated_ports.is_empty() {
        return false;
    }
    let local = stream.local_addr().map(|a| a.port()).ok();
    let peer = stream.peer_addr().map(|a| a.port()).ok();
    local.is_some_and(|p| profile.isolated_ports.contains(&p))
        || peer.is_some_and(|p| profile.isolated_ports.contains(&p))
}

/// Sends one frame, applying the simulation profile first.
pub fn send_frame(stream: &mut TcpStream, msg: &str) -> Result<()> {
    let (delay_ms, jitter_ms, drop_rate, cut) = {
        let profile = PROFILE.lock().unwrap();
        (
            profile.delay_ms,
            profile.jitter_ms,
            profile.drop_rate,
            isolated(stream, &profile),
        )
    };

    if delay_ms > 0.0 || jitter_ms > 0.0 {
        let jitter = if jitter_ms > 0.0 {
            rand::rng().random_range(-jitter_ms..=jitter_ms)
        } else {
            0.0
        };
        let total = (delay_ms + jitter).max(0.0);
        if total > 0.0 {
            thread::sleep(Duration::from_secs_f64(total / 1000.0));
        }
    }

    if cut {
        return Err(DhtError::Partition);
    }
    if drop_rate > 0.0 && rand::rng().random::<f64>() < drop_rate {
        return Err(DhtError::PacketDrop);
    }

    stream.write_all(msg.as_bytes())?;
    stream.write_all(FRAME_END)?;
    Ok(())
}

/// Reads one frame, stripping the terminator.
///
/// EOF before the terminator is a transport error, whether or not any bytes
/// arrived first.
pub fn read_frame(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(DhtError::UnexpectedEof);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(FRAME_END) {
            buf.truncate(buf.len() - FRAME_END.len());
            break;
        }
    }
    String::from_utf8(buf).map_err(|e| DhtError::Malformed(e.to_string()))
}

/// One request/response round trip on a fresh connection.
///
/// The connection is dropped afterwards; failures are independent per call.
pub fn call(addr: &Address, request: &str) -> Result<String> {
    let mut stream = connect(addr)?;
    send_frame(&mut stream, request)?;
    read_frame(&mut stream)
}
