//! Named periodic tasks with cooperative shutdown.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

/// A one-way shutdown signal shared between a node and its daemons.
///
/// Sleeping daemons park on the condvar so that [`Shutdown::trigger`] wakes
/// them immediately instead of at the end of their cadence.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal. Returns `true` the first time only.
    pub fn trigger(&self) -> bool {
        let mut flag = self.flag.lock().unwrap();
        let first = !*flag;
        *flag = true;
        self.signal.notify_all();
        first
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Sleeps up to `timeout`, waking early on shutdown.
    ///
    /// Returns `true` when shutdown was triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.signal.wait_timeout(flag, deadline - now).unwrap();
            flag = guard;
        }
        true
    }
}

/// Runs `task` every `interval` on a named thread until it returns `false`
/// or `shutdown` is triggered.
///
/// A panicking tick is logged and re-scheduled; it never takes the daemon
/// down with it.
pub fn spawn<F>(name: &str, interval: Duration, shutdown: Arc<Shutdown>, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    let name = name.to_string();
    thread::Builder::new()
        .name(format!("daemon-{name}"))
        .spawn(move || {
            debug!("daemon {name} started");
            loop {
                if shutdown.is_triggered() {
                    break;
                }
                let keep_going = match panic::catch_unwind(AssertUnwindSafe(|| task())) {
                    Ok(keep_going) => keep_going,
                    Err(_) => {
                        error!("daemon {name}: tick panicked, re-scheduling");
                        true
                    }
                };
                if !keep_going {
                    break;
                }
                if shutdown.wait(interval) {
                    break;
                }
            }
            debug!("daemon {name} stopped");
        })
        .expect("failed to spawn daemon thread")
}
