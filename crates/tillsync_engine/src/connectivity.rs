//! Connectivity monitoring.
//!
//! The monitor maintains a boolean online signal and reports edge
//! transitions. It retries nothing itself; the worker uses a
//! came-online transition as a sync trigger and suppresses attempts
//! while offline.

use parking_lot::Mutex;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// A source of the raw reachability signal.
pub trait ConnectivityProbe: Send + Sync {
    /// Returns true if the remote is currently reachable.
    fn is_online(&self) -> bool;
}

/// A probe driven externally, by tests or a platform reachability
/// callback.
#[derive(Debug)]
pub struct AtomicProbe {
    online: AtomicBool,
}

impl AtomicProbe {
    /// Creates a probe with the given initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Updates the reachability state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for AtomicProbe {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// A probe that checks reachability with a TCP connect attempt.
///
/// Each check resolves the host and tries a short connect; this is a
/// liveness signal only, the connection is dropped immediately.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Creates a probe against `host` (a `host:port` pair).
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl ConnectivityProbe for TcpProbe {
    fn is_online(&self) -> bool {
        let addrs: Vec<SocketAddr> = match self.host.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(_) => return false,
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
    }
}

/// An observed reachability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The connection came back.
    CameOnline,
    /// The connection was lost.
    WentOffline,
}

/// Tracks the probe's state between polls and reports edges.
///
/// The first poll establishes the baseline and reports no transition.
pub struct ConnectivityMonitor {
    probe: std::sync::Arc<dyn ConnectivityProbe>,
    last: Mutex<Option<bool>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor over the given probe.
    pub fn new(probe: std::sync::Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            probe,
            last: Mutex::new(None),
        }
    }

    /// Returns the current raw reachability signal.
    pub fn is_online(&self) -> bool {
        self.probe.is_online()
    }

    /// Samples the probe and returns the transition since the previous
    /// poll, if any.
    pub fn poll(&self) -> Option<Transition> {
        let online = self.probe.is_online();
        let mut last = self.last.lock();
        let transition = match *last {
            Some(prev) if prev != online => {
                if online {
                    debug!("connectivity restored");
                    Some(Transition::CameOnline)
                } else {
                    debug!("connectivity lost");
                    Some(Transition::WentOffline)
                }
            }
            _ => None,
        };
        *last = Some(online);
        transition
    }
}
