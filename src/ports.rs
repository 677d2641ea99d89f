//! Local port arbitration.
//!
//! Every observation here is point-in-time: another process can grab a port
//! between the probe and the actual bind by kubectl. That race is tolerated
//! upstream — a wrong-free answer makes the spawn fail and the state machine
//! handles it like any other failure.

use log::debug;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::ServiceSpec;

pub type Port = u16;

const PROBE_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port found at or above {0}")]
    NoFreePort(Port),
}

/// Hands out conflict-free local ports.
///
/// Two layers of bookkeeping: a short-TTL cache of bind probes so a
/// monitoring sweep does not hammer the socket table, and a reservation set
/// for ports currently claimed by live tunnels so concurrent starts inside
/// this process never race each other onto the same port.
pub struct PortAllocator {
    cache_ttl: Duration,
    cache: Mutex<HashMap<Port, ProbeEntry>>,
    reserved: Mutex<HashSet<Port>>,
}

struct ProbeEntry {
    free: bool,
    observed_at: Instant,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_cache_ttl(PROBE_CACHE_TTL)
    }

    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Attempts a wildcard bind and releases immediately.
    pub fn is_free(&self, port: Port) -> bool {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&port) {
                if entry.observed_at.elapsed() < self.cache_ttl {
                    return entry.free;
                }
            }
        }

        let free = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok();

        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            port,
            ProbeEntry {
                free,
                observed_at: Instant::now(),
            },
        );
        free
    }

    /// Lowest free port >= `hint` that is neither excluded nor reserved.
    pub fn next_free(&self, hint: Port, exclude: &HashSet<Port>) -> Result<Port, PortError> {
        for port in hint..=Port::MAX {
            if exclude.contains(&port) {
                continue;
            }
            if self.reserved.lock().unwrap().contains(&port) {
                continue;
            }
            if self.is_free(port) {
                return Ok(port);
            }
        }
        Err(PortError::NoFreePort(hint))
    }

    /// Claims `hint` if available, otherwise the next free port above it.
    /// The claim holds until [`release`](Self::release). The reservation
    /// lock is held across probe-and-insert so two concurrent claims can
    /// never settle on the same port.
    pub fn claim(&self, hint: Port) -> Result<Port, PortError> {
        let mut reserved = self.reserved.lock().unwrap();
        if !reserved.contains(&hint) && self.is_free(hint) {
            reserved.insert(hint);
            debug!("claimed local port {}", hint);
            return Ok(hint);
        }
        for port in hint.saturating_add(1)..=Port::MAX {
            if !reserved.contains(&port) && self.is_free(port) {
                reserved.insert(port);
                debug!("claimed local port {}", port);
                return Ok(port);
            }
        }
        Err(PortError::NoFreePort(hint))
    }

    pub fn release(&self, port: Port) {
        self.reserved.lock().unwrap().remove(&port);
        debug!("released local port {}", port);
    }

    /// Two-pass bulk resolution over the whole service table, iterated in
    /// name order so the outcome is deterministic.
    ///
    /// Pass one honors every preference that is free and unclaimed within
    /// the pass; pass two repairs the leftovers with a next-free search.
    /// The whole operation fails if any entry cannot be placed.
    pub fn resolve_all(
        &self,
        specs: &HashMap<String, ServiceSpec>,
    ) -> Result<HashMap<String, Port>, PortError> {
        let mut names: Vec<&String> = specs.keys().collect();
        names.sort();

        let mut assignments: HashMap<String, Port> = HashMap::new();
        let mut taken: HashSet<Port> = self.reserved.lock().unwrap().clone();

        for name in &names {
            let desired = specs[*name].local_port;
            if !taken.contains(&desired) && self.is_free(desired) {
                assignments.insert((*name).clone(), desired);
                taken.insert(desired);
            }
        }

        for name in &names {
            if assignments.contains_key(*name) {
                continue;
            }
            let desired = specs[*name].local_port;
            let port = self.next_free(desired, &taken)?;
            assignments.insert((*name).clone(), port);
            taken.insert(port);
        }

        Ok(assignments)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
