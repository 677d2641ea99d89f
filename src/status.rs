//! Status snapshots and their fan-out channel.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ports::Port;

/// Lifecycle phase of one supervised tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Failed,
    Cooldown,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Starting => "Starting",
            Phase::Running => "Running",
            Phase::Failed => "Failed",
            Phase::Cooldown => "Cooldown",
            Phase::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}

/// Public, value-typed view of one service. Observers never see the
/// supervisor's mutable state, only copies of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub phase: Phase,
    pub local_port: Port,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub restart_count: u64,
    pub last_error: Option<String>,
    pub cooldown_active: bool,
}

impl ServiceStatus {
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    /// Cluster context the tunnels were started against.
    pub context: String,
    pub services: HashMap<String, ServiceStatus>,
}

impl StatusSnapshot {
    pub fn running(&self) -> usize {
        self.services
            .values()
            .filter(|s| s.phase == Phase::Running)
            .count()
    }
}

/// Latest-value delivery of snapshots from the coordinator to observers.
///
/// Built on a watch channel rather than a broadcast: a snapshot is a
/// refresh, not an event log entry. A slow observer simply misses
/// intermediate snapshots; publishing never blocks the coordinator.
pub struct StatusBus {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::default());
        Self { tx }
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// The receiver outlives the bus but reports closure once the bus is
    /// dropped at shutdown.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
