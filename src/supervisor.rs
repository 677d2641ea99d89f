//! Per-service lifecycle: start, health, failure accounting, backoff.

use anyhow::Result;
use log::{info, warn};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::ServiceSpec;
use crate::kube::Forwarder;
use crate::ports::PortAllocator;
use crate::status::{Phase, ServiceStatus};

/// Failures tolerated before backoff kicks in; transient flaps stay cheap.
const FAILURE_THRESHOLD: u32 = 3;
/// Cooldown ladder past the threshold, clamped at the top rung.
const BACKOFF_SECONDS: [u64; 5] = [5, 10, 20, 40, 60];
/// Window after a spawn during which reachability is not yet demanded.
const STARTUP_GRACE: Duration = Duration::from_secs(3);
/// SIGTERM-to-SIGKILL window for our own children.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns one tunnel child and the state machine around it.
///
/// All mutation is serialized by the runtime lock; `status()` takes a read
/// lock and copies out a value. Nothing here points back at the
/// coordinator.
pub struct ServiceSupervisor {
    name: String,
    spec: ServiceSpec,
    forwarder: Arc<dyn Forwarder>,
    allocator: Arc<PortAllocator>,
    runtime: RwLock<ServiceRuntime>,
    restart_gate: AtomicBool,
    halted: AtomicBool,
}

struct ServiceRuntime {
    phase: Phase,
    effective_port: u16,
    port_claimed: bool,
    handle: Option<Box<dyn crate::process::ChildHandle>>,
    started_at: Option<Instant>,
    restart_count: u64,
    failure_streak: u32,
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
}

fn backoff_duration(streak: u32) -> Option<Duration> {
    if streak < FAILURE_THRESHOLD {
        return None;
    }
    let index = ((streak - FAILURE_THRESHOLD) as usize).min(BACKOFF_SECONDS.len() - 1);
    Some(Duration::from_secs(BACKOFF_SECONDS[index]))
}

impl ServiceSupervisor {
    pub fn new(
        name: String,
        spec: ServiceSpec,
        forwarder: Arc<dyn Forwarder>,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        let effective_port = spec.local_port;
        Self {
            name,
            spec,
            forwarder,
            allocator,
            runtime: RwLock::new(ServiceRuntime {
                phase: Phase::Stopped,
                effective_port,
                port_claimed: false,
                handle: None,
                started_at: None,
                restart_count: 0,
                failure_streak: 0,
                cooldown_until: None,
                last_error: None,
            }),
            restart_gate: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idempotent: a live child counts as success. Refused while a cooldown
    /// deadline is still in the future.
    pub async fn start(&self) -> Result<()> {
        let mut rt = self.runtime.write().await;
        self.start_locked(&mut rt).await
    }

    /// Idempotent: terminates the child if there is one and parks the
    /// machine in `Stopped`.
    pub async fn stop(&self) {
        let mut rt = self.runtime.write().await;
        self.stop_locked(&mut rt).await;
    }

    /// Stop followed by start under one lock; bumps the restart counter
    /// even when the subsequent start is refused.
    pub async fn restart(&self) -> Result<()> {
        info!("restarting service {}", self.name);
        let mut rt = self.runtime.write().await;
        self.stop_locked(&mut rt).await;
        rt.restart_count += 1;
        self.start_locked(&mut rt).await
    }

    pub async fn status(&self) -> ServiceStatus {
        let rt = self.runtime.read().await;
        ServiceStatus {
            phase: rt.phase,
            local_port: rt.effective_port,
            pid: rt.handle.as_ref().map(|h| h.pid()),
            started_at: rt.started_at,
            restart_count: rt.restart_count,
            last_error: rt.last_error.clone(),
            cooldown_active: rt
                .cooldown_until
                .map(|until| Instant::now() < until)
                .unwrap_or(false),
        }
    }

    /// Health sweep, called once per monitoring tick. Two independent ways
    /// to fail: the child died, or the port stopped accepting connections.
    pub async fn probe(&self) {
        let mut rt = self.runtime.write().await;
        if !matches!(rt.phase, Phase::Starting | Phase::Running) {
            return;
        }
        let now = Instant::now();

        let child_alive = match rt.handle.as_mut() {
            Some(handle) => handle.alive(),
            None => false,
        };
        if !child_alive {
            self.demote(&mut rt, "port-forward process exited", now).await;
            return;
        }

        let grace_over = rt
            .started_at
            .map(|t| now.duration_since(t) >= STARTUP_GRACE)
            .unwrap_or(true);
        if !grace_over {
            return;
        }

        if !tcp_reachable(rt.effective_port).await {
            self.demote(&mut rt, "local port stopped accepting connections", now)
                .await;
            return;
        }

        if rt.phase == Phase::Starting {
            info!(
                "service {} is up on local port {}",
                self.name, rt.effective_port
            );
        }
        if rt.failure_streak > 0 {
            info!("service {} recovered, clearing failure streak", self.name);
        }
        rt.phase = Phase::Running;
        rt.last_error = None;
        rt.failure_streak = 0;
        rt.cooldown_until = None;
    }

    /// Point of no return before shutdown. A late restart that lost the
    /// race against `stop()` must not spawn a child nobody will reap.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Guard for coordinator-dispatched restarts: at most one in flight.
    pub fn try_begin_restart(&self) -> bool {
        self.restart_gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_restart(&self) {
        self.restart_gate.store(false, Ordering::SeqCst);
    }

    async fn start_locked(&self, rt: &mut ServiceRuntime) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            anyhow::bail!("service {} is shut down", self.name);
        }
        if matches!(rt.phase, Phase::Starting | Phase::Running) {
            if let Some(handle) = rt.handle.as_mut() {
                if handle.alive() {
                    return Ok(());
                }
            }
        }

        let now = Instant::now();
        if let Some(until) = rt.cooldown_until {
            if now < until {
                rt.phase = Phase::Cooldown;
                anyhow::bail!(
                    "service {} is cooling down for another {:.0?}",
                    self.name,
                    until - now
                );
            }
        }

        rt.phase = Phase::Starting;
        self.release_port(rt);

        let port = match self.allocator.claim(self.spec.local_port) {
            Ok(port) => port,
            Err(err) => {
                rt.last_error = Some(err.to_string());
                self.note_failure(rt, now);
                return Err(err.into());
            }
        };
        rt.effective_port = port;
        rt.port_claimed = true;
        if port != self.spec.local_port {
            warn!(
                "port {} is busy for {}, forwarding on {} instead",
                self.spec.local_port, self.name, port
            );
        }

        match self.forwarder.spawn(&self.name, &self.spec, port).await {
            Ok(handle) => {
                info!(
                    "started port-forward for {}: {}:{} -> local {}",
                    self.name, self.spec.target, self.spec.target_port, port
                );
                rt.handle = Some(handle);
                rt.started_at = Some(now);
                Ok(())
            }
            Err(err) => {
                rt.last_error = Some(err.to_string());
                self.release_port(rt);
                self.note_failure(rt, now);
                Err(err.into())
            }
        }
    }

    async fn stop_locked(&self, rt: &mut ServiceRuntime) {
        if let Some(mut handle) = rt.handle.take() {
            handle.terminate(TERMINATE_GRACE).await;
            info!("stopped port-forward for {}", self.name);
        }
        self.release_port(rt);
        rt.phase = Phase::Stopped;
        rt.started_at = None;
    }

    /// Running/Starting -> Failed (or straight to Cooldown past the
    /// threshold). The child is torn down so the next start begins clean.
    async fn demote(&self, rt: &mut ServiceRuntime, reason: &str, now: Instant) {
        warn!("service {} failed: {}", self.name, reason);
        if let Some(mut handle) = rt.handle.take() {
            handle.terminate(TERMINATE_GRACE).await;
        }
        self.release_port(rt);
        rt.started_at = None;
        rt.last_error = Some(reason.to_string());
        self.note_failure(rt, now);
    }

    fn note_failure(&self, rt: &mut ServiceRuntime, now: Instant) {
        rt.phase = Phase::Failed;
        rt.failure_streak += 1;
        if let Some(cooldown) = backoff_duration(rt.failure_streak) {
            rt.cooldown_until = Some(now + cooldown);
            rt.phase = Phase::Cooldown;
            warn!(
                "service {} failed {} times, cooling down for {:?}",
                self.name, rt.failure_streak, cooldown
            );
        }
    }

    fn release_port(&self, rt: &mut ServiceRuntime) {
        if rt.port_claimed {
            self.allocator.release(rt.effective_port);
            rt.port_claimed = false;
        }
    }
}

async fn tcp_reachable(port: u16) -> bool {
    let attempt = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, attempt).await,
        Ok(Ok(_))
    )
}
