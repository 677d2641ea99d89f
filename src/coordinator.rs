//! Top-level composition: one supervisor per configured service, a
//! monitoring tick that sweeps them all, and a single cancellation signal
//! threaded through every task.

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ServiceSpec};
use crate::kube::{ClusterProbe, Forwarder};
use crate::ports::PortAllocator;
use crate::status::{Phase, ServiceStatus, StatusBus, StatusSnapshot};
use crate::supervisor::ServiceSupervisor;
use crate::ui_handlers::UiHandler;

/// Spacing between per-service restarts after a context change, so the
/// external CLI is not hit by the whole herd at once.
const CONTEXT_RESTART_SPACING: Duration = Duration::from_millis(100);
/// Upper bound on one context read; a wedged CLI must not stall the tick
/// loop for longer than a sweep.
const CONTEXT_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Coordinator {
    supervisors: HashMap<String, Arc<ServiceSupervisor>>,
    specs: Arc<HashMap<String, ServiceSpec>>,
    probe: Arc<dyn ClusterProbe>,
    ui_handlers: Vec<Arc<dyn UiHandler>>,
    allocator: Arc<PortAllocator>,
    interval: Duration,
    context: RwLock<String>,
    bus: Mutex<Option<StatusBus>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    context_restart_gate: Arc<AtomicBool>,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        forwarder: Arc<dyn Forwarder>,
        probe: Arc<dyn ClusterProbe>,
        ui_handlers: Vec<Arc<dyn UiHandler>>,
    ) -> Arc<Self> {
        let allocator = Arc::new(PortAllocator::new());
        let specs: HashMap<String, ServiceSpec> = config.port_forwards.clone();

        let supervisors = specs
            .iter()
            .map(|(name, spec)| {
                let supervisor = ServiceSupervisor::new(
                    name.clone(),
                    spec.clone(),
                    forwarder.clone(),
                    allocator.clone(),
                );
                (name.clone(), Arc::new(supervisor))
            })
            .collect();

        Arc::new(Self {
            supervisors,
            specs: Arc::new(specs),
            probe,
            ui_handlers,
            allocator,
            interval: config.monitoring_interval(),
            context: RwLock::new(String::new()),
            bus: Mutex::new(Some(StatusBus::new())),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            context_restart_gate: Arc::new(AtomicBool::new(false)),
            tick_task: Mutex::new(None),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        let bus = self.bus.lock().unwrap();
        bus.as_ref()
            .expect("subscribe called after shutdown")
            .subscribe()
    }

    pub fn current_context(&self) -> String {
        self.context.read().unwrap().clone()
    }

    /// Brings every service up and starts the monitoring loop. Individual
    /// start failures are contained; the returned count reports them. An
    /// unreadable cluster context or an exhausted port space is fatal.
    pub async fn start(self: Arc<Self>) -> Result<usize> {
        let context = self
            .probe
            .current()
            .await
            .context("failed to read the active cluster context")?;
        info!("cluster context: {}", context);
        *self.context.write().unwrap() = context;

        // Global preflight: the whole table must be placeable before any
        // tunnel spawns; individual supervisors still re-arbitrate later.
        self.allocator
            .resolve_all(&self.specs)
            .context("cannot place all services on free local ports")?;

        let results = join_all(self.supervisors.values().map(|supervisor| {
            let supervisor = supervisor.clone();
            async move {
                supervisor
                    .start()
                    .await
                    .map_err(|err| (supervisor.name().to_string(), err))
            }
        }))
        .await;

        let mut failures = 0;
        for result in results {
            if let Err((name, err)) = result {
                error!("failed to start service {}: {:#}", name, err);
                failures += 1;
            }
        }
        if failures > 0 {
            warn!(
                "started {} of {} services",
                self.supervisors.len() - failures,
                self.supervisors.len()
            );
        } else {
            info!("started {} port-forward services", self.supervisors.len());
        }

        let coordinator = self.clone();
        let task = tokio::spawn(async move { coordinator.run_ticks().await });
        *self.tick_task.lock().unwrap() = Some(task);

        Ok(failures)
    }

    /// Idempotent teardown: helpers first, then every tunnel in parallel
    /// (total time is bounded by the grace window, not the service count),
    /// then a final all-Stopped snapshot before the bus closes.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.cancel.cancel();

        let tick_task = self.tick_task.lock().unwrap().take();
        if let Some(task) = tick_task {
            let _ = task.await;
        }

        // In-flight restart tasks must not respawn once stop has passed
        // their supervisor.
        for supervisor in self.supervisors.values() {
            supervisor.halt();
        }

        join_all(self.ui_handlers.iter().map(|handler| handler.stop_all())).await;
        join_all(
            self.supervisors
                .values()
                .map(|supervisor| supervisor.stop()),
        )
        .await;

        let snapshot = self.collect(false).await;
        let bus = self.bus.lock().unwrap().take();
        if let Some(bus) = bus {
            bus.publish(snapshot);
        }
        info!("shutdown complete");
    }

    async fn run_ticks(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let snapshot = self.collect(true).await;

        self.dispatch_restarts(&snapshot);

        for handler in &self.ui_handlers {
            if !handler.is_enabled() {
                continue;
            }
            let handler = handler.clone();
            let specs = self.specs.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                handler.reconcile(&snapshot, &specs).await;
            });
        }

        if let Some(bus) = self.bus.lock().unwrap().as_ref() {
            bus.publish(snapshot);
        }

        self.check_context().await;
    }

    /// One status sweep. With `with_probe` set this also runs each
    /// service's health check; the per-service futures run concurrently so
    /// a slow probe cannot stretch the sweep past its own timeout.
    async fn collect(&self, with_probe: bool) -> StatusSnapshot {
        let statuses: Vec<(String, ServiceStatus)> =
            join_all(self.supervisors.values().map(|supervisor| async move {
                if with_probe {
                    supervisor.probe().await;
                }
                (supervisor.name().to_string(), supervisor.status().await)
            }))
            .await;

        StatusSnapshot {
            context: self.current_context(),
            services: statuses.into_iter().collect(),
        }
    }

    /// Failed services restart on background tasks, never on the tick
    /// itself, with at most one outstanding restart per service.
    fn dispatch_restarts(&self, snapshot: &StatusSnapshot) {
        for (name, status) in &snapshot.services {
            let wants_restart = matches!(status.phase, Phase::Failed | Phase::Cooldown)
                && !status.cooldown_active;
            if !wants_restart {
                continue;
            }
            let Some(supervisor) = self.supervisors.get(name) else {
                continue;
            };
            if !supervisor.try_begin_restart() {
                continue;
            }

            info!("restarting failed service: {}", name);
            let supervisor = supervisor.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                // Shutdown may have started since the tick; do not respawn
                // into a system that is going away.
                if !cancel.is_cancelled() {
                    if let Err(err) = supervisor.restart().await {
                        warn!("restart of {} failed: {:#}", supervisor.name(), err);
                    }
                }
                supervisor.end_restart();
            });
        }
    }

    async fn check_context(&self) {
        let read = tokio::time::timeout(CONTEXT_READ_TIMEOUT, self.probe.current()).await;
        let new_context = match read {
            Ok(Ok(context)) => context,
            Ok(Err(err)) => {
                warn!(
                    "failed to read cluster context, assuming unchanged: {:#}",
                    err
                );
                return;
            }
            Err(_) => {
                warn!("cluster context read timed out, assuming unchanged");
                return;
            }
        };

        let old_context = self.current_context();
        if new_context == old_context {
            return;
        }

        info!(
            "cluster context changed from {} to {}, restarting all services",
            old_context, new_context
        );
        *self.context.write().unwrap() = new_context;

        if self
            .context_restart_gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut supervisors: Vec<Arc<ServiceSupervisor>> =
            self.supervisors.values().cloned().collect();
        supervisors.sort_by(|a, b| a.name().cmp(b.name()));
        let cancel = self.cancel.clone();
        let gate = self.context_restart_gate.clone();
        tokio::spawn(async move {
            restart_all(supervisors, cancel).await;
            gate.store(false, Ordering::SeqCst);
        });
    }
}

/// Sequential restart of every supervisor with a small gap in between.
async fn restart_all(supervisors: Vec<Arc<ServiceSupervisor>>, cancel: CancellationToken) {
    for supervisor in supervisors {
        if cancel.is_cancelled() {
            return;
        }
        if !supervisor.try_begin_restart() {
            continue;
        }
        if let Err(err) = supervisor.restart().await {
            warn!(
                "restart of {} after context change failed: {:#}",
                supervisor.name(),
                err
            );
        }
        supervisor.end_restart();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(CONTEXT_RESTART_SPACING) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceKind;
    use crate::process::{ChildHandle, SpawnError};
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    fn spec(local_port: u16) -> ServiceSpec {
        ServiceSpec {
            target: "service/test".to_string(),
            target_port: 8080,
            local_port,
            namespace: "default".to_string(),
            kind: ServiceKind::Rpc,
            swagger_path: None,
            api_path: None,
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Both listeners are held while reading the numbers, so the pair is
    /// guaranteed distinct.
    fn free_port_pair() -> (u16, u16) {
        let first = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let second = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        (
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        )
    }

    fn config(ports: &[(&str, u16)]) -> Config {
        let mut cfg = Config::default();
        cfg.monitoring_interval = 5;
        for (name, port) in ports {
            cfg.port_forwards.insert(name.to_string(), spec(*port));
        }
        cfg
    }

    // -- mock collaborators ------------------------------------------------

    struct MockChildState {
        alive: AtomicBool,
        terminated: AtomicBool,
        listener: StdMutex<Option<TcpListener>>,
    }

    impl MockChildState {
        fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.listener.lock().unwrap().take();
        }
    }

    struct MockChild {
        pid: u32,
        state: Arc<MockChildState>,
    }

    #[async_trait]
    impl ChildHandle for MockChild {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn alive(&mut self) -> bool {
            self.state.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.state.terminated.store(true, Ordering::SeqCst);
            self.state.kill();
        }
    }

    struct MockForwarder {
        fail_next: AtomicU32,
        children: StdMutex<Vec<(String, Arc<MockChildState>)>>,
        next_pid: AtomicU32,
    }

    impl MockForwarder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_next: AtomicU32::new(0),
                children: StdMutex::new(Vec::new()),
                next_pid: AtomicU32::new(1000),
            })
        }

        fn child_of(&self, service: &str) -> Arc<MockChildState> {
            self.children
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(name, _)| name == service)
                .map(|(_, state)| state.clone())
                .unwrap()
        }

        fn all_children(&self) -> Vec<Arc<MockChildState>> {
            self.children
                .lock()
                .unwrap()
                .iter()
                .map(|(_, state)| state.clone())
                .collect()
        }
    }

    #[async_trait]
    impl crate::kube::Forwarder for MockForwarder {
        async fn spawn(
            &self,
            name: &str,
            _spec: &ServiceSpec,
            local_port: u16,
        ) -> Result<Box<dyn ChildHandle>, SpawnError> {
            let remaining_failures = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
            if remaining_failures.is_ok() {
                return Err(SpawnError::Launch {
                    command: name.to_string(),
                    source: std::io::Error::other("simulated spawn failure"),
                });
            }
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).unwrap();
            let state = Arc::new(MockChildState {
                alive: AtomicBool::new(true),
                terminated: AtomicBool::new(false),
                listener: StdMutex::new(Some(listener)),
            });
            self.children
                .lock()
                .unwrap()
                .push((name.to_string(), state.clone()));
            Ok(Box::new(MockChild {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                state,
            }))
        }
    }

    struct MockProbe {
        context: StdMutex<String>,
        fail: AtomicBool,
    }

    impl MockProbe {
        fn new(context: &str) -> Arc<Self> {
            Arc::new(Self {
                context: StdMutex::new(context.to_string()),
                fail: AtomicBool::new(false),
            })
        }

        fn set_context(&self, context: &str) {
            *self.context.lock().unwrap() = context.to_string();
        }
    }

    #[async_trait]
    impl ClusterProbe for MockProbe {
        async fn current(&self) -> Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("simulated kubectl failure");
            }
            Ok(self.context.lock().unwrap().clone())
        }
    }

    struct MockUiHandler {
        reconciles: AtomicUsize,
        stopped: AtomicBool,
        last_running: StdMutex<Vec<String>>,
    }

    impl MockUiHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reconciles: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                last_running: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UiHandler for MockUiHandler {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn enable(&self) -> Result<()> {
            Ok(())
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn reconcile(
            &self,
            snapshot: &StatusSnapshot,
            _specs: &HashMap<String, ServiceSpec>,
        ) {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            let mut running: Vec<String> = snapshot
                .services
                .iter()
                .filter(|(_, s)| s.phase == Phase::Running)
                .map(|(n, _)| n.clone())
                .collect();
            running.sort();
            *self.last_running.lock().unwrap() = running;
        }

        async fn stop_all(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    // -- helpers -----------------------------------------------------------

    /// Advances paused time in small steps, yielding so background tasks
    /// (tick loop, restart tasks) get scheduled in between.
    async fn run_for(duration: Duration) {
        let step = Duration::from_millis(100);
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            let advance = step.min(remaining);
            tokio::time::advance(advance).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            remaining -= advance;
        }
    }

    fn phases(snapshot: &StatusSnapshot) -> HashMap<String, Phase> {
        snapshot
            .services
            .iter()
            .map(|(name, status)| (name.clone(), status.phase))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn start_brings_every_service_to_running() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (a, b) = free_port_pair();
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        let coordinator = Coordinator::new(&config(&[("a", a), ("b", b)]), forwarder, probe, vec![]);

        let failures = coordinator.clone().start().await.unwrap();
        assert_eq!(failures, 0);
        assert_eq!(coordinator.current_context(), "alpha");

        let mut rx = coordinator.subscribe();
        // Three sweeps are plenty for spawn + grace + probe.
        run_for(Duration::from_secs(15)).await;

        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(phases(&snapshot)["a"], Phase::Running);
        assert_eq!(phases(&snapshot)["b"], Phase::Running);
        assert_eq!(snapshot.services["a"].local_port, a);
        assert_eq!(snapshot.services["b"].local_port, b);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_reports_partial_failures_without_aborting() {
        let _ = env_logger::builder().is_test(true).try_init();
        let forwarder = MockForwarder::new();
        forwarder.fail_next.store(1, Ordering::SeqCst);
        let probe = MockProbe::new("alpha");
        let coordinator = Coordinator::new(
            &config(&[("a", free_port()), ("b", free_port())]),
            forwarder,
            probe,
            vec![],
        );

        let failures = coordinator.clone().start().await.unwrap();
        assert_eq!(failures, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_context_is_fatal_at_start() {
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        probe.fail.store(true, Ordering::SeqCst);
        let coordinator =
            Coordinator::new(&config(&[("a", free_port())]), forwarder, probe, vec![]);

        assert!(coordinator.clone().start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_service_is_restarted_by_the_tick_loop() {
        let _ = env_logger::builder().is_test(true).try_init();
        let port = free_port();
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        let coordinator =
            Coordinator::new(&config(&[("a", port)]), forwarder.clone(), probe, vec![]);

        coordinator.clone().start().await.unwrap();
        run_for(Duration::from_secs(15)).await;
        let mut rx = coordinator.subscribe();
        assert_eq!(phases(&rx.borrow_and_update())["a"], Phase::Running);

        forwarder.child_of("a").kill();
        run_for(Duration::from_secs(20)).await;

        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.services["a"].phase, Phase::Running);
        assert_eq!(snapshot.services["a"].restart_count, 1);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn context_change_restarts_every_service_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (a, b) = free_port_pair();
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        let coordinator = Coordinator::new(
            &config(&[("a", a), ("b", b)]),
            forwarder,
            probe.clone(),
            vec![],
        );

        coordinator.clone().start().await.unwrap();
        run_for(Duration::from_secs(15)).await;

        probe.set_context("beta");
        run_for(Duration::from_secs(20)).await;

        let mut rx = coordinator.subscribe();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.context, "beta");
        assert_eq!(snapshot.services["a"].restart_count, 1);
        assert_eq!(snapshot.services["b"].restart_count, 1);
        assert_eq!(snapshot.services["a"].phase, Phase::Running);
        assert_eq!(snapshot.services["b"].phase, Phase::Running);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn context_read_failure_is_treated_as_unchanged() {
        let _ = env_logger::builder().is_test(true).try_init();
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        let coordinator = Coordinator::new(
            &config(&[("a", free_port())]),
            forwarder,
            probe.clone(),
            vec![],
        );

        coordinator.clone().start().await.unwrap();
        probe.fail.store(true, Ordering::SeqCst);
        run_for(Duration::from_secs(20)).await;

        let mut rx = coordinator.subscribe();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.context, "alpha");
        assert_eq!(snapshot.services["a"].restart_count, 0);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn aux_managers_see_every_sweep_and_stop_on_shutdown() {
        let _ = env_logger::builder().is_test(true).try_init();
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        let ui = MockUiHandler::new();
        let coordinator = Coordinator::new(
            &config(&[("a", free_port())]),
            forwarder,
            probe,
            vec![ui.clone() as Arc<dyn UiHandler>],
        );

        coordinator.clone().start().await.unwrap();
        run_for(Duration::from_secs(15)).await;

        assert!(ui.reconciles.load(Ordering::SeqCst) > 0);
        assert_eq!(*ui.last_running.lock().unwrap(), vec!["a".to_string()]);

        coordinator.shutdown().await;
        assert!(ui.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reaps_everything_and_closes_the_bus() {
        let _ = env_logger::builder().is_test(true).try_init();
        let forwarder = MockForwarder::new();
        let probe = MockProbe::new("alpha");
        let coordinator = Coordinator::new(
            &config(&[("a", free_port()), ("b", free_port())]),
            forwarder.clone(),
            probe,
            vec![],
        );

        coordinator.clone().start().await.unwrap();
        run_for(Duration::from_secs(15)).await;

        let mut rx = coordinator.subscribe();
        coordinator.shutdown().await;
        // Safe to call twice.
        coordinator.shutdown().await;

        // The final snapshot shows every service stopped...
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot
            .services
            .values()
            .all(|s| s.phase == Phase::Stopped));
        // ...no child survives...
        assert!(forwarder
            .all_children()
            .iter()
            .all(|c| !c.alive.load(Ordering::SeqCst)));
        // ...and the bus is closed.
        assert!(rx.changed().await.is_err());
    }
}
