//! gRPC inspector helpers, one `grpcui` child per running RPC tunnel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{adoption_targets, reconcile_delta, UiHandler};
use crate::config::{ServiceKind, ServiceSpec};
use crate::ports::{Port, PortAllocator};
use crate::process::ProcessHandle;
use crate::status::StatusSnapshot;

/// Helper ports are searched upward from here, well clear of the primary
/// tunnel range.
const GRPCUI_BASE_PORT: Port = 9090;
const HELPER_GRACE: Duration = Duration::from_secs(2);

struct Helper {
    handle: ProcessHandle,
    ui_port: Port,
    service_port: Port,
}

pub struct GrpcUiManager {
    enabled: AtomicBool,
    allocator: PortAllocator,
    helpers: Mutex<HashMap<String, Helper>>,
}

impl GrpcUiManager {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            allocator: PortAllocator::new(),
            helpers: Mutex::new(HashMap::new()),
        }
    }

    async fn adopt(&self, name: &str, service_port: Port) -> Result<Helper> {
        let ui_port = self
            .allocator
            .claim(GRPCUI_BASE_PORT)
            .context("no free port for grpcui")?;

        let mut cmd = Command::new("grpcui");
        cmd.args(["-bind", "localhost", "-port"])
            .arg(ui_port.to_string())
            .arg("-plaintext")
            .arg(format!("localhost:{}", service_port));

        match ProcessHandle::spawn(cmd, &format!("grpcui [{}]", name)) {
            Ok(handle) => {
                info!(
                    "started gRPC UI for {} at http://localhost:{}",
                    name, ui_port
                );
                Ok(Helper {
                    handle,
                    ui_port,
                    service_port,
                })
            }
            Err(err) => {
                self.allocator.release(ui_port);
                Err(err.into())
            }
        }
    }

    async fn drop_helper(&self, name: &str, mut helper: Helper) {
        helper.handle.terminate(HELPER_GRACE).await;
        self.allocator.release(helper.ui_port);
        info!("stopped gRPC UI for {}", name);
    }
}

impl Default for GrpcUiManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UiHandler for GrpcUiManager {
    fn name(&self) -> &'static str {
        "grpcui"
    }

    async fn enable(&self) -> Result<()> {
        Command::new("grpcui")
            .arg("-version")
            .output()
            .await
            .context(
                "grpcui not found in PATH. \
                 Install with: go install github.com/fullstorydev/grpcui/cmd/grpcui@latest",
            )?;
        self.enabled.store(true, Ordering::SeqCst);
        info!("gRPC UI manager enabled");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn reconcile(&self, snapshot: &StatusSnapshot, specs: &HashMap<String, ServiceSpec>) {
        let mut helpers = self.helpers.lock().await;
        // Checked under the lock: stop_all may have disabled the manager
        // while this reconcile was waiting its turn.
        if !self.is_enabled() {
            return;
        }

        // Dead helpers leave the adopted set so they are started again below.
        let mut dead = Vec::new();
        for (name, helper) in helpers.iter_mut() {
            if !helper.handle.alive() {
                warn!("gRPC UI for {} died, re-adopting", name);
                dead.push(name.clone());
            }
        }
        for name in dead {
            if let Some(helper) = helpers.remove(&name) {
                self.allocator.release(helper.ui_port);
            }
        }

        let adopted: HashMap<String, Port> = helpers
            .iter()
            .map(|(name, helper)| (name.clone(), helper.service_port))
            .collect();
        let target = adoption_targets(ServiceKind::Rpc, snapshot, specs);
        let (to_start, to_stop) = reconcile_delta(&adopted, &target);

        for name in to_stop {
            if let Some(helper) = helpers.remove(&name) {
                self.drop_helper(&name, helper).await;
            }
        }
        for name in to_start {
            match self.adopt(&name, target[&name]).await {
                Ok(helper) => {
                    helpers.insert(name, helper);
                }
                Err(err) => error!("failed to start gRPC UI for {}: {:#}", name, err),
            }
        }
    }

    async fn stop_all(&self) {
        let mut helpers = self.helpers.lock().await;
        self.enabled.store(false, Ordering::SeqCst);
        for (name, helper) in helpers.drain() {
            self.drop_helper(&name, helper).await;
        }
    }
}
