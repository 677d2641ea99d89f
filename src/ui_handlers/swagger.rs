//! Swagger UI helpers, one `swaggerapi/swagger-ui` container per running
//! REST tunnel, driven through the docker CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{adoption_targets, reconcile_delta, UiHandler};
use crate::config::{ServiceKind, ServiceSpec};
use crate::ports::{Port, PortAllocator};
use crate::status::StatusSnapshot;

const SWAGGER_BASE_PORT: Port = 8080;
const SWAGGER_IMAGE: &str = "swaggerapi/swagger-ui";
const DEFAULT_SWAGGER_PATH: &str = "configuration/swagger";
const DEFAULT_API_PATH: &str = "api";

struct Helper {
    container_id: String,
    container_name: String,
    ui_port: Port,
    service_port: Port,
}

pub struct SwaggerUiManager {
    enabled: AtomicBool,
    allocator: PortAllocator,
    helpers: Mutex<HashMap<String, Helper>>,
}

impl SwaggerUiManager {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            allocator: PortAllocator::new(),
            helpers: Mutex::new(HashMap::new()),
        }
    }

    fn container_name(service: &str) -> String {
        format!("kpf-swagger-{}", service.replace('_', "-"))
    }

    async fn adopt(&self, name: &str, service_port: Port, spec: &ServiceSpec) -> Result<Helper> {
        let ui_port = self
            .allocator
            .claim(SWAGGER_BASE_PORT)
            .context("no free port for Swagger UI")?;
        let container_name = Self::container_name(name);

        // A stale container with our name blocks the run; clear it first.
        let _ = Command::new("docker")
            .arg("stop")
            .arg(&container_name)
            .output()
            .await;

        let swagger_path = spec
            .swagger_path
            .as_deref()
            .unwrap_or(DEFAULT_SWAGGER_PATH);
        let spec_url = format!(
            "http://host.docker.internal:{}/{}",
            service_port, swagger_path
        );

        let output = Command::new("docker")
            .args(["run", "-d", "--rm", "--name"])
            .arg(&container_name)
            .args(["--add-host", "host.docker.internal:host-gateway"])
            .arg("-p")
            .arg(format!("{}:8080", ui_port))
            .arg("-e")
            .arg(format!("SWAGGER_JSON_URL={}", spec_url))
            .arg(SWAGGER_IMAGE)
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                self.allocator.release(ui_port);
                anyhow::bail!(
                    "docker run failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(err) => {
                self.allocator.release(ui_port);
                return Err(err).context("failed to run docker");
            }
        };

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let api_path = spec.api_path.as_deref().unwrap_or(DEFAULT_API_PATH);
        info!(
            "started Swagger UI for {} at http://localhost:{} (api under /{})",
            name, ui_port, api_path
        );
        Ok(Helper {
            container_id,
            container_name,
            ui_port,
            service_port,
        })
    }

    async fn drop_helper(&self, name: &str, helper: Helper) {
        let _ = Command::new("docker")
            .arg("stop")
            .arg(&helper.container_id)
            .output()
            .await;
        self.allocator.release(helper.ui_port);
        info!("stopped Swagger UI for {} ({})", name, helper.container_name);
    }

    async fn container_running(container_id: &str) -> bool {
        match Command::new("docker")
            .args(["ps", "-q", "--filter"])
            .arg(format!("id={}", container_id))
            .output()
            .await
        {
            Ok(output) => !String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(_) => false,
        }
    }
}

impl Default for SwaggerUiManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UiHandler for SwaggerUiManager {
    fn name(&self) -> &'static str {
        "swaggerui"
    }

    async fn enable(&self) -> Result<()> {
        let output = Command::new("docker")
            .arg("version")
            .output()
            .await
            .context("docker not found. Install and start Docker to use the Swagger UI")?;
        if !output.status.success() {
            anyhow::bail!("docker is installed but not running");
        }
        self.enabled.store(true, Ordering::SeqCst);
        info!("Swagger UI manager enabled");
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

        let mut dead = Vec::new();
        for (name, helper) in helpers.iter() {
            if !Self::container_running(&helper.container_id).await {
                warn!("Swagger UI container for {} died, re-adopting", name);
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
        let target = adoption_targets(ServiceKind::Rest, snapshot, specs);
        let (to_start, to_stop) = reconcile_delta(&adopted, &target);

        for name in to_stop {
            if let Some(helper) = helpers.remove(&name) {
                self.drop_helper(&name, helper).await;
            }
        }
        for name in to_start {
            let Some(spec) = specs.get(&name) else {
                continue;
            };
            match self.adopt(&name, target[&name], spec).await {
                Ok(helper) => {
                    helpers.insert(name, helper);
                }
                Err(err) => error!("failed to start Swagger UI for {}: {:#}", name, err),
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
