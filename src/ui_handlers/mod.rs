//! Optional inspection UIs slaved to running tunnels.
//!
//! Each manager adopts helpers for the service kind it understands and
//! reconciles them against every status snapshot: compute the target set,
//! diff against what is adopted, tear down leavers, then adopt joiners.
//! A helper's death never touches its parent service; the next reconcile
//! simply re-adopts it.

mod grpc;
mod swagger;

pub use grpc::GrpcUiManager;
pub use swagger::SwaggerUiManager;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::config::{ServiceKind, ServiceSpec};
use crate::ports::Port;
use crate::status::{Phase, StatusSnapshot};

#[async_trait]
pub trait UiHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verifies the external helper tooling is present; a manager that
    /// fails to enable stays disabled and inert.
    async fn enable(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;

    /// Idempotent and order-independent: running it twice on the same
    /// snapshot is a no-op.
    async fn reconcile(&self, snapshot: &StatusSnapshot, specs: &HashMap<String, ServiceSpec>);

    async fn stop_all(&self);
}

/// Disabled stand-in so callers never branch on "is there a manager".
pub struct NoopUiManager {
    name: &'static str,
}

impl NoopUiManager {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl UiHandler for NoopUiManager {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn enable(&self) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn reconcile(&self, _snapshot: &StatusSnapshot, _specs: &HashMap<String, ServiceSpec>) {}

    async fn stop_all(&self) {}
}

/// Services a manager should be running a helper for right now: matching
/// kind and currently `Running`, mapped to their effective local port.
fn adoption_targets(
    kind: ServiceKind,
    snapshot: &StatusSnapshot,
    specs: &HashMap<String, ServiceSpec>,
) -> HashMap<String, Port> {
    snapshot
        .services
        .iter()
        .filter(|(name, status)| {
            status.phase == Phase::Running
                && specs.get(*name).map(|s| s.kind) == Some(kind)
        })
        .map(|(name, status)| (name.clone(), status.local_port))
        .collect()
}

/// The reconcile delta. An adopted helper leaves when its parent left the
/// target set or moved to a different local port.
fn reconcile_delta(
    adopted: &HashMap<String, Port>,
    target: &HashMap<String, Port>,
) -> (Vec<String>, Vec<String>) {
    let mut to_stop: Vec<String> = adopted
        .iter()
        .filter(|(name, port)| target.get(name.as_str()) != Some(*port))
        .map(|(name, _)| name.clone())
        .collect();
    let mut to_start: Vec<String> = target
        .keys()
        .filter(|name| !adopted.contains_key(name.as_str()) || to_stop.contains(*name))
        .cloned()
        .collect();
    to_stop.sort();
    to_start.sort();
    (to_start, to_stop)
}
