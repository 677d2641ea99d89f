//! The kubectl boundary: tunnel spawning and context discovery.
//!
//! Everything the tool knows about the cluster comes through the external
//! CLI; nothing here speaks to the apiserver directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ServiceSpec;
use crate::process::{ChildHandle, ProcessHandle, SpawnError};
use crate::ports::Port;

/// Reads the identifier of the cluster context kubectl currently points at.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn current(&self) -> Result<String>;
}

pub struct KubectlProbe;

#[async_trait]
impl ClusterProbe for KubectlProbe {
    async fn current(&self) -> Result<String> {
        let output = Command::new("kubectl")
            .args(["config", "current-context"])
            .output()
            .await
            .context("failed to run `kubectl config current-context`")?;

        if !output.status.success() {
            anyhow::bail!(
                "`kubectl config current-context` failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_context(&output.stdout))
    }
}

fn parse_context(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_string()
}

/// Launches the tunnel process for one service. The seam the supervisor
/// tests mock out.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn spawn(
        &self,
        name: &str,
        spec: &ServiceSpec,
        local_port: Port,
    ) -> Result<Box<dyn ChildHandle>, SpawnError>;
}

pub struct KubectlForwarder;

impl KubectlForwarder {
    fn args(spec: &ServiceSpec, local_port: Port) -> Vec<String> {
        vec![
            "port-forward".to_string(),
            "-n".to_string(),
            spec.namespace.clone(),
            spec.target.clone(),
            format!("{}:{}", local_port, spec.target_port),
        ]
    }
}

#[async_trait]
impl Forwarder for KubectlForwarder {
    async fn spawn(
        &self,
        name: &str,
        spec: &ServiceSpec,
        local_port: Port,
    ) -> Result<Box<dyn ChildHandle>, SpawnError> {
        let mut cmd = Command::new("kubectl");
        cmd.args(Self::args(spec, local_port));
        let label = format!("kubectl port-forward [{}]", name);
        let handle = ProcessHandle::spawn(cmd, &label)?;
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceKind;

    #[test]
    fn context_output_is_trimmed() {
        assert_eq!(parse_context(b"minikube\n"), "minikube");
        assert_eq!(parse_context(b"prod-eu-1"), "prod-eu-1");
    }

    #[test]
    fn port_forward_args_match_kubectl_shape() {
        let spec = ServiceSpec {
            target: "service/user-api".to_string(),
            target_port: 8080,
            local_port: 9080,
            namespace: "default".to_string(),
            kind: ServiceKind::Rest,
            swagger_path: None,
            api_path: None,
        };

        assert_eq!(
            KubectlForwarder::args(&spec, 9085),
            vec!["port-forward", "-n", "default", "service/user-api", "9085:8080"]
        );
    }
}
