//! Pod Lifecycle Utility
//!
//! Create, delete and query pods, resolve pod IPs, run commands inside pods
//! and verify pod-to-pod connectivity. Mutations are followed by bounded
//! polling rather than fixed sleeps.

pub mod cluster;
pub mod memory;

pub use cluster::*;
pub use memory::*;

use crate::domain::ports::PodApiRef;
use crate::error::{Error, Result};
use crate::poll::{poll_until, PollPolicy};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use std::path::Path;
use tracing::{error, info, warn};

/// Namespace used when a descriptor does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

const RUNNING_PHASE: &str = "Running";

/// Load a rendered pod descriptor (YAML or JSON)
pub fn load_pod_descriptor(path: impl AsRef<Path>) -> Result<Pod> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let pod: Pod = serde_yaml::from_str(&raw)?;
    pod_identity(&pod)?;
    Ok(pod)
}

/// Minimal descriptor carrying only name and namespace
pub fn pod_descriptor(name: &str, namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// `(namespace, name)` of a descriptor
pub fn pod_identity(pod: &Pod) -> Result<(String, String)> {
    let name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Configuration("pod descriptor has no metadata.name".into()))?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    Ok((namespace, name))
}

/// Extract the loss percentage from `ping` summary output
pub fn parse_packet_loss(output: &str) -> Option<f64> {
    output
        .split(|c| c == ',' || c == '\n')
        .find(|segment| segment.contains("packet loss"))
        .and_then(|segment| segment.split_whitespace().next())
        .and_then(|token| token.trim_end_matches('%').parse().ok())
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == RUNNING_PHASE)
        .unwrap_or(false)
}

fn matches(pod: &Pod, namespace: &str, name: &str) -> bool {
    pod.metadata.name.as_deref() == Some(name)
        && pod.metadata.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE) == namespace
}

/// Pod operations over a [`PodApi`](crate::domain::ports::PodApi)
#[derive(Clone)]
pub struct PodLifecycle {
    api: PodApiRef,
    settle: PollPolicy,
}

impl PodLifecycle {
    pub fn new(api: PodApiRef, settle: PollPolicy) -> Self {
        Self { api, settle }
    }

    pub async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let (namespace, name) = pod_identity(pod)?;
        info!("Creating pod {}/{}", namespace, name);
        self.api.create_pod(&namespace, pod).await
    }

    /// Delete a pod; an absent pod is not an error
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        info!("Deleting pod {}/{}", namespace, name);
        match self.api.delete_pod(namespace, name).await {
            Err(e) if e.is_not_found() => {
                info!("Pod {}/{} already gone", namespace, name);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn find_pods_with_namespace(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .api
            .list_pods()
            .await?
            .into_iter()
            .filter(|p| p.metadata.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE) == namespace)
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    /// Delete every pod in the namespace and confirm they are gone.
    /// An empty namespace succeeds without issuing any delete.
    pub async fn delete_pods_with_given_namespace(&self, namespace: &str) -> Result<bool> {
        let names = self.find_pods_with_namespace(namespace).await?;
        if names.is_empty() {
            info!("No pods found with namespace = {}", namespace);
            return Ok(true);
        }

        for name in &names {
            self.delete_pod(namespace, name).await?;
        }

        let mut all_gone = true;
        for name in &names {
            if !self.wait_until_gone(namespace, name).await? {
                error!("Failed to delete {}/{}", namespace, name);
                all_gone = false;
            }
        }
        Ok(all_gone)
    }

    pub async fn execute_command(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> Result<String> {
        self.api.exec(namespace, name, command).await
    }

    pub async fn find_pod_ip(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .api
            .list_pods()
            .await?
            .into_iter()
            .find(|p| matches(p, namespace, name))
            .and_then(|p| p.status.and_then(|s| s.pod_ip)))
    }

    pub async fn verify_pod_running(&self, namespace: &str, name: &str) -> Result<bool> {
        let running = self
            .api
            .list_pods()
            .await?
            .iter()
            .any(|p| matches(p, namespace, name) && is_running(p));
        if running {
            info!("Pod {}/{} running", namespace, name);
        } else {
            info!("Pod {}/{} not running", namespace, name);
        }
        Ok(running)
    }

    /// Poll until the pod runs; `false` when it never does
    pub async fn wait_until_running(&self, namespace: &str, name: &str) -> Result<bool> {
        let condition = format!("pod {}/{} running", namespace, name);
        let outcome = poll_until(&self.settle, &condition, || async move {
            Ok(self.verify_pod_running(namespace, name).await?.then_some(()))
        })
        .await;
        settled(outcome)
    }

    /// Poll until the pod is no longer listed; `false` when it lingers
    pub async fn wait_until_gone(&self, namespace: &str, name: &str) -> Result<bool> {
        let condition = format!("pod {}/{} gone", namespace, name);
        let outcome = poll_until(&self.settle, &condition, || async move {
            let listed = self
                .api
                .list_pods()
                .await?
                .iter()
                .any(|p| matches(p, namespace, name));
            Ok((!listed).then_some(()))
        })
        .await;
        settled(outcome)
    }

    /// Ping `dest_ip` from inside a pod and require 0% packet loss
    pub async fn ping_and_verify_no_packet_loss(
        &self,
        namespace: &str,
        name: &str,
        dest_ip: &str,
        count: u32,
    ) -> Result<bool> {
        let command = vec![
            "ping".to_string(),
            "-c".to_string(),
            count.to_string(),
            dest_ip.to_string(),
        ];

        let output = match self.execute_command(namespace, name, &command).await {
            Ok(output) => output,
            Err(Error::Command { stderr, .. }) => {
                warn!("ping from {} to {} failed: {}", name, dest_ip, stderr);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match parse_packet_loss(&output) {
            Some(loss) => {
                info!("{}% packet loss from {} to {}", loss, name, dest_ip);
                Ok(loss == 0.0)
            }
            None => {
                warn!("No packet loss summary in ping output from {}", name);
                Ok(false)
            }
        }
    }
}

fn settled(outcome: Result<()>) -> Result<bool> {
    match outcome {
        Ok(()) => Ok(true),
        Err(Error::PollTimeout { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    fn lifecycle(api: Arc<InMemoryPodApi>) -> PodLifecycle {
        PodLifecycle::new(api, PollPolicy::new(Duration::from_millis(1), 10))
    }

    #[test]
    fn test_parse_packet_loss() {
        let ok = "--- 10.244.0.7 ping statistics ---\n\
                  10 packets transmitted, 10 received, 0% packet loss, time 9012ms\n\
                  rtt min/avg/max/mdev = 0.041/0.060/0.092/0.015 ms\n";
        assert_eq!(parse_packet_loss(ok), Some(0.0));

        let lossy = "10 packets transmitted, 7 received, 30% packet loss, time 9012ms";
        assert_eq!(parse_packet_loss(lossy), Some(30.0));

        let busybox = "3 packets transmitted, 3 packets received, 0% packet loss";
        assert_eq!(parse_packet_loss(busybox), Some(0.0));

        assert_eq!(parse_packet_loss("ping: bad address"), None);
    }

    #[tokio::test]
    async fn test_delete_empty_namespace_issues_no_deletes() {
        let api = Arc::new(InMemoryPodApi::new());
        api.insert(pod_descriptor("other", "kube-system"));
        let pods = lifecycle(api.clone());

        assert!(pods.delete_pods_with_given_namespace("default").await.unwrap());
        assert_eq!(api.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_namespace_removes_every_pod() {
        let api = Arc::new(InMemoryPodApi::new());
        for name in ["a", "b", "c"] {
            api.insert(pod_descriptor(name, "default"));
        }
        api.insert(pod_descriptor("keep", "kube-system"));
        let pods = lifecycle(api.clone());

        assert!(pods.delete_pods_with_given_namespace("default").await.unwrap());
        assert_eq!(api.delete_calls(), 3);
        assert!(pods.find_pods_with_namespace("default").await.unwrap().is_empty());
        assert_eq!(pods.find_pods_with_namespace("kube-system").await.unwrap(), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_delete_namespace_reports_stuck_pod() {
        let api = Arc::new(InMemoryPodApi::new());
        api.insert(pod_descriptor("stuck", "default"));
        api.set_termination_lag(100);
        let pods = lifecycle(api);

        assert!(!pods.delete_pods_with_given_namespace("default").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_waits_for_running() {
        let api = Arc::new(InMemoryPodApi::new());
        api.set_startup_lag(3);
        let pods = lifecycle(api);

        pods.create_pod(&pod_descriptor("web", "default")).await.unwrap();
        assert!(!pods.verify_pod_running("default", "web").await.unwrap());
        assert!(pods.wait_until_running("default", "web").await.unwrap());
        assert!(pods.find_pod_ip("default", "web").await.unwrap().is_some());
        assert_eq!(pods.find_pod_ip("default", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_absent_pod_is_ok() {
        let pods = lifecycle(Arc::new(InMemoryPodApi::new()));
        pods.delete_pod("default", "ghost").await.unwrap();
        assert!(pods.wait_until_gone("default", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_between_pods() {
        let api = Arc::new(InMemoryPodApi::new());
        let pods = lifecycle(api);
        pods.create_pod(&pod_descriptor("a", "default")).await.unwrap();
        pods.create_pod(&pod_descriptor("b", "default")).await.unwrap();

        let ip = pods.find_pod_ip("default", "b").await.unwrap().unwrap();
        assert!(pods
            .ping_and_verify_no_packet_loss("default", "a", &ip, 10)
            .await
            .unwrap());
        assert!(!pods
            .ping_and_verify_no_packet_loss("default", "a", "192.0.2.1", 10)
            .await
            .unwrap());
    }

    #[test]
    fn test_load_descriptor() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: test-pod0\nspec:\n  containers:\n  - name: c\n    image: busybox\n"
        )
        .unwrap();

        let pod = load_pod_descriptor(file.path()).unwrap();
        assert_eq!(
            pod_identity(&pod).unwrap(),
            ("default".to_string(), "test-pod0".to_string())
        );
    }
}
