//! Pod Stress Scenario
//!
//! Two pods ping each other, then one is repeatedly deleted and recreated
//! and connectivity is checked again.

use super::{collect_teardown, ensure, ScenarioReport, StepLog};
use crate::config::PodStressConfig;
use crate::domain::ports::ExecutionEnvironment;
use crate::error::{Error, Result};
use crate::pods::{pod_identity, PodLifecycle};
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

const SCENARIO: &str = "pod-stress";

/// Delete/recreate stress over a pair of pods
pub struct PodStressScenario {
    pods: PodLifecycle,
    config: PodStressConfig,
    environment: ExecutionEnvironment,
}

/// Pod descriptor with its resolved namespace and name
struct Placed {
    pod: Pod,
    namespace: String,
    name: String,
}

impl PodStressScenario {
    pub fn new(
        pods: PodLifecycle,
        config: PodStressConfig,
        environment: ExecutionEnvironment,
    ) -> Self {
        Self {
            pods,
            config,
            environment,
        }
    }

    /// Descriptors without a namespace land in the configured one
    fn place(&self, pod: &Pod) -> Result<Placed> {
        let mut pod = pod.clone();
        if pod.metadata.namespace.is_none() {
            pod.metadata.namespace = Some(self.config.namespace.clone());
        }
        let (namespace, name) = pod_identity(&pod)?;
        Ok(Placed {
            pod,
            namespace,
            name,
        })
    }

    pub async fn run(&self, pod_a: &Pod, pod_b: &Pod) -> ScenarioReport {
        let mut steps = StepLog::new(SCENARIO);
        let placed = self
            .place(pod_a)
            .and_then(|a| Ok((a, self.place(pod_b)?)));

        let (a, b) = match placed {
            Ok(pair) => pair,
            Err(e) => return steps.finish(self.environment, Err(e), Vec::new()),
        };

        let outcome = match self.setup(&mut steps).await {
            Ok(()) => self.body(&mut steps, &a, &b).await,
            Err(e) => Err(e),
        };

        let mut teardown_errors = Vec::new();
        for pod in [&a, &b] {
            let outcome = self.pods.delete_pod(&pod.namespace, &pod.name).await;
            collect_teardown(&mut teardown_errors, &pod.name, outcome);
        }
        steps.finish(self.environment, outcome, teardown_errors)
    }

    async fn setup(&self, steps: &mut StepLog) -> Result<()> {
        let namespace = &self.config.namespace;
        ensure(
            self.pods.delete_pods_with_given_namespace(namespace).await?,
            "leftover pods removed",
            "none listed",
            "pods still listed",
        )?;
        steps.record(format!("namespace {} clean", namespace));
        Ok(())
    }

    async fn body(&self, steps: &mut StepLog, a: &Placed, b: &Placed) -> Result<()> {
        self.start(steps, a).await?;
        self.start(steps, b).await?;
        self.ping(steps, a, b).await?;

        for i in 1..=self.config.iterations {
            info!("Pod stress iteration {}/{}", i, self.config.iterations);
            self.pods.delete_pod(&a.namespace, &a.name).await?;
            ensure(
                self.pods.wait_until_gone(&a.namespace, &a.name).await?,
                &format!("{} deleted in iteration {}", a.name, i),
                "gone",
                "still listed",
            )?;
            self.start(steps, a).await?;
            steps.record(format!("iteration {} complete", i));
        }

        self.ping(steps, a, b).await
    }

    async fn start(&self, steps: &mut StepLog, pod: &Placed) -> Result<()> {
        self.pods.create_pod(&pod.pod).await?;
        ensure(
            self.pods.wait_until_running(&pod.namespace, &pod.name).await?,
            &format!("{} running", pod.name),
            "Running",
            "not running",
        )?;
        steps.record(format!("{} running", pod.name));
        Ok(())
    }

    async fn resolve_ip(&self, pod: &Placed) -> Result<String> {
        self.pods
            .find_pod_ip(&pod.namespace, &pod.name)
            .await?
            .ok_or_else(|| Error::consistency(format!("{} has an IP", pod.name), "an IP", "none"))
    }

    /// Ping B from inside A and require zero loss
    async fn ping(&self, steps: &mut StepLog, a: &Placed, b: &Placed) -> Result<()> {
        let a_ip = self.resolve_ip(a).await?;
        let b_ip = self.resolve_ip(b).await?;
        info!("{} at {}, {} at {}", a.name, a_ip, b.name, b_ip);

        ensure(
            self.pods
                .ping_and_verify_no_packet_loss(&a.namespace, &a.name, &b_ip, self.config.ping_count)
                .await?,
            &format!("ping {} -> {}", a.name, b.name),
            "0% packet loss",
            "packet loss",
        )?;
        steps.record(format!("{} reaches {} with no packet loss", a.name, b.name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::pods::{pod_descriptor, InMemoryPodApi};
    use crate::poll::PollPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn scenario(api: Arc<InMemoryPodApi>, iterations: u32) -> PodStressScenario {
        let pods = PodLifecycle::new(api, PollPolicy::new(Duration::from_millis(1), 10));
        let config = PodStressConfig {
            iterations,
            ..Default::default()
        };
        PodStressScenario::new(pods, config, ExecutionEnvironment::Simulated)
    }

    fn unplaced(name: &str) -> Pod {
        let mut pod = pod_descriptor(name, "default");
        pod.metadata.namespace = None;
        pod
    }

    #[tokio::test]
    async fn test_stress_passes_and_cleans_up() {
        let api = Arc::new(InMemoryPodApi::new());
        api.set_startup_lag(2);
        let report = scenario(api.clone(), 3)
            .run(&unplaced("test-pod0"), &unplaced("test-pod1"))
            .await;

        assert!(report.passed, "{:?}", report.error);
        assert_eq!(
            report
                .steps
                .iter()
                .filter(|s| s.step.starts_with("iteration"))
                .count(),
            3
        );
        assert_eq!(
            report
                .steps
                .iter()
                .filter(|s| s.step.contains("no packet loss"))
                .count(),
            2
        );
        // three iterations plus two teardown deletes
        assert_eq!(api.delete_calls(), 5);
        assert_eq!(api.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_setup_removes_leftovers() {
        let api = Arc::new(InMemoryPodApi::new());
        api.insert(pod_descriptor("stale", "default"));
        let report = scenario(api.clone(), 1)
            .run(&unplaced("a"), &unplaced("b"))
            .await;

        assert!(report.passed, "{:?}", report.error);
        assert_eq!(report.steps[0].step, "namespace default clean");
        assert_eq!(api.delete_calls(), 4);
    }

    #[tokio::test]
    async fn test_stuck_leftover_fails_setup() {
        let api = Arc::new(InMemoryPodApi::new());
        api.insert(pod_descriptor("stale", "default"));
        api.set_termination_lag(100);
        let report = scenario(api.clone(), 1)
            .run(&unplaced("a"), &unplaced("b"))
            .await;

        assert!(!report.passed);
        assert_eq!(report.error_category, Some(ErrorCategory::Consistency));
        assert!(report.steps.is_empty());
        // teardown deletes of never-created pods are swallowed
        assert!(report.teardown_errors.is_empty());
    }

    #[tokio::test]
    async fn test_pod_never_running_fails() {
        let api = Arc::new(InMemoryPodApi::new());
        api.set_startup_lag(100);
        let report = scenario(api, 1).run(&unplaced("a"), &unplaced("b")).await;

        assert!(!report.passed);
        assert!(report.error.unwrap().contains("a running"));
    }

    #[tokio::test]
    async fn test_descriptor_without_name_is_rejected() {
        let api = Arc::new(InMemoryPodApi::new());
        let report = scenario(api.clone(), 1).run(&Pod::default(), &unplaced("b")).await;

        assert!(!report.passed);
        assert_eq!(report.error_category, Some(ErrorCategory::Configuration));
        assert_eq!(api.delete_calls(), 0);
    }
}
