//! In-memory [`PodApi`] for the simulated environment and tests

use crate::domain::ports::PodApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::debug;

const PENDING: &str = "Pending";
const RUNNING: &str = "Running";

#[derive(Debug, Clone)]
struct Entry {
    pod: Pod,
    ip: String,
    /// List calls left before the pod reports Running
    starting: u32,
    /// List calls left before a deleted pod disappears; `None` while live
    terminating: Option<u32>,
}

/// Pods stored in a concurrent map keyed by `namespace/name`
#[derive(Debug, Default)]
pub struct InMemoryPodApi {
    pods: DashMap<String, Entry>,
    next_ip: AtomicU32,
    startup_lag: AtomicU32,
    termination_lag: AtomicU32,
    deletes: AtomicUsize,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl InMemoryPodApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pods stay Pending for this many listings after creation
    pub fn set_startup_lag(&self, listings: u32) {
        self.startup_lag.store(listings, Ordering::SeqCst);
    }

    /// Deleted pods stay listed for this many listings
    pub fn set_termination_lag(&self, listings: u32) {
        self.termination_lag.store(listings, Ordering::SeqCst);
    }

    /// Place a pod directly, already running
    pub fn insert(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| super::DEFAULT_NAMESPACE.to_string());
        self.store(&namespace, pod, &name, 0);
    }

    /// Pods currently stored, terminating ones included
    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Delete calls received so far
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn store(&self, namespace: &str, mut pod: Pod, name: &str, starting: u32) {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst) + 1;
        let ip = format!("10.244.0.{}", n);
        pod.metadata.namespace = Some(namespace.to_string());
        self.pods.insert(
            key(namespace, name),
            Entry {
                pod,
                ip,
                starting,
                terminating: None,
            },
        );
    }

    fn snapshot(entry: &Entry) -> Pod {
        let mut pod = entry.pod.clone();
        let running = entry.starting == 0;
        pod.status = Some(PodStatus {
            phase: Some(if running { RUNNING } else { PENDING }.to_string()),
            pod_ip: running.then(|| entry.ip.clone()),
            ..Default::default()
        });
        pod
    }

    fn ping(&self, command: &[String]) -> String {
        let dest = command.last().cloned().unwrap_or_default();
        let count = command
            .iter()
            .position(|arg| arg == "-c")
            .and_then(|i| command.get(i + 1))
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(1);
        let reachable = self
            .pods
            .iter()
            .any(|e| e.starting == 0 && e.terminating.is_none() && e.ip == dest);
        let received = if reachable { count } else { 0 };
        let loss = if reachable { 0 } else { 100 };
        format!(
            "--- {} ping statistics ---\n{} packets transmitted, {} received, {}% packet loss\n",
            dest, count, received, loss
        )
    }
}

#[async_trait]
impl PodApi for InMemoryPodApi {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Configuration("pod has no name".into()))?;
        if self.pods.contains_key(&key(namespace, &name)) {
            return Err(Error::Internal(format!(
                "pod {}/{} already exists",
                namespace, name
            )));
        }
        self.store(
            namespace,
            pod.clone(),
            &name,
            self.startup_lag.load(Ordering::SeqCst),
        );
        debug!("Stored pod {}/{}", namespace, name);
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let lag = self.termination_lag.load(Ordering::SeqCst);
        let k = key(namespace, name);

        let mut entry = self.pods.get_mut(&k).ok_or_else(|| Error::ResourceNotFound {
            kind: "Pod".into(),
            name: name.to_string(),
        })?;
        if lag == 0 {
            drop(entry);
            self.pods.remove(&k);
        } else if entry.terminating.is_none() {
            entry.terminating = Some(lag);
        }
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let mut listed = Vec::new();
        let mut expired = Vec::new();

        for mut entry in self.pods.iter_mut() {
            listed.push(Self::snapshot(&entry));
            entry.starting = entry.starting.saturating_sub(1);
            if let Some(left) = entry.terminating {
                if left <= 1 {
                    expired.push(entry.key().clone());
                } else {
                    entry.terminating = Some(left - 1);
                }
            }
        }
        for k in expired {
            self.pods.remove(&k);
        }
        Ok(listed)
    }

    async fn exec(&self, namespace: &str, name: &str, command: &[String]) -> Result<String> {
        if !self.pods.contains_key(&key(namespace, name)) {
            return Err(Error::ResourceNotFound {
                kind: "Pod".into(),
                name: name.to_string(),
            });
        }
        match command.first().map(String::as_str) {
            Some("ping") => Ok(self.ping(command)),
            _ => Ok(String::new()),
        }
    }
}
