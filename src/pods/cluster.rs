//! Kubernetes-backed [`PodApi`]

use crate::domain::ports::PodApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

const EXEC_SUCCESS: &str = "Success";

/// Pod API over a live cluster client
#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
    exec_timeout: Duration,
}

impl KubePodApi {
    pub fn new(client: Client, exec_timeout: Duration) -> Self {
        Self {
            client,
            exec_timeout,
        }
    }

    /// Client from the ambient kubeconfig or in-cluster environment
    pub async fn try_default(exec_timeout: Duration) -> Result<Self> {
        Ok(Self::new(Client::try_default().await?, exec_timeout))
    }

    fn namespaced(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn not_found(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: "Pod".into(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut text = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut text).await?;
    }
    Ok(text)
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        self.namespaced(namespace)
            .create(&PostParams::default(), pod)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| not_found(e, name))?;
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        Ok(pods.list(&ListParams::default()).await?.items)
    }

    async fn exec(&self, namespace: &str, name: &str, command: &[String]) -> Result<String> {
        let endpoint = format!("pod/{}/{}", namespace, name);
        debug!("exec on {}: {:?}", endpoint, command);

        let run = async {
            let mut process = self
                .namespaced(namespace)
                .exec(name, command.to_vec(), &AttachParams::default())
                .await
                .map_err(|e| not_found(e, name))?;

            let out = process.stdout();
            let err = process.stderr();
            let (stdout, stderr) = tokio::join!(read_all(out), read_all(err));
            let (stdout, stderr) = (stdout?, stderr?);

            let status = match process.take_status() {
                Some(status) => status.await,
                None => None,
            };
            process.join().await.map_err(|e| Error::Transport {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

            match status {
                Some(s) if s.status.as_deref() != Some(EXEC_SUCCESS) => Err(Error::Command {
                    endpoint: endpoint.clone(),
                    command: command.join(" "),
                    status: 1,
                    stderr: if stderr.is_empty() {
                        s.message.unwrap_or_default()
                    } else {
                        stderr
                    },
                }),
                _ => Ok(stdout),
            }
        };

        tokio::time::timeout(self.exec_timeout, run)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("exec on {}", endpoint),
                timeout: self.exec_timeout,
            })?
    }
}
