//! Pod side effects of a replica set pass
//!
//! Production code uses `KubePodControl`, which talks to the API server.
//! Tests use `MockPodControl`, which records the calls for assertions.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::debug;

/// Pod operations executed for a replica set plan
#[async_trait]
pub trait PodControl: Send + Sync {
    /// Create a pod; returns the name the API server assigned
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<String, kube::Error>;

    /// Delete a pod; a pod that is already gone counts as deleted
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Set a label, or remove it when `value` is None
    async fn set_pod_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), kube::Error>;
}

pub struct KubePodControl {
    client: kube::Client,
}

impl KubePodControl {
    pub fn new(client: kube::Client) -> Self {
        KubePodControl { client }
    }
}

#[async_trait]
impl PodControl for KubePodControl {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<String, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let created = api.create(&PostParams::default(), pod).await?;
        let name = created.metadata.name.unwrap_or_default();
        debug!(namespace, pod = %name, "Created pod");
        Ok(name)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(namespace, pod = name, "Deleted pod");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_pod_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "labels": { key: value } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Call recorded by `MockPodControl`
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum PodAction {
    /// Node the created pod is pinned to
    Create(String),
    Delete(String),
    Label {
        pod: String,
        key: String,
        value: Option<String>,
    },
}

#[cfg(test)]
#[derive(Default)]
pub struct MockPodControl {
    actions: std::sync::Mutex<Vec<PodAction>>,
    created: std::sync::Mutex<Vec<Pod>>,
    fail_creates: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockPodControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every create call fail with a 500
    pub fn failing_creates() -> Self {
        let mock = Self::default();
        mock.fail_creates
            .store(true, std::sync::atomic::Ordering::SeqCst);
        mock
    }

    pub fn actions(&self) -> Vec<PodAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn created_pods(&self) -> Vec<Pod> {
        self.created.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl PodControl for MockPodControl {
    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<String, kube::Error> {
        if self.fail_creates.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "quota exceeded".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }));
        }
        let node = crate::controller::pod::pod_node_name(pod).unwrap_or_default();
        self.actions.lock().unwrap().push(PodAction::Create(node.clone()));
        self.created.lock().unwrap().push(pod.clone());
        Ok(format!("{}{}", pod.metadata.generate_name.as_deref().unwrap_or_default(), node))
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.actions
            .lock()
            .unwrap()
            .push(PodAction::Delete(name.to_string()));
        Ok(())
    }

    async fn set_pod_label(
        &self,
        _namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), kube::Error> {
        self.actions.lock().unwrap().push(PodAction::Label {
            pod: name.to_string(),
            key: key.to_string(),
            value: value.map(str::to_string),
        });
        Ok(())
    }
}
