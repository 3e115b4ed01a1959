//! Access to the Kubernetes cluster the benchmark runs against.
//!
//! The benchmark only needs a handful of verbs on a handful of kinds, so the
//! seam is narrow: one [`ResourceClient`] per kind (and namespace, for
//! namespaced kinds), and a [`LogSource`] for container logs. [`KubeCluster`]
//! implements it on top of `kube`.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::api::storage::v1::{StorageClass, VolumeAttachment};
use utils::wait::ObjectGetter;

use crate::crd::{
    PausableScyllaDBDatacenter, ScyllaDBDatacenter, ScyllaDBDatacenterClaim,
    ScyllaDBDatacenterPool,
};

#[cfg(test)]
pub(crate) mod fake;
mod k8s;

pub use k8s::KubeCluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePropagation {
    #[default]
    Background,
    /// The object is only gone once all of its dependents are.
    Foreground,
}

/// Create, read, patch and delete objects of one kind.
#[async_trait]
pub trait ResourceClient<K>: ObjectGetter<K> {
    /// Returns the object as created by the API server, with its generated
    /// name if the object asked for one.
    async fn create(&self, obj: &K) -> anyhow::Result<K>;

    /// Applies a JSON merge patch.
    async fn patch(&self, name: &str, patch: &serde_json::Value) -> anyhow::Result<K>;

    /// Deleting an object that doesn't exist is not an error. With `uid`, only
    /// the object with that UID is deleted.
    async fn delete(
        &self,
        name: &str,
        uid: Option<&str>,
        propagation: DeletePropagation,
    ) -> anyhow::Result<()>;
}

/// Reads a required object, failing if it doesn't exist.
pub async fn get_required<K>(client: &dyn ResourceClient<K>, name: &str) -> anyhow::Result<K>
where
    K: Send + Sync,
{
    client
        .get_object(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("{} {name:?} not found", client.kind()))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Logs of `container` in `pod`, every line prefixed with the RFC 3339
    /// timestamp of when it was emitted.
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> anyhow::Result<String>;
}

pub type Client<K> = Arc<dyn ResourceClient<K>>;

/// Everything the benchmark touches.
pub trait Cluster: Send + Sync {
    fn namespaces(&self) -> Client<Namespace>;
    fn storage_classes(&self) -> Client<StorageClass>;
    fn persistent_volumes(&self) -> Client<PersistentVolume>;
    fn volume_attachments(&self) -> Client<VolumeAttachment>;

    fn pods(&self, namespace: &str) -> Client<Pod>;
    fn persistent_volume_claims(&self, namespace: &str) -> Client<PersistentVolumeClaim>;
    fn secrets(&self, namespace: &str) -> Client<Secret>;
    fn service_accounts(&self, namespace: &str) -> Client<ServiceAccount>;
    fn roles(&self, namespace: &str) -> Client<Role>;
    fn role_bindings(&self, namespace: &str) -> Client<RoleBinding>;
    fn datacenters(&self, namespace: &str) -> Client<ScyllaDBDatacenter>;
    fn datacenter_pools(&self, namespace: &str) -> Client<ScyllaDBDatacenterPool>;
    fn pausable_datacenters(&self, namespace: &str) -> Client<PausableScyllaDBDatacenter>;
    fn datacenter_claims(&self, namespace: &str) -> Client<ScyllaDBDatacenterClaim>;

    fn logs(&self) -> Arc<dyn LogSource>;
}
