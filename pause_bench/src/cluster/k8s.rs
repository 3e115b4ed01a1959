use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolume, PersistentVolumeClaim, Pod, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::api::storage::v1::{StorageClass, VolumeAttachment};
use kube::api::{DeleteParams, LogParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use utils::wait::ObjectGetter;

use super::{Cluster, DeletePropagation, LogSource, ResourceClient};
use crate::crd::{
    PausableScyllaDBDatacenter, ScyllaDBDatacenter, ScyllaDBDatacenterClaim,
    ScyllaDBDatacenterPool,
};

const FIELD_MANAGER: &str = "pausing-bench";

/// The cluster pointed at by the ambient kubeconfig or in-cluster config.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("create Kubernetes client")?;
        Ok(Self { client })
    }

    fn cluster_scoped<K>(&self) -> Arc<dyn ResourceClient<K>>
    where
        K: Resource<DynamicType = ()> + KubeObject,
    {
        Arc::new(KubeResources::new(Api::<K>::all(self.client.clone())))
    }

    fn namespaced<K>(&self, namespace: &str) -> Arc<dyn ResourceClient<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + KubeObject,
    {
        Arc::new(KubeResources::new(Api::<K>::namespaced(
            self.client.clone(),
            namespace,
        )))
    }
}

/// What `Api<K>` needs to read and write `K`.
pub trait KubeObject:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> KubeObject for K where K: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

struct KubeResources<K> {
    api: Api<K>,
    kind: String,
}

impl<K> KubeResources<K>
where
    K: Resource<DynamicType = ()> + KubeObject,
{
    fn new(api: Api<K>) -> Self {
        Self {
            api,
            kind: K::kind(&()).into_owned(),
        }
    }
}

#[async_trait]
impl<K> ObjectGetter<K> for KubeResources<K>
where
    K: Resource<DynamicType = ()> + KubeObject,
{
    async fn get_object(&self, name: &str) -> anyhow::Result<Option<K>> {
        self.api
            .get_opt(name)
            .await
            .with_context(|| format!("get {} {name:?}", self.kind))
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResources<K>
where
    K: Resource<DynamicType = ()> + KubeObject,
{
    async fn create(&self, obj: &K) -> anyhow::Result<K> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api
            .create(&pp, obj)
            .await
            .with_context(|| format!("create {}", self.kind))
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> anyhow::Result<K> {
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api
            .patch(name, &pp, &Patch::Merge(patch))
            .await
            .with_context(|| format!("patch {} {name:?}", self.kind))
    }

    async fn delete(
        &self,
        name: &str,
        uid: Option<&str>,
        propagation: DeletePropagation,
    ) -> anyhow::Result<()> {
        let dp = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            propagation_policy: Some(match propagation {
                DeletePropagation::Background => PropagationPolicy::Background,
                DeletePropagation::Foreground => PropagationPolicy::Foreground,
            }),
            ..Default::default()
        };
        match self.api.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {} {name:?}", self.kind)),
        }
    }
}

struct KubeLogs {
    client: Client,
}

#[async_trait]
impl LogSource for KubeLogs {
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> anyhow::Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            container: Some(container.to_string()),
            timestamps: true,
            ..Default::default()
        };
        pods.logs(pod, &lp)
            .await
            .with_context(|| format!("get logs of container {container:?} in pod {namespace}/{pod}"))
    }
}

impl Cluster for KubeCluster {
    fn namespaces(&self) -> Arc<dyn ResourceClient<Namespace>> {
        self.cluster_scoped()
    }

    fn storage_classes(&self) -> Arc<dyn ResourceClient<StorageClass>> {
        self.cluster_scoped()
    }

    fn persistent_volumes(&self) -> Arc<dyn ResourceClient<PersistentVolume>> {
        self.cluster_scoped()
    }

    fn volume_attachments(&self) -> Arc<dyn ResourceClient<VolumeAttachment>> {
        self.cluster_scoped()
    }

    fn pods(&self, namespace: &str) -> Arc<dyn ResourceClient<Pod>> {
        self.namespaced(namespace)
    }

    fn persistent_volume_claims(&self, namespace: &str) -> Arc<dyn ResourceClient<PersistentVolumeClaim>> {
        self.namespaced(namespace)
    }

    fn secrets(&self, namespace: &str) -> Arc<dyn ResourceClient<Secret>> {
        self.namespaced(namespace)
    }

    fn service_accounts(&self, namespace: &str) -> Arc<dyn ResourceClient<ServiceAccount>> {
        self.namespaced(namespace)
    }

    fn roles(&self, namespace: &str) -> Arc<dyn ResourceClient<Role>> {
        self.namespaced(namespace)
    }

    fn role_bindings(&self, namespace: &str) -> Arc<dyn ResourceClient<RoleBinding>> {
        self.namespaced(namespace)
    }

    fn datacenters(&self, namespace: &str) -> Arc<dyn ResourceClient<ScyllaDBDatacenter>> {
        self.namespaced(namespace)
    }

    fn datacenter_pools(&self, namespace: &str) -> Arc<dyn ResourceClient<ScyllaDBDatacenterPool>> {
        self.namespaced(namespace)
    }

    fn pausable_datacenters(
        &self,
        namespace: &str,
    ) -> Arc<dyn ResourceClient<PausableScyllaDBDatacenter>> {
        self.namespaced(namespace)
    }

    fn datacenter_claims(&self, namespace: &str) -> Arc<dyn ResourceClient<ScyllaDBDatacenterClaim>> {
        self.namespaced(namespace)
    }

    fn logs(&self) -> Arc<dyn LogSource> {
        Arc::new(KubeLogs {
            client: self.client.clone(),
        })
    }
}
