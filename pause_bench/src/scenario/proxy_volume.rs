//! The proxy volume suite: how long a pod takes to become ready once its
//! storage is there.
//!
//! `pod_baseline` creates a pod on an already provisioned backend volume and
//! measures from creating it until it's ready. `busywait` and `sidecar` start
//! the pod on an empty proxy volume first; once it runs, they annotate the
//! proxy PVC with the backend PVC and measure until the pod is ready. The
//! sidecar variant has the proxy CSI driver's `wait` container tell the
//! workload when the backend volume is mounted, instead of the workload
//! retrying its first write.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, bail};
use k8s_openapi::api::core::v1::{NodeSelector, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use utils::wait::{ConditionFn, WaitForStateOptions, wait_for_object_state};

use super::{CreatedObjects, Orchestrator, Phase, Scenario, ScenarioRun, bound_volume_name};
use crate::cluster::{Cluster, ResourceClient, get_required};
use crate::cql::SessionFactory;
use crate::manifests::{self, READINESS_POD_NAME, VolumeBindingMode};
use crate::naming::DELAYED_STORAGE_BACKEND_PVC_REF_ANNOTATION;
use crate::predicates;

/// Limit on provisioning the backend volume.
const BACKEND_BINDING_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Limit on a pod starting on its empty proxy volume.
const PREWARM_TIMEOUT: Duration = Duration::from_secs(60);

impl<C, S> Orchestrator<C, S>
where
    C: Cluster,
    S: SessionFactory,
{
    pub(super) async fn run_proxy_volume(
        &self,
        run: &mut ScenarioRun,
        created: &mut CreatedObjects,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Duration> {
        let scenario = run.scenario;
        if !matches!(
            scenario,
            Scenario::PodBaseline | Scenario::Busywait | Scenario::Sidecar
        ) {
            bail!("scenario {scenario} does not run pods on proxy volumes");
        }

        run.pursue(Phase::Provisioning);
        let namespace = self.create_namespace(created).await?;
        let storage_class = self
            .create_storage_class(VolumeBindingMode::Immediate, created)
            .await?;
        if scenario == Scenario::Sidecar {
            self.create_pod_reader(&namespace).await?;
        }
        let pvcs = self.cluster.persistent_volume_claims(&namespace);
        let backend_pvc = pvcs
            .create(&manifests::backend_volume_claim(&storage_class))
            .await?
            .name_any();

        run.pursue(Phase::BackendVolumeBound);
        let bound = self
            .wait_state_within(
                &*pvcs,
                &backend_pvc,
                BACKEND_BINDING_TIMEOUT,
                cancel,
                &predicates::is_pvc_bound,
            )
            .await?;
        let node_selector = self.volume_node_selector(&bound).await?;

        let pods = self.cluster.pods(&namespace);
        let start = if scenario == Scenario::PodBaseline {
            let pod = manifests::readiness_pod(
                &self.config,
                &backend_pvc,
                manifests::TOUCH_SCRIPT,
                node_selector,
            );
            run.pursue(Phase::PodReady);
            let start = Instant::now();
            pods.create(&pod).await?;
            start
        } else {
            let proxy_pvc = pvcs
                .create(&manifests::proxy_volume_claim(
                    &self.config.proxy_storage_class_name,
                ))
                .await?
                .name_any();
            let pod = if scenario == Scenario::Sidecar {
                manifests::with_mount_signal_sidecar(
                    manifests::readiness_pod(
                        &self.config,
                        &proxy_pvc,
                        manifests::SIGNAL_WAIT_SCRIPT,
                        node_selector,
                    ),
                    &self.config,
                    manifests::POD_READER_NAME,
                )
            } else {
                manifests::readiness_pod(
                    &self.config,
                    &proxy_pvc,
                    manifests::BUSYWAIT_SCRIPT,
                    node_selector,
                )
            };

            run.pursue(Phase::PodRunning);
            pods.create(&pod).await?;
            self.wait_state_within(
                &*pods,
                READINESS_POD_NAME,
                PREWARM_TIMEOUT,
                cancel,
                &predicates::is_pod_running,
            )
            .await?;

            run.pursue(Phase::PodReady);
            let start = Instant::now();
            let mut annotations = serde_json::Map::new();
            annotations.insert(
                DELAYED_STORAGE_BACKEND_PVC_REF_ANNOTATION.to_string(),
                backend_pvc.clone().into(),
            );
            pvcs.patch(&proxy_pvc, &json!({"metadata": {"annotations": annotations}}))
                .await?;
            start
        };

        let pod = self
            .wait_state(&*pods, READINESS_POD_NAME, cancel, &predicates::is_pod_ready)
            .await?;
        let elapsed = start.elapsed();
        info!(
            elapsed = %humantime::format_duration(elapsed),
            ready_since = ?ready_since(&pod),
            "pod ready"
        );
        Ok(elapsed)
    }

    /// The sidecar reads its own pod to find out when the volume is mounted.
    async fn create_pod_reader(&self, namespace: &str) -> anyhow::Result<()> {
        self.cluster
            .service_accounts(namespace)
            .create(&manifests::pod_reader_service_account())
            .await?;
        self.cluster
            .roles(namespace)
            .create(&manifests::pod_reader_role())
            .await?;
        self.cluster
            .role_bindings(namespace)
            .create(&manifests::pod_reader_role_binding(namespace))
            .await?;
        Ok(())
    }

    /// Nodes the volume bound to `pvc` is reachable from, if it's restricted.
    async fn volume_node_selector(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> anyhow::Result<Option<NodeSelector>> {
        let volume_name = bound_volume_name(pvc)
            .with_context(|| format!("PersistentVolumeClaim {:?} is not bound", pvc.name_any()))?;
        let pv = get_required(&*self.cluster.persistent_volumes(), &volume_name).await?;
        Ok(pv
            .spec
            .and_then(|spec| spec.node_affinity)
            .and_then(|affinity| affinity.required))
    }

    /// Like `wait_state`, giving up after `limit` if that comes first.
    async fn wait_state_within<K>(
        &self,
        client: &dyn ResourceClient<K>,
        name: &str,
        limit: Duration,
        cancel: &CancellationToken,
        condition: &ConditionFn<'_, K>,
    ) -> anyhow::Result<K>
    where
        K: Clone + Debug + Send + Sync + 'static,
    {
        let options = WaitForStateOptions::new(
            self.wait_options.poll_interval(),
            limit.min(self.wait_options.timeout()),
        )?;
        Ok(wait_for_object_state(client, name, &options, cancel, condition, &[]).await?)
    }
}

/// When the pod's `Ready` condition last changed, as reported by the kubelet.
fn ready_since(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")?
        .last_transition_time
        .as_ref()
        .map(|time| time.0.to_rfc3339())
}
