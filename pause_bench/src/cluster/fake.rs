//! In-memory cluster that plays the part of both operators, the proxy CSI
//! driver and the ingress controller, for orchestrator tests.
//!
//! Controllers react synchronously to writes. The things that take time are a
//! plain datacenter becoming available, a paused datacenter resuming on
//! connect, and pods starting and getting their backend volume mounted; all of
//! them are driven by tokio's clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, Namespace, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, Pod, PodCondition, PodSpec, PodStatus, Secret, ServiceAccount,
    VolumeNodeAffinity,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::api::storage::v1::{
    StorageClass, VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec,
    VolumeAttachmentStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use utils::wait::ObjectGetter;

use super::{Client, Cluster, DeletePropagation, LogSource, ResourceClient};
use crate::attachment::attachment_name;
use crate::cql::{CqlEndpoint, CqlSession, SessionFactory, TestData};
use crate::crd::{
    ObjectCondition, PausableScyllaDBDatacenter, RolloutStatus, ScyllaDBDatacenter,
    ScyllaDBDatacenterClaim, ScyllaDBDatacenterClaimSpec, ScyllaDBDatacenterClaimStatus,
    ScyllaDBDatacenterPool, ScyllaDBDatacenterSpec,
};
use crate::naming::{
    DELAYED_STORAGE_BACKEND_PVC_REF_ANNOTATION, DELAYED_STORAGE_PROXY_PVC_REF_ANNOTATION,
    TOPOLOGY_ZONE_LABEL, backend_pvc_name_for_member, claim_name_for_pausable_datacenter,
    local_cql_connection_configs_name, member_pod_name, pvc_name_for_pod,
};

const CSI_DRIVER: &str = "pd.csi.storage.gke.io";
pub(crate) const VOLUME_ZONE: &str = "us-east1-b";

/// `(namespace, name)`; the namespace is empty for cluster-scoped objects.
type Key = (String, String);

/// Knobs of the simulated controllers.
#[derive(Debug, Clone)]
pub(crate) struct Behavior {
    /// How long each member's ScyllaDB takes from process start to serving,
    /// cycled through by ordinal.
    pub member_startup: Vec<Duration>,
    /// Connecting to a paused datacenter backed by a pool with spare capacity.
    pub prewarmed_resume: Duration,
    /// Connecting to a paused datacenter backed by an empty pool.
    pub cold_resume: Duration,
    /// Connecting to a running datacenter.
    pub connect: Duration,
    /// From creating a plain datacenter to it being available.
    pub plain_startup: Duration,
    pub pool_never_rolls_out: bool,
    /// Connection attempts failing before the first one goes through.
    pub connect_failures: u32,
    /// Connections to a paused datacenter fail without resuming it.
    pub resume_fails: bool,
    /// From creating a pod to it running, or being ready if its volume is
    /// already there.
    pub pod_start: Duration,
    /// From annotating a proxy PVC to its pod seeing the backend volume.
    pub backend_mount: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            member_startup: vec![
                Duration::from_millis(7000),
                Duration::from_millis(8000),
                Duration::from_millis(7500),
            ],
            prewarmed_resume: Duration::from_secs(10),
            cold_resume: Duration::from_secs(40),
            connect: Duration::from_millis(100),
            plain_startup: Duration::from_secs(30),
            pool_never_rolls_out: false,
            connect_failures: 0,
            resume_fails: false,
            pod_start: Duration::from_secs(5),
            backend_mount: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub namespaces: BTreeMap<Key, Namespace>,
    pub storage_classes: BTreeMap<Key, StorageClass>,
    pub persistent_volumes: BTreeMap<Key, PersistentVolume>,
    pub volume_attachments: BTreeMap<Key, VolumeAttachment>,
    pub pods: BTreeMap<Key, Pod>,
    pub persistent_volume_claims: BTreeMap<Key, PersistentVolumeClaim>,
    pub datacenters: BTreeMap<Key, ScyllaDBDatacenter>,
    pub datacenter_pools: BTreeMap<Key, ScyllaDBDatacenterPool>,
    pub pausable_datacenters: BTreeMap<Key, PausableScyllaDBDatacenter>,
    pub datacenter_claims: BTreeMap<Key, ScyllaDBDatacenterClaim>,
    pub secrets: BTreeMap<Key, Secret>,
    pub service_accounts: BTreeMap<Key, ServiceAccount>,
    pub roles: BTreeMap<Key, Role>,
    pub role_bindings: BTreeMap<Key, RoleBinding>,

    /// Every connection attempt, in order.
    pub connections: Vec<Connection>,
    /// Container logs by pod.
    pub logs: BTreeMap<Key, String>,
    /// Rows by keyspace.
    pub tables: BTreeMap<String, Vec<(i32, String)>>,
    /// Plain datacenters that become available at the given instant.
    pending_available: BTreeMap<Key, Instant>,
    /// Pods created through the API that aren't ready yet.
    pending_pods: BTreeMap<Key, PendingPod>,
    failed_connects: u32,
    next_id: u64,
    behavior: Behavior,
}

/// Where a session was headed, as read from its connection config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Connection {
    pub datacenter: String,
    pub server: String,
    pub node_domain: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingPod {
    claim: String,
    running_at: Instant,
    /// Unknown until the pod's volume has data behind it.
    ready_at: Option<Instant>,
}

pub(crate) struct FakeWorld {
    state: Mutex<State>,
}

impl FakeWorld {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                behavior,
                ..Default::default()
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn rolled_out(generation: i64) -> RolloutStatus {
    let condition = |type_: &str, status: &str| ObjectCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        observed_generation: Some(generation),
        ..Default::default()
    };
    RolloutStatus {
        observed_generation: Some(generation),
        conditions: vec![
            condition("Available", "True"),
            condition("Progressing", "False"),
            condition("Degraded", "False"),
        ],
        ..Default::default()
    }
}

fn progressing(generation: i64) -> RolloutStatus {
    let mut status = rolled_out(generation);
    for c in &mut status.conditions {
        c.status = match c.type_.as_str() {
            "Progressing" => "True",
            _ => "False",
        }
        .to_string();
    }
    status
}

/// What Scylla Operator publishes for each DNS domain of a datacenter.
pub(crate) fn connection_config(datacenter: &str, dns_domain: &str) -> String {
    format!(
        "apiVersion: cqlclient.scylla.scylladb.com/v1alpha1
kind: CQLConnectionConfig
authInfos:
  admin:
    username: cassandra
    password: cassandra
contexts:
  default:
    authInfoName: admin
    datacenterName: {datacenter}
currentContext: default
datacenters:
  {datacenter}:
    certificateAuthorityData: Y2E=
    nodeDomain: cql.{dns_domain}
    server: any.cql.{dns_domain}
"
    )
}

/// Volumes of the backend driver are zonal.
fn zonal_affinity() -> VolumeNodeAffinity {
    VolumeNodeAffinity {
        required: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: TOPOLOGY_ZONE_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![VOLUME_ZONE.to_string()]),
                }]),
                ..Default::default()
            }],
        }),
    }
}

/// Log line as emitted by ScyllaDB, prefixed with the log source timestamp.
fn log_line(at: chrono::DateTime<chrono::Utc>, message: &str) -> String {
    format!(
        "{} INFO  {} {message}",
        at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        at.format("%Y-%m-%d %H:%M:%S,%3f")
    )
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn member_logs(&self, ordinal: u32, boot: u64) -> String {
        let startups = &self.behavior.member_startup;
        let startup = startups[ordinal as usize % startups.len()];
        let millis = |ms: u64| chrono::TimeDelta::milliseconds(ms as i64);
        let process_start =
            chrono::DateTime::from_timestamp(1_736_510_400 + boot as i64 * 600, 0).unwrap();
        let serving_start = process_start + millis(startup.as_millis() as u64);
        [
            log_line(process_start - millis(300), "setting up"),
            log_line(process_start, "starting ScyllaDB..."),
            log_line(process_start + millis(50), "[shard 0:main] init - starting gossiper"),
            log_line(serving_start, "[shard 0:main] init - serving"),
        ]
        .join("\n")
    }

    /// Creates member pods, volumes and attachments of `sdc`. `pvc_name`
    /// names the PVC backing each member.
    fn start_members(
        &mut self,
        namespace: &str,
        sdc: &ScyllaDBDatacenter,
        pvc_name: &dyn Fn(&str, u32) -> String,
        proxied: bool,
    ) {
        let sdc_name = sdc.name_any();
        let Some(rack) = sdc.spec.racks.first() else {
            return;
        };
        let nodes = sdc.rack_node_count(rack).unwrap_or(0);
        let boot = self.next_id();
        for ordinal in 0..nodes as u32 {
            let pod_name =
                member_pod_name(&sdc_name, sdc.gossip_datacenter_name(), &rack.name, ordinal);
            let node_name = format!("node-{ordinal}");
            let pod_uid = format!("uid-{}", self.next_id());
            self.pods.insert(
                key(namespace, &pod_name),
                Pod {
                    metadata: ObjectMeta {
                        name: Some(pod_name.clone()),
                        namespace: Some(namespace.to_string()),
                        uid: Some(pod_uid),
                        ..Default::default()
                    },
                    spec: Some(PodSpec {
                        node_name: Some(node_name.clone()),
                        ..Default::default()
                    }),
                    status: Some(PodStatus {
                        phase: Some("Running".to_string()),
                        conditions: Some(vec![PodCondition {
                            type_: "Ready".to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
            );
            let logs = self.member_logs(ordinal, boot);
            self.logs.insert(key(namespace, &pod_name), logs);

            let claim_name = pvc_name(&pod_name, ordinal);
            let volume_name = format!("pv-{namespace}-{claim_name}");
            let volume_handle = format!("projects/p/zones/z/disks/{volume_name}");
            let pvc_key = key(namespace, &claim_name);
            if !self.persistent_volume_claims.contains_key(&pvc_key) {
                let uid = format!("uid-{}", self.next_id());
                self.persistent_volume_claims.insert(
                    pvc_key.clone(),
                    PersistentVolumeClaim {
                        metadata: ObjectMeta {
                            name: Some(claim_name.clone()),
                            namespace: Some(namespace.to_string()),
                            uid: Some(uid),
                            ..Default::default()
                        },
                        spec: Some(PersistentVolumeClaimSpec {
                            volume_name: Some(volume_name.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                );
                self.persistent_volumes.insert(
                    key("", &volume_name),
                    PersistentVolume {
                        metadata: ObjectMeta {
                            name: Some(volume_name.clone()),
                            ..Default::default()
                        },
                        spec: Some(PersistentVolumeSpec {
                            csi: Some(CSIPersistentVolumeSource {
                                driver: CSI_DRIVER.to_string(),
                                volume_handle: volume_handle.clone(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                );
            }
            if proxied {
                if let Some(pvc) = self.persistent_volume_claims.get_mut(&pvc_key) {
                    pvc.annotations_mut().insert(
                        DELAYED_STORAGE_PROXY_PVC_REF_ANNOTATION.to_string(),
                        format!("{namespace}/data-{pod_name}"),
                    );
                }
            }

            let va_name = attachment_name(&volume_handle, CSI_DRIVER, &node_name);
            let uid = format!("uid-{}", self.next_id());
            self.volume_attachments.insert(
                key("", &va_name),
                VolumeAttachment {
                    metadata: ObjectMeta {
                        name: Some(va_name.clone()),
                        uid: Some(uid),
                        ..Default::default()
                    },
                    spec: VolumeAttachmentSpec {
                        attacher: CSI_DRIVER.to_string(),
                        node_name: node_name.clone(),
                        source: VolumeAttachmentSource {
                            persistent_volume_name: Some(volume_name.clone()),
                            ..Default::default()
                        },
                    },
                    status: Some(VolumeAttachmentStatus {
                        attached: true,
                        ..Default::default()
                    }),
                },
            );
        }
    }

    fn publish_connection_configs(&mut self, namespace: &str, sdc: &ScyllaDBDatacenter) {
        let name = local_cql_connection_configs_name(&sdc.name_any());
        let data = sdc
            .spec
            .dns_domains
            .iter()
            .map(|domain| {
                let config = connection_config(sdc.gossip_datacenter_name(), domain);
                (domain.clone(), ByteString(config.into_bytes()))
            })
            .collect();
        self.secrets.insert(
            key(namespace, &name),
            Secret {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            },
        );
    }

    /// Removes member pods and their attachments, and the connection configs.
    /// Volumes stay.
    fn stop_members(&mut self, namespace: &str, sdc: &ScyllaDBDatacenter) {
        self.secrets
            .remove(&key(namespace, &local_cql_connection_configs_name(&sdc.name_any())));
        let prefix = format!("{}-", sdc.name_any());
        let stopped: Vec<Key> = self
            .pods
            .keys()
            .filter(|(ns, name)| ns == namespace && name.starts_with(&prefix))
            .cloned()
            .collect();
        let volume_prefix = format!("pv-{namespace}-");
        for pod_key in stopped {
            let Some(pod) = self.pods.remove(&pod_key) else {
                continue;
            };
            self.logs.remove(&pod_key);
            let node_name = pod.spec.and_then(|s| s.node_name).unwrap_or_default();
            self.volume_attachments.retain(|_, va| {
                let ours = va
                    .spec
                    .source
                    .persistent_volume_name
                    .as_deref()
                    .is_some_and(|pv| pv.starts_with(&volume_prefix));
                !(ours && va.spec.node_name == node_name)
            });
        }
    }

    /// Takes a datacenter out of the pool and binds it to the pausable
    /// datacenter through its claim.
    fn bind_datacenter(&mut self, namespace: &str, psdc: &PausableScyllaDBDatacenter) {
        let psdc_name = psdc.name_any();
        let pool_key = key(namespace, &psdc.spec.scylla_db_datacenter_pool_name);
        let Some(pool) = self.datacenter_pools.get(&pool_key) else {
            return;
        };
        let mut spec: ScyllaDBDatacenterSpec = pool.spec.template.spec.clone();
        let rack_name = spec.racks.first().map(|r| r.name.clone()).unwrap_or_default();
        spec.dns_domains = vec![format!("{psdc_name}.{namespace}.pausing.scylladb.com")];

        let sdc_name = format!("{psdc_name}-{}", self.next_id());
        let mut sdc = ScyllaDBDatacenter::new(&sdc_name, spec);
        sdc.metadata.namespace = Some(namespace.to_string());
        sdc.metadata.uid = Some(format!("uid-{}", self.next_id()));
        sdc.metadata.generation = Some(1);
        sdc.status = Some(rolled_out(1));

        let backend_pvc =
            |_pod: &str, ordinal: u32| backend_pvc_name_for_member(&psdc_name, &rack_name, ordinal);
        self.start_members(namespace, &sdc, &backend_pvc, true);
        self.publish_connection_configs(namespace, &sdc);

        let claim_name = claim_name_for_pausable_datacenter(&psdc_name);
        let mut claim = ScyllaDBDatacenterClaim::new(&claim_name, ScyllaDBDatacenterClaimSpec::default());
        claim.metadata.namespace = Some(namespace.to_string());
        claim.status = Some(ScyllaDBDatacenterClaimStatus {
            scylla_db_datacenter_name: Some(sdc_name.clone()),
            ..Default::default()
        });
        self.datacenter_claims.insert(key(namespace, &claim_name), claim);
        self.datacenters.insert(key(namespace, &sdc_name), sdc);
    }

    /// Releases the bound datacenter and the backend volumes.
    fn unbind_datacenter(&mut self, namespace: &str, psdc_name: &str) {
        let claim_key = key(namespace, &claim_name_for_pausable_datacenter(psdc_name));
        let bound = self
            .datacenter_claims
            .get_mut(&claim_key)
            .and_then(|claim| claim.status.as_mut())
            .and_then(|status| status.scylla_db_datacenter_name.take());
        if let Some(sdc) = bound.and_then(|name| self.datacenters.remove(&key(namespace, &name))) {
            self.stop_members(namespace, &sdc);
        }
        for ((ns, _), pvc) in self.persistent_volume_claims.iter_mut() {
            if ns == namespace {
                pvc.annotations_mut().remove(DELAYED_STORAGE_PROXY_PVC_REF_ANNOTATION);
            }
        }
    }

    /// What the ingress controller does on a connection to a paused datacenter.
    fn unpause_all(&mut self) {
        let paused: Vec<Key> = self
            .pausable_datacenters
            .iter()
            .filter(|(_, psdc)| psdc.spec.paused == Some(true))
            .map(|(k, _)| k.clone())
            .collect();
        for psdc_key in paused {
            let Some(mut psdc) = self.pausable_datacenters.remove(&psdc_key) else {
                continue;
            };
            let generation = psdc.metadata.generation.unwrap_or(0) + 1;
            psdc.spec.paused = Some(false);
            psdc.metadata.generation = Some(generation);
            psdc.status = Some(rolled_out(generation));
            self.bind_datacenter(&psdc_key.0, &psdc);
            self.pausable_datacenters.insert(psdc_key, psdc);
        }
    }

    fn resume_delay(&self) -> Option<Duration> {
        let paused = self
            .pausable_datacenters
            .iter()
            .find(|(_, psdc)| psdc.spec.paused == Some(true))?;
        let ((namespace, _), psdc) = paused;
        let pool = self
            .datacenter_pools
            .get(&key(namespace, &psdc.spec.scylla_db_datacenter_pool_name));
        Some(match pool {
            Some(pool) if pool.spec.capacity > 0 => self.behavior.prewarmed_resume,
            _ => self.behavior.cold_resume,
        })
    }
}

/// Per-kind storage and controller reactions.
pub(crate) trait FakeKind:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self>;

    /// An error rejects the object, like admission would.
    fn on_create(_state: &mut State, _namespace: &str, _obj: &mut Self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_patch(_state: &mut State, _namespace: &str, _obj: &mut Self) {}

    fn on_delete(_state: &mut State, _namespace: &str, _obj: &Self) {}

    fn on_get(_state: &mut State, _namespace: &str, _name: &str) {}
}

macro_rules! plain_kind {
    ($kind:ty, $field:ident) => {
        impl FakeKind for $kind {
            fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
                &mut state.$field
            }
        }
    };
}

plain_kind!(StorageClass, storage_classes);
plain_kind!(PersistentVolume, persistent_volumes);
plain_kind!(VolumeAttachment, volume_attachments);
plain_kind!(ScyllaDBDatacenterClaim, datacenter_claims);
plain_kind!(Secret, secrets);
plain_kind!(ServiceAccount, service_accounts);
plain_kind!(Role, roles);
plain_kind!(RoleBinding, role_bindings);

/// Member pods are set up by the operators. Pods created through the API start
/// after a while, and get ready once their volume has data behind it.
impl FakeKind for Pod {
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
        &mut state.pods
    }

    fn on_create(state: &mut State, namespace: &str, obj: &mut Self) -> anyhow::Result<()> {
        let spec = obj.spec.as_ref().context("pod has no spec")?;
        if let Some(service_account) = &spec.service_account_name {
            if !state
                .service_accounts
                .contains_key(&key(namespace, service_account))
            {
                bail!("serviceaccount {service_account:?} not found");
            }
        }
        let claim = spec
            .volumes
            .iter()
            .flatten()
            .find_map(|v| v.persistent_volume_claim.as_ref())
            .map(|source| source.claim_name.clone())
            .context("pod mounts no PersistentVolumeClaim")?;
        let pvc = state
            .persistent_volume_claims
            .get(&key(namespace, &claim))
            .with_context(|| format!("persistentvolumeclaim {claim:?} not found"))?;
        let has_data = pvc
            .spec
            .as_ref()
            .is_some_and(|spec| spec.volume_name.is_some());

        let running_at = Instant::now() + state.behavior.pod_start;
        obj.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.pending_pods.insert(
            key(namespace, &obj.name_any()),
            PendingPod {
                claim,
                running_at,
                ready_at: has_data.then_some(running_at),
            },
        );
        Ok(())
    }

    fn on_delete(state: &mut State, namespace: &str, obj: &Self) {
        state.pending_pods.remove(&key(namespace, &obj.name_any()));
    }

    fn on_get(state: &mut State, namespace: &str, name: &str) {
        let k = key(namespace, name);
        let Some(pending) = state.pending_pods.get(&k).cloned() else {
            return;
        };
        let now = Instant::now();
        let running = now >= pending.running_at;
        let ready = pending.ready_at.is_some_and(|at| now >= at);
        if ready {
            state.pending_pods.remove(&k);
        }
        if let Some(pod) = state.pods.get_mut(&k) {
            pod.status = Some(PodStatus {
                phase: Some(if running { "Running" } else { "Pending" }.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }
}

/// Claims of a StorageClass created by the benchmark are provisioned right
/// away by the backend driver. Proxy claims stay empty until annotated with a
/// backend claim.
impl FakeKind for PersistentVolumeClaim {
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
        &mut state.persistent_volume_claims
    }

    fn on_create(state: &mut State, namespace: &str, obj: &mut Self) -> anyhow::Result<()> {
        let Some(class) = obj
            .spec
            .as_ref()
            .and_then(|spec| spec.storage_class_name.clone())
        else {
            return Ok(());
        };
        if !state.storage_classes.contains_key(&key("", &class)) {
            return Ok(());
        }
        let volume_name = format!("pv-{namespace}-{}", obj.name_any());
        state.persistent_volumes.insert(
            key("", &volume_name),
            PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(volume_name.clone()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    csi: Some(CSIPersistentVolumeSource {
                        driver: CSI_DRIVER.to_string(),
                        volume_handle: format!("projects/p/zones/z/disks/{volume_name}"),
                        ..Default::default()
                    }),
                    node_affinity: Some(zonal_affinity()),
                    storage_class_name: Some(class),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        obj.spec.get_or_insert_with(Default::default).volume_name = Some(volume_name);
        Ok(())
    }

    fn on_patch(state: &mut State, namespace: &str, obj: &mut Self) {
        if !obj
            .annotations()
            .contains_key(DELAYED_STORAGE_BACKEND_PVC_REF_ANNOTATION)
        {
            return;
        }
        let claim = obj.name_any();
        let mounted_at = Instant::now() + state.behavior.backend_mount;
        for ((ns, _), pending) in state.pending_pods.iter_mut() {
            if ns == namespace && pending.claim == claim && pending.ready_at.is_none() {
                pending.ready_at = Some(mounted_at.max(pending.running_at));
            }
        }
    }
}

impl FakeKind for Namespace {
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
        &mut state.namespaces
    }

    fn on_delete(state: &mut State, _namespace: &str, obj: &Self) {
        let namespace = obj.name_any();
        let keep = |(ns, _): &Key| *ns != namespace;
        state.pods.retain(|k, _| keep(k));
        state.logs.retain(|k, _| keep(k));
        state.persistent_volume_claims.retain(|k, _| keep(k));
        state.datacenters.retain(|k, _| keep(k));
        state.datacenter_pools.retain(|k, _| keep(k));
        state.pausable_datacenters.retain(|k, _| keep(k));
        state.datacenter_claims.retain(|k, _| keep(k));
        state.secrets.retain(|k, _| keep(k));
        state.service_accounts.retain(|k, _| keep(k));
        state.roles.retain(|k, _| keep(k));
        state.role_bindings.retain(|k, _| keep(k));
        state.pending_available.retain(|k, _| keep(k));
        state.pending_pods.retain(|k, _| keep(k));
    }
}

impl FakeKind for ScyllaDBDatacenterPool {
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
        &mut state.datacenter_pools
    }

    fn on_create(state: &mut State, _namespace: &str, obj: &mut Self) -> anyhow::Result<()> {
        let generation = obj.metadata.generation.unwrap_or(1);
        obj.status = Some(if state.behavior.pool_never_rolls_out {
            progressing(generation)
        } else {
            rolled_out(generation)
        });
        Ok(())
    }
}

impl FakeKind for PausableScyllaDBDatacenter {
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
        &mut state.pausable_datacenters
    }

    fn on_create(state: &mut State, namespace: &str, obj: &mut Self) -> anyhow::Result<()> {
        obj.status = Some(rolled_out(obj.metadata.generation.unwrap_or(1)));
        if obj.spec.paused != Some(true) {
            state.bind_datacenter(namespace, obj);
        }
        Ok(())
    }

    fn on_patch(state: &mut State, namespace: &str, obj: &mut Self) {
        obj.status = Some(rolled_out(obj.metadata.generation.unwrap_or(1)));
        if obj.spec.paused == Some(true) {
            state.unbind_datacenter(namespace, &obj.name_any());
        }
    }
}

/// Datacenters created directly are managed by Scylla Operator, which takes
/// a while to bring them up.
impl FakeKind for ScyllaDBDatacenter {
    fn store(state: &mut State) -> &mut BTreeMap<Key, Self> {
        &mut state.datacenters
    }

    fn on_create(state: &mut State, namespace: &str, obj: &mut Self) -> anyhow::Result<()> {
        obj.status = Some(progressing(obj.metadata.generation.unwrap_or(1)));
        let available_at = Instant::now() + state.behavior.plain_startup;
        state
            .pending_available
            .insert(key(namespace, &obj.name_any()), available_at);
        Ok(())
    }

    fn on_delete(state: &mut State, namespace: &str, obj: &Self) {
        state.pending_available.remove(&key(namespace, &obj.name_any()));
        state.stop_members(namespace, obj);
    }

    fn on_get(state: &mut State, namespace: &str, name: &str) {
        let k = key(namespace, name);
        let Some(available_at) = state.pending_available.get(&k).copied() else {
            return;
        };
        if Instant::now() < available_at {
            return;
        }
        state.pending_available.remove(&k);
        let Some(mut sdc) = state.datacenters.remove(&k) else {
            return;
        };
        sdc.status = Some(rolled_out(sdc.metadata.generation.unwrap_or(1)));
        state.start_members(namespace, &sdc, &|pod: &str, _: u32| pvc_name_for_pod(pod), false);
        state.publish_connection_configs(namespace, &sdc);
        state.datacenters.insert(k, sdc);
    }
}

fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

pub(crate) struct FakeClient<K> {
    world: Arc<FakeWorld>,
    namespace: String,
    kind: String,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: FakeKind> FakeClient<K> {
    fn new(world: &Arc<FakeWorld>, namespace: &str) -> Self {
        Self {
            world: Arc::clone(world),
            namespace: namespace.to_string(),
            kind: K::kind(&()).into_owned(),
            _kind: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<K: FakeKind> ObjectGetter<K> for FakeClient<K> {
    async fn get_object(&self, name: &str) -> anyhow::Result<Option<K>> {
        let mut state = self.world.state();
        K::on_get(&mut state, &self.namespace, name);
        Ok(K::store(&mut state)
            .get(&key(&self.namespace, name))
            .cloned())
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

#[async_trait]
impl<K: FakeKind> ResourceClient<K> for FakeClient<K> {
    async fn create(&self, obj: &K) -> anyhow::Result<K> {
        let mut state = self.world.state();
        let id = state.next_id();
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            let generate_name = meta
                .generate_name
                .clone()
                .context("neither name nor generateName set")?;
            meta.name = Some(format!("{generate_name}{id:05}"));
        }
        if !self.namespace.is_empty() {
            meta.namespace = Some(self.namespace.clone());
        }
        meta.uid = Some(format!("uid-{id}"));
        meta.generation = Some(1);
        let name = obj.name_any();
        let k = key(&self.namespace, &name);
        if K::store(&mut state).contains_key(&k) {
            bail!("{} {name:?} already exists", self.kind);
        }
        K::on_create(&mut state, &self.namespace, &mut obj)?;
        K::store(&mut state).insert(k, obj.clone());
        Ok(obj)
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> anyhow::Result<K> {
        let mut state = self.world.state();
        let k = key(&self.namespace, name);
        let current = K::store(&mut state)
            .remove(&k)
            .with_context(|| format!("{} {name:?} not found", self.kind))?;
        let mut value = serde_json::to_value(&current)?;
        merge(&mut value, patch);
        let mut obj: K = serde_json::from_value(value)?;
        let generation = obj.meta().generation.unwrap_or(0) + 1;
        obj.meta_mut().generation = Some(generation);
        K::on_patch(&mut state, &self.namespace, &mut obj);
        K::store(&mut state).insert(k, obj.clone());
        Ok(obj)
    }

    async fn delete(
        &self,
        name: &str,
        uid: Option<&str>,
        _propagation: DeletePropagation,
    ) -> anyhow::Result<()> {
        let mut state = self.world.state();
        let k = key(&self.namespace, name);
        let Some(obj) = K::store(&mut state).remove(&k) else {
            return Ok(());
        };
        if let Some(uid) = uid {
            if obj.meta().uid.as_deref() != Some(uid) {
                K::store(&mut state).insert(k, obj);
                bail!("precondition failed: UID mismatch for {name:?}");
            }
        }
        K::on_delete(&mut state, &self.namespace, &obj);
        Ok(())
    }
}

#[async_trait]
impl LogSource for FakeWorld {
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        _container: &str,
    ) -> anyhow::Result<String> {
        self.state()
            .logs
            .get(&key(namespace, pod))
            .cloned()
            .with_context(|| format!("no logs for pod {namespace}/{pod}"))
    }
}

#[derive(Clone)]
pub(crate) struct FakeCluster {
    pub world: Arc<FakeWorld>,
}

impl FakeCluster {
    fn client<K: FakeKind>(&self, namespace: &str) -> Client<K> {
        Arc::new(FakeClient::<K>::new(&self.world, namespace))
    }
}

impl Cluster for FakeCluster {
    fn namespaces(&self) -> Client<Namespace> {
        self.client("")
    }

    fn storage_classes(&self) -> Client<StorageClass> {
        self.client("")
    }

    fn persistent_volumes(&self) -> Client<PersistentVolume> {
        self.client("")
    }

    fn volume_attachments(&self) -> Client<VolumeAttachment> {
        self.client("")
    }

    fn pods(&self, namespace: &str) -> Client<Pod> {
        self.client(namespace)
    }

    fn persistent_volume_claims(&self, namespace: &str) -> Client<PersistentVolumeClaim> {
        self.client(namespace)
    }

    fn secrets(&self, namespace: &str) -> Client<Secret> {
        self.client(namespace)
    }

    fn service_accounts(&self, namespace: &str) -> Client<ServiceAccount> {
        self.client(namespace)
    }

    fn roles(&self, namespace: &str) -> Client<Role> {
        self.client(namespace)
    }

    fn role_bindings(&self, namespace: &str) -> Client<RoleBinding> {
        self.client(namespace)
    }

    fn datacenters(&self, namespace: &str) -> Client<ScyllaDBDatacenter> {
        self.client(namespace)
    }

    fn datacenter_pools(&self, namespace: &str) -> Client<ScyllaDBDatacenterPool> {
        self.client(namespace)
    }

    fn pausable_datacenters(&self, namespace: &str) -> Client<PausableScyllaDBDatacenter> {
        self.client(namespace)
    }

    fn datacenter_claims(&self, namespace: &str) -> Client<ScyllaDBDatacenterClaim> {
        self.client(namespace)
    }

    fn logs(&self) -> Arc<dyn LogSource> {
        self.world.clone()
    }
}

/// Connections go through the simulated ingress controller, which resumes
/// paused datacenters.
pub(crate) struct FakeSessions {
    pub world: Arc<FakeWorld>,
}

/// What the simulated ingress controller does with a connection.
enum Outcome {
    Refuse,
    Resume,
    Serve,
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn open(&self, endpoint: &CqlEndpoint) -> anyhow::Result<Box<dyn CqlSession>> {
        let (delay, outcome) = {
            let mut state = self.world.state();
            state.connections.push(Connection {
                datacenter: endpoint.datacenter.clone(),
                server: endpoint.server().to_string(),
                node_domain: endpoint
                    .bundle
                    .node_domain(&endpoint.datacenter)
                    .map(str::to_string),
            });
            let refused = state.failed_connects < state.behavior.connect_failures;
            if refused {
                state.failed_connects += 1;
            }
            match state.resume_delay() {
                _ if refused => (state.behavior.connect, Outcome::Refuse),
                Some(delay) if state.behavior.resume_fails => (delay, Outcome::Refuse),
                Some(delay) => (delay, Outcome::Resume),
                None => (state.behavior.connect, Outcome::Serve),
            }
        };
        tokio::time::sleep(delay).await;
        match outcome {
            Outcome::Refuse => bail!("connection to {} refused", endpoint.server()),
            Outcome::Resume => self.world.state().unpause_all(),
            Outcome::Serve => {}
        }
        Ok(Box::new(FakeSession {
            world: self.world.clone(),
        }))
    }
}

struct FakeSession {
    world: Arc<FakeWorld>,
}

#[async_trait]
impl CqlSession for FakeSession {
    async fn insert_test_data(&self, data: &TestData) -> anyhow::Result<()> {
        self.world
            .state()
            .tables
            .insert(data.keyspace.clone(), data.rows.clone());
        Ok(())
    }

    async fn read_test_data(&self, data: &TestData) -> anyhow::Result<Vec<(i32, String)>> {
        self.world
            .state()
            .tables
            .get(&data.keyspace)
            .cloned()
            .with_context(|| format!("keyspace {} does not exist", data.keyspace))
    }
}
