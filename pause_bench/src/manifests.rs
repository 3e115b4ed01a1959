//! Objects the benchmark creates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction, Namespace,
    NodeAffinity, NodeSelector, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext,
    PodSpec, Probe, ServiceAccount, Toleration, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{Map, Value, json};

use crate::config::{BackendCsiDriver, BenchmarkConfig};
use crate::crd::{
    PausableScyllaDBDatacenter, PausableScyllaDBDatacenterSpec, RackSpec, RackTemplate,
    ScyllaDBDatacenter, ScyllaDBDatacenterPool, ScyllaDBDatacenterPoolSpec,
    ScyllaDBDatacenterSpec, ScyllaDBDatacenterTemplate,
};
use crate::naming::{INGRESS_CONTROLLER_MEMBER_CONDITION_TYPE, TOPOLOGY_ZONE_LABEL};

pub const CLUSTER_NAME: &str = "basic";
pub const DATACENTER_NAME: &str = "us-east-1";
pub const RACK_NAME: &str = "us-east-1a";

/// Name of the pool, the pausable datacenter and the plain datacenter.
pub const OBJECT_NAME: &str = "basic";

const NAMESPACE_GENERATE_NAME: &str = "benchmark-";

/// How volumes of a storage class get bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeBindingMode {
    Immediate,
    WaitForFirstConsumer,
}

impl VolumeBindingMode {
    fn as_str(&self) -> &'static str {
        match self {
            VolumeBindingMode::Immediate => "Immediate",
            VolumeBindingMode::WaitForFirstConsumer => "WaitForFirstConsumer",
        }
    }
}

/// Every run gets a fresh namespace.
pub fn benchmark_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            generate_name: Some(NAMESPACE_GENERATE_NAME.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn backend_storage_class(driver: BackendCsiDriver, binding: VolumeBindingMode) -> StorageClass {
    let (generate_name, disk_type) = match driver {
        BackendCsiDriver::GcePersistentDisk => ("premium-rwo-", "pd-ssd"),
        BackendCsiDriver::Ebs => ("gp3-", "gp3"),
    };
    let binding_suffix = match binding {
        VolumeBindingMode::Immediate => "immediate-",
        VolumeBindingMode::WaitForFirstConsumer => "wffc-",
    };
    StorageClass {
        metadata: ObjectMeta {
            generate_name: Some(format!("{generate_name}{binding_suffix}")),
            ..Default::default()
        },
        provisioner: driver.name().to_string(),
        parameters: Some(BTreeMap::from([
            ("csi.storage.k8s.io/fstype".to_string(), "xfs".to_string()),
            ("type".to_string(), disk_type.to_string()),
        ])),
        reclaim_policy: Some("Delete".to_string()),
        volume_binding_mode: Some(binding.as_str().to_string()),
        ..Default::default()
    }
}

fn resources(cpu: &str, memory: &str) -> Value {
    json!({
        "limits": {"cpu": cpu, "memory": memory},
        "requests": {"cpu": cpu, "memory": memory},
    })
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A single rack of `config.nodes` members on dedicated nodes, storing data on
/// `storage_class_name`.
pub fn datacenter_spec(config: &BenchmarkConfig, storage_class_name: &str) -> ScyllaDBDatacenterSpec {
    let mut match_expressions = vec![json!({
        "key": "scylla.scylladb.com/node-type",
        "operator": "In",
        "values": ["scylla"],
    })];
    if let Some(zone) = &config.topology_zone {
        match_expressions.push(json!({
            "key": TOPOLOGY_ZONE_LABEL,
            "operator": "In",
            "values": [zone],
        }));
    }

    let rack = RackSpec {
        name: RACK_NAME.to_string(),
        nodes: None,
        extra: into_map(json!({
            "placement": {
                "nodeAffinity": {
                    "requiredDuringSchedulingIgnoredDuringExecution": {
                        "nodeSelectorTerms": [{"matchExpressions": match_expressions}],
                    },
                },
                "tolerations": [{
                    "key": "scylla-operator.scylladb.com/dedicated",
                    "operator": "Equal",
                    "value": "scyllaclusters",
                    "effect": "NoSchedule",
                }],
            },
        })),
    };

    let rack_template = RackTemplate {
        nodes: Some(config.nodes as i32),
        extra: into_map(json!({
            "scyllaDB": {
                "resources": resources("1", "4Gi"),
                "storage": {
                    "capacity": "10Gi",
                    "storageClassName": storage_class_name,
                },
            },
            "scyllaDBManagerAgent": {
                "resources": resources("10m", "100Mi"),
            },
        })),
    };

    ScyllaDBDatacenterSpec {
        cluster_name: CLUSTER_NAME.to_string(),
        datacenter_name: Some(DATACENTER_NAME.to_string()),
        dns_domains: Vec::new(),
        rack_template: Some(rack_template),
        racks: vec![rack],
        extra: into_map(json!({
            "scyllaDB": {
                "image": config.images.scylladb,
                "enableDeveloperMode": false,
            },
            "scyllaDBManagerAgent": {
                "image": config.images.manager_agent,
            },
            "exposeOptions": {
                "nodeService": {"type": "Headless"},
                "broadcastOptions": {
                    "nodes": {"type": "PodIP"},
                    "clients": {"type": "PodIP"},
                },
            },
            "minReadySeconds": 0,
            "readinessGates": [{"conditionType": INGRESS_CONTROLLER_MEMBER_CONDITION_TYPE}],
        })),
    }
}

fn cql_ingress(ingress_class_name: &str) -> Value {
    json!({"ingress": {"ingressClassName": ingress_class_name}})
}

pub fn datacenter_pool(
    config: &BenchmarkConfig,
    storage_class_name: &str,
    capacity: i32,
    limit: i32,
) -> ScyllaDBDatacenterPool {
    let mut spec = datacenter_spec(config, storage_class_name);
    // The pausable operator provisions its own certificates for pooled datacenters.
    let user_managed = json!({"type": "UserManaged", "userManagedOptions": {"secretName": ""}});
    spec.extra.insert(
        "certificateOptions".to_string(),
        json!({"servingCA": user_managed, "clientCA": user_managed}),
    );
    ScyllaDBDatacenterPool::new(
        OBJECT_NAME,
        ScyllaDBDatacenterPoolSpec {
            template: ScyllaDBDatacenterTemplate { spec },
            capacity,
            limit,
            proxy_storage_class_name: config.proxy_storage_class_name.clone(),
        },
    )
}

/// Created unpaused, exposing CQL through the ingress.
pub fn pausable_datacenter(pool_name: &str, ingress_class_name: &str) -> PausableScyllaDBDatacenter {
    PausableScyllaDBDatacenter::new(
        OBJECT_NAME,
        PausableScyllaDBDatacenterSpec {
            scylla_db_datacenter_pool_name: pool_name.to_string(),
            paused: Some(false),
            expose_options: Some(json!({"cql": cql_ingress(ingress_class_name)})),
            extra: Map::new(),
        },
    )
}

/// A datacenter managed directly by Scylla Operator, exposing CQL through the
/// ingress under the namespace's public domain.
pub fn plain_datacenter(
    config: &BenchmarkConfig,
    storage_class_name: &str,
    dns_domain: &str,
) -> ScyllaDBDatacenter {
    let mut spec = datacenter_spec(config, storage_class_name);
    spec.dns_domains = vec![dns_domain.to_string()];
    if let Some(Value::Object(expose)) = spec.extra.get_mut("exposeOptions") {
        expose.insert("cql".to_string(), cql_ingress(&config.ingress_class_name));
    }
    ScyllaDBDatacenter::new(OBJECT_NAME, spec)
}

/// Name of the pod every proxy volume scenario measures.
pub const READINESS_POD_NAME: &str = "test";
/// Pod volume holding the measured data.
pub const DATA_VOLUME_NAME: &str = "data";

const SHARED_VOLUME_NAME: &str = "shared";
const SHARED_DIR: &str = "/var/lib/shared";
const MOUNT_SIGNAL_FILE: &str = "/var/lib/shared/backend-volume-mounting.done";
const NOBODY: i64 = 65534;

/// Writes the readiness marker right away.
pub const TOUCH_SCRIPT: &str = "trap 'kill $( jobs -p ); exit 0' TERM

touch /data/test

sleep infinity &
wait $!";

/// Keeps trying to write the readiness marker until the backend volume shows
/// up behind the proxy volume.
pub const BUSYWAIT_SCRIPT: &str = "trap 'kill $( jobs -p ); exit 0' TERM

while true; do
\ttouch /data/test && break
done

sleep infinity &
wait $!";

/// Writes the readiness marker once the sidecar signals the backend volume is
/// mounted.
pub const SIGNAL_WAIT_SCRIPT: &str = "trap 'kill $( jobs -p ); exit 0' TERM

while true; do
\ttest -f \"/var/lib/shared/backend-volume-mounting.done\" && break
done
touch /data/test

sleep infinity &
wait $!";

fn volume_claim(
    metadata: ObjectMeta,
    storage_class_name: &str,
    storage: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name: Some(storage_class_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Provisioned right away by the backend driver.
pub fn backend_volume_claim(storage_class_name: &str) -> PersistentVolumeClaim {
    volume_claim(
        ObjectMeta {
            generate_name: Some("backend-pvc-".to_string()),
            ..Default::default()
        },
        storage_class_name,
        "100Mi",
    )
}

/// Mounted empty until annotated with the backend PVC to put behind it.
pub fn proxy_volume_claim(proxy_storage_class_name: &str) -> PersistentVolumeClaim {
    volume_claim(
        ObjectMeta {
            generate_name: Some("proxy-pvc-".to_string()),
            ..Default::default()
        },
        proxy_storage_class_name,
        "1Mi",
    )
}

/// A pod that becomes ready once `/data/test` exists on the volume of
/// `claim_name`. `script` decides when it's written. `node_selector`, if
/// any, pins the pod next to its backend volume.
pub fn readiness_pod(
    config: &BenchmarkConfig,
    claim_name: &str,
    script: &str,
    node_selector: Option<NodeSelector>,
) -> Pod {
    let container = Container {
        name: "sleep".to_string(),
        image: Some(config.images.busybox.clone()),
        image_pull_policy: Some(config.image_pull_policy.as_str().to_string()),
        command: Some(
            ["bin/sh", "-euEo", "pipefail", "-c", script]
                .map(String::from)
                .to_vec(),
        ),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME_NAME.to_string(),
            mount_path: "/data".to_string(),
            mount_propagation: Some("HostToContainer".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(["test", "-f", "/data/test"].map(String::from).to_vec()),
            }),
            initial_delay_seconds: Some(0),
            timeout_seconds: Some(300),
            period_seconds: Some(1),
            success_threshold: Some(1),
            failure_threshold: Some(300),
            ..Default::default()
        }),
        ..Default::default()
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(READINESS_POD_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: DATA_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            containers: vec![container],
            security_context: Some(PodSecurityContext {
                run_as_user: Some(NOBODY),
                run_as_group: Some(NOBODY),
                run_as_non_root: Some(true),
                fs_group: Some(NOBODY),
                ..Default::default()
            }),
            restart_policy: Some("OnFailure".to_string()),
            tolerations: Some(vec![Toleration {
                key: Some("scylla-operator.scylladb.com/dedicated".to_string()),
                operator: Some("Equal".to_string()),
                value: Some("scyllaclusters".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }]),
            affinity: node_selector.map(|required| Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(required),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Adds the proxy CSI driver's `wait` sidecar, which touches a file on a
/// volume shared with the workload once the backend volume is mounted. The
/// sidecar reads its own pod, so the pod runs as `service_account_name`.
pub fn with_mount_signal_sidecar(
    mut pod: Pod,
    config: &BenchmarkConfig,
    service_account_name: &str,
) -> Pod {
    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    spec.service_account_name = Some(service_account_name.to_string());
    if let Some(workload) = spec.containers.first_mut() {
        workload
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: SHARED_VOLUME_NAME.to_string(),
                read_only: Some(true),
                mount_path: SHARED_DIR.to_string(),
                ..Default::default()
            });
    }
    spec.containers.push(Container {
        name: "wait".to_string(),
        image: Some(config.images.proxy_csi_driver.clone()),
        image_pull_policy: Some(config.image_pull_policy.as_str().to_string()),
        args: Some(vec![
            "wait".to_string(),
            "--pod-name=$(POD_NAME)".to_string(),
            format!("--volume={DATA_VOLUME_NAME}"),
            format!("--signal-file-path={MOUNT_SIGNAL_FILE}"),
        ]),
        env: Some(vec![EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: SHARED_VOLUME_NAME.to_string(),
            mount_path: SHARED_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: SHARED_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    pod
}

pub const POD_READER_NAME: &str = "basic";
const POD_READER_ROLE_NAME: &str = "pods";
const POD_READER_ROLE_BINDING_NAME: &str = "pods-role";

pub fn pod_reader_service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(POD_READER_NAME.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn pod_reader_role() -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(POD_READER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string()]),
            verbs: ["get", "list", "watch"].map(String::from).to_vec(),
            ..Default::default()
        }]),
    }
}

pub fn pod_reader_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(POD_READER_ROLE_BINDING_NAME.to_string()),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            api_group: Some(String::new()),
            kind: "ServiceAccount".to_string(),
            name: POD_READER_NAME.to_string(),
            namespace: Some(namespace.to_string()),
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: POD_READER_ROLE_NAME.to_string(),
        },
    }
}
