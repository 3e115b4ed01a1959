//! Custom resources of the pausable ScyllaDB operator and of Scylla Operator.
//!
//! Only the fields the benchmark reads or writes are typed. Everything else is
//! kept in `extra` so that objects survive a read-modify-write round trip.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PAUSING_GROUP: &str = "pausing.scylladb.com";
pub const SCYLLA_GROUP: &str = "scylla.scylladb.com";

/// A status condition, as reported by both operators.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Status shared by the rolled-out objects of both operators.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ObjectCondition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Objects whose readiness is reported through generation-scoped conditions.
pub trait HasConditions {
    fn meta(&self) -> &ObjectMeta;
    fn conditions(&self) -> &[ObjectCondition];
}

macro_rules! impl_has_conditions {
    ($($kind:ty),+) => {
        $(
            impl HasConditions for $kind {
                fn meta(&self) -> &ObjectMeta {
                    &self.metadata
                }

                fn conditions(&self) -> &[ObjectCondition] {
                    self.status
                        .as_ref()
                        .map(|status| status.conditions.as_slice())
                        .unwrap_or_default()
                }
            }
        )+
    };
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "scylla.scylladb.com",
    version = "v1alpha1",
    kind = "ScyllaDBDatacenter",
    namespaced,
    status = "RolloutStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ScyllaDBDatacenterSpec {
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack_template: Option<RackTemplate>,
    #[serde(default)]
    pub racks: Vec<RackSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RackTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RackSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScyllaDBDatacenter {
    /// The datacenter name used for gossip, which defaults to the object name.
    pub fn gossip_datacenter_name(&self) -> &str {
        self.spec
            .datacenter_name
            .as_deref()
            .or(self.metadata.name.as_deref())
            .unwrap_or_default()
    }

    /// Nodes of `rack`; the rack overrides the rack template.
    pub fn rack_node_count(&self, rack: &RackSpec) -> Option<i32> {
        rack.nodes.or_else(|| {
            self.spec
                .rack_template
                .as_ref()
                .and_then(|template| template.nodes)
        })
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "pausing.scylladb.com",
    version = "v1alpha1",
    kind = "ScyllaDBDatacenterPool",
    namespaced,
    status = "RolloutStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ScyllaDBDatacenterPoolSpec {
    pub template: ScyllaDBDatacenterTemplate,
    /// Number of pre-warmed datacenters kept ready.
    pub capacity: i32,
    /// Upper bound of datacenters in the pool.
    pub limit: i32,
    pub proxy_storage_class_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScyllaDBDatacenterTemplate {
    pub spec: ScyllaDBDatacenterSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "pausing.scylladb.com",
    version = "v1alpha1",
    kind = "PausableScyllaDBDatacenter",
    namespaced,
    status = "RolloutStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PausableScyllaDBDatacenterSpec {
    #[serde(rename = "scyllaDBDatacenterPoolName")]
    pub scylla_db_datacenter_pool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose_options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "pausing.scylladb.com",
    version = "v1alpha1",
    kind = "ScyllaDBDatacenterClaim",
    namespaced,
    status = "ScyllaDBDatacenterClaimStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ScyllaDBDatacenterClaimSpec {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScyllaDBDatacenterClaimStatus {
    /// The datacenter currently bound to the claim.
    #[serde(
        rename = "scyllaDBDatacenterName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub scylla_db_datacenter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ObjectCondition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl_has_conditions!(
    ScyllaDBDatacenter,
    ScyllaDBDatacenterPool,
    PausableScyllaDBDatacenter
);
