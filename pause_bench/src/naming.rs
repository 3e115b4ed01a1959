//! Names of objects the operators derive from the objects we create.

/// Container running ScyllaDB in every member pod.
pub const SCYLLA_CONTAINER_NAME: &str = "scylla";

/// Set by the proxy CSI driver on a backend PVC while a proxy PVC is bound to it.
pub const DELAYED_STORAGE_PROXY_PVC_REF_ANNOTATION: &str =
    "proxy.csi.scylladb.com/delayed-storage-proxy-persistent-volume-claim-ref";

/// Set by us on a proxy PVC to tell the proxy CSI driver which backend PVC to
/// mount behind it.
pub const DELAYED_STORAGE_BACKEND_PVC_REF_ANNOTATION: &str =
    "proxy.csi.scylladb.com/delayed-storage-backend-persistent-volume-claim-ref";

/// Pod condition set by the ingress controller once it routes CQL traffic to
/// the member.
pub const INGRESS_CONTROLLER_MEMBER_CONDITION_TYPE: &str =
    "pausing.scylladb.com/IngressControllerReady";

pub const TOPOLOGY_ZONE_LABEL: &str = "topology.kubernetes.io/zone";

pub fn stateful_set_name_for_rack(sdc_name: &str, datacenter_name: &str, rack_name: &str) -> String {
    format!("{sdc_name}-{datacenter_name}-{rack_name}")
}

/// Member pods are named after their StatefulSet and ordinal.
pub fn member_pod_name(sdc_name: &str, datacenter_name: &str, rack_name: &str, ordinal: u32) -> String {
    format!(
        "{}-{ordinal}",
        stateful_set_name_for_rack(sdc_name, datacenter_name, rack_name)
    )
}

/// PVC of a member pod managed directly by Scylla Operator.
pub fn pvc_name_for_pod(pod_name: &str) -> String {
    format!("data-{pod_name}")
}

/// The pausable operator claims a datacenter under the name of the pausable
/// datacenter itself.
pub fn claim_name_for_pausable_datacenter(psdc_name: &str) -> String {
    psdc_name.to_string()
}

/// Backend PVC holding the data of a pausable datacenter's member. It outlives
/// the datacenters that come and go from the pool.
pub fn backend_pvc_name_for_member(psdc_name: &str, rack_name: &str, ordinal: u32) -> String {
    format!("{psdc_name}-{rack_name}-{ordinal}-backend")
}

/// Secret in which Scylla Operator publishes the CQL connection configs of a
/// datacenter, one per DNS domain.
pub fn local_cql_connection_configs_name(sdc_name: &str) -> String {
    format!("{sdc_name}-local-cql-connection-configs-admin")
}

/// Domain under which a plainly deployed datacenter exposes its nodes.
pub fn public_dns_domain(namespace: &str) -> String {
    format!("{namespace}.public.nodes.scylladb.com")
}

/// CQL keyspaces can't contain dashes, namespaces can.
pub fn keyspace_for_namespace(namespace: &str) -> String {
    namespace.replace('-', "_")
}
