//! Conditions the benchmark waits for.
//!
//! All of them have the [`utils::wait::ConditionFn`] shape: `Ok(false)` means
//! "not yet", `Err` means the observed object makes no sense and waiting longer
//! won't help.

use anyhow::{Context, bail};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use strum_macros::EnumString;

use crate::crd::{HasConditions, ObjectCondition};
use crate::naming::DELAYED_STORAGE_PROXY_PVC_REF_ANNOTATION;

pub const AVAILABLE_CONDITION: &str = "Available";
pub const PROGRESSING_CONDITION: &str = "Progressing";
pub const DEGRADED_CONDITION: &str = "Degraded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Status of the condition of type `type_` reported for the current
/// generation, or `None` if there's no such condition yet.
fn current_condition_status<K: HasConditions>(
    obj: &K,
    type_: &str,
) -> anyhow::Result<Option<ConditionStatus>> {
    let generation = obj
        .meta()
        .generation
        .context("object has no metadata.generation")?;
    let condition = obj
        .conditions()
        .iter()
        .find(|c| c.type_ == type_ && c.observed_generation == Some(generation));
    let Some(ObjectCondition { status, .. }) = condition else {
        return Ok(None);
    };
    match status.parse() {
        Ok(status) => Ok(Some(status)),
        Err(_) => bail!("condition {type_:?} has unknown status {status:?}"),
    }
}

/// Available, not progressing and not degraded, all as of the current
/// generation.
pub fn is_rolled_out<K: HasConditions>(obj: &K) -> anyhow::Result<bool> {
    let expectations = [
        (AVAILABLE_CONDITION, ConditionStatus::True),
        (PROGRESSING_CONDITION, ConditionStatus::False),
        (DEGRADED_CONDITION, ConditionStatus::False),
    ];
    for (type_, expected) in expectations {
        if current_condition_status(obj, type_)? != Some(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn is_available<K: HasConditions>(obj: &K) -> anyhow::Result<bool> {
    Ok(current_condition_status(obj, AVAILABLE_CONDITION)? == Some(ConditionStatus::True))
}

/// A pod that already terminated will never run again.
pub fn is_pod_running(pod: &Pod) -> anyhow::Result<bool> {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => Ok(true),
        Some(phase @ ("Succeeded" | "Failed")) => {
            bail!("pod ran to completion unexpectedly (phase {phase})")
        }
        _ => Ok(false),
    }
}

pub fn is_pod_ready(pod: &Pod) -> anyhow::Result<bool> {
    Ok(pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        }))
}

pub fn is_pod_running_and_ready(pod: &Pod) -> anyhow::Result<bool> {
    Ok(is_pod_running(pod)? && is_pod_ready(pod)?)
}

pub fn is_pvc_bound(pvc: &PersistentVolumeClaim) -> anyhow::Result<bool> {
    Ok(pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .is_some_and(|name| !name.is_empty()))
}

/// The proxy CSI driver annotates a backend PVC while a proxy PVC is bound to
/// it; the annotation goes away once the proxy volume is released.
pub fn is_backend_pvc_unbound_from_proxy_pvc(pvc: &PersistentVolumeClaim) -> anyhow::Result<bool> {
    Ok(!pvc
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(DELAYED_STORAGE_PROXY_PVC_REF_ANNOTATION)))
}

pub fn is_volume_attached(va: &VolumeAttachment) -> anyhow::Result<bool> {
    Ok(va.status.as_ref().is_some_and(|s| s.attached))
}
