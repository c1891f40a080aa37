//! Cutover and failback planning. Pure planning: given the declaration's
//! recorded `deploymentScales`, decide which (kind, name) pairs need their
//! replica count flipped on which side. The reconciler
//! (`namespace_mapping::actions`) turns a [`ScaleIntent`] into an actual
//! patch against the right `ClusterClient`; nothing here touches a cluster.

use dr_syncer_types::DeploymentScaleRecord;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleIntent {
    pub side: Side,
    pub kind: String,
    pub name: String,
    pub replicas: i32,
}

/// Cutover: stop the source, start the destination at its originally
/// recorded replica count.
pub fn plan_cutover(deployment_scales: &BTreeMap<String, DeploymentScaleRecord>) -> Vec<ScaleIntent> {
    let mut out = Vec::new();
    for record in deployment_scales.values() {
        out.push(ScaleIntent { side: Side::Source, kind: record.kind.clone(), name: record.name.clone(), replicas: 0 });
        out.push(ScaleIntent {
            side: Side::Destination,
            kind: record.kind.clone(),
            name: record.name.clone(),
            replicas: record.original_replicas,
        });
    }
    out
}

/// Failback: the reverse of cutover, destination back to zero, source
/// restored to its originally recorded count.
pub fn plan_failback(deployment_scales: &BTreeMap<String, DeploymentScaleRecord>) -> Vec<ScaleIntent> {
    let mut out = Vec::new();
    for record in deployment_scales.values() {
        out.push(ScaleIntent {
            side: Side::Source,
            kind: record.kind.clone(),
            name: record.name.clone(),
            replicas: record.original_replicas,
        });
        out.push(ScaleIntent { side: Side::Destination, kind: record.kind.clone(), name: record.name.clone(), replicas: 0 });
    }
    out
}

/// Whether a trigger annotation's value changed since the last-observed
/// value recorded in status, the same "manual trigger" detection used for
/// manual-mode reconciles.
pub fn trigger_changed(last_seen: Option<&str>, current: Option<&str>) -> bool {
    match (last_seen, current) {
        (None, Some(_)) => true,
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}
