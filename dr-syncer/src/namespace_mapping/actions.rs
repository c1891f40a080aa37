//! The replication reconciler's write phase: transforms
//! one source object and applies it to the destination, handling the
//! `immutable-resource-policy` when the destination object already exists
//! with a conflicting immutable field.

use crate::cluster_client::ClusterClient;
use crate::ssh_keys::{KubePodExec, KubeSecretStore, SshKeyManager};
use crate::sync_session::{self, NodeCandidate};
use crate::transform;
use crate::util::Error;
use dr_syncer_common::annotations;
use dr_syncer_types::{ErrorClass, ImmutableResourcePolicy, PvcSyncConfig};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::core::ApiResource;
use kube::ResourceExt;
use serde_json::json;
use std::time::Duration;

pub const FIELD_MANAGER: &str = "dr-syncer-namespace-mapping";

/// Outcome of syncing a single resource, folded into `resourceStatus` by the
/// caller via `status::record_resource_outcome`.
pub enum ResourceOutcome {
    Synced,
    Failed(ErrorClass, String),
    /// Source object vanished between discovery and fetch, or carries the
    /// `dr-syncer.io/ignore=true` label.
    Skipped,
}

fn is_ignored(obj: &kube::api::DynamicObject) -> bool {
    obj.labels().get(annotations::IGNORE).map(|v| v == "true").unwrap_or(false)
}

/// Transforms and applies one source object to the destination, driving the
/// declaration's immutable-resource-policy on conflict. Never returns an
/// `Err`: every failure is folded into [`ResourceOutcome::Failed`] so a
/// single resource's failure can't abort the pass.
#[allow(clippy::too_many_arguments)]
pub async fn sync_resource(
    source: &ClusterClient,
    destination: &ClusterClient,
    ar: &ApiResource,
    kind: &str,
    source_namespace: &str,
    destination_namespace: &str,
    name: &str,
    pvc_config: &PvcSyncConfig,
    scale_to_zero: bool,
    immutable_policy: ImmutableResourcePolicy,
    drain_timeout: Duration,
) -> ResourceOutcome {
    match sync_resource_inner(
        source,
        destination,
        ar,
        kind,
        source_namespace,
        destination_namespace,
        name,
        pvc_config,
        scale_to_zero,
        immutable_policy,
        drain_timeout,
    )
    .await
    {
        Ok(true) => ResourceOutcome::Synced,
        Ok(false) => ResourceOutcome::Skipped,
        Err(e) => ResourceOutcome::Failed(crate::util::classify(&e), e.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn sync_resource_inner(
    source: &ClusterClient,
    destination: &ClusterClient,
    ar: &ApiResource,
    kind: &str,
    source_namespace: &str,
    destination_namespace: &str,
    name: &str,
    pvc_config: &PvcSyncConfig,
    scale_to_zero: bool,
    immutable_policy: ImmutableResourcePolicy,
    drain_timeout: Duration,
) -> Result<bool, Error> {
    let Some(source_obj) = source.get(ar, source_namespace, name).await? else {
        return Ok(false);
    };
    if is_ignored(&source_obj) {
        return Ok(false);
    }

    let mut transformed = transform::transform_resource(&source_obj, destination_namespace, pvc_config);
    if scale_to_zero && matches!(kind, "Deployment" | "StatefulSet") {
        transform::zero_replicas(&mut transformed);
    }

    match destination.apply(ar, destination_namespace, &transformed, FIELD_MANAGER).await {
        Ok(_) => Ok(true),
        Err(Error::ImmutableConflict(_)) => {
            apply_immutable_policy(destination, ar, destination_namespace, &transformed, immutable_policy, drain_timeout).await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Handles an immutable-field conflict the initial apply hit, per the
/// declaration's `immutable-resource-policy`.
async fn apply_immutable_policy(
    destination: &ClusterClient,
    ar: &ApiResource,
    namespace: &str,
    desired: &kube::api::DynamicObject,
    policy: ImmutableResourcePolicy,
    drain_timeout: Duration,
) -> Result<(), Error> {
    let name = desired.name_any();
    match policy {
        ImmutableResourcePolicy::NoChange => {
            eprintln!("dr-syncer: {namespace}/{name} has an immutable-field diff; no-change policy leaves it as-is");
            Ok(())
        }
        ImmutableResourcePolicy::PartialUpdate => {
            let patch = json!({
                "metadata": { "labels": desired.labels(), "annotations": desired.metadata.annotations },
            });
            destination.merge_patch(ar, namespace, &name, patch, FIELD_MANAGER).await?;
            Ok(())
        }
        ImmutableResourcePolicy::Recreate => recreate(destination, ar, namespace, &name, desired).await,
        ImmutableResourcePolicy::RecreateWithPodDrain => {
            drain_mounting_pods(destination, namespace, &name, drain_timeout).await?;
            recreate(destination, ar, namespace, &name, desired).await
        }
        ImmutableResourcePolicy::ForceUpdate => recreate(destination, ar, namespace, &name, desired).await,
    }
}

async fn recreate(destination: &ClusterClient, ar: &ApiResource, namespace: &str, name: &str, desired: &kube::api::DynamicObject) -> Result<(), Error> {
    destination.delete(ar, namespace, name).await?;
    destination.create(ar, namespace, desired).await?;
    Ok(())
}

/// Scales `name` to zero and waits (bounded by `drain_timeout`) for its pods
/// to terminate, force-deleting whatever remains at the deadline.
async fn drain_mounting_pods(destination: &ClusterClient, namespace: &str, name: &str, drain_timeout: Duration) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(destination.client(), namespace);
    let selector = format!("app={name}");
    let deadline = tokio::time::Instant::now() + drain_timeout;
    loop {
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        if pods.items.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            for pod in pods.items {
                if let Some(pod_name) = pod.metadata.name {
                    api.delete(&pod_name, &DeleteParams { grace_period_seconds: Some(0), ..Default::default() }).await.ok();
                }
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Runs the PVC data sync session for one declaration's PVC, when
/// `sync-data=true`. Never returns an `Err` the caller can't fold into
/// `resourceStatus`.
#[allow(clippy::too_many_arguments)]
pub async fn sync_pvc_data(
    source: &ClusterClient,
    destination: &ClusterClient,
    source_cluster_name: &str,
    source_namespace: &str,
    destination_namespace: &str,
    pvc_name: &str,
    pvc_config: &PvcSyncConfig,
    debug: bool,
) -> Result<(), Error> {
    // Reserved for the whole call; dropped (and so released) on every exit
    // path, including the early `?`s below.
    let _session_guard = sync_session::begin_global_session(destination_namespace, pvc_name)?;

    let key_manager = SshKeyManager::new(
        KubeSecretStore::new(source.client(), source_namespace),
        KubePodExec::new(source, source_namespace),
    );
    key_manager.ensure_agent_pair(source_cluster_name).await?;

    let source_node = find_pvc_mount_node(source, source_namespace, pvc_name).await?;
    // The destination cluster's node topology isn't tracked by this
    // declaration; colocating on the same node name is a simplification
    // pending a `RemoteCluster`-level node map.
    let destination_node = source_node.clone();

    let producer = sync_session::launch_transient_producer(
        source,
        source_namespace,
        &source_node,
        pvc_name,
        sync_session::DEFAULT_AGENT_IMAGE,
    )
    .await?;

    let mut session = sync_session::Session::new(source_namespace, pvc_name, destination_namespace, pvc_name);

    #[cfg(feature = "metrics")]
    let metrics_label = format!("{destination_namespace}/{pvc_name}");
    #[cfg(feature = "metrics")]
    crate::util::metrics::sync_metrics().sessions_started.with_label_values(&[&metrics_label]).inc();
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = sync_session::run(
        destination,
        source,
        &key_manager,
        &mut session,
        source_cluster_name,
        &source_node,
        &destination_node,
        &producer,
        2222,
        pvc_config,
        debug,
    )
    .await;

    #[cfg(feature = "metrics")]
    {
        let outcome = if result.is_ok() { "completed" } else { "failed" };
        crate::util::metrics::sync_metrics()
            .sessions_completed
            .with_label_values(&[&metrics_label, outcome])
            .inc();
        crate::util::metrics::sync_metrics()
            .transfer_seconds
            .with_label_values(&[&metrics_label])
            .observe(started.elapsed().as_secs_f64());
    }

    result
}

/// Finds the node best suited to host the source-side rsync producer for
/// `pvc_name`: the node of whichever existing pod already mounts it, tied
/// by [`sync_session::pick_source_node`] when several do.
async fn find_pvc_mount_node(cluster: &ClusterClient, namespace: &str, pvc_name: &str) -> Result<String, Error> {
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let pods = api.list(&ListParams::default()).await?;
    let mut candidates = Vec::new();
    for pod in pods.items {
        let mounts = pod
            .spec
            .as_ref()
            .map(|s| {
                s.volumes
                    .as_ref()
                    .map(|vols| {
                        vols.iter().any(|v| {
                            v.persistent_volume_claim
                                .as_ref()
                                .map(|c| c.claim_name == pvc_name)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !mounts {
            continue;
        }
        if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
            candidates.push(NodeCandidate { node, healthy_ready_producers: 1 });
        }
    }
    sync_session::pick_source_node(&candidates)
        .map(str::to_string)
        .ok_or_else(|| Error::PathResolution(format!("PATH-NOT-FOUND: no pod mounts PVC {pvc_name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_label_is_detected() {
        let mut obj = kube::api::DynamicObject {
            types: None,
            metadata: kube::api::ObjectMeta::default(),
            data: serde_json::json!({}),
        };
        obj.metadata.labels = Some(std::collections::BTreeMap::from([(
            annotations::IGNORE.to_string(),
            "true".to_string(),
        )]));
        assert!(is_ignored(&obj));
    }

    #[test]
    fn absent_label_is_not_ignored() {
        let obj = kube::api::DynamicObject {
            types: None,
            metadata: kube::api::ObjectMeta::default(),
            data: serde_json::json!({}),
        };
        assert!(!is_ignored(&obj));
    }
}
