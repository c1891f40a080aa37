//! The node-local path resolver. Given a destination PVC and
//! a node, returns the host filesystem path of its CSI bind mount inside the
//! kubelet tree, creating a placeholder pod to force attachment when no pod
//! currently mounts the volume.

use crate::cluster_client::ClusterClient;
use crate::util::Error;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use std::time::Duration;
use tokio::time::sleep;

const PLACEHOLDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PLACEHOLDER_TIMEOUT: Duration = Duration::from_secs(300);

pub const PLACEHOLDER_LABEL: &str = "dr-syncer.io/placeholder";

/// Formats the kubelet-tree CSI bind-mount path for a bound PV.
pub fn csi_mount_path(pod_uid: &str, pv_id: &str) -> String {
    format!("/var/lib/kubelet/pods/{pod_uid}/volumes/kubernetes.io~csi/{pv_id}/mount")
}

/// A cleanup handle guaranteeing a created placeholder pod is torn down.
/// The session is required to invoke it on every exit path, so a session
/// never leaves a placeholder behind while reporting a terminal state.
pub struct PlaceholderHandle {
    namespace: String,
    pod_name: Option<String>,
}

impl PlaceholderHandle {
    fn none(namespace: &str) -> Self {
        Self { namespace: namespace.to_string(), pod_name: None }
    }

    pub async fn cleanup(self, cluster: &ClusterClient) -> Result<(), Error> {
        if let Some(name) = self.pod_name {
            let api: Api<Pod> = Api::namespaced(cluster.client(), &self.namespace);
            api.delete(&name, &DeleteParams::default()).await.ok();
        }
        Ok(())
    }
}

pub struct ResolvedPath {
    pub host_path: String,
    pub node: String,
    pub cleanup: PlaceholderHandle,
}

/// Locates a pod on `node` already mounting `pvc_name` and returns its uid,
/// or `None` if no such pod exists.
async fn find_mounting_pod(cluster: &ClusterClient, namespace: &str, node: &str, pvc_name: &str) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let pods = api
        .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
        .await?;
    for pod in pods.items {
        let mounts_pvc = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(|vols| {
                vols.iter().any(|v| {
                    v.persistent_volume_claim
                        .as_ref()
                        .map(|c| c.claim_name == pvc_name)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if mounts_pvc {
            return Ok(Some(pod));
        }
    }
    Ok(None)
}

async fn bound_pv_id(cluster: &ClusterClient, namespace: &str, pvc_name: &str) -> Result<String, Error> {
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    let api: Api<PersistentVolumeClaim> = Api::namespaced(cluster.client(), namespace);
    let pvc = api.get(pvc_name).await?;
    pvc.spec
        .and_then(|s| s.volume_name)
        .ok_or_else(|| Error::PathResolution(format!("PVC {pvc_name} is not yet bound")))
}

fn placeholder_pod_spec(name: &str, node: &str, pvc_name: &str) -> Pod {
    use k8s_openapi::api::core::v1::{Container, PodSpec, Volume, VolumeMount, PersistentVolumeClaimVolumeSource};
    use std::collections::BTreeMap;

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(PLACEHOLDER_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "placeholder".to_string(),
                image: Some("busybox:stable".to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name.to_string(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn wait_for_running(cluster: &ClusterClient, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let deadline = tokio::time::Instant::now() + PLACEHOLDER_TIMEOUT;
    loop {
        let pod = api.get(name).await?;
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase == Some("Running") {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::PlaceholderTimeout(format!(
                "placeholder pod {name} did not reach Running within {:?}",
                PLACEHOLDER_TIMEOUT
            )));
        }
        sleep(PLACEHOLDER_POLL_INTERVAL).await;
    }
}

/// Resolves the host path of `pvc_name`'s CSI mount on `node`. Takes the
/// fast path when an existing pod already mounts the volume there;
/// otherwise creates a placeholder, waits for it to run, and falls back to
/// the fast path.
pub async fn resolve(cluster: &ClusterClient, namespace: &str, node: &str, pvc_name: &str) -> Result<ResolvedPath, Error> {
    if let Some(pod) = find_mounting_pod(cluster, namespace, node, pvc_name).await? {
        let pod_uid = pod.metadata.uid.ok_or_else(|| Error::PathResolution("pod missing uid".to_string()))?;
        let pv_id = bound_pv_id(cluster, namespace, pvc_name).await?;
        return Ok(ResolvedPath {
            host_path: csi_mount_path(&pod_uid, &pv_id),
            node: node.to_string(),
            cleanup: PlaceholderHandle::none(namespace),
        });
    }

    let placeholder_name = format!("dr-syncer-placeholder-{}", uuid::Uuid::new_v4());
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let pod_spec = placeholder_pod_spec(&placeholder_name, node, pvc_name);
    api.create(&PostParams::default(), &pod_spec).await?;
    wait_for_running(cluster, namespace, &placeholder_name).await?;

    let pod = find_mounting_pod(cluster, namespace, node, pvc_name)
        .await?
        .ok_or_else(|| Error::PathResolution(format!("PATH-NOT-FOUND: placeholder {placeholder_name} did not register a mount")))?;
    let pod_uid = pod.metadata.uid.ok_or_else(|| Error::PathResolution("pod missing uid".to_string()))?;
    let pv_id = bound_pv_id(cluster, namespace, pvc_name).await?;

    Ok(ResolvedPath {
        host_path: csi_mount_path(&pod_uid, &pv_id),
        node: node.to_string(),
        cleanup: PlaceholderHandle { namespace: namespace.to_string(), pod_name: Some(placeholder_name) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csi_mount_path_matches_kubelet_tree_layout() {
        let path = csi_mount_path("pod-uid-1", "pvc-abc");
        assert_eq!(
            path,
            "/var/lib/kubelet/pods/pod-uid-1/volumes/kubernetes.io~csi/pvc-abc/mount"
        );
    }

    #[test]
    fn placeholder_pod_spec_targets_the_requested_node_and_pvc() {
        let pod = placeholder_pod_spec("ph-1", "node-a", "data-dr");
        assert_eq!(pod.spec.as_ref().unwrap().node_name.as_deref(), Some("node-a"));
        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "data-dr"
        );
        assert!(pod.metadata.labels.unwrap().contains_key(PLACEHOLDER_LABEL));
    }
}
