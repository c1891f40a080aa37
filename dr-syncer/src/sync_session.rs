//! The sync session orchestrator. A per-PVC state machine
//! that pairs a source-side rsync producer with a destination pool pod,
//! exchanges ephemeral keys, drives rsync, and tears everything down on
//! every exit path.

use crate::cluster_client::ClusterClient;
use crate::node_resolver::{self, PlaceholderHandle};
use crate::rsync_pool;
use crate::ssh_keys::{PodExec, SecretStore, SshKeyManager};
use crate::util::Error;
use dr_syncer_types::PvcSyncConfig;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PersistentVolumeClaimVolumeSource, Volume, VolumeMount};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_AGENT_IMAGE: &str = "dr-syncer/rsync-agent:latest";
pub const PRODUCER_LABEL: &str = "dr-syncer.io/component";
pub const PRODUCER_LABEL_VALUE: &str = "rsync-producer";

/// The source-side rsync endpoint a session transfers from. A
/// [`Transient`] pod is one this session launched itself and
/// must delete on every exit path; an [`ExistingAgent`] pod belongs to
/// standing infrastructure on the source node and is left alone.
pub enum ProducerPod {
    Transient { namespace: String, name: String },
    ExistingAgent { name: String },
}

impl ProducerPod {
    pub fn pod_name(&self) -> &str {
        match self {
            ProducerPod::Transient { name, .. } => name,
            ProducerPod::ExistingAgent { name } => name,
        }
    }
}

fn producer_pod_spec(name: &str, node: &str, pvc_name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(PRODUCER_LABEL.to_string(), PRODUCER_LABEL_VALUE.to_string())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "producer".to_string(),
                image: Some(image.to_string()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name.to_string(),
                    read_only: Some(true),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Launches a transient rsync producer pod into the source namespace,
/// colocated (via `nodeName`) with the source PVC's mount. Callers should
/// prefer an existing agent pod on the node when one is already running;
/// this is the fallback for when none exists.
pub async fn launch_transient_producer(
    cluster: &ClusterClient,
    namespace: &str,
    node: &str,
    pvc_name: &str,
    image: &str,
) -> Result<ProducerPod, Error> {
    let name = format!("dr-syncer-producer-{}", Uuid::new_v4());
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    api.create(&PostParams::default(), &producer_pod_spec(&name, node, pvc_name, image)).await?;
    Ok(ProducerPod::Transient { namespace: namespace.to_string(), name })
}

async fn delete_producer(cluster: &ClusterClient, producer: &ProducerPod) -> Result<(), Error> {
    if let ProducerPod::Transient { namespace, name } = producer {
        let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
        api.delete(name, &DeleteParams::default()).await.ok();
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    KeysExchanged,
    Transferring,
    Completed,
    Failed,
}

/// A node's candidacy to host the source-side rsync producer: how many
/// healthy-ready candidate pods exist there already.
#[derive(Clone, Debug)]
pub struct NodeCandidate {
    pub node: String,
    pub healthy_ready_producers: u32,
}

/// Picks the source node for a ReadWriteMany PVC with multiple mounting
/// nodes: greatest count of healthy-ready producer candidates, then
/// lexicographically smallest node name.
pub fn pick_source_node(candidates: &[NodeCandidate]) -> Option<&str> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.healthy_ready_producers
                .cmp(&b.healthy_ready_producers)
                .then_with(|| b.node.cmp(&a.node))
        })
        .map(|c| c.node.as_str())
}

/// Builds the rsync invocation run inside the destination pool pod. Pure
/// string assembly so option-injection is testable without a live exec.
pub fn rsync_argv(
    pvc_config: &PvcSyncConfig,
    ssh_port: u16,
    ephemeral_key_path: &str,
    source_endpoint: &str,
    source_path: &str,
    destination_path: &str,
) -> Vec<String> {
    let mut argv = vec!["rsync".to_string(), "-az".to_string()];
    if let Some(limit) = pvc_config.bandwidth_limit_kbps {
        argv.push(format!("--bwlimit={limit}"));
    }
    for exclude in &pvc_config.exclude_paths {
        argv.push(format!("--exclude={exclude}"));
    }
    argv.extend(pvc_config.rsync_options.iter().cloned());
    argv.push("-e".to_string());
    argv.push(format!(
        "ssh -o StrictHostKeyChecking=no -p {ssh_port} -i {ephemeral_key_path}"
    ));
    argv.push(format!("root@{source_endpoint}:{source_path}/"));
    argv.push(format!("{destination_path}/"));
    argv
}

pub struct Session {
    pub id: String,
    pub source_namespace: String,
    pub source_pvc: String,
    pub destination_namespace: String,
    pub destination_pvc: String,
    pub state: SessionState,
}

impl Session {
    pub fn new(source_namespace: &str, source_pvc: &str, destination_namespace: &str, destination_pvc: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_namespace: source_namespace.to_string(),
            source_pvc: source_pvc.to_string(),
            destination_namespace: destination_namespace.to_string(),
            destination_pvc: destination_pvc.to_string(),
            state: SessionState::Created,
        }
    }
}

/// Tracks destination (namespace, PVC) pairs with a non-terminal session, so
/// a new session can be aborted with `SESSION-CONFLICT` when one is already
/// running against the same destination PVC.
#[derive(Default)]
pub struct SessionRegistry {
    in_flight: std::collections::BTreeSet<(String, String)>,
}

impl SessionRegistry {
    pub fn try_begin(&mut self, destination_namespace: &str, destination_pvc: &str) -> Result<(), Error> {
        let key = (destination_namespace.to_string(), destination_pvc.to_string());
        if self.in_flight.contains(&key) {
            return Err(Error::SessionConflict(format!(
                "SESSION-CONFLICT: a sync session for {destination_namespace}/{destination_pvc} is already in progress"
            )));
        }
        self.in_flight.insert(key);
        Ok(())
    }

    pub fn end(&mut self, destination_namespace: &str, destination_pvc: &str) {
        self.in_flight.remove(&(destination_namespace.to_string(), destination_pvc.to_string()));
    }
}

lazy_static::lazy_static! {
    /// Process-wide registry of non-terminal sessions, keyed by destination
    /// (namespace, PVC). Shared across every declaration, not just the one
    /// a pass belongs to: two `NamespaceMapping`s that happen to target the
    /// same destination PVC must still exclude each other.
    static ref GLOBAL_SESSION_REGISTRY: std::sync::Mutex<SessionRegistry> =
        std::sync::Mutex::new(SessionRegistry::default());
}

/// A held slot in [`GLOBAL_SESSION_REGISTRY`] for one destination (namespace,
/// PVC). Releases on drop so every exit path of [`run`], success, error, or
/// an early `?` before `run` is even reached, frees the slot exactly once.
pub struct SessionGuard {
    namespace: String,
    pvc: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        GLOBAL_SESSION_REGISTRY.lock().unwrap().end(&self.namespace, &self.pvc);
    }
}

/// Reserves the (destination_namespace, destination_pvc) slot for a new
/// session, failing with [`Error::SessionConflict`] if one is already
/// non-terminal for the same destination PVC.
pub fn begin_global_session(destination_namespace: &str, destination_pvc: &str) -> Result<SessionGuard, Error> {
    GLOBAL_SESSION_REGISTRY.lock().unwrap().try_begin(destination_namespace, destination_pvc)?;
    Ok(SessionGuard { namespace: destination_namespace.to_string(), pvc: destination_pvc.to_string() })
}

/// Runs a full session end to end. On every exit path, success, rsync
/// failure, or a panic-free early return, cleanup revokes the authorized
/// key, drops the ephemeral pair, and releases any placeholder pod created
/// along the way.
#[allow(clippy::too_many_arguments)]
pub async fn run<S: SecretStore, P: PodExec>(
    cluster: &ClusterClient,
    source_cluster: &ClusterClient,
    key_manager: &SshKeyManager<S, P>,
    session: &mut Session,
    source_cluster_name: &str,
    source_node: &str,
    destination_node: &str,
    producer: &ProducerPod,
    ssh_port: u16,
    pvc_config: &PvcSyncConfig,
    debug: bool,
) -> Result<(), Error> {
    let pool_pod = rsync_pool::pool_pod_on_node(cluster, &session.destination_namespace, destination_node)
        .await?
        .ok_or_else(|| Error::PathResolution(format!("no running pool pod on node {destination_node}")))?;
    let pool_pod_name = pool_pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::PathResolution("pool pod missing name".to_string()))?;

    let resolved = node_resolver::resolve(cluster, &session.destination_namespace, destination_node, &session.destination_pvc).await?;

    let ephemeral = key_manager.issue_ephemeral_pair()?;
    key_manager
        .authorize(source_cluster_name, producer.pod_name(), &ephemeral.public_openssh, &session.id)
        .await?;
    session.state = SessionState::KeysExchanged;

    let outcome = transfer(
        cluster,
        &pool_pod_name,
        &session.destination_namespace,
        &ephemeral.private_pem,
        ssh_port,
        pvc_config,
        source_node,
        &resolved.host_path,
    )
    .await;

    session.state = match &outcome {
        Ok(_) => SessionState::Transferring,
        Err(_) => SessionState::Failed,
    };

    let cleanup_result = cleanup(cluster, source_cluster, key_manager, session, producer, resolved.cleanup, debug, outcome.is_err()).await;

    match outcome {
        Ok(_) => {
            session.state = SessionState::Completed;
            cleanup_result?;
            Ok(())
        }
        Err(e) => {
            cleanup_result?;
            Err(e)
        }
    }
}

async fn transfer(
    cluster: &ClusterClient,
    pool_pod: &str,
    namespace: &str,
    ephemeral_private_key: &str,
    ssh_port: u16,
    pvc_config: &PvcSyncConfig,
    source_endpoint: &str,
    destination_path: &str,
) -> Result<(), Error> {
    let key_path = "/tmp/dr-syncer-ephemeral-key";
    cluster
        .exec_with_stdin(
            namespace,
            pool_pod,
            None,
            vec!["sh".to_string(), "-c".to_string(), format!("cat > {key_path} && chmod 600 {key_path}")],
            ephemeral_private_key.as_bytes(),
        )
        .await?;

    let argv = rsync_argv(pvc_config, ssh_port, key_path, source_endpoint, "/data", destination_path);
    let result = cluster.exec(namespace, pool_pod, None, argv).await?;
    if !result.success {
        return Err(Error::Exec(format!("rsync failed: {}", result.stderr)));
    }
    Ok(())
}

async fn cleanup<S: SecretStore, P: PodExec>(
    cluster: &ClusterClient,
    source_cluster: &ClusterClient,
    key_manager: &SshKeyManager<S, P>,
    session: &Session,
    producer: &ProducerPod,
    placeholder: PlaceholderHandle,
    debug: bool,
    failed: bool,
) -> Result<(), Error> {
    key_manager.revoke(producer.pod_name(), &session.id).await?;
    placeholder.cleanup(cluster).await?;
    if failed && debug {
        // Producer pod retained for postmortem inspection.
        return Ok(());
    }
    delete_producer(source_cluster, producer).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_break_prefers_more_healthy_ready_producers() {
        let candidates = vec![
            NodeCandidate { node: "node-b".to_string(), healthy_ready_producers: 1 },
            NodeCandidate { node: "node-a".to_string(), healthy_ready_producers: 3 },
        ];
        assert_eq!(pick_source_node(&candidates), Some("node-a"));
    }

    #[test]
    fn tie_break_falls_back_to_lexicographic_node_name() {
        let candidates = vec![
            NodeCandidate { node: "node-b".to_string(), healthy_ready_producers: 2 },
            NodeCandidate { node: "node-a".to_string(), healthy_ready_producers: 2 },
        ];
        assert_eq!(pick_source_node(&candidates), Some("node-a"));
    }

    #[test]
    fn pick_source_node_on_empty_candidates_is_none() {
        assert_eq!(pick_source_node(&[]), None);
    }

    #[test]
    fn rsync_argv_injects_bwlimit_and_exclude_and_user_options() {
        let mut cfg = PvcSyncConfig::default();
        cfg.bandwidth_limit_kbps = Some(1024);
        cfg.exclude_paths = vec!["*.tmp".to_string()];
        cfg.rsync_options = vec!["--delete".to_string()];
        let argv = rsync_argv(&cfg, 2222, "/tmp/key", "10.0.0.5", "/data/src", "/data/dst");
        assert!(argv.contains(&"--bwlimit=1024".to_string()));
        assert!(argv.contains(&"--exclude=*.tmp".to_string()));
        assert!(argv.contains(&"--delete".to_string()));
        assert_eq!(argv.last().unwrap(), "/data/dst/");
        assert!(argv.iter().any(|a| a == "root@10.0.0.5:/data/src/"));
    }

    #[test]
    fn rsync_argv_omits_absent_options() {
        let cfg = PvcSyncConfig::default();
        let argv = rsync_argv(&cfg, 2222, "/tmp/key", "10.0.0.5", "/data/src", "/data/dst");
        assert!(!argv.iter().any(|a| a.starts_with("--bwlimit")));
        assert!(!argv.iter().any(|a| a.starts_with("--exclude")));
    }

    #[test]
    fn session_registry_rejects_concurrent_session_for_same_destination_pvc() {
        let mut registry = SessionRegistry::default();
        registry.try_begin("ns-a-dr", "data-dr").unwrap();
        let err = registry.try_begin("ns-a-dr", "data-dr").unwrap_err();
        match err {
            Error::SessionConflict(msg) => assert!(msg.contains("SESSION-CONFLICT")),
            other => panic!("expected SessionConflict, got {other:?}"),
        }
    }

    #[test]
    fn session_registry_allows_reuse_after_end() {
        let mut registry = SessionRegistry::default();
        registry.try_begin("ns-a-dr", "data-dr").unwrap();
        registry.end("ns-a-dr", "data-dr");
        assert!(registry.try_begin("ns-a-dr", "data-dr").is_ok());
    }

    #[test]
    fn session_registry_distinguishes_different_destination_pvcs() {
        let mut registry = SessionRegistry::default();
        registry.try_begin("ns-a-dr", "data-dr").unwrap();
        assert!(registry.try_begin("ns-a-dr", "other-dr").is_ok());
    }

    #[test]
    fn global_session_guard_blocks_concurrent_sessions_for_the_same_destination_pvc() {
        let first = begin_global_session("ns-global-test", "data-dr").unwrap();
        let err = begin_global_session("ns-global-test", "data-dr").unwrap_err();
        match err {
            Error::SessionConflict(msg) => assert!(msg.contains("SESSION-CONFLICT")),
            other => panic!("expected SessionConflict, got {other:?}"),
        }
        drop(first);
        assert!(begin_global_session("ns-global-test", "data-dr").is_ok());
    }

    #[test]
    fn producer_pod_name_covers_both_variants() {
        let transient = ProducerPod::Transient { namespace: "ns".to_string(), name: "dr-syncer-producer-abc".to_string() };
        assert_eq!(transient.pod_name(), "dr-syncer-producer-abc");
        let existing = ProducerPod::ExistingAgent { name: "agent-node-1".to_string() };
        assert_eq!(existing.pod_name(), "agent-node-1");
    }
}
