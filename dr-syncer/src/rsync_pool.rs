//! The rsync pool. A DaemonSet of privileged, host-networked
//! pods on every destination node, each bind-mounting the kubelet tree and
//! the agent key secret. Acts as the data-plane capability surface sync
//! sessions exec into.

use crate::cluster_client::ClusterClient;
use crate::util::Error;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, PodTemplateSpec, SecretVolumeSource,
    Toleration, Volume, VolumeMount,
};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use std::collections::BTreeMap;

const POOL_LABEL: &str = "dr-syncer.io/component";
const POOL_LABEL_VALUE: &str = "rsync-pool";
const KUBELET_HOST_PATH: &str = "/var/lib/kubelet";
const AGENT_KEY_MOUNT_PATH: &str = "/etc/dr-syncer/agent-key";
pub const FIELD_MANAGER: &str = "dr-syncer-rsync-pool";

pub struct PoolConfig {
    pub namespace: String,
    pub name: String,
    pub image: String,
    pub agent_key_secret: String,
    pub ssh_port: u16,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

fn pool_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(POOL_LABEL.to_string(), POOL_LABEL_VALUE.to_string())])
}

/// Builds the declared DaemonSet spec for a pool config. Pure, so the
/// "no gratuitous restart" invariant below can diff two calls' output
/// without touching a cluster.
pub fn desired_daemonset(config: &PoolConfig) -> DaemonSet {
    let labels = pool_labels();
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    node_selector: Some(config.node_selector.clone()),
                    tolerations: Some(config.tolerations.clone()),
                    containers: vec![Container {
                        name: "agent".to_string(),
                        image: Some(config.image.clone()),
                        security_context: Some(k8s_openapi::api::core::v1::SecurityContext {
                            privileged: Some(true),
                            run_as_user: Some(0),
                            ..Default::default()
                        }),
                        ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                            container_port: config.ssh_port as i32,
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "kubelet".to_string(),
                                mount_path: KUBELET_HOST_PATH.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "agent-key".to_string(),
                                mount_path: AGENT_KEY_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "kubelet".to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: KUBELET_HOST_PATH.to_string(),
                                type_: None,
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "agent-key".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(config.agent_key_secret.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Whether `desired` differs from `existing` in an observable field
/// (container image, env, volumes, annotations). If nothing observable
/// changed, the reconciler must leave the existing object alone rather than
/// issuing an update that would bounce every pool pod.
pub fn needs_update(existing: &DaemonSet, desired: &DaemonSet) -> bool {
    let existing_template = existing.spec.as_ref().map(|s| &s.template);
    let desired_template = desired.spec.as_ref().map(|s| &s.template);
    existing_template != desired_template
}

/// Reconciles the pool DaemonSet against the desired spec, applying only if
/// [`needs_update`] says so (or the object doesn't exist yet).
pub async fn reconcile(cluster: &ClusterClient, config: &PoolConfig) -> Result<(), Error> {
    let api: Api<DaemonSet> = Api::namespaced(cluster.client(), &config.namespace);
    let desired = desired_daemonset(config);
    let existing = match api.get(&config.name).await {
        Ok(ds) => Some(ds),
        Err(kube::Error::Api(e)) if e.code == 404 => None,
        Err(e) => return Err(e.into()),
    };
    match existing {
        Some(existing) if !needs_update(&existing, &desired) => Ok(()),
        _ => {
            let patch = Patch::Apply(&desired);
            api.patch(&config.name, &PatchParams::apply(FIELD_MANAGER).force(), &patch).await?;
            Ok(())
        }
    }
}

/// Looks up a running pool pod scheduled onto `node`, the capability
/// surface sync sessions exec rsync through.
pub async fn pool_pod_on_node(cluster: &ClusterClient, namespace: &str, node: &str) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(cluster.client(), namespace);
    let selector = format!("{POOL_LABEL}={POOL_LABEL_VALUE}");
    let pods = api
        .list(&ListParams::default().labels(&selector).fields(&format!("spec.nodeName={node}")))
        .await?;
    Ok(pods.items.into_iter().find(|p| {
        p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig {
            namespace: "dr-syncer-system".to_string(),
            name: "dr-syncer-rsync-pool".to_string(),
            image: "dr-syncer/rsync-agent:v1".to_string(),
            agent_key_secret: "dr-syncer-agent-key-dr-west".to_string(),
            ssh_port: 2222,
            node_selector: BTreeMap::new(),
            tolerations: vec![],
        }
    }

    #[test]
    fn desired_daemonset_mounts_kubelet_tree_and_agent_key() {
        let ds = desired_daemonset(&config());
        let container = &ds.spec.unwrap().template.spec.unwrap().containers[0];
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == KUBELET_HOST_PATH));
        assert!(mounts.iter().any(|m| m.mount_path == AGENT_KEY_MOUNT_PATH));
        assert_eq!(container.security_context.as_ref().unwrap().privileged, Some(true));
    }

    #[test]
    fn identical_desired_specs_need_no_update() {
        let a = desired_daemonset(&config());
        let b = desired_daemonset(&config());
        assert!(!needs_update(&a, &b));
    }

    #[test]
    fn image_change_requires_update() {
        let existing = desired_daemonset(&config());
        let mut cfg = config();
        cfg.image = "dr-syncer/rsync-agent:v2".to_string();
        let desired = desired_daemonset(&cfg);
        assert!(needs_update(&existing, &desired));
    }

    #[test]
    fn agent_key_rotation_bumps_template_and_requires_update() {
        let existing = desired_daemonset(&config());
        let mut cfg = config();
        cfg.agent_key_secret = "dr-syncer-agent-key-dr-west-2".to_string();
        let desired = desired_daemonset(&cfg);
        assert!(needs_update(&existing, &desired));
    }
}
