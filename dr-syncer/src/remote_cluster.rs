//! Entrypoint for the `RemoteCluster` controller. Each `RemoteCluster`
//! names one destination cluster's credentials; this
//! controller ensures that cluster carries an agent SSH key pair and a
//! running rsync pool DaemonSet, and reports both in its status.

use dr_syncer_types::{ClusterMappingPhase, RemoteCluster, RemoteClusterStatus};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::cluster_client::ClusterClient;
use crate::rsync_pool::{self, PoolConfig};
use crate::ssh_keys::{KubePodExec, KubeSecretStore, SshKeyManager};
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

const POOL_NAMESPACE: &str = "dr-syncer-system";
const POOL_NAME: &str = "dr-syncer-rsync-pool";

/// Entrypoint for the `RemoteCluster` controller.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting RemoteCluster controller".color(FG1));

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dr-syncer-remote-cluster-{}", uuid::Uuid::new_v4()));
    let lease_name = "dr-syncer-remote-cluster-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams { holder_id, lease_name, lease_ttl },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        dr_syncer_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("{}", format!("leader election renew/acquire failed: {e}").red());
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "acquired leadership; starting RemoteCluster controller".color(FG2));
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<RemoteCluster> = Api::namespaced(client_for_controller, &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping RemoteCluster controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    fn new(client: Client) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData { client, metrics: ControllerMetrics::new("remote_cluster") }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client }
        }
    }
}

async fn reconcile(instance: Arc<RemoteCluster>, context: Arc<ContextData>) -> Result<Action, Error> {
    let hub_client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| Error::UserInput("RemoteCluster must be namespaced".to_string()))?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.reconcile_counter.with_label_values(&[&name, &namespace]).inc();
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let result = run_pass(&hub_client, &namespace, &name, &instance).await;

    let status = match &result {
        Ok(fingerprint) => RemoteClusterStatus {
            phase: ClusterMappingPhase::Ready,
            message: None,
            agent_key_fingerprint: Some(fingerprint.clone()),
        },
        Err(e) => RemoteClusterStatus {
            phase: ClusterMappingPhase::Error,
            message: Some(e.to_string()),
            agent_key_fingerprint: None,
        },
    };
    crate::util::patch::patch_status(hub_client.clone(), instance.as_ref(), |s: &mut RemoteClusterStatus| {
        *s = status.clone();
    })
    .await?;

    #[cfg(feature = "metrics")]
    context
        .metrics
        .write_histogram
        .with_label_values(&[&name, &namespace, "reconcile"])
        .observe(start.elapsed().as_secs_f64());

    result?;
    Ok(Action::requeue(PROBE_INTERVAL))
}

/// Resolves the destination cluster's client, ensures its agent key pair
/// exists, and reconciles the rsync pool DaemonSet against it. Returns the
/// agent key's fingerprint.
async fn run_pass(hub_client: &Client, namespace: &str, name: &str, instance: &RemoteCluster) -> Result<String, Error> {
    let secret_name = &instance.spec.key_material_secret_ref.name;
    let secret_namespace = instance
        .spec
        .key_material_secret_ref
        .namespace
        .as_deref()
        .unwrap_or(namespace);

    let secrets: Api<Secret> = Api::namespaced(hub_client.clone(), secret_namespace);
    let secret = secrets.get(secret_name).await?;
    let data = secret
        .data
        .ok_or_else(|| Error::UserInput(format!("secret {secret_name} has no data")))?;
    let bytes = data
        .get("kubeconfig")
        .ok_or_else(|| Error::UserInput(format!("secret {secret_name} is missing key kubeconfig")))?;
    let kubeconfig_yaml = String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::UserInput(format!("secret {secret_name} key kubeconfig is not valid UTF-8: {e}")))?;

    let destination = ClusterClient::from_kubeconfig(&kubeconfig_yaml).await?;

    let key_manager = SshKeyManager::new(
        KubeSecretStore::new(destination.client(), POOL_NAMESPACE),
        KubePodExec::new(&destination, POOL_NAMESPACE),
    );
    key_manager.ensure_agent_pair(name).await?;
    let fingerprint = key_manager
        .agent_fingerprint(name)
        .await?
        .ok_or_else(|| Error::SshKey(format!("KEY-MISSING: no agent pair for cluster {name} right after ensuring one")))?;

    let pool_config = PoolConfig {
        namespace: POOL_NAMESPACE.to_string(),
        name: POOL_NAME.to_string(),
        image: instance.spec.agent_image.clone(),
        agent_key_secret: format!("dr-syncer-agent-key-{name}"),
        ssh_port: instance.spec.agent_port,
        node_selector: instance.spec.node_selector.clone(),
        tolerations: instance.spec.tolerations.clone(),
    };
    rsync_pool::reconcile(&destination, &pool_config).await?;

    Ok(fingerprint)
}

fn on_error(instance: Arc<RemoteCluster>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("reconciliation error for {}: {error}", instance.name_any()).red());
    Action::requeue(Duration::from_secs(5))
}
