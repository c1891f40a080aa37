//! Entrypoint for the `ClusterMapping` controller. A
//! `ClusterMapping` just names a source/destination cluster pair and the
//! secret holding both kubeconfigs; this controller's only job is to
//! validate that secret resolves cleanly, so a broken pairing surfaces in
//! `status.phase` before any `NamespaceMapping` tries to use it.

use dr_syncer_types::{ClusterMapping, ClusterMappingPhase, ClusterMappingStatus};
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::namespace_mapping::cluster_resolve;
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `ClusterMapping` controller.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting ClusterMapping controller".color(FG1));

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dr-syncer-cluster-mapping-{}", uuid::Uuid::new_v4()));
    let lease_name = "dr-syncer-cluster-mapping-lock".to_string();
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
                println!("{}", "acquired leadership; starting ClusterMapping controller".color(FG2));
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<ClusterMapping> = Api::namespaced(client_for_controller, &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping ClusterMapping controller");
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
            ContextData { client, metrics: ControllerMetrics::new("cluster_mapping") }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client }
        }
    }
}

async fn reconcile(instance: Arc<ClusterMapping>, context: Arc<ContextData>) -> Result<Action, Error> {
    let hub_client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| Error::UserInput("ClusterMapping must be namespaced".to_string()))?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.reconcile_counter.with_label_values(&[&name, &namespace]).inc();
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let status = match cluster_resolve::resolve(&hub_client, &namespace, &name).await {
        Ok(_) => ClusterMappingStatus { phase: ClusterMappingPhase::Ready, message: None },
        Err(e) => ClusterMappingStatus { phase: ClusterMappingPhase::Error, message: Some(e.to_string()) },
    };
    let failed = matches!(status.phase, ClusterMappingPhase::Error);
    let failure_message = status.message.clone();

    crate::util::patch::patch_status(hub_client.clone(), instance.as_ref(), |s: &mut ClusterMappingStatus| {
        *s = status.clone();
    })
    .await?;

    #[cfg(feature = "metrics")]
    context
        .metrics
        .write_histogram
        .with_label_values(&[&name, &namespace, "reconcile"])
        .observe(start.elapsed().as_secs_f64());

    if failed {
        eprintln!("{}", format!("{namespace}/{name}: cluster pairing invalid: {}", failure_message.unwrap_or_default()).red());
    }
    Ok(Action::requeue(PROBE_INTERVAL))
}

fn on_error(instance: Arc<ClusterMapping>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("reconciliation error for {}: {error}", instance.name_any()).red());
    Action::requeue(Duration::from_secs(5))
}
