//! Entrypoint for the `NamespaceMapping` controller.
//! One reconcile pass per declaration per trigger, gated by leader election
//! the same way the rest of this operator's controllers are.

use dr_syncer_types::*;
use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{actions, cluster_resolve, discovery};
use crate::cutover;
use crate::scheduler;
use crate::status;
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `NamespaceMapping` controller.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "starting NamespaceMapping controller".color(FG1));

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dr-syncer-namespace-mapping-{}", uuid::Uuid::new_v4()));
    let lease_name = "dr-syncer-namespace-mapping-lock".to_string();
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
                println!("{}", "acquired leadership; starting NamespaceMapping controller".color(FG2));
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<NamespaceMapping> = Api::namespaced(client_for_controller, &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping NamespaceMapping controller");
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
            ContextData { client, metrics: ControllerMetrics::new("namespace_mapping") }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client }
        }
    }
}

async fn reconcile(instance: Arc<NamespaceMapping>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| Error::UserInput("NamespaceMapping must be namespaced".to_string()))?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.reconcile_counter.with_label_values(&[&name, &namespace]).inc();
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let spec = &instance.spec;

    // Step 1: gate.
    if spec.paused {
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    let now = chrono::Utc::now();
    let status_snapshot = instance.status.clone().unwrap_or_default();
    let manual_trigger = instance
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(dr_syncer_common::annotations::MANUAL_SYNC_TRIGGER))
        .map(String::as_str);
    let manual_trigger_changed = cutover::trigger_changed(status_snapshot.last_manual_trigger.as_deref(), manual_trigger);
    let next_sync_time = status_snapshot.next_sync_time.as_ref().map(|t| t.0);
    let background_sync_due = matches!(spec.replication_mode, ReplicationMode::Continuous)
        && status_snapshot
            .last_sync_time
            .as_ref()
            .map(|t| now - t.0 >= chrono::Duration::seconds(spec.background_sync_interval_seconds.unwrap_or(300) as i64))
            .unwrap_or(true);

    if !scheduler::should_fire(&spec.replication_mode, now, next_sync_time, manual_trigger_changed, background_sync_due) {
        return Ok(Action::requeue(PROBE_INTERVAL));
    }

    // A pending retry backoff takes precedence over the mode's own cadence:
    // there is no point re-attempting a network-class failure before its
    // schedule says to.
    if let Some(next_retry) = status_snapshot.retry_status.as_ref().and_then(|r| r.next_retry_time.as_ref()) {
        if now < next_retry.0 {
            return Ok(Action::requeue(PROBE_INTERVAL));
        }
    }

    let result = run_pass(&client, &namespace, &instance).await;

    match &result {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{}", format!("{namespace}/{name}: reconcile pass failed: {e}").red());
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .write_histogram
        .with_label_values(&[&name, &namespace, "reconcile"])
        .observe(start.elapsed().as_secs_f64());

    result?;
    Ok(Action::requeue(PROBE_INTERVAL))
}

/// The body of a single reconcile pass, separated from `reconcile` so error
/// handling / status-writing stays in one place regardless of what stage
/// failed.
async fn run_pass(hub_client: &Client, namespace: &str, instance: &NamespaceMapping) -> Result<(), Error> {
    let spec = &instance.spec;
    let started = std::time::Instant::now();

    let clusters = cluster_resolve::resolve(hub_client, namespace, &spec.cluster_mapping_ref).await?;

    // Step 2: discover + expand selectors.
    let discovered = clusters.source.discover_preferred().await?;
    let selected = discovery::selected_kinds(&discovered, &spec.resource_types, &spec.exclude_resource_types);

    let mut status = instance.status.clone().unwrap_or_default();
    let mut had_retriable_failure = false;

    // Step 3 + 4: per-kind listing, pre-scale bookkeeping, and the ordered
    // per-resource write phase.
    let mut items: Vec<(String, String, String)> = Vec::new(); // (kind_selector, kind, name)
    for kind_selector in &selected {
        let (group, version, kind) = crate::cluster_client::parse_gvk(kind_selector);
        let ar = match clusters.source.discover(&group, &version, &kind).await {
            Ok(ar) => ar,
            Err(_) => continue,
        };
        let objects = clusters.source.list(&ar, &spec.source_namespace).await.unwrap_or_default();
        for obj in objects {
            items.push((kind_selector.clone(), kind.clone(), obj.name_any()));
        }
    }

    let mut sortable: Vec<(String, String)> = items.iter().map(|(_, kind, name)| (kind.clone(), name.clone())).collect();
    discovery::sort_resources(&mut sortable);
    let order: std::collections::BTreeMap<(String, String), usize> =
        sortable.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();
    items.sort_by_key(|(_, kind, name)| order.get(&(kind.clone(), name.clone())).copied().unwrap_or(usize::MAX));

    for (kind_selector, kind, name) in &items {
        let (group, version, k) = crate::cluster_client::parse_gvk(kind_selector);
        let Ok(ar) = clusters.source.discover(&group, &version, &k).await else { continue };

        if matches!(kind.as_str(), "Deployment" | "StatefulSet") {
            if let Ok(Some(obj)) = clusters.source.get(&ar, &spec.source_namespace, name).await {
                if let Some(replicas) = obj.data.pointer("/spec/replicas").and_then(|v| v.as_i64()) {
                    status::record_deployment_scale(&mut status, kind, name, replicas as i32);
                }
            }
        }

        let immutable_policy = spec.immutable_resource_policy.get(kind).copied().unwrap_or_default();
        let drain_timeout = Duration::from_secs(spec.drain_timeout_seconds);

        let outcome = actions::sync_resource(
            &clusters.source,
            &clusters.destination,
            &ar,
            kind,
            &spec.source_namespace,
            &spec.destination_namespace,
            name,
            &spec.pvc,
            spec.scale_to_zero,
            immutable_policy,
            drain_timeout,
        )
        .await;

        let policy = match &outcome {
            actions::ResourceOutcome::Failed(class, _) => {
                Some(spec.failure_handling.get(&class.to_string()).copied().unwrap_or_default())
            }
            _ => None,
        };
        let fail_fast = policy == Some(FailureHandlingPolicy::FailFast);
        had_retriable_failure |= matches!(policy, Some(FailureHandlingPolicy::RetryAndWait) | Some(FailureHandlingPolicy::RetryOnly));
        record_outcome(&mut status, kind, name, outcome);
        if fail_fast {
            break;
        }
    }

    // Step 4, PVC branch: data sync sessions, bounded-parallelism across the
    // declaration's own PVCs.
    if spec.pvc.sync_data {
        let pvc_names: Vec<String> = items
            .iter()
            .filter(|(_, kind, _)| kind == "PersistentVolumeClaim")
            .map(|(_, _, name)| name.clone())
            .collect();
        if !pvc_names.is_empty() {
            let concurrency = spec.pvc.concurrent_syncs.max(1) as usize;
            let outcomes: Vec<(String, Result<(), Error>)> = futures::stream::iter(pvc_names.into_iter().map(|name| {
                let source = &clusters.source;
                let destination = &clusters.destination;
                let source_cluster_name = clusters.source_cluster_name.as_str();
                let source_namespace = spec.source_namespace.as_str();
                let destination_namespace = spec.destination_namespace.as_str();
                let pvc_config = &spec.pvc;
                let debug = spec.debug;
                async move {
                    let result = actions::sync_pvc_data(
                        source,
                        destination,
                        source_cluster_name,
                        source_namespace,
                        destination_namespace,
                        &name,
                        pvc_config,
                        debug,
                    )
                    .await;
                    (name, result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

            for (name, result) in outcomes {
                let outcome = match result {
                    Ok(()) => actions::ResourceOutcome::Synced,
                    Err(e) => actions::ResourceOutcome::Failed(crate::util::classify(&e), e.to_string()),
                };
                if let actions::ResourceOutcome::Failed(class, _) = &outcome {
                    let policy = spec.failure_handling.get(&class.to_string()).copied().unwrap_or_default();
                    had_retriable_failure |= matches!(policy, FailureHandlingPolicy::RetryAndWait | FailureHandlingPolicy::RetryOnly);
                }
                record_outcome(&mut status, "PersistentVolumeClaim", &name, outcome);
            }
        }
    }

    // Cutover / failback triggers.
    apply_cutover_and_failback_triggers(&clusters, instance, &spec.source_namespace, &spec.destination_namespace, &mut status).await?;

    if let Some(manual) = instance
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(dr_syncer_common::annotations::MANUAL_SYNC_TRIGGER))
    {
        status.last_manual_trigger = Some(manual.clone());
    }
    if matches!(spec.replication_mode, ReplicationMode::Scheduled) {
        if let Some(cron_expr) = &spec.schedule {
            if let Ok(next) = scheduler::next_fire(cron_expr, chrono::Utc::now()) {
                status.next_sync_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(next));
            }
        }
    }

    status.retry_status = status::compute_retry_status(
        status.retry_status.as_ref(),
        had_retriable_failure,
        chrono::Utc::now(),
        spec.max_retries,
        Duration::from_secs(spec.initial_backoff_seconds),
        Duration::from_secs(spec.max_backoff_seconds),
        spec.backoff_multiplier,
    );

    status::recompute_sync_stats(&mut status, started.elapsed());
    status::update_conditions(&mut status);
    status.last_sync_time = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));

    crate::util::patch::patch_status(hub_client.clone(), instance, |s: &mut NamespaceMappingStatus| {
        *s = status.clone();
    })
    .await?;

    Ok(())
}

fn record_outcome(status: &mut NamespaceMappingStatus, kind: &str, name: &str, outcome: actions::ResourceOutcome) {
    use dr_syncer_types::{ResourceStatusEntry, ResourceSyncState};
    let (state, error) = match outcome {
        actions::ResourceOutcome::Synced => (ResourceSyncState::Synced, None),
        actions::ResourceOutcome::Skipped => return,
        actions::ResourceOutcome::Failed(class, msg) => {
            status::record_error(status, class);
            (ResourceSyncState::Failed, Some(msg))
        }
    };
    status::record_resource_outcome(
        status,
        ResourceStatusEntry {
            group: String::new(),
            kind: kind.to_string(),
            name: name.to_string(),
            state,
            last_attempt: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())),
            error,
        },
    );
}

/// Detects and acts on cutover/failback trigger annotations, using the pure
/// planning in [`cutover`]. The declaration's own `status.message` records
/// the last-observed trigger value so a repeated reconcile of an unchanged
/// annotation is a no-op.
async fn apply_cutover_and_failback_triggers(
    clusters: &cluster_resolve::ResolvedClusters,
    instance: &NamespaceMapping,
    source_namespace: &str,
    destination_namespace: &str,
    status: &mut NamespaceMappingStatus,
) -> Result<(), Error> {
    let annotations = instance.metadata.annotations.as_ref();
    let cutover_trigger = annotations.and_then(|a| a.get(dr_syncer_common::annotations::CUTOVER_TRIGGER)).map(String::as_str);
    let failback_trigger = annotations.and_then(|a| a.get(dr_syncer_common::annotations::FAILBACK_TRIGGER)).map(String::as_str);

    if cutover::trigger_changed(status.last_cutover_trigger.as_deref(), cutover_trigger) {
        apply_scale_plan(clusters, cutover::plan_cutover(&status.deployment_scales), source_namespace, destination_namespace).await?;
    }
    if cutover::trigger_changed(status.last_failback_trigger.as_deref(), failback_trigger) {
        apply_scale_plan(clusters, cutover::plan_failback(&status.deployment_scales), source_namespace, destination_namespace).await?;
    }
    status.last_cutover_trigger = cutover_trigger.map(str::to_string);
    status.last_failback_trigger = failback_trigger.map(str::to_string);
    Ok(())
}

const FIELD_MANAGER: &str = "dr-syncer-cutover";

async fn apply_scale_plan(
    clusters: &cluster_resolve::ResolvedClusters,
    plan: Vec<cutover::ScaleIntent>,
    source_namespace: &str,
    destination_namespace: &str,
) -> Result<(), Error> {
    for intent in plan {
        let (cluster, namespace) = match intent.side {
            cutover::Side::Source => (&clusters.source, source_namespace),
            cutover::Side::Destination => (&clusters.destination, destination_namespace),
        };
        let (group, version, kind) = ("apps".to_string(), "v1".to_string(), intent.kind.clone());
        let Ok(ar) = cluster.discover(&group, &version, &kind).await else { continue };
        let patch = serde_json::json!({ "spec": { "replicas": intent.replicas } });
        cluster.merge_patch(&ar, namespace, &intent.name, patch, FIELD_MANAGER).await?;
    }
    Ok(())
}

fn on_error(instance: Arc<NamespaceMapping>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{}", format!("reconciliation error for {}: {error}", instance.name_any()).red());
    Action::requeue(Duration::from_secs(5))
}
