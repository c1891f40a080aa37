//! Pure functions that fold per-pass outcomes into a `NamespaceMappingStatus`.
//! No cluster access here; the reconciler reads the current status, calls
//! into this module, and writes the result back via
//! `util::patch::patch_status`.

use chrono::Utc;
use dr_syncer_types::{
    DeploymentScaleRecord, ErrorCategoryStatus, NamespaceMappingStatus, ResourceStatusEntry,
    ResourceSyncState, SyncPhase,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

fn now_time() -> Time {
    Time(Utc::now())
}

/// Upserts a resource's outcome by (group, kind, name). Callers only ever
/// move a resource forward through Pending -> InProgress -> {Synced | Failed}.
pub fn record_resource_outcome(status: &mut NamespaceMappingStatus, entry: ResourceStatusEntry) {
    let key = (entry.group.clone(), entry.kind.clone(), entry.name.clone());
    if let Some(existing) = status.resource_status.iter_mut().find(|e| {
        (e.group.clone(), e.kind.clone(), e.name.clone()) == key
    }) {
        *existing = entry;
    } else {
        status.resource_status.push(entry);
    }
}

/// Records a Deployment/StatefulSet's replica count the first time it is
/// observed for this declaration's lifetime. Once recorded it is never
/// overwritten by a later zero-valued observation (cutover legitimately
/// drives the source to zero).
pub fn record_deployment_scale(status: &mut NamespaceMappingStatus, kind: &str, name: &str, replicas: i32) {
    let key = format!("{kind}/{name}");
    if status.deployment_scales.contains_key(&key) {
        return;
    }
    status.deployment_scales.insert(
        key,
        DeploymentScaleRecord {
            kind: kind.to_string(),
            name: name.to_string(),
            original_replicas: replicas,
            recorded_at: Some(now_time()),
        },
    );
}

pub fn record_error(status: &mut NamespaceMappingStatus, class: dr_syncer_types::ErrorClass) {
    let entry = status
        .error_categories
        .entry(class.to_string())
        .or_insert_with(ErrorCategoryStatus::default);
    entry.count += 1;
    entry.last_occurred = Some(now_time());
}

/// Computes the declaration's `retryStatus` for the pass just completed.
/// Network-class errors are retried with exponential backoff bounded by
/// max-retries, initial-backoff, max-backoff, and a percentage multiplier.
/// `had_retriable_failure` reflects whether this pass left behind a failure
/// whose class carries a `retry-and-wait` or `retry-only` policy. Clears the
/// schedule once nothing retriable remains, and stops advancing it (rather
/// than clearing it) once `max-retries` is exhausted, so the last schedule
/// stays visible as the reason the declaration stopped retrying.
pub fn compute_retry_status(
    existing: Option<&dr_syncer_types::RetryStatus>,
    had_retriable_failure: bool,
    now: chrono::DateTime<Utc>,
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    multiplier: f64,
) -> Option<dr_syncer_types::RetryStatus> {
    if !had_retriable_failure {
        return None;
    }
    let attempt = existing.map(|r| max_retries.saturating_sub(r.remaining)).unwrap_or(0);
    if crate::scheduler::retries_exhausted(attempt, max_retries) {
        return existing.cloned();
    }
    let backoff = crate::scheduler::backoff_duration(attempt, initial_backoff, max_backoff, multiplier);
    let next_retry_time = chrono::Duration::from_std(backoff).ok().map(|d| Time(now + d));
    Some(dr_syncer_types::RetryStatus {
        next_retry_time,
        remaining: max_retries.saturating_sub(attempt + 1),
        backoff_seconds: backoff.as_secs(),
    })
}

/// Recomputes `syncStats` from the current `resourceStatus` list. Preserves
/// the invariant `successful + failed <= total` by construction: every
/// Pending/InProgress entry simply isn't counted in either bucket.
pub fn recompute_sync_stats(status: &mut NamespaceMappingStatus, duration: std::time::Duration) {
    let total = status.resource_status.len() as u32;
    let successful = status
        .resource_status
        .iter()
        .filter(|e| e.state == ResourceSyncState::Synced)
        .count() as u32;
    let failed = status
        .resource_status
        .iter()
        .filter(|e| e.state == ResourceSyncState::Failed)
        .count() as u32;
    status.sync_stats.total_resources = total;
    status.sync_stats.successful_syncs = successful;
    status.sync_stats.failed_syncs = failed;
    status.sync_stats.last_duration_seconds = Some(duration.as_secs_f64());
}

/// Derives the declaration's overall phase from its resource statuses.
pub fn derive_phase(status: &NamespaceMappingStatus) -> SyncPhase {
    if status.resource_status.is_empty() {
        return SyncPhase::Pending;
    }
    let any_in_progress = status
        .resource_status
        .iter()
        .any(|e| e.state == ResourceSyncState::InProgress || e.state == ResourceSyncState::Pending);
    if any_in_progress {
        return SyncPhase::Running;
    }
    let any_failed = status.resource_status.iter().any(|e| e.state == ResourceSyncState::Failed);
    if any_failed {
        SyncPhase::Failed
    } else {
        SyncPhase::Completed
    }
}

fn set_condition(status: &mut NamespaceMappingStatus, kind: &str, true_: bool, reason: &str, message: &str) {
    let condition_status = if true_ { "True" } else { "False" };
    if let Some(existing) = status.conditions.iter_mut().find(|c| c.type_ == kind) {
        if existing.status != condition_status {
            existing.last_transition_time = now_time();
        }
        existing.status = condition_status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
    } else {
        status.conditions.push(Condition {
            type_: kind.to_string(),
            status: condition_status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            observed_generation: None,
            last_transition_time: now_time(),
        });
    }
}

/// Sets the `Synced` and `Ready` conditions from the declaration's derived
/// phase.
pub fn update_conditions(status: &mut NamespaceMappingStatus) {
    let phase = derive_phase(status);
    match phase {
        SyncPhase::Completed => {
            set_condition(status, "Synced", true, "AllResourcesSynced", "all selected resources synced");
            set_condition(status, "Ready", true, "Synced", "declaration is up to date");
        }
        SyncPhase::Failed => {
            set_condition(status, "Synced", false, "ResourcesFailed", "one or more resources failed to sync");
            set_condition(status, "Ready", false, "SyncFailed", "declaration has outstanding failures");
        }
        SyncPhase::Running | SyncPhase::Pending => {
            set_condition(status, "Synced", false, "SyncInProgress", "sync pass is in progress");
            set_condition(status, "Ready", false, "NotYetSynced", "declaration has not completed a sync pass");
        }
    }
    status.phase = phase;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, name: &str, state: ResourceSyncState) -> ResourceStatusEntry {
        ResourceStatusEntry {
            group: "apps".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            state,
            last_attempt: None,
            error: None,
        }
    }

    #[test]
    fn record_resource_outcome_upserts_by_group_kind_name() {
        let mut status = NamespaceMappingStatus::default();
        record_resource_outcome(&mut status, entry("Deployment", "app", ResourceSyncState::InProgress));
        record_resource_outcome(&mut status, entry("Deployment", "app", ResourceSyncState::Synced));
        assert_eq!(status.resource_status.len(), 1);
        assert_eq!(status.resource_status[0].state, ResourceSyncState::Synced);
    }

    #[test]
    fn deployment_scale_is_recorded_once_and_not_overwritten_by_zero() {
        let mut status = NamespaceMappingStatus::default();
        record_deployment_scale(&mut status, "Deployment", "app", 3);
        record_deployment_scale(&mut status, "Deployment", "app", 0);
        assert_eq!(status.deployment_scales["Deployment/app"].original_replicas, 3);
    }

    #[test]
    fn sync_stats_never_exceed_total_resources() {
        let mut status = NamespaceMappingStatus::default();
        record_resource_outcome(&mut status, entry("Deployment", "a", ResourceSyncState::Synced));
        record_resource_outcome(&mut status, entry("Deployment", "b", ResourceSyncState::Failed));
        record_resource_outcome(&mut status, entry("Deployment", "c", ResourceSyncState::Pending));
        recompute_sync_stats(&mut status, std::time::Duration::from_secs(5));
        assert_eq!(status.sync_stats.total_resources, 3);
        assert!(status.sync_stats.successful_syncs + status.sync_stats.failed_syncs <= status.sync_stats.total_resources);
        assert_eq!(status.sync_stats.successful_syncs, 1);
        assert_eq!(status.sync_stats.failed_syncs, 1);
    }

    #[test]
    fn phase_is_pending_with_no_resources_yet() {
        let status = NamespaceMappingStatus::default();
        assert_eq!(derive_phase(&status), SyncPhase::Pending);
    }

    #[test]
    fn phase_is_running_while_any_resource_is_unsettled() {
        let mut status = NamespaceMappingStatus::default();
        record_resource_outcome(&mut status, entry("Deployment", "a", ResourceSyncState::Synced));
        record_resource_outcome(&mut status, entry("Deployment", "b", ResourceSyncState::InProgress));
        assert_eq!(derive_phase(&status), SyncPhase::Running);
    }

    #[test]
    fn phase_is_failed_when_a_resource_failed_and_nothing_is_pending() {
        let mut status = NamespaceMappingStatus::default();
        record_resource_outcome(&mut status, entry("Deployment", "a", ResourceSyncState::Synced));
        record_resource_outcome(&mut status, entry("Deployment", "b", ResourceSyncState::Failed));
        assert_eq!(derive_phase(&status), SyncPhase::Failed);
    }

    #[test]
    fn phase_is_completed_when_everything_settled_successfully() {
        let mut status = NamespaceMappingStatus::default();
        record_resource_outcome(&mut status, entry("Deployment", "a", ResourceSyncState::Synced));
        assert_eq!(derive_phase(&status), SyncPhase::Completed);
    }

    #[test]
    fn update_conditions_sets_both_synced_and_ready() {
        let mut status = NamespaceMappingStatus::default();
        record_resource_outcome(&mut status, entry("Deployment", "a", ResourceSyncState::Synced));
        update_conditions(&mut status);
        assert_eq!(status.phase, SyncPhase::Completed);
        let names: Vec<_> = status.conditions.iter().map(|c| c.type_.clone()).collect();
        assert!(names.contains(&"Synced".to_string()));
        assert!(names.contains(&"Ready".to_string()));
        assert_eq!(status.conditions.iter().find(|c| c.type_ == "Synced").unwrap().status, "True");
    }

    #[test]
    fn record_error_accumulates_count_across_calls() {
        let mut status = NamespaceMappingStatus::default();
        record_error(&mut status, dr_syncer_types::ErrorClass::Network);
        record_error(&mut status, dr_syncer_types::ErrorClass::Network);
        assert_eq!(status.error_categories["network"].count, 2);
    }

    #[test]
    fn retry_status_clears_once_nothing_retriable_remains() {
        let now = Utc::now();
        let initial = std::time::Duration::from_secs(5);
        let max = std::time::Duration::from_secs(60);
        assert!(compute_retry_status(None, false, now, 3, initial, max, 2.0).is_none());
    }

    #[test]
    fn retry_status_starts_at_attempt_zero_on_first_failure() {
        let now = Utc::now();
        let initial = std::time::Duration::from_secs(5);
        let max = std::time::Duration::from_secs(60);
        let retry = compute_retry_status(None, true, now, 3, initial, max, 2.0).unwrap();
        assert_eq!(retry.backoff_seconds, 5);
        assert_eq!(retry.remaining, 2);
        assert!(retry.next_retry_time.unwrap().0 > now);
    }

    #[test]
    fn retry_status_advances_and_doubles_backoff_across_passes() {
        let now = Utc::now();
        let initial = std::time::Duration::from_secs(5);
        let max = std::time::Duration::from_secs(60);
        let first = compute_retry_status(None, true, now, 3, initial, max, 2.0).unwrap();
        let second = compute_retry_status(Some(&first), true, now, 3, initial, max, 2.0).unwrap();
        assert_eq!(second.backoff_seconds, 10);
        assert_eq!(second.remaining, 1);
    }

    #[test]
    fn retry_status_stops_advancing_once_exhausted() {
        let now = Utc::now();
        let initial = std::time::Duration::from_secs(5);
        let max = std::time::Duration::from_secs(60);
        let exhausted = dr_syncer_types::RetryStatus {
            next_retry_time: Some(Time(now)),
            remaining: 0,
            backoff_seconds: 20,
        };
        let result = compute_retry_status(Some(&exhausted), true, now, 3, initial, max, 2.0).unwrap();
        assert_eq!(result.remaining, 0);
        assert_eq!(result.backoff_seconds, 20);
    }
}
