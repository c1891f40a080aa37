use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

// --- shared small types -----------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema, Hash)]
pub enum ReplicationMode {
    Scheduled,
    Continuous,
    #[default]
    Manual,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMode::Scheduled => write!(f, "Scheduled"),
            ReplicationMode::Continuous => write!(f, "Continuous"),
            ReplicationMode::Manual => write!(f, "Manual"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrent_syncs() -> u32 {
    2
}

fn default_pvc_timeout_seconds() -> u64 {
    1800
}

fn default_drain_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_seconds() -> u64 {
    2
}

fn default_max_backoff_seconds() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PvcSyncConfig {
    /// Whether to migrate PVC data block-for-block via the rsync-over-SSH channel.
    #[serde(default)]
    pub sync_data: bool,
    /// Whether to also transform the PV bound to a synced PVC. The semantics
    /// of `claimRef` rewriting are left to this implementation's discretion;
    /// the decision taken is recorded in DESIGN.md.
    #[serde(default)]
    pub sync_persistent_volumes: bool,
    #[serde(default)]
    pub storage_class_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub access_mode_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub rsync_options: Vec<String>,
    pub bandwidth_limit_kbps: Option<u64>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_syncs: u32,
    #[serde(default = "default_pvc_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Hash, PartialOrd, Ord)]
pub enum ErrorClass {
    Network,
    Auth,
    StorageClassNotFound,
    ResourceNotFound,
    Validation,
    ImmutableConflict,
    SessionConflict,
    PathNotFound,
    PlaceholderTimeout,
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Network => "network",
            ErrorClass::Auth => "auth",
            ErrorClass::StorageClassNotFound => "storage-class-not-found",
            ErrorClass::ResourceNotFound => "resource-not-found",
            ErrorClass::Validation => "validation",
            ErrorClass::ImmutableConflict => "immutable-conflict",
            ErrorClass::SessionConflict => "session-conflict",
            ErrorClass::PathNotFound => "path-not-found",
            ErrorClass::PlaceholderTimeout => "placeholder-timeout",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ErrorClass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "network" => ErrorClass::Network,
            "auth" => ErrorClass::Auth,
            "storage-class-not-found" => ErrorClass::StorageClassNotFound,
            "resource-not-found" => ErrorClass::ResourceNotFound,
            "validation" => ErrorClass::Validation,
            "immutable-conflict" => ErrorClass::ImmutableConflict,
            "session-conflict" => ErrorClass::SessionConflict,
            "path-not-found" => ErrorClass::PathNotFound,
            "placeholder-timeout" => ErrorClass::PlaceholderTimeout,
            "timeout" => ErrorClass::Timeout,
            _ => ErrorClass::Unknown,
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum FailureHandlingPolicy {
    RetryAndWait,
    RetryOnly,
    #[default]
    WaitForNextSync,
    FailFast,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ImmutableResourcePolicy {
    #[default]
    NoChange,
    PartialUpdate,
    Recreate,
    RecreateWithPodDrain,
    ForceUpdate,
}

// --- NamespaceMapping --------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "dr-syncer.io",
    version = "v1",
    kind = "NamespaceMapping",
    plural = "namespacemappings",
    derive = "PartialEq",
    status = "NamespaceMappingStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.sourceNamespace\", \"name\": \"SOURCE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.destinationNamespace\", \"name\": \"DESTINATION\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastSyncTime\", \"name\": \"LAST-SYNC\", \"type\": \"date\" }"
)]
pub struct NamespaceMappingSpec {
    pub cluster_mapping_ref: String,
    pub source_namespace: String,
    pub destination_namespace: String,
    #[serde(default)]
    pub replication_mode: ReplicationMode,
    /// Cron expression, required when `replication_mode == Scheduled`.
    pub schedule: Option<String>,
    /// Continuous-mode catch-up timer.
    pub background_sync_interval_seconds: Option<u64>,
    /// Resource-type selectors: literal "group/resource" strings, or "*".
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Kinds to drop from `resource_types` even when the wildcard or an
    /// explicit include would otherwise select them.
    #[serde(default)]
    pub exclude_resource_types: Vec<String>,
    #[serde(default)]
    pub scale_to_zero: bool,
    #[serde(default)]
    pub pvc: PvcSyncConfig,
    /// Keyed by the string form of [`ErrorClass`] (CRD schemas require string map keys).
    #[serde(default)]
    pub failure_handling: BTreeMap<String, FailureHandlingPolicy>,
    #[serde(default)]
    pub immutable_resource_policy: BTreeMap<String, ImmutableResourcePolicy>,
    #[serde(default)]
    pub paused: bool,
    /// When set, a failed sync session's transient producer pod is kept
    /// around for postmortem inspection instead of being cleaned up.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_seconds")]
    pub initial_backoff_seconds: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SyncPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Pending => write!(f, "Pending"),
            SyncPhase::Running => write!(f, "Running"),
            SyncPhase::Completed => write!(f, "Completed"),
            SyncPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for SyncPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SyncPhase::Pending),
            "Running" => Ok(SyncPhase::Running),
            "Completed" => Ok(SyncPhase::Completed),
            "Failed" => Ok(SyncPhase::Failed),
            _ => Err(()),
        }
    }
}

/// Per-resource sync state, folded into status at the end of a reconcile
/// pass. Transitions are monotonic: Pending -> InProgress -> {Synced |
/// Failed}.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ResourceSyncState {
    #[default]
    Pending,
    InProgress,
    Synced,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct ResourceStatusEntry {
    pub group: String,
    pub kind: String,
    pub name: String,
    pub state: ResourceSyncState,
    pub last_attempt: Option<Time>,
    pub error: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct SyncStats {
    pub total_resources: u32,
    pub successful_syncs: u32,
    pub failed_syncs: u32,
    pub last_duration_seconds: Option<f64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct ErrorCategoryStatus {
    pub count: u32,
    pub last_occurred: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct RetryStatus {
    pub next_retry_time: Option<Time>,
    pub remaining: u32,
    pub backoff_seconds: u64,
}

/// The source-side replica count at first observation, so cutover can
/// restore it. Never overwritten by a later zero-valued observation.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct DeploymentScaleRecord {
    pub kind: String,
    pub name: String,
    pub original_replicas: i32,
    pub recorded_at: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct NamespaceMappingStatus {
    pub phase: SyncPhase,
    #[serde(default)]
    pub sync_stats: SyncStats,
    #[serde(default)]
    pub resource_groups: BTreeMap<String, u32>,
    #[serde(default)]
    pub resource_status: Vec<ResourceStatusEntry>,
    /// Keyed by the string form of [`ErrorClass`].
    #[serde(default)]
    pub error_categories: BTreeMap<String, ErrorCategoryStatus>,
    pub retry_status: Option<RetryStatus>,
    #[serde(default)]
    pub deployment_scales: BTreeMap<String, DeploymentScaleRecord>,
    pub last_sync_time: Option<Time>,
    pub next_sync_time: Option<Time>,
    pub last_watch_event: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub message: Option<String>,
    /// Last-observed value of the `dr-syncer.io/cutover-trigger` annotation,
    /// so a repeated reconcile of an unchanged trigger is a no-op.
    pub last_cutover_trigger: Option<String>,
    pub last_failback_trigger: Option<String>,
    /// Last-observed value of the `dr-syncer.io/sync-trigger` annotation,
    /// driving `Manual`-mode firing.
    pub last_manual_trigger: Option<String>,
}

// --- ClusterMapping -----------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "dr-syncer.io",
    version = "v1",
    kind = "ClusterMapping",
    plural = "clustermappings",
    derive = "PartialEq",
    status = "ClusterMappingStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct ClusterMappingSpec {
    pub source_cluster: String,
    pub destination_cluster: String,
    pub key_material_secret_ref: SecretReference,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ClusterMappingPhase {
    #[default]
    Pending,
    Ready,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct ClusterMappingStatus {
    pub phase: ClusterMappingPhase,
    pub message: Option<String>,
}

// --- RemoteCluster --------------------------------------------------------

fn default_agent_port() -> u16 {
    2222
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RemoteClusterResources {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "dr-syncer.io",
    version = "v1",
    kind = "RemoteCluster",
    plural = "remoteclusters",
    derive = "PartialEq",
    status = "RemoteClusterStatus",
    namespaced
)]
#[kube(derive = "Default")]
pub struct RemoteClusterSpec {
    pub key_material_secret_ref: SecretReference,
    pub agent_image: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default)]
    pub resources: RemoteClusterResources,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<k8s_openapi::api::core::v1::Toleration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema, Default)]
pub struct RemoteClusterStatus {
    pub phase: ClusterMappingPhase,
    pub message: Option<String>,
    pub agent_key_fingerprint: Option<String>,
}
