pub mod shutdown;

/// Writes the readiness file consumed by the container's readiness probe.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const STABLE_ID: &str = "dr-syncer.io/stable-id";
    pub const CREATED_BY: &str = "dr-syncer.io/created-by";
    pub const SPEC_HASH: &str = "dr-syncer.io/spec-hash";
    pub const ORIGINAL_REPLICAS: &str = "provenance.original-replicas";
    pub const SOURCE_NAMESPACE: &str = "dr-syncer.io/source-namespace";
    pub const SOURCE_CLUSTER: &str = "dr-syncer.io/source-cluster";
    pub const IGNORE: &str = "dr-syncer.io/ignore";
    pub const CUTOVER_TRIGGER: &str = "dr-syncer.io/cutover-trigger";
    pub const FAILBACK_TRIGGER: &str = "dr-syncer.io/failback-trigger";
    pub const MANUAL_SYNC_TRIGGER: &str = "dr-syncer.io/sync-trigger";
    pub const PLACEHOLDER: &str = "dr-syncer.io/placeholder";
    pub const SESSION_ID: &str = "dr-syncer.io/session-id";
}
