#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Out of range: {source}")]
    OutOfRange {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Invalid cron expression: {source}")]
    Cron {
        #[from]
        source: cron::error::Error,
    },

    #[error("SSH key error: {0}")]
    SshKey(String),

    #[error("Remote exec failed: {0}")]
    Exec(String),

    #[error("Path resolution failed: {0}")]
    PathResolution(String),

    #[error("Placeholder pod timed out waiting for Running: {0}")]
    PlaceholderTimeout(String),

    #[error("Sync session conflict: {0}")]
    SessionConflict(String),

    #[error("Immutable field conflict: {0}")]
    ImmutableConflict(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl From<ssh_key::Error> for Error {
    fn from(e: ssh_key::Error) -> Self {
        Error::SshKey(e.to_string())
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Error::SshKey(e.to_string())
    }
}
