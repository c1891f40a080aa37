use std::time::Duration;

pub mod patch;

pub(crate) mod colors;

#[cfg(feature = "metrics")]
pub mod metrics;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource once it has
/// converged.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the Kubernetes field manager used for server-side apply.
pub(crate) const MANAGER_NAME: &str = "dr-syncer";

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Classifies an [`Error`] into a failure taxonomy, used to pick a
/// per-class [`dr_syncer_types::FailureHandlingPolicy`] and to accumulate
/// `status.errorCategories`.
pub fn classify(err: &Error) -> dr_syncer_types::ErrorClass {
    use dr_syncer_types::ErrorClass;
    match err {
        Error::Kube { source } => match source {
            kube::Error::Api(ae) if ae.code == 404 => ErrorClass::ResourceNotFound,
            kube::Error::Api(ae) if ae.code == 409 => ErrorClass::ImmutableConflict,
            kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ErrorClass::Auth,
            kube::Error::Api(ae) if is_storage_class_error(&ae.message) => ErrorClass::StorageClassNotFound,
            kube::Error::Api(_) => ErrorClass::Validation,
            _ => ErrorClass::Network,
        },
        Error::SshKey(_) => ErrorClass::Auth,
        Error::Exec(_) => ErrorClass::Network,
        Error::PathResolution(_) => ErrorClass::PathNotFound,
        Error::PlaceholderTimeout(_) => ErrorClass::PlaceholderTimeout,
        Error::SessionConflict(_) => ErrorClass::SessionConflict,
        Error::ImmutableConflict(_) => ErrorClass::ImmutableConflict,
        Error::Timeout(_) => ErrorClass::Timeout,
        Error::Json { .. } | Error::UserInput(_) | Error::Cron { .. } => ErrorClass::Validation,
        Error::Chrono { .. } | Error::OutOfRange { .. } | Error::ParseDuration { .. } => {
            ErrorClass::Unknown
        }
    }
}

/// Whether an API admission message names a missing `storageClassName` on
/// the destination. The apiserver reports this as an ordinary
/// validation-shaped rejection, not a distinct status code, so the message
/// text is the only signal available to tell it apart from other validation
/// failures.
fn is_storage_class_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("storageclass") || lower.contains("storage class")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_syncer_types::ErrorClass;

    #[test]
    fn not_found_classifies_as_resource_not_found() {
        let err = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "not found".into(),
                reason: "NotFound".into(),
                code: 404,
            }),
        };
        assert_eq!(classify(&err), ErrorClass::ResourceNotFound);
    }

    #[test]
    fn conflict_classifies_as_immutable_conflict() {
        let err = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "conflict".into(),
                reason: "Conflict".into(),
                code: 409,
            }),
        };
        assert_eq!(classify(&err), ErrorClass::ImmutableConflict);
    }

    #[test]
    fn missing_storage_class_classifies_distinctly_from_generic_validation() {
        let err = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "persistentvolumeclaim \"data\" is invalid: spec.storageClassName: Not found: \"fast-ssd\"".into(),
                reason: "Invalid".into(),
                code: 422,
            }),
        };
        assert_eq!(classify(&err), ErrorClass::StorageClassNotFound);
    }

    #[test]
    fn generic_validation_failure_is_not_storage_class_not_found() {
        let err = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "deployment.apps \"app\" is invalid: spec.replicas: Invalid value".into(),
                reason: "Invalid".into(),
                code: 422,
            }),
        };
        assert_eq!(classify(&err), ErrorClass::Validation);
    }

    #[test]
    fn session_conflict_roundtrips() {
        let err = Error::SessionConflict("already syncing".to_string());
        assert_eq!(classify(&err), ErrorClass::SessionConflict);
    }

    #[test]
    fn hash_spec_is_stable_for_equal_values() {
        #[derive(serde::Serialize)]
        struct S {
            a: u32,
            b: String,
        }
        let x = S { a: 1, b: "x".into() };
        let y = S { a: 1, b: "x".into() };
        assert_eq!(hash_spec(&x), hash_spec(&y));
    }

    #[test]
    fn hash_spec_differs_for_different_values() {
        #[derive(serde::Serialize)]
        struct S {
            a: u32,
        }
        assert_ne!(hash_spec(&S { a: 1 }), hash_spec(&S { a: 2 }));
    }
}
