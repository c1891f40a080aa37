//! Resource discovery and ordering for a reconcile pass. Decides which
//! (group, version, kind) tuples a declaration's selectors cover, and the
//! deterministic order resources within a pass are visited in.

pub use crate::cluster_client::{DEFAULT_SAFE_KINDS, should_sync};

/// A resource's position in the deterministic per-pass order: ConfigMaps and
/// Secrets first, then PVCs (ahead of the workloads that mount them), then
/// Services, then workloads, then Ingresses, HPAs last.
pub fn ordering_rank(kind: &str) -> u8 {
    match kind {
        "ConfigMap" | "Secret" => 0,
        "PersistentVolumeClaim" => 1,
        "Service" | "ServiceAccount" | "Role" | "RoleBinding" | "NetworkPolicy" => 2,
        "Deployment" | "StatefulSet" | "DaemonSet" => 3,
        "Ingress" => 4,
        "HorizontalPodAutoscaler" => 5,
        _ => 3,
    }
}

/// Sorts `(kind, name)` pairs into the pass's deterministic visitation
/// order. Ties within a rank break on kind then name so repeated passes
/// over an unchanged resource set always visit items in the same order.
pub fn sort_resources(items: &mut [(String, String)]) {
    items.sort_by(|a, b| {
        ordering_rank(&a.0)
            .cmp(&ordering_rank(&b.0))
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });
}

/// Expands a declaration's resource-type selectors against the discovered
/// kind list, applying the wildcard / include / exclude rules. `discovered`
/// pairs each kind with whether it's a custom resource (a non-core API
/// group), since that distinction drives the wildcard rule. `exclude` always
/// wins over the wildcard and over an explicit include.
pub fn selected_kinds(discovered: &[(String, bool)], resource_types: &[String], exclude: &[String]) -> Vec<String> {
    discovered
        .iter()
        .filter(|(k, is_custom)| should_sync(k, *is_custom, resource_types, exclude))
        .map(|(k, _)| k.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_places_configmaps_and_secrets_first() {
        assert!(ordering_rank("ConfigMap") < ordering_rank("Service"));
        assert!(ordering_rank("Secret") < ordering_rank("Deployment"));
    }

    #[test]
    fn ordering_places_pvcs_before_workloads() {
        assert!(ordering_rank("PersistentVolumeClaim") < ordering_rank("Deployment"));
        assert!(ordering_rank("PersistentVolumeClaim") < ordering_rank("StatefulSet"));
    }

    #[test]
    fn ordering_places_services_before_ingresses() {
        assert!(ordering_rank("Service") < ordering_rank("Ingress"));
    }

    #[test]
    fn ordering_places_hpas_last() {
        assert!(ordering_rank("HorizontalPodAutoscaler") > ordering_rank("Ingress"));
    }

    #[test]
    fn sort_resources_is_deterministic_across_runs() {
        let mut a = vec![
            ("Deployment".to_string(), "app".to_string()),
            ("ConfigMap".to_string(), "cfg".to_string()),
            ("Ingress".to_string(), "web".to_string()),
            ("PersistentVolumeClaim".to_string(), "data".to_string()),
        ];
        let mut b = a.clone();
        sort_resources(&mut a);
        sort_resources(&mut b);
        assert_eq!(a, b);
        assert_eq!(a[0].0, "ConfigMap");
        assert_eq!(a.last().unwrap().0, "Ingress");
    }

    #[test]
    fn selected_kinds_expands_wildcard_to_default_safe_list() {
        let discovered: Vec<(String, bool)> = DEFAULT_SAFE_KINDS
            .iter()
            .map(|s| (s.to_string(), false))
            .chain([("batch/v1/Job".to_string(), false)])
            .collect();
        let selected = selected_kinds(&discovered, &["*".to_string()], &[]);
        assert!(selected.iter().any(|k| k == "apps/v1/Deployment"));
        assert!(!selected.iter().any(|k| k == "batch/v1/Job"));
    }

    #[test]
    fn selected_kinds_exclude_wins_over_wildcard() {
        let discovered: Vec<(String, bool)> = DEFAULT_SAFE_KINDS.iter().map(|s| (s.to_string(), false)).collect();
        let selected = selected_kinds(&discovered, &["*".to_string()], &["apps/v1/Deployment".to_string()]);
        assert!(!selected.iter().any(|k| k == "apps/v1/Deployment"));
        assert!(selected.len() == DEFAULT_SAFE_KINDS.len() - 1);
    }

    #[test]
    fn selected_kinds_exclude_wins_over_explicit_include() {
        let discovered = vec![("apps/v1/Deployment".to_string(), false)];
        let selected = selected_kinds(
            &discovered,
            &["apps/v1/Deployment".to_string()],
            &["apps/v1/Deployment".to_string()],
        );
        assert!(selected.is_empty());
    }
}
