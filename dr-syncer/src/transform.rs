//! The resource transformer. A pure function: given a
//! source object and a destination namespace, returns a deep copy stripped
//! of cluster-specific fields and annotated with provenance/original-scale.
//! No I/O, no side effects. Every case here is covered by a unit test.

use dr_syncer_common::annotations;
use dr_syncer_types::PvcSyncConfig;
use kube::api::DynamicObject;
use serde_json::{Value, json};

/// Universal metadata rewrites applied to every object regardless of kind.
fn strip_universal_metadata(obj: &mut DynamicObject, dest_namespace: &str) {
    obj.metadata.namespace = Some(dest_namespace.to_string());
    obj.metadata.resource_version = None;
    obj.metadata.uid = None;
    obj.metadata.creation_timestamp = None;
    obj.metadata.self_link = None;
    obj.metadata.managed_fields = None;

    if let Some(data) = obj.data.as_object_mut() {
        data.remove("status");
    }
}

const OWNERLESS_WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "Ingress"];

fn clear_owner_references(obj: &mut DynamicObject, kind: &str) {
    if OWNERLESS_WORKLOAD_KINDS.contains(&kind) {
        obj.metadata.owner_references = None;
    }
}

fn set_annotation(obj: &mut DynamicObject, key: &str, value: String) {
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value);
}

fn remove_annotation(obj: &mut DynamicObject, key: &str) {
    if let Some(annotations) = obj.metadata.annotations.as_mut() {
        annotations.remove(key);
    }
}

fn get_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for segment in path {
        cur = cur.as_object()?.get(*segment)?;
    }
    Some(cur)
}

fn remove_path(value: &mut Value, path: &[&str]) {
    let Some((last, prefix)) = path.split_last() else {
        return;
    };
    let mut cur = value;
    for segment in prefix {
        let Some(obj) = cur.as_object_mut() else {
            return;
        };
        let Some(next) = obj.get_mut(*segment) else {
            return;
        };
        cur = next;
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(*last);
    }
}

fn set_path(value: &mut Value, path: &[&str], new_value: Value) {
    let Some((last, prefix)) = path.split_last() else {
        return;
    };
    let mut cur = value;
    for segment in prefix {
        if !cur.is_object() {
            *cur = json!({});
        }
        cur = cur
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| json!({}));
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.insert(last.to_string(), new_value);
    }
}

const SERVICE_FIELDS_TO_CLEAR: &[&[&str]] = &[
    &["spec", "clusterIP"],
    &["spec", "clusterIPs"],
    &["spec", "ipFamilies"],
    &["spec", "ipFamilyPolicy"],
    &["spec", "healthCheckNodePort"],
    &["spec", "externalTrafficPolicy"],
    &["spec", "loadBalancerIP"],
    &["spec", "loadBalancerSourceRanges"],
    &["spec", "externalIPs"],
    &["spec", "allocateLoadBalancerNodePorts"],
    &["spec", "sessionAffinity"],
    &["spec", "sessionAffinityConfig"],
];

fn transform_service(obj: &mut DynamicObject) {
    for path in SERVICE_FIELDS_TO_CLEAR {
        remove_path(&mut obj.data, path);
    }
}

/// Records `spec.replicas` into `provenance.original-replicas` before the
/// caller (the reconciler) optionally zeroes it for scale-to-zero. Callers
/// must not re-record once a value exists; that bookkeeping lives in the
/// reconciler, not here. This function always overwrites the annotation
/// with the source's current replicas, because the reconciler only calls it
/// when it has already decided this observation should be recorded.
fn transform_workload(obj: &mut DynamicObject, kind: &str) {
    if let Some(replicas) = get_path(&obj.data, &["spec", "replicas"]).and_then(Value::as_i64) {
        set_annotation(obj, annotations::ORIGINAL_REPLICAS, replicas.to_string());
    }
    if kind == "StatefulSet" {
        if let Some(templates) = obj
            .data
            .pointer_mut("/spec/volumeClaimTemplates")
            .and_then(Value::as_array_mut)
        {
            for template in templates {
                if let Some(map) = template.as_object_mut() {
                    map.remove("status");
                }
            }
        }
    }
}

fn transform_ingress(obj: &mut DynamicObject) {
    remove_annotation(obj, "kubernetes.io/ingress.class");
}

fn remap(table: &std::collections::BTreeMap<String, String>, value: &str) -> String {
    table
        .get(value)
        .cloned()
        .unwrap_or_else(|| value.to_string())
}

fn transform_pvc(obj: &mut DynamicObject, pvc_config: &PvcSyncConfig) {
    if let Some(class) = get_path(&obj.data, &["spec", "storageClassName"]).and_then(Value::as_str)
    {
        let remapped = remap(&pvc_config.storage_class_mapping, class);
        set_path(&mut obj.data, &["spec", "storageClassName"], json!(remapped));
    }
    if let Some(modes) = obj
        .data
        .pointer_mut("/spec/accessModes")
        .and_then(Value::as_array_mut)
    {
        for mode in modes.iter_mut() {
            if let Some(s) = mode.as_str() {
                *mode = json!(remap(&pvc_config.access_mode_mapping, s));
            }
        }
    }
    if !pvc_config.sync_persistent_volumes {
        // Let the destination's storage provisioner allocate a fresh PV
        // rather than binding to the (nonexistent, on this cluster) source PV.
        remove_path(&mut obj.data, &["spec", "volumeName"]);
    }
}

/// Transforms `source` for application into `dest_namespace`. Pure and
/// side-effect free: callers decide whether/when to apply the result.
pub fn transform_resource(
    source: &DynamicObject,
    dest_namespace: &str,
    pvc_config: &PvcSyncConfig,
) -> DynamicObject {
    let mut obj = source.clone();
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();

    strip_universal_metadata(&mut obj, dest_namespace);
    clear_owner_references(&mut obj, &kind);
    set_annotation(&mut obj, annotations::CREATED_BY, "dr-syncer".to_string());

    match kind.as_str() {
        "Service" => transform_service(&mut obj),
        "Deployment" | "StatefulSet" => transform_workload(&mut obj, &kind),
        "Ingress" => transform_ingress(&mut obj),
        "PersistentVolumeClaim" => transform_pvc(&mut obj, pvc_config),
        // Unknown kinds: the universal rewrites above already ran; everything
        // kind-specific passes through unchanged.
        _ => {}
    }

    obj
}

/// Applies scale-to-zero to an already-transformed Deployment/StatefulSet
/// copy. Split out from `transform_resource` because the decision of
/// *whether* to zero depends on reconciler state (has the original already
/// been recorded this lifetime?) that the pure transformer has no business
/// holding.
pub fn zero_replicas(obj: &mut DynamicObject) {
    set_path(&mut obj.data, &["spec", "replicas"], json!(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};
    use std::collections::BTreeMap;

    fn obj(kind: &str, data: Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("ns-a".to_string()),
                resource_version: Some("123".to_string()),
                uid: Some("abc-uid".to_string()),
                ..Default::default()
            },
            data,
        }
    }

    fn pvc_config() -> PvcSyncConfig {
        PvcSyncConfig::default()
    }

    #[test]
    fn universal_rewrites_strip_cluster_specific_fields() {
        let src = obj("ConfigMap", json!({"data": {"k": "v"}, "status": {"foo": "bar"}}));
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert_eq!(out.metadata.namespace.as_deref(), Some("ns-a-dr"));
        assert!(out.metadata.resource_version.is_none());
        assert!(out.metadata.uid.is_none());
        assert!(out.data.get("status").is_none());
        assert_eq!(out.data["data"]["k"], json!("v"));
    }

    #[test]
    fn unknown_kind_passes_through_identity() {
        let src = obj("WeirdCustomThing", json!({"spec": {"a": 1}}));
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert_eq!(out.data["spec"]["a"], json!(1));
    }

    #[test]
    fn service_clears_cluster_ip_fields_but_preserves_ports_and_selector() {
        let src = obj(
            "Service",
            json!({
                "spec": {
                    "clusterIP": "10.0.0.5",
                    "clusterIPs": ["10.0.0.5"],
                    "type": "ClusterIP",
                    "ports": [{"port": 80}],
                    "selector": {"app": "demo"}
                }
            }),
        );
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert!(out.data["spec"].get("clusterIP").is_none());
        assert!(out.data["spec"].get("clusterIPs").is_none());
        assert_eq!(out.data["spec"]["type"], json!("ClusterIP"));
        assert_eq!(out.data["spec"]["ports"], json!([{"port": 80}]));
        assert_eq!(out.data["spec"]["selector"], json!({"app": "demo"}));
    }

    #[test]
    fn deployment_records_original_replicas_annotation() {
        let src = obj("Deployment", json!({"spec": {"replicas": 3}}));
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert_eq!(
            out.metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(annotations::ORIGINAL_REPLICAS)
                .unwrap(),
            "3"
        );
        // Transformer itself never zeroes; that's a caller decision.
        assert_eq!(out.data["spec"]["replicas"], json!(3));
    }

    #[test]
    fn zero_replicas_helper_sets_replicas_to_zero() {
        let src = obj("Deployment", json!({"spec": {"replicas": 3}}));
        let mut out = transform_resource(&src, "ns-a-dr", &pvc_config());
        zero_replicas(&mut out);
        assert_eq!(out.data["spec"]["replicas"], json!(0));
    }

    #[test]
    fn deployment_and_statefulset_lose_owner_references() {
        let mut src = obj("Deployment", json!({"spec": {}}));
        src.metadata.owner_references = Some(vec![]);
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert!(out.metadata.owner_references.is_none());
    }

    #[test]
    fn configmap_keeps_owner_references_field_absent_by_default() {
        let src = obj("ConfigMap", json!({}));
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert!(out.metadata.owner_references.is_none());
    }

    #[test]
    fn statefulset_strips_status_from_volume_claim_templates() {
        let src = obj(
            "StatefulSet",
            json!({
                "spec": {
                    "replicas": 2,
                    "volumeClaimTemplates": [
                        {"metadata": {"name": "data"}, "spec": {}, "status": {"phase": "Bound"}}
                    ]
                }
            }),
        );
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        let templates = out.data["spec"]["volumeClaimTemplates"].as_array().unwrap();
        assert!(templates[0].get("status").is_none());
    }

    #[test]
    fn ingress_removes_legacy_class_annotation() {
        let mut src = obj("Ingress", json!({"spec": {"ingressClassName": "nginx"}}));
        src.metadata.annotations = Some(BTreeMap::from([(
            "kubernetes.io/ingress.class".to_string(),
            "nginx".to_string(),
        )]));
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert!(
            out.metadata
                .annotations
                .as_ref()
                .unwrap()
                .get("kubernetes.io/ingress.class")
                .is_none()
        );
        assert_eq!(out.data["spec"]["ingressClassName"], json!("nginx"));
    }

    #[test]
    fn pvc_remaps_storage_class_via_table_with_fallback() {
        let mut cfg = pvc_config();
        cfg.storage_class_mapping
            .insert("fast-ssd".to_string(), "dr-standard".to_string());
        let src = obj(
            "PersistentVolumeClaim",
            json!({"spec": {"storageClassName": "fast-ssd", "accessModes": ["ReadWriteOnce"]}}),
        );
        let out = transform_resource(&src, "ns-a-dr", &cfg);
        assert_eq!(out.data["spec"]["storageClassName"], json!("dr-standard"));

        let src_unmapped = obj(
            "PersistentVolumeClaim",
            json!({"spec": {"storageClassName": "untouched", "accessModes": []}}),
        );
        let out_unmapped = transform_resource(&src_unmapped, "ns-a-dr", &cfg);
        assert_eq!(out_unmapped.data["spec"]["storageClassName"], json!("untouched"));
    }

    #[test]
    fn pvc_clears_volume_name_unless_sync_persistent_volumes() {
        let src = obj(
            "PersistentVolumeClaim",
            json!({"spec": {"volumeName": "pv-123", "accessModes": []}}),
        );
        let out = transform_resource(&src, "ns-a-dr", &pvc_config());
        assert!(out.data["spec"].get("volumeName").is_none());

        let mut cfg = pvc_config();
        cfg.sync_persistent_volumes = true;
        let out_synced = transform_resource(&src, "ns-a-dr", &cfg);
        assert_eq!(out_synced.data["spec"]["volumeName"], json!("pv-123"));
    }

    #[test]
    fn transform_is_idempotent_on_its_own_output() {
        let src = obj(
            "Deployment",
            json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 3}}),
        );
        let once = transform_resource(&src, "ns-a-dr", &pvc_config());
        let twice = transform_resource(&once, "ns-a-dr", &pvc_config());
        assert_eq!(once, twice);
    }
}
