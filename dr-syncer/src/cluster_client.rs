//! The cluster client. The sole abstraction over a foreign
//! Kubernetes API; every other component takes one as a dependency. A
//! reconcile pass holds two instances, source and destination, built from
//! independent `kube::Config`s resolved from a `ClusterMapping`'s key
//! material.

use crate::util::Error;
use futures::StreamExt;
use kube::api::{
    Api, AttachParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, WatchEvent,
    WatchParams,
};
use kube::core::ApiResource;
use kube::discovery;
use kube::{Client, Config};

const APPLY_RETRY_ATTEMPTS: usize = 5;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// One cluster's API surface, resolved once at reconcile start and reused
/// for every operation the pass performs against it.
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from a kubeconfig-shaped blob (the `ClusterMapping`'s
    /// referenced secret).
    pub async fn from_kubeconfig(kubeconfig_yaml: &str) -> Result<Self, Error> {
        let kubeconfig = kube::config::Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| Error::UserInput(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &Default::default())
            .await
            .map_err(|e| Error::UserInput(format!("invalid kubeconfig: {e}")))?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolves a `(group, version, kind)` triple to its `ApiResource`.
    /// `group` is `""` for the core API group.
    pub async fn discover(&self, group: &str, version: &str, kind: &str) -> Result<ApiResource, Error> {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, _caps) = discovery::pinned_kind(&self.client, &gvk).await?;
        Ok(ar)
    }

    fn api_for(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    pub async fn list(&self, ar: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>, Error> {
        let api = self.api_for(ar, Some(namespace));
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// Returns `None` on a 404 rather than surfacing `ResourceNotFound`,
    /// since a missing destination object is an ordinary precondition for
    /// `create`, not an error.
    pub async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, Error> {
        let api = self.api_for(ar, Some(namespace));
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let api = self.api_for(ar, Some(namespace));
        Ok(api.create(&Default::default(), obj).await?)
    }

    pub async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.api_for(ar, Some(namespace));
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Server-side apply with conflict retry bounded by
    /// [`APPLY_RETRY_ATTEMPTS`]: a create that returns already-exists
    /// transparently falls back to update, retrying conflicts up to a fixed
    /// attempt count.
    pub async fn apply(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, Error> {
        let api = self.api_for(ar, Some(namespace));
        let pp = PatchParams::apply(field_manager);
        let mut attempt = 0;
        loop {
            match api.patch(&obj.name_any(), &pp, &Patch::Apply(obj)).await {
                Ok(applied) => return Ok(applied),
                Err(kube::Error::Api(e)) if e.code == 409 && attempt < APPLY_RETRY_ATTEMPTS => {
                    attempt += 1;
                    continue;
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    return Err(Error::ImmutableConflict(format!(
                        "apply of {} exhausted {APPLY_RETRY_ATTEMPTS} retries",
                        obj.name_any()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// JSON merge-patch, used by the replication reconciler's `partial-update`
    /// immutable-resource policy to update only the fields named in `patch`
    /// rather than attempting a full server-side apply.
    pub async fn merge_patch(&self, ar: &ApiResource, namespace: &str, name: &str, patch: serde_json::Value, field_manager: &str) -> Result<DynamicObject, Error> {
        let api = self.api_for(ar, Some(namespace));
        let pp = PatchParams::apply(field_manager);
        Ok(api.patch(name, &pp, &Patch::Merge(patch)).await?)
    }

    pub async fn server_version(&self) -> Result<String, Error> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    /// Runs API discovery and returns every namespaced `(group, version,
    /// kind)` triple the cluster serves, alongside whether it belongs to a
    /// well-known builtin group. Used by the reconciler to expand a
    /// declaration's `"*"` selector.
    pub async fn discover_preferred(&self) -> Result<Vec<(String, bool)>, Error> {
        let discovery = discovery::Discovery::new(self.client.clone()).run().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if caps.scope != kube::discovery::Scope::Namespaced {
                    continue;
                }
                let kind_str = gvk_string(&ar.group, &ar.version, &ar.kind);
                out.push((kind_str, !is_builtin_group(&ar.group)));
            }
        }
        Ok(out)
    }

    /// Opens a watch on a single (kind, namespace) pair starting at
    /// `resource_version`, returning every Added/Modified/Deleted object
    /// seen in one poll of the stream. Continuous-mode plumbing drives this
    /// in a loop and demultiplexes by object key rather than opening one
    /// watch per declaration.
    pub async fn watch(&self, ar: &ApiResource, namespace: &str, resource_version: &str) -> Result<Vec<DynamicObject>, Error> {
        let api = self.api_for(ar, Some(namespace));
        let mut stream = api.watch(&WatchParams::default(), resource_version).await?.boxed();
        let mut out = Vec::new();
        if let Some(event) = stream.next().await {
            match event? {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                    out.push(obj)
                }
                WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
            }
        }
        Ok(out)
    }

    /// Execs `argv` inside `pod`, returning captured stdout/stderr and
    /// whether the process exited zero.
    pub async fn exec(&self, namespace: &str, pod: &str, container: Option<&str>, argv: Vec<String>) -> Result<ExecResult, Error> {
        self.exec_inner(namespace, pod, container, argv, None).await
    }

    /// Execs `argv` inside `pod` with `stdin` written to the process's
    /// standard input and closed once fully flushed, then waits for the
    /// process to exit the same way [`Self::exec`] does. Used to deliver key
    /// material into a pod without ever writing it to an argv or an
    /// environment variable.
    pub async fn exec_with_stdin(&self, namespace: &str, pod: &str, container: Option<&str>, argv: Vec<String>, stdin: &[u8]) -> Result<ExecResult, Error> {
        self.exec_inner(namespace, pod, container, argv, Some(stdin)).await
    }

    async fn exec_inner(&self, namespace: &str, pod: &str, container: Option<&str>, argv: Vec<String>, stdin: Option<&[u8]>) -> Result<ExecResult, Error> {
        let api: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut ap = AttachParams::default().stdout(true).stderr(true).stdin(stdin.is_some());
        if let Some(c) = container {
            ap = ap.container(c);
        }
        let argv_ref: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut attached = api.exec(pod, argv_ref, &ap).await?;

        if let Some(bytes) = stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut sink) = attached.stdin() {
                sink.write_all(bytes).await.map_err(|e| Error::Exec(format!("writing exec stdin: {e}")))?;
                sink.shutdown().await.ok();
            }
        }

        let stdout = match attached.stdout() {
            Some(s) => read_to_string(s).await,
            None => String::new(),
        };
        let stderr = match attached.stderr() {
            Some(s) => read_to_string(s).await,
            None => String::new(),
        };
        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.ok();

        let success = status
            .as_ref()
            .map(|s| s.status.as_deref() == Some("Success"))
            .unwrap_or(false);

        Ok(ExecResult { stdout, stderr, success })
    }
}

async fn read_to_string(stream: impl tokio::io::AsyncRead + Unpin) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    let mut stream = stream;
    let _ = stream.read_to_string(&mut buf).await;
    buf
}

/// The default safe list of resource kinds synced when a declaration's
/// selectors include `"*"`. The controller's own enumeration is treated as
/// authoritative here rather than deferring to cluster discovery.
pub const DEFAULT_SAFE_KINDS: &[&str] = &[
    "v1/ConfigMap",
    "v1/Secret",
    "v1/Service",
    "v1/ServiceAccount",
    "v1/PersistentVolumeClaim",
    "apps/v1/Deployment",
    "apps/v1/StatefulSet",
    "apps/v1/DaemonSet",
    "networking.k8s.io/v1/Ingress",
    "networking.k8s.io/v1/NetworkPolicy",
    "rbac.authorization.k8s.io/v1/Role",
    "rbac.authorization.k8s.io/v1/RoleBinding",
    "autoscaling/v2/HorizontalPodAutoscaler",
];

/// Formats a `(group, version, kind)` triple the same way
/// [`DEFAULT_SAFE_KINDS`] is written: `version/Kind` for the core group,
/// `group/version/Kind` otherwise.
pub fn gvk_string(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{version}/{kind}")
    } else {
        format!("{group}/{version}/{kind}")
    }
}

/// Splits a `gvk_string`-shaped selector back into its `(group, version,
/// kind)` parts, so the reconciler can call [`ClusterClient::discover`]
/// against it.
pub fn parse_gvk(s: &str) -> (String, String, String) {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
        [version, kind] => (String::new(), version.to_string(), kind.to_string()),
        [group, version, kind] => (group.to_string(), version.to_string(), kind.to_string()),
        _ => (String::new(), "v1".to_string(), s.to_string()),
    }
}

/// Well-known API groups treated as "builtin" for the wildcard rule
/// (everything else is a custom resource, which the wildcard always
/// selects regardless of the default safe list).
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "autoscaling",
    "policy",
    "storage.k8s.io",
    "apiextensions.k8s.io",
    "coordination.k8s.io",
];

pub fn is_builtin_group(group: &str) -> bool {
    BUILTIN_GROUPS.contains(&group)
}

/// Decides whether a resource kind should be synced under a declaration's
/// selectors: the default safe list applies only to non-custom kinds
/// matched against `"*"`; exclude always beats include when a kind appears
/// in both.
pub fn should_sync(kind: &str, is_custom: bool, include: &[String], exclude: &[String]) -> bool {
    if exclude.iter().any(|e| e == kind) {
        return false;
    }
    if include.iter().any(|i| i == kind) {
        return true;
    }
    if include.iter().any(|i| i == "*") {
        return is_custom || DEFAULT_SAFE_KINDS.contains(&kind);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_selects_default_safe_list_for_builtin_kinds() {
        assert!(should_sync("apps/v1/Deployment", false, &["*".to_string()], &[]));
    }

    #[test]
    fn wildcard_excludes_builtin_kinds_outside_the_safe_list() {
        assert!(!should_sync("batch/v1/Job", false, &["*".to_string()], &[]));
    }

    #[test]
    fn wildcard_always_selects_custom_resources() {
        assert!(should_sync("example.com/v1/Widget", true, &["*".to_string()], &[]));
    }

    #[test]
    fn explicit_include_selects_kind_outside_default_list() {
        assert!(should_sync(
            "batch/v1/Job",
            false,
            &["batch/v1/Job".to_string()],
            &[]
        ));
    }

    #[test]
    fn exclude_beats_include_when_both_name_the_kind() {
        let include = vec!["apps/v1/Deployment".to_string()];
        let exclude = vec!["apps/v1/Deployment".to_string()];
        assert!(!should_sync("apps/v1/Deployment", false, &include, &exclude));
    }

    #[test]
    fn absent_from_every_selector_is_not_synced() {
        assert!(!should_sync("apps/v1/Deployment", false, &[], &[]));
    }

    #[test]
    fn gvk_string_omits_group_for_core_resources() {
        assert_eq!(gvk_string("", "v1", "ConfigMap"), "v1/ConfigMap");
        assert_eq!(gvk_string("apps", "v1", "Deployment"), "apps/v1/Deployment");
    }

    #[test]
    fn parse_gvk_round_trips_with_gvk_string() {
        assert_eq!(parse_gvk("v1/ConfigMap"), (String::new(), "v1".to_string(), "ConfigMap".to_string()));
        assert_eq!(
            parse_gvk("apps/v1/Deployment"),
            ("apps".to_string(), "v1".to_string(), "Deployment".to_string())
        );
    }

    #[test]
    fn builtin_groups_cover_the_default_safe_list() {
        assert!(is_builtin_group(""));
        assert!(is_builtin_group("apps"));
        assert!(!is_builtin_group("example.com"));
    }
}
