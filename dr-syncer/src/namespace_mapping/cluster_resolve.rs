//! Resolves a `ClusterMapping`'s symbolic source/destination clusters into
//! a pair of live [`ClusterClient`]s. The hub cluster, the one the operator
//! itself runs against and where `NamespaceMapping`, `ClusterMapping`, and
//! `RemoteCluster` objects live, supplies the `ClusterMapping`'s
//! key-material secret; that secret's `source` and `destination` keys each
//! hold an independent kubeconfig blob.

use crate::cluster_client::ClusterClient;
use crate::util::Error;
use dr_syncer_types::ClusterMapping;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

pub struct ResolvedClusters {
    pub source: ClusterClient,
    pub destination: ClusterClient,
    /// The `ClusterMapping`'s declared cluster names, not the hub-local
    /// `cluster_mapping_ref`. This is what the SSH key manager's agent-pair
    /// secrets are keyed by.
    pub source_cluster_name: String,
    pub destination_cluster_name: String,
}

async fn kubeconfig_from_secret(client: &Client, namespace: &str, secret_name: &str, key: &str) -> Result<String, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(secret_name).await?;
    let data = secret
        .data
        .ok_or_else(|| Error::UserInput(format!("secret {secret_name} has no data")))?;
    let bytes = data
        .get(key)
        .ok_or_else(|| Error::UserInput(format!("secret {secret_name} is missing key {key}")))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::UserInput(format!("secret {secret_name} key {key} is not valid UTF-8: {e}")))
}

/// Looks up the named `ClusterMapping` in `namespace` and builds a
/// [`ClusterClient`] for each side from its `key_material_secret_ref`.
pub async fn resolve(hub_client: &Client, namespace: &str, cluster_mapping_ref: &str) -> Result<ResolvedClusters, Error> {
    let mappings: Api<ClusterMapping> = Api::namespaced(hub_client.clone(), namespace);
    let mapping = mappings.get(cluster_mapping_ref).await?;

    let secret_name = &mapping.spec.key_material_secret_ref.name;
    let secret_namespace = mapping
        .spec
        .key_material_secret_ref
        .namespace
        .as_deref()
        .unwrap_or(namespace);

    let source_yaml = kubeconfig_from_secret(hub_client, secret_namespace, secret_name, "source").await?;
    let destination_yaml = kubeconfig_from_secret(hub_client, secret_namespace, secret_name, "destination").await?;

    Ok(ResolvedClusters {
        source: ClusterClient::from_kubeconfig(&source_yaml).await?,
        destination: ClusterClient::from_kubeconfig(&destination_yaml).await?,
        source_cluster_name: mapping.spec.source_cluster.clone(),
        destination_cluster_name: mapping.spec.destination_cluster.clone(),
    })
}
