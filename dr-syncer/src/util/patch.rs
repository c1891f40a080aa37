use super::MANAGER_NAME;
use dr_syncer_types::*;
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};

/// Gives generic access to a CRD's status sub-object, initializing it with
/// the default value on first write.
pub trait Object<S> {
    fn mut_status(&mut self) -> &mut S;
}

impl Object<NamespaceMappingStatus> for NamespaceMapping {
    fn mut_status(&mut self) -> &mut NamespaceMappingStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Object<ClusterMappingStatus> for ClusterMapping {
    fn mut_status(&mut self) -> &mut ClusterMappingStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Object<RemoteClusterStatus> for RemoteCluster {
    fn mut_status(&mut self) -> &mut RemoteClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
///
/// Writes go through server-side apply so conflicting writers (a second
/// controller replica that briefly thought it was leader) resolve by
/// re-read-and-retry rather than clobbering each other.
pub async fn patch_status<S, T>(client: Client, instance: &T, f: impl FnOnce(&mut S)) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(modified.mut_status());
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}
