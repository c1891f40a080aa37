use dr_syncer_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/dr-syncer.io_namespacemapping_crd.yaml",
        serde_yaml::to_string(&NamespaceMapping::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/dr-syncer.io_clustermapping_crd.yaml",
        serde_yaml::to_string(&ClusterMapping::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/dr-syncer.io_remotecluster_crd.yaml",
        serde_yaml::to_string(&RemoteCluster::crd()).unwrap(),
    )
    .unwrap();
}
