//! The `NamespaceMapping` controller: discovery/ordering, the write-phase
//! actions, cross-cluster resolution, and the reconcile entrypoint.

mod actions;
pub mod cluster_resolve;
mod discovery;
mod reconcile;

pub use reconcile::run;
