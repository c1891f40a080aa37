use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;

mod cluster_client;
mod cluster_mapping;
mod cutover;
mod namespace_mapping;
mod node_resolver;
mod remote_cluster;
mod rsync_pool;
mod scheduler;
mod ssh_keys;
mod status;
mod sync_session;
mod transform;
mod util;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Namespace the operator's CRDs, leader-election leases, and the rsync
    /// pool DaemonSet live in.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Port `/metrics` is served on. Ignored when built without the
    /// `metrics` feature.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    metrics_port: u16,

    /// Disables ANSI coloring of console output, for log collectors that
    /// don't strip escape codes.
    #[arg(long, env = "NO_COLOR")]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.no_color {
        owo_colors::set_override(false);
    }
    // SAFETY: single-threaded at this point in startup, before any
    // controller reads NAMESPACE.
    unsafe {
        std::env::set_var("NAMESPACE", &cli.namespace);
    }

    dr_syncer_common::signal_ready();

    let client = Client::try_default().await.context("failed to build Kubernetes client from in-cluster/kubeconfig")?;

    #[cfg(feature = "metrics")]
    {
        let metrics_port = cli.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = util::metrics::run_metrics_server(metrics_port).await {
                eprintln!("{}", format!("metrics server exited: {e}").red());
            }
        });
    }

    let namespace_mapping = tokio::spawn({
        let client = client.clone();
        async move { namespace_mapping::run(client).await }
    });
    let cluster_mapping = tokio::spawn({
        let client = client.clone();
        async move { cluster_mapping::run(client).await }
    });
    let remote_cluster = tokio::spawn({
        let client = client.clone();
        async move { remote_cluster::run(client).await }
    });

    let (nm, cm, rc) = tokio::try_join!(namespace_mapping, cluster_mapping, remote_cluster)
        .context("a controller task panicked")?;
    nm.context("NamespaceMapping controller failed")?;
    cm.context("ClusterMapping controller failed")?;
    rc.context("RemoteCluster controller failed")?;

    println!("{}", "all controllers shut down gracefully".green());
    Ok(())
}
