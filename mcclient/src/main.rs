//! mc-controller: inspect and watch resources across every cluster
//! registered in the management cluster

mod output;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::api::{ListParams, WatchParams};
use mcclient::shutdown::ShutdownCoordinator;
use mcclient::{McConfig, MultiClusterClient, ResourceDescriptor, WatcherStatus};
use output::OutputFormat;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before relisting after a cluster's watch ends
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "mc-controller")]
#[command(author, version, about = "Multi-cluster Kubernetes client", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Kubeconfig for the management cluster
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context for the management cluster
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace holding the cluster credential ConfigMaps
    #[arg(long, global = true)]
    credential_namespace: Option<String>,

    /// Name prefix of credential ConfigMaps
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Log level or filter directive
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known clusters
    Clusters,
    /// Show client health
    Health,
    /// List a resource across every cluster
    List {
        #[command(flatten)]
        resource: ResourceArgs,

        /// Return what could be listed instead of failing on an unavailable cluster
        #[arg(long)]
        best_effort: bool,
    },
    /// Watch a resource across every cluster until interrupted
    Watch {
        #[command(flatten)]
        resource: ResourceArgs,
    },
    /// Print a sample configuration file
    SampleConfig,
}

#[derive(Args)]
struct ResourceArgs {
    /// Resource plural name (e.g. configmaps, deployments)
    plural: String,

    /// Kind (e.g. ConfigMap)
    #[arg(short, long)]
    kind: String,

    /// API group; empty for the core group
    #[arg(short, long, default_value = "")]
    group: String,

    /// API version
    #[arg(long, default_value = "v1")]
    api_version: String,

    /// Namespace; all namespaces when unset
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Field selector
    #[arg(long)]
    field_selector: Option<String>,
}

impl ResourceArgs {
    fn descriptor(&self) -> ResourceDescriptor {
        let mut resource =
            ResourceDescriptor::new(&self.group, &self.api_version, &self.kind, &self.plural);
        if let Some(ns) = &self.namespace {
            resource = resource.namespaced(ns);
        }
        if let Some(selector) = &self.selector {
            resource = resource.with_label_selector(selector);
        }
        if let Some(selector) = &self.field_selector {
            resource = resource.with_field_selector(selector);
        }
        resource
    }
}

impl Cli {
    fn apply(&self, config: &mut McConfig) {
        if let Some(path) = &self.kubeconfig {
            config.management.kubeconfig = Some(path.clone());
        }
        if let Some(context) = &self.context {
            config.management.context = Some(context.clone());
        }
        if let Some(namespace) = &self.credential_namespace {
            config.management.credentials.namespace = namespace.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.management.credentials.name_prefix = prefix.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        print!("{}", McConfig::generate_sample());
        return Ok(());
    }

    let mut config = McConfig::load_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    let _log_guard = config.logging.init()?;

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.wait_for_signal().await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    let client = MultiClusterClient::connect(&config, &shutdown.token())
        .await
        .context("Failed to start the multi-cluster client")?;

    let result = match &cli.command {
        Commands::Clusters => {
            let rows = client.clusters().into_iter().map(output::ClusterRow::from).collect();
            output::print_output(rows, cli.output)
        }
        Commands::Health => output::print_single(&client.health(), cli.output),
        Commands::List {
            resource,
            best_effort,
        } => list(&client, &resource.descriptor(), *best_effort, cli.output).await,
        Commands::Watch { resource } => {
            watch(&client, &resource.descriptor(), shutdown.token(), cli.output).await
        }
        Commands::SampleConfig => Ok(()),
    };

    shutdown.shutdown();
    client.shutdown(shutdown.timeout()).await;

    if let Err(e) = &result {
        output::print_error(&format!("{e:#}"));
    }
    result
}

async fn list(
    client: &MultiClusterClient,
    resource: &ResourceDescriptor,
    best_effort: bool,
    format: OutputFormat,
) -> Result<()> {
    let aggregate = client.cross_cluster_list_watch(resource);
    let params = ListParams::default();

    let list = if best_effort {
        let partial = aggregate.list_best_effort(&params).await;
        for (cluster, err) in &partial.failures {
            output::print_warning(&format!("{cluster}: {err}"));
        }
        partial.list
    } else {
        aggregate
            .list(&params)
            .await
            .with_context(|| format!("Failed to list {resource}"))?
    };

    output::print_objects(&list.items, format)
}

/// Print every change until cancelled. Lists first, then watches from the
/// listed versions; when any cluster's watch ends, the whole set is
/// relisted so that clusters added or removed meanwhile are picked up.
async fn watch(
    client: &MultiClusterClient,
    resource: &ResourceDescriptor,
    token: CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    let aggregate = client.cross_cluster_list_watch(resource);

    while !token.is_cancelled() {
        if client.watcher_status() == Some(WatcherStatus::Terminated) {
            bail!("Credential watch terminated; cluster set is stale");
        }

        let list = match aggregate.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(resource = %resource, error = %e, "Aggregate list failed, retrying");
                pause(&token).await;
                continue;
            }
        };
        info!(resource = %resource, objects = list.len(), clusters = list.resource_versions.len(), "Listed");

        let mut events = aggregate.watch(&WatchParams::default(), &list.resource_versions, &token);
        loop {
            let event = tokio::select! {
                biased;
                _ = client.watcher_terminated() => {
                    events.shutdown().await;
                    bail!("Credential watch terminated; cluster set is stale");
                }
                event = events.recv() => event,
            };
            let Some(event) = event else { break };

            output::print_event(&event, format)?;
            if event.event.is_terminal() {
                info!(cluster = %event.cluster, "Cluster watch ended, restarting");
                break;
            }
        }

        let report = events.shutdown().await;
        debug!(clusters = ?report.clusters, "Watch stopped");
        pause(&token).await;
    }

    Ok(())
}

async fn pause(token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(RESTART_DELAY) => {}
    }
}
