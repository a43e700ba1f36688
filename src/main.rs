//! Tailscale Operator - fronts annotated Services with a Tailscale StatefulSet

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use tailscale_operator::controller::{apply, backoff_key, build, error_policy, reconcile, Context};
use tailscale_operator::retry::{retry_with_backoff, ErrorBackoff, RetryConfig};
use tailscale_operator::telemetry::{init_telemetry, LogFormat};
use tailscale_operator::template::Templates;
use tailscale_operator::CONTROLLER_NAME;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Tailscale Operator - exposes annotated Services on a tailnet
#[derive(Parser, Debug)]
#[command(name = "tailscale-operator", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    templates: TemplateArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Services (and the Services/StatefulSets they own) and
    /// converges every Service annotated with
    /// `tailscale.maisem.dev/enable: "true"`.
    Controller(ControllerArgs),

    /// Print the children that would be created for a Service, then exit
    ///
    /// Reads a Service manifest and writes the routing Service and the
    /// StatefulSet as multi-document YAML. Nothing is sent to a cluster.
    Render(RenderArgs),
}

/// Child template locations, shared by all commands
#[derive(Args, Debug)]
struct TemplateArgs {
    /// Routing Service template (a full Service manifest; only `spec` is used)
    #[arg(long, env = "SERVICE_TEMPLATE", default_value = "svc.yaml", global = true)]
    service_template: PathBuf,

    /// StatefulSet template (a full StatefulSet manifest; only `spec` is used)
    #[arg(long, env = "STATEFULSET_TEMPLATE", default_value = "sts.yaml", global = true)]
    statefulset_template: PathBuf,

    /// Image for the Tailscale agent container, overriding the template
    #[arg(long, env = "TAILSCALE_IMAGE", global = true)]
    tailscale_image: Option<String>,
}

/// Controller mode arguments
#[derive(Args, Debug, Default)]
struct ControllerArgs {
    /// Only watch Services in this namespace (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

/// Render mode arguments
#[derive(Args, Debug)]
struct RenderArgs {
    /// Service manifest to render children for
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Uid to assume when the manifest has none (it determines the pod hostname)
    #[arg(long)]
    uid: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(cli.log_format)?;

    // Malformed templates are fatal before any reconcile runs
    let templates = Templates::load(
        &cli.templates.service_template,
        &cli.templates.statefulset_template,
    )
    .await?
    .with_image(cli.templates.tailscale_image);

    match cli.command {
        Some(Commands::Render(args)) => run_render(templates, args).await,
        Some(Commands::Controller(args)) => run_controller(templates, args).await,
        None => run_controller(templates, ControllerArgs::default()).await,
    }
}

/// Run the Service controller until a shutdown signal arrives
async fn run_controller(templates: Templates, args: ControllerArgs) -> anyhow::Result<()> {
    let client = retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "kube_client",
        || async { Client::try_default().await },
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let (services, owned_services, stateful_sets): (
        Api<Service>,
        Api<Service>,
        Api<StatefulSet>,
    ) = match &args.namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "watching a single namespace");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            )
        }
        None => (
            Api::all(client.clone()),
            Api::all(client.clone()),
            Api::all(client.clone()),
        ),
    };

    let backoff = Arc::new(ErrorBackoff::default());
    let ctx = Arc::new(
        Context::builder(client, templates)
            .backoff(backoff.clone())
            .build(),
    );

    tracing::info!(controller = CONTROLLER_NAME, "starting Service controller");

    Controller::new(
        services,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        owned_services,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        stateful_sets,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(move |result| {
        match result {
            Ok((obj, action)) => {
                backoff.reset(&backoff_key(obj.namespace.as_deref(), &obj.name));
                tracing::debug!(service = %obj.name, ?action, "Service reconciliation completed");
            }
            Err(e) => tracing::error!(error = ?e, "Service reconciliation error"),
        }
        std::future::ready(())
    })
    .await;

    tracing::info!("controller shut down");
    Ok(())
}

/// Print the desired children of a Service manifest as YAML
async fn run_render(templates: Templates, args: RenderArgs) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", args.file, e))?;
    let mut service: Service = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse Service manifest: {}", e))?;

    if service.namespace().is_none() {
        service.metadata.namespace = Some("default".to_string());
    }
    if let Some(uid) = args.uid {
        service.metadata.uid = Some(uid);
    }

    let owner = service.controller_owner_ref(&()).ok_or_else(|| {
        anyhow::anyhow!("Service manifest needs metadata.name and metadata.uid (or pass --uid)")
    })?;
    let children = build(&service, &templates)?;

    let (routing, _) = apply::prepare::<Service, _>(
        None,
        &children.routing.name,
        &children.routing.namespace,
        &owner,
        |svc| children.routing.apply_to(svc),
    )?;
    let (stateful_set, _) = apply::prepare::<StatefulSet, _>(
        None,
        &children.stateful_set.name,
        &children.stateful_set.namespace,
        &owner,
        |sts| children.stateful_set.apply_to(sts),
    )?;

    let routing = serde_yaml::to_string(&routing)
        .map_err(|e| anyhow::anyhow!("Failed to serialize routing Service: {}", e))?;
    let stateful_set = serde_yaml::to_string(&stateful_set)
        .map_err(|e| anyhow::anyhow!("Failed to serialize StatefulSet: {}", e))?;
    print!("{routing}---\n{stateful_set}");
    Ok(())
}
