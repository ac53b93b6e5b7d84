use crate::{
    acl::AclSync,
    admission::Admission,
    applier::Applier,
    broadcast::{Broadcast, E4lbPhase, EipPhase, Intervals},
    certificate::{KubeBootstrapStore, ProviderKind, SecretCertificateProvider},
    dns::DnsSync,
    http,
    index::{Index, SharedIndex},
    inject::{self, Injector},
    k8s, lease,
    maps::NodeMaps,
    metrics::{AdmissionMetrics, BroadcastMetrics, DataPathMetrics, StatusMetrics},
    probe::ConnectProber,
    scheduler::Scheduler,
    status, webhook,
    xnet::{Netlink, RawAnnouncer},
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

// The maximum number of status patches to buffer. Planning runs every couple
// of seconds and each pass writes at most one patch per advertisement.
const STATUS_UPDATE_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Parser)]
#[clap(name = "xmesh-controller", about = "The xmesh control plane")]
pub struct Args {
    #[clap(long, default_value = "xmesh=info,warn", env = "XMESH_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "xmesh")]
    mesh_name: String,

    #[clap(long, default_value = "xmesh-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "xmesh-mesh-config")]
    mesh_config_name: String,

    #[clap(long, default_value = "cluster.local")]
    trust_domain: String,

    /// The service whose cluster IP serves local DNS and the sidecar repo.
    #[clap(long, default_value = "xmesh-controller")]
    controller_service_name: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serves the sidecar-injection admission webhook.
    Injector(InjectorArgs),

    /// Programs this node's data path.
    Xnet(XnetArgs),
}

#[derive(Debug, clap::Args)]
struct InjectorArgs {
    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    webhook: WebhookArgs,
}

#[derive(Debug, clap::Args)]
struct WebhookArgs {
    #[clap(long, default_value = "xmesh-mutating-webhook-configuration")]
    webhook_config_name: String,

    /// The service fronting this webhook.
    #[clap(long, default_value = "xmesh-injector")]
    injector_service_name: String,

    /// Seconds the API server waits on each review.
    #[clap(
        long,
        default_value = "20",
        value_parser = clap::value_parser!(i32).range(1..=30)
    )]
    webhook_timeout: i32,

    /// Marks the webhook configuration for reconciliation.
    #[clap(long)]
    enable_reconciler: bool,

    /// PEM bundle the API server uses to verify this webhook.
    #[clap(long)]
    webhook_ca_bundle: PathBuf,

    #[clap(long, value_enum, default_value = "secret")]
    certificate_provider: ProviderKind,

    #[clap(long, default_value = "xmesh-ca-bundle")]
    ca_bundle_secret_name: String,

    #[clap(long)]
    sidecar_pull_policy: Option<String>,
}

#[derive(Debug, clap::Args)]
struct XnetArgs {
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    #[clap(long, default_value = "/sys/fs/bpf")]
    bpf_pin_root: PathBuf,

    #[clap(long, default_value = "cni0")]
    cni_bridge: String,

    /// Seconds between DNS redirect passes.
    #[clap(long, default_value = "2")]
    mesh_config_interval: u64,

    /// Seconds between planning and NAT passes.
    #[clap(long, default_value = "2")]
    e4lb_interval: u64,

    /// Seconds between EIP announcements.
    #[clap(long, default_value = "2")]
    eip_interval: u64,

    /// Size of the reconciliation worker pool. Defaults to the available
    /// parallelism.
    #[clap(long)]
    workers: Option<NonZeroUsize>,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
}

/// Settings shared by every command.
struct Mesh {
    name: String,
    control_plane_namespace: String,
    mesh_config_name: String,
    trust_domain: String,
    controller_service_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            mesh_name,
            control_plane_namespace,
            mesh_config_name,
            trust_domain,
            controller_service_name,
            command,
        } = self;

        let mesh = Mesh {
            name: mesh_name,
            control_plane_namespace,
            mesh_config_name,
            trust_domain,
            controller_service_name,
        };
        let index = Index::shared(
            &mesh.control_plane_namespace,
            &mesh.mesh_config_name,
            &mesh.controller_service_name,
        );

        let mut prom = <Registry>::default();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        match command {
            Command::Injector(InjectorArgs { server, webhook }) => {
                let metrics = AdmissionMetrics::register(&mut prom);
                let runtime = kubert::Runtime::builder()
                    .with_log(log_level, log_format)
                    .with_metrics(rt_metrics)
                    .with_admin(admin.into_builder().with_prometheus(prom))
                    .with_client(client)
                    .with_server(server)
                    .build()
                    .await
                    .context("failed to initialize runtime")?;
                run_injector(runtime, mesh, index, webhook, metrics).await
            }
            Command::Xnet(args) => {
                let status_metrics = StatusMetrics::register(&mut prom);
                let dp_metrics = DataPathMetrics::register(&mut prom);
                let bcast_metrics = BroadcastMetrics::register(&mut prom);
                let runtime = kubert::Runtime::builder()
                    .with_log(log_level, log_format)
                    .with_metrics(rt_metrics)
                    .with_admin(admin.into_builder().with_prometheus(prom))
                    .with_client(client)
                    .build()
                    .await
                    .context("failed to initialize runtime")?;
                run_xnet(
                    runtime,
                    mesh,
                    index,
                    args,
                    status_metrics,
                    dp_metrics,
                    bcast_metrics,
                )
                .await
            }
        }
    }
}

async fn run_injector(
    mut runtime: kubert::Runtime<kubert::server::Bound>,
    mesh: Mesh,
    index: SharedIndex,
    args: WebhookArgs,
    metrics: AdmissionMetrics,
) -> Result<()> {
    let WebhookArgs {
        webhook_config_name,
        injector_service_name,
        webhook_timeout,
        enable_reconciler,
        webhook_ca_bundle,
        certificate_provider,
        ca_bundle_secret_name,
        sidecar_pull_policy,
    } = args;

    watch_cluster(&mut runtime, &index, &mesh);

    let ca_bundle = std::fs::read(&webhook_ca_bundle).with_context(|| {
        format!(
            "failed to read webhook CA bundle {}",
            webhook_ca_bundle.display()
        )
    })?;
    webhook::apply(
        runtime.client(),
        &webhook::Params {
            name: webhook_config_name,
            mesh_name: mesh.name.clone(),
            control_plane_namespace: mesh.control_plane_namespace.clone(),
            service: injector_service_name,
            timeout_seconds: webhook_timeout,
            ca_bundle,
            reconcile: enable_reconciler,
        },
    )
    .await
    .context("failed to reconcile webhook configuration")?;

    let certs = match certificate_provider {
        ProviderKind::Secret => SecretCertificateProvider::new(
            runtime.client(),
            &mesh.control_plane_namespace,
            ca_bundle_secret_name,
            metrics.clone(),
        ),
    };
    let injector = Injector::new(
        inject::Config {
            mesh_name: mesh.name,
            control_plane_namespace: mesh.control_plane_namespace,
            controller_service: mesh.controller_service_name,
            trust_domain: mesh.trust_domain,
            pull_policy: sidecar_pull_policy,
        },
        certs,
        KubeBootstrapStore::new(runtime.client()),
    );
    let admission = Admission::new(injector, index, metrics);

    spawn_status_server(drain_on_shutdown(&runtime));

    let runtime = runtime.spawn_server(admission);
    info!("Injector started");
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }
    Ok(())
}

async fn run_xnet(
    mut runtime: kubert::Runtime<kubert::runtime::NoServer>,
    mesh: Mesh,
    index: SharedIndex,
    args: XnetArgs,
    status_metrics: StatusMetrics,
    dp_metrics: DataPathMetrics,
    bcast_metrics: BroadcastMetrics,
) -> Result<()> {
    let XnetArgs {
        node_name,
        bpf_pin_root,
        cni_bridge,
        mesh_config_interval,
        e4lb_interval,
        eip_interval,
        workers,
        patch_timeout_ms,
    } = args;

    watch_cluster(&mut runtime, &index, &mesh);

    let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
    tokio::spawn(kubert::index::cluster(index.clone(), nodes).instrument(info_span!("nodes")));

    let slices = runtime.watch_all::<k8s::EndpointSlice>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), slices).instrument(info_span!("endpointslices")),
    );

    let advs = runtime.watch_all::<k8s::EIPAdvertisement>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), advs).instrument(info_span!("eipadvertisements")),
    );

    let acls = runtime.watch_all::<k8s::AccessControl>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), acls).instrument(info_span!("accesscontrols")),
    );

    let claims = lease::init(&runtime, &mesh.control_plane_namespace, &mesh.name, &node_name)
        .await
        .context("failed to initialize lease")?;

    let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
    let status_controller = status::Controller::new(
        runtime.client(),
        updates_rx,
        Duration::from_millis(patch_timeout_ms),
        status_metrics,
    );
    tokio::spawn(
        status_controller
            .run()
            .instrument(info_span!("status_controller")),
    );

    let maps = NodeMaps::pinned(&bpf_pin_root);
    let neighbors = Netlink::connect().context("failed to connect to rtnetlink")?;
    let applier = Arc::new(Applier::new(
        &node_name,
        &cni_bridge,
        index.clone(),
        maps.clone(),
        Arc::new(neighbors),
        Arc::new(RawAnnouncer::new()),
        Arc::new(ConnectProber::default()),
        dp_metrics.clone(),
    ));
    let dns = DnsSync::new(index.clone(), maps.clone(), &cni_bridge, dp_metrics.clone());
    let e4lb = E4lbPhase {
        scheduler: Scheduler::new(index.clone(), &node_name, claims, updates_tx),
        applier: applier.clone(),
        acl: AclSync::new(index.clone(), maps.acl.clone(), dp_metrics),
    };

    let drain = drain_on_shutdown(&runtime);
    let workers = workers.map_or_else(
        || std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        NonZeroUsize::get,
    );
    let broadcast = Broadcast::new(
        index,
        Intervals {
            mesh_config: Duration::from_secs(mesh_config_interval),
            e4lb: Duration::from_secs(e4lb_interval),
            eip: Duration::from_secs(eip_interval),
        },
        workers,
        bcast_metrics,
        Arc::new(dns),
        Arc::new(e4lb),
        Arc::new(EipPhase(applier)),
    );
    tokio::spawn(
        broadcast
            .run(drain.clone())
            .instrument(info_span!("broadcast", node = %node_name)),
    );

    spawn_status_server(drain);

    info!(node = %node_name, pin_root = %bpf_pin_root.display(), "Xnet started");
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }
    Ok(())
}

/// Watches the resources both commands read: namespaces, the mesh config
/// and services.
fn watch_cluster<S>(runtime: &mut kubert::Runtime<S>, index: &SharedIndex, mesh: &Mesh)
where
    S: 'static,
{
    let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
    tokio::spawn(
        kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
    );

    let configs = runtime.watch_all::<k8s::MeshConfig>(
        watcher::Config::default().fields(&format!("metadata.name={}", mesh.mesh_config_name)),
    );
    tokio::spawn(
        kubert::index::namespaced(index.clone(), configs).instrument(info_span!("meshconfigs")),
    );

    let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
    );
}

/// Releases the runtime's shutdown only after every task holding the
/// returned watch has drained.
fn drain_on_shutdown<S>(runtime: &kubert::Runtime<S>) -> drain::Watch {
    let (signal, watch) = drain::channel();
    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        let release = shutdown.signaled().await;
        signal.drain().await;
        drop(release);
    });
    watch
}

fn spawn_status_server(drain: drain::Watch) {
    let addr = SocketAddr::from(([0, 0, 0, 0], http::STATUS_PORT));
    tokio::spawn(async move {
        if let Err(error) = http::serve(addr, drain).await {
            tracing::error!(%error, "Status server failed");
        }
    });
}
