use agent::{leader, observability, provider, watch};
use anyhow::Context;
use clap::Parser;
use derivative::Derivative;
use futures::FutureExt;
use indexer::Controller;
use intake_client::DeltaStreamer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Agent is a daemon which watches a Kubernetes cluster and streams its
/// inventory graph to the intake service.
#[derive(Derivative, Parser)]
#[derivative(Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// host:port of the intake service.
    #[clap(long = "intake-address", env = "INTAKE_ADDRESS")]
    intake_address: String,
    /// Bearer token presented to the intake service.
    #[derivative(Debug = "ignore")]
    #[clap(long = "intake-api-key", env = "INTAKE_API_KEY")]
    intake_api_key: Option<String>,
    /// Use TLS when talking to the intake service.
    #[clap(long = "intake-secure", env = "INTAKE_SECURE")]
    intake_secure: bool,
    /// Proactively rotate the intake stream once it reaches this age.
    #[clap(
        long = "max-stream-age",
        env = "MAX_STREAM_AGE",
        default_value = "30m",
        value_parser = humantime::parse_duration
    )]
    max_stream_age: std::time::Duration,

    /// Which provider probe determines cluster identity.
    #[clap(long = "kubernetes-provider", value_enum, default_value = "kind")]
    kubernetes_provider: provider::Provider,
    /// EKS account id override.
    #[clap(long = "kubernetes-provider-eks-account-id")]
    eks_account_id: Option<String>,
    /// EKS region override.
    #[clap(long = "kubernetes-provider-eks-region")]
    eks_region: Option<String>,
    /// EKS cluster name.
    #[clap(long = "kubernetes-provider-eks-cluster-name")]
    eks_cluster_name: Option<String>,
    /// Autodiscover EKS account and region from instance metadata.
    #[clap(long = "kubernetes-provider-eks-autodiscover")]
    eks_autodiscover: bool,
    /// GKE project id.
    #[clap(long = "kubernetes-provider-gke-project-id")]
    gke_project_id: Option<String>,
    /// GKE region.
    #[clap(long = "kubernetes-provider-gke-region")]
    gke_region: Option<String>,
    /// GKE cluster name.
    #[clap(long = "kubernetes-provider-gke-cluster-name")]
    gke_cluster_name: Option<String>,
    /// AKS subscription id.
    #[clap(long = "kubernetes-provider-aks-subscription-id")]
    aks_subscription_id: Option<String>,
    /// AKS region.
    #[clap(long = "kubernetes-provider-aks-region")]
    aks_region: Option<String>,
    /// AKS cluster name.
    #[clap(long = "kubernetes-provider-aks-cluster-name")]
    aks_cluster_name: Option<String>,
    /// kind cluster name.
    #[clap(long = "kubernetes-provider-kind-cluster-name")]
    kind_cluster_name: Option<String>,

    /// Restrict indexing to the replica holding the leader lease.
    #[clap(long = "leader-elect")]
    leader_elect: bool,
    /// Namespace of the leader lease.
    #[clap(long = "leader-elect-namespace", default_value = "kube-system")]
    leader_elect_namespace: String,

    /// Address of the metrics endpoint.
    #[clap(long = "metrics-bind-address", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,
    /// Address of the health probe endpoints.
    #[clap(long = "health-probe-bind-address", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,
}

impl Args {
    fn provider_overrides(&self) -> provider::Overrides {
        match self.kubernetes_provider {
            provider::Provider::Eks => provider::Overrides {
                account: self.eks_account_id.clone(),
                region: self.eks_region.clone(),
                cluster_name: self.eks_cluster_name.clone(),
                autodiscover: self.eks_autodiscover,
            },
            provider::Provider::Gke => provider::Overrides {
                account: self.gke_project_id.clone(),
                region: self.gke_region.clone(),
                cluster_name: self.gke_cluster_name.clone(),
                autodiscover: false,
            },
            provider::Provider::Aks => provider::Overrides {
                account: self.aks_subscription_id.clone(),
                region: self.aks_region.clone(),
                cluster_name: self.aks_cluster_name.clone(),
                autodiscover: false,
            },
            provider::Provider::Kind => provider::Overrides {
                cluster_name: self.kind_cluster_name.clone(),
                ..Default::default()
            },
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    // Startup failures below here terminate the process with exit code 1.
    let cluster = provider::probe(args.kubernetes_provider, args.provider_overrides())
        .await
        .context("probing cluster identity")?;
    tracing::info!(?cluster, "determined cluster identity");

    let intake = intake_client::connect(
        &args.intake_address,
        args.intake_api_key.clone(),
        args.intake_secure,
    )
    .await
    .context("connecting to intake service")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("initializing kubernetes client")?;

    let registry = prometheus::Registry::new();
    let streamer_metrics = intake_client::Metrics::new();
    streamer_metrics
        .register(&registry)
        .context("registering streamer metrics")?;
    let indexer_metrics = indexer::Metrics::new();
    indexer_metrics
        .register(&registry)
        .context("registering indexer metrics")?;

    let store = graph::Store::new();
    store
        .update_resource(indexer::cluster_resource(&cluster))
        .await
        .context("indexing the cluster resource")?;

    // The streamer subscribes before any watcher runs, so nothing the
    // indexer commits is ever missed upstream.
    let events = store.subscribe(None);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received interrupt; shutting down");
            cancel.cancel();
        }
    });

    let streamer = DeltaStreamer::new(intake, args.max_stream_age, streamer_metrics);
    let streamer_task = tokio::spawn(streamer.run(events, cancel.clone()));

    let controller = Arc::new(Controller::new(
        store.clone(),
        cluster.clone(),
        indexer_metrics,
    ));
    let readiness = observability::Readiness::default();

    // Wire up the indexing pipeline, gated on leadership when enabled.
    let index_task = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        let readiness = readiness.clone();
        let leader_elect = args.leader_elect;
        let lease_namespace = args.leader_elect_namespace.clone();
        let kube_client = kube_client.clone();
        async move {
            if leader_elect {
                let identity =
                    std::env::var("HOSTNAME").unwrap_or_else(|_| "inventory-agent".to_string());
                let elected = leader::lead(
                    kube_client.clone(),
                    &lease_namespace,
                    "inventory-agent",
                    &identity,
                    cancel.clone(),
                )
                .await?;
                if !elected {
                    return Ok(());
                }
            }
            readiness.set_ready();

            let watchers = watch::spawn(kube_client, controller.clone(), cancel.clone());
            controller.run(cancel).await;
            for watcher in watchers {
                let _ = watcher.await;
            }
            anyhow::Result::Ok(())
        }
    });

    let metrics_server = observability::serve(
        &args.metrics_bind_address,
        observability::metrics_router(registry),
        cancel.clone(),
    );
    let health_server = observability::serve(
        &args.health_probe_bind_address,
        observability::health_router(readiness.clone()),
        cancel.clone(),
    );

    let streamer_task = streamer_task.map(|result| result.context("delta streamer panicked"));
    let index_task = index_task.map(|result| {
        result
            .context("indexing pipeline panicked")
            .and_then(std::convert::identity)
    });
    let ((), (), (), ()) = tokio::try_join!(
        streamer_task,
        index_task,
        metrics_server,
        health_server,
    )?;

    // Every publisher has exited; close the feed and its subscribers.
    store.close().await;
    Ok(())
}
