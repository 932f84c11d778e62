use crate::{
    apply::KubeApplier,
    controller::{self, Context},
    core::{
        autoimport::AutoImporter,
        bootstrap::BootstrapCredentialBuilder,
        ca::CaResolver,
        reaper::NamespaceReaper,
        render::{DefaultImages, DefaultPullSecret, RenderSettings},
        state::{Features, ImportStateMachine},
        work::WorkDistributor,
    },
    hub::KubeHub,
    k8s::{Client, Infrastructure, Resource},
    lease::{self, Leader},
    metrics::ControllerMetrics,
};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// One year.
const DEFAULT_TOKEN_EXPIRATION_SECONDS: &str = "31536000";

#[derive(Debug, Parser)]
#[clap(
    name = "import-controller",
    about = "Imports managed clusters into a hub"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "import_controller=info,warn",
        env = "IMPORT_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, env = "REGISTRATION_OPERATOR_IMAGE")]
    registration_operator_image: String,

    #[clap(long, env = "REGISTRATION_IMAGE")]
    registration_image: String,

    #[clap(long, env = "WORK_IMAGE")]
    work_image: String,

    /// The hub's default image pull secret, in the controller namespace.
    #[clap(long, env = "DEFAULT_IMAGE_PULL_SECRET", default_value = "")]
    default_image_pull_secret: String,

    /// The controller's own namespace.
    #[clap(long, env = "POD_NAMESPACE", default_value = "open-cluster-management")]
    pod_namespace: String,

    #[clap(long, default_value = "10")]
    max_concurrent_reconciles: u16,

    /// Lifetime of minted bootstrap tokens.
    #[clap(long, default_value = DEFAULT_TOKEN_EXPIRATION_SECONDS)]
    token_expiration_seconds: i64,

    #[clap(long)]
    enable_hosted_mode: bool,

    #[clap(long, default_value = "managedcluster-import-controller")]
    lease_name: String,

    #[clap(long, default_value = "managedcluster-import-controller")]
    controller_deployment: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            registration_operator_image,
            registration_image,
            work_image,
            default_image_pull_secret,
            pod_namespace,
            max_concurrent_reconciles,
            token_expiration_seconds,
            enable_hosted_mode,
            lease_name,
            controller_deployment,
        } = self;

        if token_expiration_seconds <= 0 {
            bail!("--token-expiration-seconds must be positive");
        }
        if max_concurrent_reconciles == 0 {
            bail!("--max-concurrent-reconciles must be positive");
        }

        let mut prom = <Registry>::default();
        let metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("import_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME").context("Failed to fetch `HOSTNAME` environment variable")?;
        let claims = lease::init(
            &runtime,
            &pod_namespace,
            &lease_name,
            &controller_deployment,
            &hostname,
        )
        .await?;
        let leader = Leader::new(claims, hostname);

        let client = runtime.client();
        let deploy_on_ocp = api_resource_exists::<Infrastructure>(&client).await;
        info!(deploy_on_ocp, hosted_mode = enable_hosted_mode, "Starting import controller");

        let hub = KubeHub::new(client.clone());
        let settings = RenderSettings {
            images: DefaultImages {
                registration_operator: registration_operator_image,
                registration: registration_image,
                work: work_image,
            },
            pull_secret: DefaultPullSecret {
                namespace: pod_namespace.clone(),
                name: default_image_pull_secret,
            },
            pod_namespace: pod_namespace.clone(),
        };
        let machine = ImportStateMachine::new(
            BootstrapCredentialBuilder::new(
                CaResolver::new(hub.clone(), pod_namespace, deploy_on_ocp),
                hub.clone(),
                chrono::Duration::seconds(token_expiration_seconds),
            ),
            WorkDistributor::new(hub.clone()),
            AutoImporter::new(hub.clone(), KubeApplier::new(client.clone())),
            hub.clone(),
            settings,
            Features {
                hosted_mode: enable_hosted_mode,
            },
        );

        let clusters = Arc::new(Context {
            inner: machine,
            leader: leader.clone(),
            metrics: metrics.clone(),
        });
        let namespaces = Arc::new(Context {
            inner: NamespaceReaper::new(hub),
            leader: leader.clone(),
            metrics,
        });

        // Controllers start once this replica leads; they stand down again
        // per reconcile if the lease moves elsewhere.
        tokio::spawn(
            async move {
                if let Err(error) = leader.acquired().await {
                    tracing::error!(%error, "Lease watch closed before it was claimed");
                    return;
                }
                info!("Claimed the controller lease");
                tokio::spawn(
                    controller::cluster::run(client.clone(), clusters, max_concurrent_reconciles)
                        .instrument(info_span!("clusters")),
                );
                tokio::spawn(
                    controller::namespace::run(client, namespaces, max_concurrent_reconciles)
                        .instrument(info_span!("namespaces")),
                );
            }
            .instrument(info_span!("leader")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
