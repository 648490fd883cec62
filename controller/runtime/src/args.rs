use crate::{
    admission::Admission,
    api::{self, ServicesApi},
    gateway::{self, Gateway, KubeServices},
    k8s::{Api, Service},
    ledger::Ledger,
    metrics::{ControllerMetrics, GatewayMetrics},
    reconcile, server, workload,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "tollgate", about = "A metered service controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "tollgate=info,warn",
        env = "TOLLGATE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Namespace holding workload Deployments and their network endpoints.
    #[clap(long, default_value = "tollgate-apps", env = "TOLLGATE_NAMESPACE")]
    namespace: String,

    /// Suffix of the public hostnames reported by the services API.
    #[clap(long, default_value = "local", env = "TOLLGATE_HOSTNAME")]
    hostname_suffix: String,

    #[clap(long, env = "RUNTIME_CLASS_NAME")]
    runtime_class_name: Option<String>,

    /// Amount charged for each request through the gateway.
    #[clap(long, default_value = "1", env = "REQUEST_PRICE")]
    request_price: u64,

    /// Amount charged for each upload through the services API.
    #[clap(long, default_value = "1", env = "SERVICE_PRICE")]
    service_price: u64,

    #[clap(long, default_value = "http://localhost:3000", env = "LEDGER_URL")]
    ledger_url: String,

    /// Base URL of the pages clients are redirected to when a request cannot
    /// be served.
    #[clap(long, default_value = "http://localhost:8080", env = "TOLLGATE_WEB_URL")]
    web_url: String,

    /// Host that workload pods must be unable to reach before they start.
    #[clap(
        long,
        default_value = "hello.tollgate-system",
        env = "READINESS_CHECK_HOST"
    )]
    readiness_check_host: String,

    #[clap(long, default_value = "0.0.0.0:8082")]
    proxy_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8081")]
    services_api_addr: SocketAddr,
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
            server,
            admission_controller_disabled,
            namespace,
            hostname_suffix,
            runtime_class_name,
            request_price,
            service_price,
            ledger_url,
            web_url,
            readiness_check_host,
            proxy_addr,
            services_api_addr,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let gateway_metrics = GatewayMetrics::register(prom.sub_registry_with_prefix("gateway"));
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let ledger = Ledger::new(ledger_url);

        // Spawn the Service controller.
        let ctx = Arc::new(reconcile::Context::new(
            client.clone(),
            workload::Config {
                namespace: namespace.clone(),
                runtime_class_name,
            },
            readiness_check_host,
            controller_metrics,
        ));
        tokio::spawn(reconcile::run(ctx, runtime.shutdown_handle()));

        // Run the gateway, charging for and forwarding client traffic.
        let gateway = Gateway::new(
            KubeServices::new(client.clone(), &namespace),
            ledger.clone(),
            gateway::Config {
                namespace,
                web_url,
                request_price,
            },
            gateway_metrics,
        );
        tokio::spawn(
            server::serve("gateway", proxy_addr, gateway, runtime.shutdown_handle())
                .instrument(info_span!("gateway")),
        );

        let services_api = ServicesApi::new(
            Api::<Service>::all(client.clone()),
            ledger,
            api::Config {
                hostname_suffix,
                service_price,
            },
        );
        tokio::spawn(
            server::serve(
                "services API",
                services_api_addr,
                services_api,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("services_api")),
        );

        let runtime = runtime.spawn_server(move || Admission::new(client));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
