use crate::admin::Admin;
use anyhow::{Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use slipway_core::{SecretRef, ServiceRef};
use slipway_k8s_api::{watcher, Api, Client, NamespaceResourceScope, Resource, WatchConfig};
use slipway_k8s_index::{
    metrics::ProcessorMetrics, processor, CertStore, ClusterInfo, EndpointIndex, IngressIndex,
    SecretIndex, ServiceIndex,
};
use slipway_proxy::{serve_http, serve_https, Director, Proxy, ProxyMetrics, Transports};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, time};
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// In-flight requests get this long to finish once shutdown starts.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[clap(
    name = "slipway",
    about = "A Kubernetes ingress controller and edge reverse proxy"
)]
pub struct Args {
    #[clap(long, default_value = "slipway=info,warn", env = "SLIPWAY_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain", env = "SLIPWAY_LOG_FORMAT")]
    log_format: LogFormat,

    /// Restrict all watches to one namespace; empty watches the whole
    /// cluster.
    #[clap(long, default_value = "")]
    namespace: String,

    /// Serve only ingresses carrying this class; an empty class serves
    /// only ingresses with no class at all.
    #[clap(long, default_value = "slipway")]
    ingress_class: String,

    /// Label selector applied to the ingress watch.
    #[clap(long)]
    label_selector: Option<String>,

    /// NAMESPACE/NAME of a backend service for requests no rule matches.
    #[clap(long)]
    default_backend: Option<ServiceRef>,

    /// Ordered NAMESPACE/NAME list of default TLS certificate secrets.
    #[clap(long, value_delimiter = ',')]
    default_tls_secrets: Vec<SecretRef>,

    /// NAMESPACE/NAME of a secret holding the client certificate for
    /// upstream mTLS.
    #[clap(long)]
    client_tls_secret: Option<SecretRef>,

    /// Redirect cleartext requests to HTTPS for ingresses that do not
    /// set the ssl-redirect annotation themselves.
    #[clap(long)]
    redirect_http_to_https: bool,

    #[clap(long, default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8443")]
    https_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9090")]
    admin_addr: SocketAddr,

    /// Advertise HTTP/3 on the HTTPS port via Alt-Svc.
    #[clap(long)]
    http3_advertise: bool,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            namespace,
            ingress_class,
            label_selector,
            default_backend,
            default_tls_secrets,
            client_tls_secret,
            redirect_http_to_https,
            http_addr,
            https_addr,
            admin_addr,
            http3_advertise,
        } = self;

        let filter = EnvFilter::try_new(&log_level).context("invalid log level")?;
        match log_format {
            LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init(),
        }

        let cluster = Arc::new(ClusterInfo {
            ingress_class,
            default_backend,
            redirect_http_to_https,
        });

        // Build the shared state: the certificate store and the three
        // request-path indices.
        let certs = CertStore::new(default_tls_secrets, client_tls_secret);
        let ingresses = IngressIndex::shared(cluster.clone(), certs.clone());
        let services = ServiceIndex::shared();
        let endpoints = EndpointIndex::shared();

        let mut registry = Registry::with_prefix("slipway");
        slipway_k8s_index::metrics::register(
            registry.sub_registry_with_prefix("index"),
            ingresses.clone(),
            endpoints.clone(),
            services.clone(),
            certs.clone(),
        );
        let proxy_metrics = ProxyMetrics::register(registry.sub_registry_with_prefix("proxy"));

        let client = Client::try_default()
            .await
            .context("failed to build the Kubernetes client")?;

        // One watch per resource kind, each feeding its own index through
        // the serial reconcile loop. Readiness is the conjunction of
        // their initial lists.
        let mut ready = Vec::new();
        let reconcilers = registry.sub_registry_with_prefix("reconciler");

        let ingress_cfg = match &label_selector {
            Some(selector) => WatchConfig::default().labels(selector),
            None => WatchConfig::default(),
        };
        // An unparseable selector must fail loudly rather than watch
        // everything.
        if let Some(selector) = &label_selector {
            selector
                .parse::<kube::core::Selector>()
                .with_context(|| format!("invalid label selector {selector:?}"))?;
        }

        let (tx, rx) = watch::channel(false);
        ready.push(rx);
        tokio::spawn(
            processor::run(
                ingresses.clone(),
                watcher(api_for::<slipway_k8s_api::Ingress>(&client, &namespace), ingress_cfg),
                tx,
                ProcessorMetrics::register(reconcilers, "ingresses"),
            )
            .instrument(info_span!("ingresses")),
        );

        let (tx, rx) = watch::channel(false);
        ready.push(rx);
        tokio::spawn(
            processor::run(
                services.clone(),
                watcher(
                    api_for::<slipway_k8s_api::Service>(&client, &namespace),
                    WatchConfig::default(),
                ),
                tx,
                ProcessorMetrics::register(reconcilers, "services"),
            )
            .instrument(info_span!("services")),
        );

        let (tx, rx) = watch::channel(false);
        ready.push(rx);
        tokio::spawn(
            processor::run(
                endpoints.clone(),
                watcher(
                    api_for::<slipway_k8s_api::Endpoints>(&client, &namespace),
                    WatchConfig::default(),
                ),
                tx,
                ProcessorMetrics::register(reconcilers, "endpoints"),
            )
            .instrument(info_span!("endpoints")),
        );

        let secrets = SecretIndex::shared(certs.clone());
        let (tx, rx) = watch::channel(false);
        ready.push(rx);
        tokio::spawn(
            processor::run(
                secrets,
                watcher(
                    api_for::<slipway_k8s_api::Secret>(&client, &namespace),
                    WatchConfig::default(),
                ),
                tx,
                ProcessorMetrics::register(reconcilers, "secrets"),
            )
            .instrument(info_span!("secrets")),
        );

        // The data plane.
        let director = Director::new(cluster, ingresses.clone(), services, endpoints.clone());
        let proxy = Proxy::new(
            director,
            Transports::new(certs.clone()),
            proxy_metrics,
            http3_advertise.then_some(https_addr.port()),
        );
        let tls_config = slipway_proxy::server_config(certs.clone());

        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind {http_addr}"))?;
        let https_listener = TcpListener::bind(https_addr)
            .await
            .with_context(|| format!("failed to bind {https_addr}"))?;
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind {admin_addr}"))?;

        let (drain_signal, drain) = drain::channel();

        info!(%http_addr, "HTTP listening");
        tokio::spawn(serve_http(http_listener, proxy.clone(), drain.clone()));
        info!(%https_addr, "HTTPS listening");
        tokio::spawn(serve_https(
            https_listener,
            tls_config,
            proxy,
            drain.clone(),
        ));

        let admin = Admin::new(Arc::new(registry), ready, ingresses, endpoints, certs);
        info!(%admin_addr, "admin listening");
        tokio::spawn(admin.serve(admin_listener, drain));

        tokio::signal::ctrl_c()
            .await
            .context("failed to watch for the shutdown signal")?;
        info!("shutdown signal received; draining");
        if time::timeout(DRAIN_GRACE, drain_signal.drain())
            .await
            .is_err()
        {
            warn!("graceful drain timed out");
        }
        Ok(())
    }
}

fn api_for<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}
