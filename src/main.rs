use std::path::{Path, PathBuf};
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};

use job_mutator::controllers::hostaliases::HostAliasInjector;
use job_mutator::controllers::jobmutator::{Config, KubeJobStore, Orchestrator, RetryPolicy};
use job_mutator::telemetry::{self, LogFormat};
use job_mutator::webhook::{self, Webhooks};
use job_mutator::State;

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Address of the HTTPS admission endpoints
    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:9443")]
    webhook_bind_address: String,

    /// Address of the plain HTTP metrics and health endpoints
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    /// Directory holding tls.crt and tls.key
    #[arg(
        long,
        env = "CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    cert_dir: PathBuf,

    /// timeoutSeconds of the webhook registration; no request is handled for longer than this
    #[arg(long, env = "WEBHOOK_TIMEOUT_SECONDS", default_value_t = 10)]
    webhook_timeout_seconds: u64,

    /// Interval between checks that a deleted Job is gone
    #[arg(long, env = "CONFIRM_INTERVAL_MS", default_value_t = 500)]
    confirm_interval_ms: u64,

    /// Longest wait for a deleted Job to disappear
    #[arg(long, env = "CONFIRM_DEADLINE_MS", default_value_t = 8000)]
    confirm_deadline_ms: u64,

    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 5)]
    retry_attempts: u32,

    #[arg(long, env = "RETRY_INITIAL_BACKOFF_MS", default_value_t = 10)]
    retry_initial_backoff_ms: u64,

    #[arg(long, env = "RETRY_MAX_BACKOFF_MS", default_value_t = 1000)]
    retry_max_backoff_ms: u64,

    /// Domain suffix of in-cluster service names
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

impl Arguments {
    fn reconcile_config(&self) -> Config {
        // leave a second to encode and send the response
        let request_budget = Duration::from_secs(self.webhook_timeout_seconds)
            .saturating_sub(Duration::from_secs(1));
        Config {
            retry: RetryPolicy {
                attempts: self.retry_attempts,
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            },
            confirm_interval: Duration::from_millis(self.confirm_interval_ms),
            confirm_deadline: Duration::from_millis(self.confirm_deadline_ms),
            request_budget,
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

fn load_tls_config(cert_dir: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let cert_path = cert_dir.join("tls.crt");
    let key_path = cert_dir.join("tls.key");

    let certs = CertificateDer::pem_file_iter(&cert_path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("reading certificates from {}", cert_path.display()))?;
    let key = PrivateKeyDer::from_pem_file(&key_path)
        .with_context(|| format!("reading private key from {}", key_path.display()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format)?;

    // Install the crypto provider for rustls (ignore error if already installed)
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let tls_config = load_tls_config(&args.cert_dir)?;

    let client = Client::try_default().await?;
    let state = State::default();

    let webhooks = Data::new(Webhooks {
        jobs: Orchestrator::new(
            KubeJobStore::new(client.clone()),
            args.reconcile_config(),
            tracing::info_span!("job-mutator"),
        ),
        pods: HostAliasInjector::new(
            client,
            args.cluster_domain.clone(),
            tracing::info_span!("hostaliases-injector"),
        ),
        state: state.clone(),
    });

    let webhook_server = HttpServer::new(move || {
        App::new()
            .app_data(webhooks.clone())
            .wrap(middleware::Logger::default())
            .configure(webhook::configure)
    })
    .bind_rustls_0_23(&args.webhook_bind_address, tls_config)?
    .shutdown_timeout(5)
    .run();

    // Start web server
    let metrics_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.metrics_bind_address)?
    .shutdown_timeout(5)
    .run();

    tracing::info!(
        webhook = %args.webhook_bind_address,
        metrics = %args.metrics_bind_address,
        "Serving admission webhooks"
    );

    // Both servers implement graceful shutdown, so poll until both are done
    let (webhook_result, metrics_result) = tokio::join!(webhook_server, metrics_server);
    webhook_result?;
    metrics_result?;
    Ok(())
}
