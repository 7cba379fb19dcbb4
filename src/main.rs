use clap::Parser;
use kube_image_freshness::config::{self, Config, OutputFormat};
use kube_image_freshness::controller;
use kube_image_freshness::oci_registry::{self, HttpRegistryTransport};
use kube_image_freshness::state::ControllerContext;
use kube_image_freshness::webserver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "kube-image-freshness")]
#[command(version, about = "Reports running container images with newer tags available")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "FRESHNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a kubeconfig file, otherwise the in-cluster or default config is used
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Report format written to stdout, overrides the configuration file
    #[arg(long, value_enum)]
    output: Option<OutputFormat>,

    /// Cron expression to audit periodically instead of once
    #[arg(long, env = "CRON_SCHEDULE")]
    schedule: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    info!("Starting kube-image-freshness {}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(output) = cli.output {
        config.output = output;
    }
    if let Some(schedule) = cli.schedule {
        config.schedule = Some(schedule);
    }

    let kube_client = controller::create_client(cli.kubeconfig.as_deref()).await?;
    let http_client = oci_registry::create_client(&config)?;
    let transport = Arc::new(HttpRegistryTransport::new(http_client));
    let schedule = config.schedule.clone();
    let port = config.webserver.port;
    let ctx = ControllerContext::new(kube_client, config, transport)?;

    let Some(cron_schedule) = schedule else {
        controller::run(ctx).await?;
        return Ok(());
    };

    info!("Executing job scheduler at cron schedule {}", cron_schedule);
    let mut scheduler = JobScheduler::new().await?;
    let readiness = ctx.readiness();
    let job = Job::new_async(cron_schedule, move |_uuid, _l| {
        let ctx = ctx.clone();
        Box::pin(async move {
            info!("Running scheduled image freshness audit");
            if let Err(e) = controller::run(ctx).await {
                error!("Error running image freshness audit: {:?}", e);
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    let app = webserver::create_app(readiness);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
