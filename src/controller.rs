use crate::evaluator::{Evaluation, FreshnessEvaluator};
use crate::inventory::collect_usage;
use crate::report::{log_evaluation, render};
use crate::state::ControllerContext;
use anyhow::Context;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::info;

/// Connects to the cluster from an explicit kubeconfig, or the in-cluster/default config
pub async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?;
            Client::try_from(config).context("Failed to create K8s client")?
        }
        None => Client::try_default()
            .await
            .context("Failed to create K8s client from the default configuration")?,
    };
    let api_server_info = client
        .apiserver_version()
        .await
        .context("Failed to reach the Kubernetes API server")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// One audit: inventory, evaluation with a fresh registry client cache, report
pub async fn run(ctx: ControllerContext) -> anyhow::Result<Evaluation> {
    let usage = collect_usage(&ctx.kube_client, &ctx.image_filter)
        .await
        .context("Failed to obtain the cluster inventory")?;

    info!("Checking {} distinct images for newer tags", usage.len());
    let evaluator = FreshnessEvaluator::new(ctx.transport.clone(), ctx.evaluator_settings());
    let evaluation = evaluator.evaluate(&usage).await;

    log_evaluation(&evaluation);
    if let Some(rendered) = render(&evaluation, ctx.config.output)? {
        println!("{}", rendered);
    }

    ctx.readiness.mark_ready();
    Ok(evaluation)
}
