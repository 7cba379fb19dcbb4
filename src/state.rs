use crate::config::Config;
use crate::evaluator::EvaluatorSettings;
use crate::inventory::ImageFilter;
use crate::oci_registry::RegistryTransport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn RegistryTransport>,
    pub(crate) image_filter: ImageFilter,
    pub(crate) readiness: Readiness,
}

impl ControllerContext {
    pub fn new(
        kube_client: kube::Client,
        config: Config,
        transport: Arc<dyn RegistryTransport>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            kube_client,
            image_filter: ImageFilter::new(&config.ignore_images)?,
            config: Arc::new(config),
            transport,
            readiness: Readiness::default(),
        })
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    pub(crate) fn evaluator_settings(&self) -> EvaluatorSettings {
        evaluator_settings(&self.config)
    }
}

pub(crate) fn evaluator_settings(config: &Config) -> EvaluatorSettings {
    EvaluatorSettings {
        timeout: config.registry.timeout(),
        concurrency: config.concurrency.0.max(1),
    }
}

/// Flips to ready once the first audit has completed
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
