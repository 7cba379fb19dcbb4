use crate::image_reference::{ImageReference, ParseError, Reference};
use crate::inventory::WorkloadUsage;
use crate::oci_registry::{RegistryError, RegistryTransport};
use crate::registry_cache::RegistryClientCache;
use crate::version::{CoercionError, ComparableVersion, coerce};
use crate::workload::WorkloadId;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct EvaluatorSettings {
    /// Upper bound for each registry call
    pub timeout: Duration,
    /// Number of images evaluated at the same time
    pub concurrency: usize,
}

/// Why an image was left out of the comparison
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("unable to parse image: {0}")]
    Unparsable(#[from] ParseError),

    #[error("image is pinned to digest {0}")]
    DigestPinned(String),

    #[error("deployed {0}")]
    NonSemverTag(#[from] CoercionError),

    #[error("unable to connect to registry {registry}: {source}")]
    Connection {
        registry: String,
        #[source]
        source: RegistryError,
    },

    #[error("unable to fetch tags for {repository}: {source}")]
    Listing {
        repository: String,
        #[source]
        source: RegistryError,
    },
}

impl SkipReason {
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::Unparsable(_) => "unparsable",
            SkipReason::DigestPinned(_) => "digestPinned",
            SkipReason::NonSemverTag(_) => "nonSemverTag",
            SkipReason::Connection { .. } => "connection",
            SkipReason::Listing { .. } => "listing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewerTag {
    pub tag: String,
    pub version: ComparableVersion,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessResult {
    pub image: String,
    pub reference: ImageReference,
    pub deployed_version: ComparableVersion,
    /// Every remote tag strictly newer than the deployed one, in registry order
    pub newer_tags: Vec<NewerTag>,
    pub workloads: Vec<WorkloadId>,
}

impl FreshnessResult {
    pub fn is_outdated(&self) -> bool {
        !self.newer_tags.is_empty()
    }

    /// Highest of the newer tags
    pub fn best_available(&self) -> Option<&NewerTag> {
        self.newer_tags.iter().max_by(|a, b| a.version.cmp(&b.version))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedImage {
    pub image: String,
    #[serde(serialize_with = "serialize_skip_reason")]
    pub reason: SkipReason,
    pub workloads: Vec<WorkloadId>,
}

fn serialize_skip_reason<S: Serializer>(reason: &SkipReason, serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(2))?;
    map.serialize_entry("kind", reason.kind())?;
    map.serialize_entry("message", &reason.to_string())?;
    map.end()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub generated_at: DateTime<Utc>,
    pub results: Vec<FreshnessResult>,
    pub skipped: Vec<SkippedImage>,
}

/// Compares deployed image tags with the tags available in their registries.
///
/// Each evaluator owns its own registry client cache, so one instance serves one run.
pub struct FreshnessEvaluator {
    cache: RegistryClientCache,
    settings: EvaluatorSettings,
}

impl FreshnessEvaluator {
    pub fn new(transport: Arc<dyn RegistryTransport>, settings: EvaluatorSettings) -> Self {
        Self {
            cache: RegistryClientCache::new(transport),
            settings,
        }
    }

    pub async fn evaluate(&self, usage: &WorkloadUsage) -> Evaluation {
        let outcomes: Vec<_> = futures::stream::iter(usage.clone())
            .map(|(image, workloads)| async move {
                let outcome = self.evaluate_image(&image, &workloads).await;
                (image, workloads, outcome)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut results = Vec::new();
        let mut skipped = Vec::new();
        for (image, workloads, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(reason) => skipped.push(SkippedImage {
                    image,
                    reason,
                    workloads,
                }),
            }
        }
        results.sort_by(|a, b| a.image.cmp(&b.image));
        skipped.sort_by(|a, b| a.image.cmp(&b.image));

        Evaluation {
            generated_at: Utc::now(),
            results,
            skipped,
        }
    }

    pub async fn evaluate_image(
        &self,
        image: &str,
        workloads: &[WorkloadId],
    ) -> Result<FreshnessResult, SkipReason> {
        let reference = ImageReference::parse(image)?;
        let tag = match &reference.reference {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => return Err(SkipReason::DigestPinned(digest.clone())),
        };
        let deployed_version = coerce(tag)?;

        let registry = reference.registry_host();
        let client = tokio::time::timeout(self.settings.timeout, self.cache.get(registry))
            .await
            .unwrap_or_else(|_| Err(RegistryError::Timeout(self.settings.timeout)))
            .map_err(|source| SkipReason::Connection {
                registry: RegistryClientCache::registry_url(registry),
                source,
            })?;

        let repository = reference.repository_path();
        let tags = tokio::time::timeout(self.settings.timeout, client.list_tags(&repository))
            .await
            .unwrap_or_else(|_| Err(RegistryError::Timeout(self.settings.timeout)))
            .map_err(|source| SkipReason::Listing {
                repository: repository.clone(),
                source,
            })?;

        Ok(FreshnessResult {
            image: image.to_string(),
            newer_tags: newer_tags(&deployed_version, &tags),
            deployed_version,
            reference,
            workloads: workloads.to_vec(),
        })
    }
}

/// Remote tags whose version is strictly greater than `deployed`
pub fn newer_tags(deployed: &ComparableVersion, tags: &[String]) -> Vec<NewerTag> {
    tags.iter()
        .filter_map(|tag| match coerce(tag) {
            Ok(version) => Some(NewerTag {
                tag: tag.clone(),
                version,
            }),
            Err(e) => {
                debug!("Skipping non-semver tag: {}", e);
                None
            }
        })
        .filter(|candidate| candidate.version > *deployed)
        .collect()
}
