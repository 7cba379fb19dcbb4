use crate::config::OutputFormat;
use crate::evaluator::{Evaluation, SkipReason};
use anyhow::Context;
use tracing::{info, warn};

pub fn log_evaluation(evaluation: &Evaluation) {
    for result in &evaluation.results {
        info!(
            "Image: {} (deployed version {})",
            result.reference, result.deployed_version
        );
        for newer in &result.newer_tags {
            info!("** Newer tag found for {}: {}", result.image, newer.tag);
        }
        for workload in &result.workloads {
            info!("Used by: {}", workload);
        }
    }

    for skipped in &evaluation.skipped {
        match &skipped.reason {
            SkipReason::DigestPinned(_) => info!("Skipping {}: {}", skipped.image, skipped.reason),
            reason => warn!("Skipping {}: {}", skipped.image, reason),
        }
    }

    let outdated: Vec<_> = evaluation
        .results
        .iter()
        .filter(|result| result.is_outdated())
        .collect();
    info!(
        "Evaluated {} images, {} with newer tags available, {} skipped",
        evaluation.results.len(),
        outdated.len(),
        evaluation.skipped.len()
    );
    for result in outdated {
        if let Some(best) = result.best_available() {
            info!(
                "{} can be upgraded to {} ({} workloads affected)",
                result.image,
                best.tag,
                result.workloads.len()
            );
        }
    }
}

/// Renders the evaluation for stdout. The `log` format has nothing beyond the log lines.
pub fn render(evaluation: &Evaluation, format: OutputFormat) -> anyhow::Result<Option<String>> {
    match format {
        OutputFormat::Log => Ok(None),
        OutputFormat::Json => serde_json::to_string_pretty(evaluation)
            .map(Some)
            .context("Failed to render report as JSON"),
        OutputFormat::Yaml => serde_yaml_ng::to_string(evaluation)
            .map(Some)
            .context("Failed to render report as YAML"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{FreshnessResult, newer_tags};
    use crate::image_reference::ImageReference;
    use crate::version::coerce;
    use crate::workload::WorkloadId;
    use chrono::Utc;

    fn evaluation() -> Evaluation {
        let deployed = coerce("1.25.3").unwrap();
        Evaluation {
            generated_at: Utc::now(),
            results: vec![FreshnessResult {
                image: "nginx:1.25.3".to_string(),
                reference: ImageReference::parse("nginx:1.25.3").unwrap(),
                newer_tags: newer_tags(&deployed, &["1.26.0".to_string()]),
                deployed_version: deployed,
                workloads: vec![WorkloadId {
                    kind: "Deployment".to_string(),
                    namespace: "web".to_string(),
                    name: "frontend".to_string(),
                }],
            }],
            skipped: vec![],
        }
    }

    #[test]
    fn test_log_format_renders_nothing() {
        assert_eq!(render(&evaluation(), OutputFormat::Log).unwrap(), None);
    }

    #[test]
    fn test_json_report() {
        let json = render(&evaluation(), OutputFormat::Json).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let result = &value["results"][0];
        assert_eq!(result["reference"], "library/nginx:1.25.3");
        assert_eq!(result["deployedVersion"], "1.25.3");
        assert_eq!(result["newerTags"][0]["tag"], "1.26.0");
        assert_eq!(result["newerTags"][0]["version"], "1.26.0");
        assert_eq!(result["workloads"][0]["kind"], "Deployment");
    }

    #[test]
    fn test_yaml_report() {
        let yaml = render(&evaluation(), OutputFormat::Yaml).unwrap().unwrap();
        let value: serde_yaml_ng::Value = serde_yaml_ng::from_str(&yaml).unwrap();

        assert_eq!(
            value["results"][0]["deployedVersion"].as_str(),
            Some("1.25.3")
        );
        assert_eq!(value["skipped"].as_sequence().map(Vec::len), Some(0));
    }
}
