use crate::workload::{Workload, WorkloadId};
use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Raw image string to the workloads declaring it
pub type WorkloadUsage = BTreeMap<String, Vec<WorkloadId>>;

/// Drops images matching any of the configured glob patterns
#[derive(Debug, Clone)]
pub struct ImageFilter {
    ignored: GlobSet,
}

impl ImageFilter {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid ignoreImages pattern {:?}", pattern))?,
            );
        }
        Ok(Self {
            ignored: builder.build().context("Failed to build image ignore list")?,
        })
    }

    pub fn is_ignored(&self, image: &str) -> bool {
        self.ignored.is_match(image)
    }
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            ignored: GlobSet::empty(),
        }
    }
}

/// Adds the images of workloads not controlled by another listed object to `usage`
pub fn record_workloads<K: Workload>(usage: &mut WorkloadUsage, workloads: &[K], filter: &ImageFilter) {
    for workload in workloads.iter().filter(|w| !w.has_listed_controller()) {
        let id = workload.workload_id();
        for image in workload.images() {
            if filter.is_ignored(&image) {
                debug!("Ignoring image {} used by {}", image, id);
                continue;
            }
            usage.entry(image).or_default().push(id.clone());
        }
    }
}

async fn list_all<K: Workload>(client: &Client) -> anyhow::Result<Vec<K>> {
    let api: Api<K> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("Failed to list {} resources", K::kind_name()))?;
    debug!("Found {} {} resources", list.items.len(), K::kind_name());
    Ok(list.items)
}

/// Lists workloads across all namespaces and groups them by image
pub async fn collect_usage(client: &Client, filter: &ImageFilter) -> anyhow::Result<WorkloadUsage> {
    let mut usage = WorkloadUsage::new();
    record_workloads(&mut usage, &list_all::<Deployment>(client).await?, filter);
    record_workloads(&mut usage, &list_all::<ReplicaSet>(client).await?, filter);
    record_workloads(&mut usage, &list_all::<StatefulSet>(client).await?, filter);
    record_workloads(&mut usage, &list_all::<DaemonSet>(client).await?, filter);
    record_workloads(&mut usage, &list_all::<CronJob>(client).await?, filter);
    record_workloads(&mut usage, &list_all::<Job>(client).await?, filter);
    record_workloads(&mut usage, &list_all::<Pod>(client).await?, filter);

    let workloads: usize = usage.values().map(Vec::len).sum();
    info!(
        "Collected {} distinct images from {} workload references",
        usage.len(),
        workloads
    );
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::tests::{container, controller, deployment, pod, replica_set};
    use k8s_openapi::api::core::v1::PodSpec;

    #[test]
    fn test_record_workloads_groups_by_image() {
        let deployments = vec![
            deployment("shop", "web", vec![container("web", "nginx:1.25")]),
            deployment(
                "shop",
                "api",
                vec![container("api", "shop/api:2.0"), container("proxy", "nginx:1.25")],
            ),
        ];
        let pods = vec![
            pod(
                "debug",
                "toolbox",
                None,
                PodSpec {
                    containers: vec![container("shell", "busybox")],
                    ..Default::default()
                },
            ),
            pod(
                "shop",
                "web-7d9f-x2x",
                Some(controller("apps/v1", "ReplicaSet", "web-7d9f")),
                PodSpec {
                    containers: vec![container("web", "nginx:1.25")],
                    ..Default::default()
                },
            ),
        ];

        let mut usage = WorkloadUsage::new();
        record_workloads(&mut usage, &deployments, &ImageFilter::default());
        record_workloads(&mut usage, &pods, &ImageFilter::default());

        assert_eq!(usage.len(), 3);
        let users: Vec<String> = usage["nginx:1.25"].iter().map(|w| w.to_string()).collect();
        assert_eq!(users, vec!["Deployment shop/web", "Deployment shop/api"]);
        assert_eq!(usage["busybox"][0].to_string(), "Pod debug/toolbox");
        assert_eq!(usage["shop/api:2.0"].len(), 1);
    }

    #[test]
    fn test_operator_managed_workloads_are_attributed_to_themselves() {
        let mut database = deployment("db", "main", vec![container("postgres", "postgres:16.1")]);
        database.metadata.owner_references = Some(vec![controller(
            "postgres-operator.crunchydata.com/v1beta1",
            "PostgresCluster",
            "main",
        )]);
        let replica_sets = vec![
            replica_set(
                "db",
                "main-5c8d",
                Some(controller("apps/v1", "Deployment", "main")),
                vec![container("postgres", "postgres:16.1")],
            ),
            replica_set("legacy", "worker", None, vec![container("worker", "legacy/worker:0.9")]),
        ];
        let static_pod_spec = PodSpec {
            containers: vec![container("etcd", "registry.k8s.io/etcd:3.5.12-0")],
            ..Default::default()
        };
        let postgres_pod_spec = PodSpec {
            containers: vec![container("postgres", "postgres:16.1")],
            ..Default::default()
        };
        let pods = vec![
            pod(
                "kube-system",
                "etcd-worker-1",
                Some(controller("v1", "Node", "worker-1")),
                static_pod_spec,
            ),
            pod(
                "db",
                "main-5c8d-q7w",
                Some(controller("apps/v1", "ReplicaSet", "main-5c8d")),
                postgres_pod_spec,
            ),
        ];

        let mut usage = WorkloadUsage::new();
        record_workloads(&mut usage, &[database], &ImageFilter::default());
        record_workloads(&mut usage, &replica_sets, &ImageFilter::default());
        record_workloads(&mut usage, &pods, &ImageFilter::default());

        let users = |image: &str| -> Vec<String> { usage[image].iter().map(|w| w.to_string()).collect() };
        assert_eq!(users("postgres:16.1"), vec!["Deployment db/main"]);
        assert_eq!(users("legacy/worker:0.9"), vec!["ReplicaSet legacy/worker"]);
        assert_eq!(users("registry.k8s.io/etcd:3.5.12-0"), vec!["Pod kube-system/etcd-worker-1"]);
    }

    #[test]
    fn test_ignored_images_are_dropped() {
        let filter = ImageFilter::new(&["registry.k8s.io/*".to_string()]).unwrap();
        let deployments = vec![deployment(
            "kube-system",
            "dns",
            vec![
                container("coredns", "registry.k8s.io/coredns/coredns:v1.11.1"),
                container("exporter", "prom/node-exporter:v1.7.0"),
            ],
        )];

        let mut usage = WorkloadUsage::new();
        record_workloads(&mut usage, &deployments, &filter);

        assert_eq!(
            usage.keys().collect::<Vec<_>>(),
            vec!["prom/node-exporter:v1.7.0"]
        );
    }

    #[test]
    fn test_invalid_ignore_pattern_is_rejected() {
        assert!(ImageFilter::new(&["[unclosed".to_string()]).is_err());
    }
}
