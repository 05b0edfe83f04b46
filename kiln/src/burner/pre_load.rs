//! Image pre-loading.
//!
//! Before submission starts, a throwaway DaemonSet referencing every
//! container image of the job's templates is created so each node pulls the
//! images up front. After the configured period the workload is deleted
//! again; measured latencies then exclude image pull time.
use std::collections::BTreeSet;

use anyhow::{Context as _, Result};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::info;

use crate::labels;

use super::{render_data, JobExecutor};

const PRELOAD_APP: &str = "kiln-preload";

pub(super) async fn pre_load(executor: &JobExecutor) -> Result<()> {
    let images = discover_images(executor)?;
    if images.is_empty() {
        return Ok(());
    }
    let namespace = format!("kiln-preload-{}", executor.job.name);
    info!(job = %executor.job.name, ?images, %namespace, "pre-loading images");
    executor
        .cluster
        .create_namespace(
            &namespace,
            labels::managed_labels(&executor.uuid, &executor.job.name),
            executor.deadline(),
            &executor.cancel,
        )
        .await?;
    let api: Api<DaemonSet> = Api::namespaced(executor.cluster.client(), &namespace);
    api.create(&PostParams::default(), &daemon_set(&images))
        .await
        .context("creating pre-load daemonset")?;

    tokio::select! {
        _ = executor.cancel.cancelled() => {}
        _ = tokio::time::sleep(executor.job.pre_load_period) => {}
    }
    executor
        .cluster
        .delete_namespace(&namespace, false, executor.deadline(), &executor.cancel)
        .await?;
    Ok(())
}

fn discover_images(executor: &JobExecutor) -> Result<BTreeSet<String>> {
    let mut images = BTreeSet::new();
    for loaded in executor.specs.iter() {
        let data = render_data(&loaded.spec, &executor.job.name, &executor.uuid, 1, 1);
        let rendered = executor.renderer.render(&loaded.template, &data)?;
        let value: serde_json::Value =
            serde_yaml::from_str(&rendered).context("parsing rendered template")?;
        collect_images(&value, &mut images);
    }
    Ok(images)
}

fn collect_images(value: &serde_json::Value, images: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                if key == "image" {
                    if let Some(image) = value.as_str() {
                        images.insert(image.to_owned());
                        continue;
                    }
                }
                collect_images(value, images);
            }
        }
        serde_json::Value::Array(entries) => {
            for entry in entries {
                collect_images(entry, images);
            }
        }
        _ => {}
    }
}

fn daemon_set(images: &BTreeSet<String>) -> DaemonSet {
    let selector = std::collections::BTreeMap::from_iter(vec![(
        "app".to_owned(),
        PRELOAD_APP.to_owned(),
    )]);
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(PRELOAD_APP.to_owned()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: images
                        .iter()
                        .enumerate()
                        .map(|(index, image)| Container {
                            name: format!("preload-{index}"),
                            image: Some(image.clone()),
                            command: Some(vec!["sleep".to_owned(), "inf".to_owned()]),
                            image_pull_policy: Some("IfNotPresent".to_owned()),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn collects_images_at_any_depth() {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "spec": {
                "template": {
                    "spec": {
                        "initContainers": [{"name": "init", "image": "busybox:1.36"}],
                        "containers": [
                            {"name": "app", "image": "nginx:1.25"},
                            {"name": "sidecar", "image": "envoy:v1.28"},
                        ],
                    }
                }
            }
        });
        let mut images = BTreeSet::new();
        collect_images(&manifest, &mut images);
        assert_eq!(
            images.into_iter().collect::<Vec<_>>(),
            vec!["busybox:1.36", "envoy:v1.28", "nginx:1.25"]
        );
    }

    #[test]
    fn ignores_non_string_image_fields() {
        let manifest = json!({"spec": {"image": 42, "containers": [{"image": "redis:7"}]}});
        let mut images = BTreeSet::new();
        collect_images(&manifest, &mut images);
        assert_eq!(images.into_iter().collect::<Vec<_>>(), vec!["redis:7"]);
    }

    #[test]
    fn daemon_set_runs_one_container_per_image() {
        let images: BTreeSet<String> =
            ["nginx:1.25".to_owned(), "redis:7".to_owned()].into_iter().collect();
        let ds = daemon_set(&images);
        let containers = ds.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert!(containers.iter().all(|c| c.command.as_deref()
            == Some(&["sleep".to_owned(), "inf".to_owned()][..])));
    }
}
