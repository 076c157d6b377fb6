use crate::docker::ContainerRuntime;
use crate::helm::{ChartApi, ChartError, ReleaseSpec};
use crate::k8s::KindCluster;
use futures::future::join_all;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Every `image` reference in a multi-document manifest, sorted and
/// deduplicated.
pub fn find_images(manifest: &str) -> Vec<String> {
    let mut images = BTreeSet::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        match Value::deserialize(document) {
            Ok(value) => collect_images(&value, &mut images),
            Err(err) => debug!(?err, "skipping unparsable manifest document"),
        }
    }
    images.into_iter().collect()
}

fn collect_images(value: &Value, images: &mut BTreeSet<String>) {
    match value {
        Value::Mapping(mapping) => {
            for (key, value) in mapping {
                match (key.as_str(), value) {
                    (Some("image"), Value::String(image)) if !image.is_empty() => {
                        images.insert(image.clone());
                    }
                    _ => collect_images(value, images),
                }
            }
        }
        Value::Sequence(sequence) => {
            for value in sequence {
                collect_images(value, images);
            }
        }
        Value::Tagged(tagged) => collect_images(&tagged.value, images),
        _ => {}
    }
}

/// Renders `spec` and lists the images it would run.
pub async fn chart_images(
    charts: &dyn ChartApi,
    spec: &ReleaseSpec,
) -> Result<Vec<String>, ChartError> {
    let manifest = charts.template(spec).await?;
    let images = find_images(&manifest);
    debug!(?images, "found images");
    Ok(images)
}

/// Pulls all images at once. Returns the ones that were pulled.
pub async fn pull_all(runtime: &dyn ContainerRuntime, images: &[String]) -> Vec<String> {
    let results = join_all(images.iter().map(|image| async move {
        match runtime.image_pull(image).await {
            Ok(()) => Some(image.clone()),
            Err(err) => {
                debug!(%image, ?err, "pull failed");
                None
            }
        }
    }))
    .await;
    results.into_iter().flatten().collect()
}

/// Saves the kubelet from pulling the platform's images one by one. Nothing
/// here is fatal.
#[tracing::instrument(skip_all, fields(count = images.len()))]
pub async fn preload(runtime: &dyn ContainerRuntime, kind: &KindCluster, images: &[String]) {
    info!("Pulling {} images", images.len());
    let pulled = pull_all(runtime, images).await;
    if pulled.len() < images.len() {
        warn!(
            "Pulled {} of {} images, the rest will be pulled by the cluster",
            pulled.len(),
            images.len()
        );
    }
    if let Err(err) = kind.load_images(&pulled).await {
        warn!("Failed loading images into the cluster: {err}");
    }
}
