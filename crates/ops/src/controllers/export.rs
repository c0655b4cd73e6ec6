//! Chart export: renders components into a helm chart tree on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use keel_core::logger::step;
use keel_core::{Component, StepStatus, Workload};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{OpContext, Operation};
use crate::error::ControllerError;

const STORAGE_CLASS_VALUE: &str = "{{ .Values.storageClass }}";
const SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    pub app_name: String,
    pub app_version: String,
    /// Last batch of the export: also write `values.yaml`.
    #[serde(default)]
    pub end: bool,
}

impl ExportOptions {
    /// `<root>/<app>-<ver>/<app>-<ver>-helm/<app>`
    pub fn chart_dir(&self, root: &Path) -> PathBuf {
        let app = format!("{}-{}", self.app_name, self.app_version);
        root.join(&app).join(format!("{app}-helm")).join(&self.app_name)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Values {
    image_domain: String,
    storage_class: String,
}

pub(crate) struct Export {
    pub(crate) components: Vec<Component>,
    pub(crate) options: ExportOptions,
}

fn io_err(what: &str, path: &Path, e: std::io::Error) -> ControllerError {
    ControllerError::Export(format!("{what} {}: {e}", path.display()))
}

fn yaml<T: Serialize>(obj: &T) -> Result<String, ControllerError> {
    serde_yaml::to_string(obj).map_err(|e| ControllerError::Export(e.to_string()))
}

/// Append one document to a template file, creating it on first use.
async fn append(path: &Path, doc: &str, end: &str) -> Result<(), ControllerError> {
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_err("open", path, e))?;
    f.write_all(doc.as_bytes()).await.map_err(|e| io_err("write", path, e))?;
    f.write_all(end.as_bytes()).await.map_err(|e| io_err("write", path, e))?;
    Ok(())
}

/// `registry/name:tag` -> (`registry`, `name:tag`).
fn split_image(image: &str) -> (&str, &str) {
    match image.rfind('/') {
        Some(i) => (&image[..i], &image[i + 1..]),
        None => ("", image),
    }
}

/// Template every container image against `.Values.imageDomain`; returns the
/// first registry seen.
fn template_images(t: &mut PodTemplateSpec) -> Option<String> {
    let mut first = None;
    for c in t.spec.iter_mut().flat_map(|s| s.containers.iter_mut()) {
        if let Some(image) = c.image.as_mut() {
            let (registry, rest) = split_image(image);
            first.get_or_insert_with(|| registry.to_string());
            let templated = format!("{{{{ default \"{registry}\" .Values.imageDomain }}}}/{rest}");
            *image = templated;
        }
    }
    first
}

fn template_storage_class(claim: &mut PersistentVolumeClaim) {
    if let Some(spec) = claim.spec.as_mut() {
        if spec.storage_class_name.as_deref().is_some_and(|s| !s.is_empty()) {
            spec.storage_class_name = Some(STORAGE_CLASS_VALUE.to_string());
        }
    }
}

async fn export_one(templates: &Path, c: &Component, registry: &mut Option<String>) -> Result<(), ControllerError> {
    for cm in c.config_maps() {
        let mut cm = cm.clone();
        cm.metadata.namespace = None;
        append(&templates.join("ConfigMap.yaml"), &yaml(&cm)?, SEPARATOR).await?;
    }
    for claim in c.claims() {
        let mut claim = claim.clone();
        claim.metadata.namespace = None;
        claim.status = None;
        template_storage_class(&mut claim);
        append(&templates.join("PersistentVolumeClaim.yaml"), &yaml(&claim)?, SEPARATOR).await?;
    }
    for svc in c.services() {
        let mut svc = svc.clone();
        svc.metadata.namespace = None;
        svc.status = None;
        let outer = svc.metadata.labels.as_ref().and_then(|l| l.get("service_type")).is_some_and(|t| t == "outer");
        if let Some(spec) = svc.spec.as_mut() {
            spec.cluster_ip = None;
            spec.cluster_ips = None;
            if outer {
                spec.type_ = Some("NodePort".into());
            }
        }
        append(&templates.join("Service.yaml"), &yaml(&svc)?, SEPARATOR).await?;
    }
    // Only secrets the component declares; observed ones belong to the cluster.
    for secret in c.secrets().iter().filter(|s| s.metadata.resource_version.is_none()) {
        let mut secret = secret.clone();
        secret.metadata.namespace = None;
        secret.type_ = None;
        append(&templates.join("Secret.yaml"), &yaml(&secret)?, SEPARATOR).await?;
    }
    for hpa in c.hpas().iter().filter(|h| h.metadata.resource_version.is_none()) {
        let mut hpa = hpa.clone();
        hpa.metadata.namespace = None;
        hpa.status = None;
        append(&templates.join("HorizontalPodAutoscaler.yaml"), &yaml(&hpa)?, SEPARATOR).await?;
    }
    match c.workload() {
        Workload::None => {}
        Workload::StatefulSet(s) => {
            let mut s = (**s).clone();
            s.metadata.namespace = None;
            s.status = None;
            if let Some(spec) = s.spec.as_mut() {
                if let Some(r) = template_images(&mut spec.template) {
                    registry.get_or_insert(r);
                }
                for claim in spec.volume_claim_templates.iter_mut().flatten() {
                    template_storage_class(claim);
                }
            }
            append(&templates.join("StatefulSet.yaml"), &yaml(&s)?, SEPARATOR).await?;
        }
        Workload::Deployment(d) => {
            let mut d = (**d).clone();
            d.metadata.namespace = None;
            d.status = None;
            if let Some(spec) = d.spec.as_mut() {
                if let Some(r) = template_images(&mut spec.template) {
                    registry.get_or_insert(r);
                }
            }
            append(&templates.join("Deployment.yaml"), &yaml(&d)?, SEPARATOR).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Operation for Export {
    /// Components are written one after another; they share template files.
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        let dir = self.options.chart_dir(&cx.config.export_root);
        let templates = dir.join("templates");
        tokio::fs::create_dir_all(&templates).await.map_err(|e| io_err("create", &templates, e))?;

        let mut registry = None;
        let mut first_err = None;
        for c in &self.components {
            match export_one(&templates, c, &mut registry).await {
                Ok(()) => c.logger().info(&format!("export component {} success", c.alias()), step::LAST, StepStatus::Success),
                Err(e) => {
                    warn!(component = %c.id(), error = %e, "export failed");
                    c.logger().error(&format!("export component {} failure: {e}", c.alias()), step::CALLBACK, StepStatus::Failure);
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.options.end {
            let values = Values {
                image_domain: registry.unwrap_or_default(),
                storage_class: cx.config.export_storage_class.clone(),
            };
            append(&dir.join("values.yaml"), &yaml(&values)?, "\n").await?;
            info!(controller = %cx.controller_id, dir = %dir.display(), "chart export finished");
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_dir_layout() {
        let o = ExportOptions { app_name: "shop".into(), app_version: "1.2".into(), end: false };
        assert_eq!(o.chart_dir(Path::new("/x")), PathBuf::from("/x/shop-1.2/shop-1.2-helm/shop"));
    }

    #[test]
    fn images_are_templated_against_the_registry() {
        let mut t = PodTemplateSpec {
            metadata: None,
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                containers: vec![k8s_openapi::api::core::v1::Container {
                    name: "app".into(),
                    image: Some("registry.local/team/web:3".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        };
        assert_eq!(template_images(&mut t).as_deref(), Some("registry.local/team"));
        let image = t.spec.unwrap().containers[0].image.clone().unwrap();
        assert_eq!(image, "{{ default \"registry.local/team\" .Values.imageDomain }}/web:3");
    }

    #[test]
    fn bare_image_has_empty_registry() {
        assert_eq!(split_image("nginx:1"), ("", "nginx:1"));
    }
}
