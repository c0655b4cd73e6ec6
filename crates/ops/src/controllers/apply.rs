//! Narrow diff-and-apply controllers: routing rules, plugin config and
//! autoscalers. Each reconciles one slice of a component and updates the
//! cached copy; nothing here waits.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use keel_core::{labels, Component};

use super::{run_each, OpContext, Operation};
use crate::error::ControllerError;
use crate::reconcile::{diff_apply, OnError};

/// Cached copy to update, or the desired component when nothing is cached yet.
fn cached_or(cx: &OpContext, c: &Component) -> (Component, bool) {
    match cx.store.get_component(c.id()) {
        Some(cached) => (cached, true),
        None => (c.clone(), false),
    }
}

pub(crate) struct ApplyRule {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for ApplyRule {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "apply_rule", |c| async move {
            let (mut comp, cached) = cached_or(cx, c);
            let (services, secrets, ingresses) = if cached {
                (comp.services().to_vec(), comp.secrets().to_vec(), comp.ingresses().to_vec())
            } else {
                Default::default()
            };
            *comp.services_mut() = diff_apply(cx, c, &services, c.services(), OnError::Abort).await?;
            *comp.secrets_mut() = diff_apply(cx, c, &secrets, c.secrets(), OnError::Abort).await?;
            *comp.ingresses_mut() = diff_apply(cx, c, &ingresses, c.ingresses(), OnError::Abort).await?;
            cx.store.register_component(comp);
            cx.trace(c, "rules applied");
            Ok(())
        })
        .await
    }
}

fn is_plugin_config(cm: &ConfigMap) -> bool {
    cm.metadata.labels.as_ref().is_some_and(|l| l.contains_key(labels::PLUGIN_ID))
}

/// Only ConfigMaps carrying the plugin-id label are reconciled.
pub(crate) struct ApplyPluginConfig {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for ApplyPluginConfig {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "apply_plugin_config", |c| async move {
            let (mut comp, cached) = cached_or(cx, c);
            let live: Vec<ConfigMap> = if cached { comp.plugin_config_maps().cloned().collect() } else { Vec::new() };
            let desired: Vec<ConfigMap> = c.plugin_config_maps().cloned().collect();
            let applied = diff_apply(cx, c, &live, &desired, OnError::Abort).await?;
            comp.config_maps_mut().retain(|cm| !is_plugin_config(cm));
            for cm in applied {
                comp.set_config_map(cm);
            }
            cx.store.register_component(comp);
            cx.trace(c, "plugin config applied");
            Ok(())
        })
        .await
    }
}

pub(crate) struct RefreshAutoscaler {
    pub(crate) components: Vec<Component>,
}

#[async_trait]
impl Operation for RefreshAutoscaler {
    async fn run(&self, cx: &OpContext) -> Result<(), ControllerError> {
        run_each(cx, &self.components, "refresh_autoscaler", |c| async move {
            let (mut comp, cached) = cached_or(cx, c);
            let live = if cached { comp.hpas().to_vec() } else { Vec::new() };
            *comp.hpas_mut() = diff_apply(cx, c, &live, c.hpas(), OnError::Abort).await?;
            cx.store.register_component(comp);
            cx.trace(c, "autoscalers refreshed");
            Ok(())
        })
        .await
    }
}
