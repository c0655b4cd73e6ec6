//! Pod DNS configuration collaborator.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodDNSConfig, PodDNSConfigOption};
use keel_core::{Component, EngineConfig};

/// Resolves the DNS config attached to a component's pod template.
/// `None` means "leave the workload's DNS settings alone".
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, component: &Component) -> Option<PodDNSConfig>;
}

/// Fixed nameservers and search domains taken from engine config.
#[derive(Debug, Clone, Default)]
pub struct StaticDnsResolver {
    nameservers: Vec<String>,
    searches: Vec<String>,
}

impl StaticDnsResolver {
    pub fn new(nameservers: Vec<String>, searches: Vec<String>) -> Self { Self { nameservers, searches } }

    pub fn from_config(cfg: &EngineConfig) -> Self { Self::new(cfg.dns_nameservers.clone(), cfg.dns_searches.clone()) }
}

#[async_trait]
impl DnsResolver for StaticDnsResolver {
    async fn resolve(&self, component: &Component) -> Option<PodDNSConfig> {
        if self.nameservers.is_empty() {
            return None;
        }
        let mut searches = vec![format!("{}.svc.cluster.local", component.namespace())];
        searches.extend(self.searches.iter().cloned());
        Some(PodDNSConfig {
            nameservers: Some(self.nameservers.clone()),
            searches: Some(searches),
            options: Some(vec![PodDNSConfigOption { name: Some("ndots".into()), value: Some("5".into()) }]),
        })
    }
}
