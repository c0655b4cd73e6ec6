//! Engine configuration, threaded explicitly through construction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONTROLLERS: usize = 200;
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(40);
pub const DEFAULT_SELECTOR: &str = "keel.io/managed-by=keel";
pub const DEFAULT_INGEST_CAPACITY: usize = 4096;
pub const DEFAULT_EXPORT_ROOT: &str = "/grdata/app/helm-chart";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent controllers admitted by the manager.
    pub max_controllers: usize,
    /// Floor for every wait deadline.
    pub min_wait: Duration,
    /// Label selector applied to every watch.
    pub managed_selector: String,
    pub ingest_capacity: usize,
    /// Components whose operations log at debug verbosity.
    pub debug_component_ids: Vec<String>,
    pub dns_nameservers: Vec<String>,
    pub dns_searches: Vec<String>,
    pub export_root: PathBuf,
    pub export_storage_class: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_controllers: DEFAULT_MAX_CONTROLLERS,
            min_wait: DEFAULT_MIN_WAIT,
            managed_selector: DEFAULT_SELECTOR.to_string(),
            ingest_capacity: DEFAULT_INGEST_CAPACITY,
            debug_component_ids: Vec::new(),
            dns_nameservers: Vec::new(),
            dns_searches: Vec::new(),
            export_root: PathBuf::from(DEFAULT_EXPORT_ROOT),
            export_storage_class: String::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> { std::env::var(key).ok().and_then(|s| s.trim().parse().ok()) }

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|s| s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from).collect())
}

impl EngineConfig {
    /// Defaults overlaid with `KEEL_*` variables. Absent or unparsable values keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<usize>("KEEL_MAX_CONTROLLERS").filter(|n| *n > 0) {
            cfg.max_controllers = n;
        }
        if let Some(secs) = env_parse::<u64>("KEEL_MIN_WAIT_SECS") {
            cfg.min_wait = Duration::from_secs(secs);
        }
        if let Some(sel) = std::env::var("KEEL_SELECTOR").ok().filter(|s| !s.trim().is_empty()) {
            cfg.managed_selector = sel;
        }
        if let Some(cap) = env_parse::<usize>("KEEL_INGEST_CAP").filter(|n| *n > 0) {
            cfg.ingest_capacity = cap;
        }
        if let Some(ids) = env_list("KEEL_DEBUG_IDS") {
            cfg.debug_component_ids = ids;
        }
        if let Some(servers) = env_list("KEEL_DNS_SERVERS") {
            cfg.dns_nameservers = servers;
        }
        if let Some(searches) = env_list("KEEL_DNS_SEARCHES") {
            cfg.dns_searches = searches;
        }
        if let Ok(root) = std::env::var("KEEL_EXPORT_ROOT") {
            if !root.is_empty() {
                cfg.export_root = PathBuf::from(root);
            }
        }
        if let Ok(sc) = std::env::var("KEEL_EXPORT_STORAGE_CLASS") {
            cfg.export_storage_class = sc;
        }
        cfg
    }

    pub fn is_debug_component(&self, id: &str) -> bool { self.debug_component_ids.iter().any(|d| d == id) }

    /// Equality terms of `managed_selector` as labels. Every object the engine
    /// creates carries them, or its own watchers would never see it.
    /// Set-based and negated terms are skipped.
    pub fn managed_labels(&self) -> BTreeMap<String, String> {
        self.managed_selector
            .split(',')
            .filter_map(|term| {
                let (k, v) = term.split_once("==").or_else(|| term.split_once('='))?;
                let (k, v) = (k.trim(), v.trim());
                (!k.is_empty() && !k.ends_with('!')).then(|| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_controllers, 200);
        assert_eq!(cfg.min_wait, Duration::from_secs(40));
        assert_eq!(cfg.managed_selector, "keel.io/managed-by=keel");
        assert!(!cfg.is_debug_component("c1"));
        assert_eq!(
            cfg.managed_labels(),
            BTreeMap::from([(crate::labels::MANAGED_BY.to_string(), "keel".to_string())])
        );
    }

    #[test]
    fn managed_labels_keep_only_equality_terms() {
        let cfg = EngineConfig { managed_selector: "team==core, tier=web,env!=dev,zone in (a".into(), ..Default::default() };
        let l = cfg.managed_labels();
        assert_eq!(l.len(), 2);
        assert_eq!(l.get("team").map(String::as_str), Some("core"));
        assert_eq!(l.get("tier").map(String::as_str), Some("web"));
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        std::env::set_var("KEEL_MAX_CONTROLLERS", "nope");
        std::env::set_var("KEEL_DEBUG_IDS", "c1, c2,,");
        std::env::set_var("KEEL_MIN_WAIT_SECS", "5");
        let cfg = EngineConfig::from_env();
        std::env::remove_var("KEEL_MAX_CONTROLLERS");
        std::env::remove_var("KEEL_DEBUG_IDS");
        std::env::remove_var("KEEL_MIN_WAIT_SECS");
        assert_eq!(cfg.max_controllers, 200);
        assert_eq!(cfg.min_wait, Duration::from_secs(5));
        assert_eq!(cfg.debug_component_ids, vec!["c1".to_string(), "c2".to_string()]);
        assert!(cfg.is_debug_component("c2"));
    }
}
