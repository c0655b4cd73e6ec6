//! Component manifests: YAML files holding one component per document, or a
//! sequence of components in a single document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use keel_core::Component;
use serde::Deserialize;

fn component(value: serde_yaml::Value) -> Result<Component> {
    let c: Component = serde_yaml::from_value(value)?;
    c.validate().with_context(|| format!("component {}", c.id()))?;
    Ok(c)
}

pub fn parse(text: &str) -> Result<Vec<Component>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        match serde_yaml::Value::deserialize(doc)? {
            serde_yaml::Value::Null => continue,
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    out.push(component(item)?);
                }
            }
            other => out.push(component(other)?),
        }
    }
    Ok(out)
}

pub fn load(path: &Path) -> Result<Vec<Component>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_all(paths: &[PathBuf]) -> Result<Vec<Component>> {
    let mut out = Vec::new();
    for p in paths {
        out.extend(load(p)?);
    }
    Ok(out)
}

/// Exactly one component; used by `diff`.
pub fn load_one(path: &Path) -> Result<Component> {
    let mut all = load(path)?;
    match all.len() {
        1 => Ok(all.remove(0)),
        n => anyhow::bail!("{}: expected one component, found {n}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::WorkloadKind;

    const WEB: &str = r#"
tenant_id: t1
component_id: web
kind: deployment
replicas: 2
dependencies: [db]
workload:
  kind: deployment
  object:
    metadata: { name: web }
    spec:
      replicas: 2
      selector: {}
      template:
        spec:
          containers:
            - name: app
              image: registry.local/web:1
services:
  - metadata: { name: web-http }
"#;

    #[test]
    fn documents_and_sequences_are_flattened() {
        let text = format!("{WEB}\n---\n- tenant_id: t1\n  component_id: db\n  kind: statefulset\n---\n");
        let cs = parse(&text).unwrap();
        let ids: Vec<_> = cs.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, ["web", "db"]);
        assert_eq!(cs[0].workload_kind(), Some(WorkloadKind::Deployment));
        assert_eq!(cs[0].services().len(), 1);
        assert_eq!(cs[0].base.dependencies.as_slice(), ["db".to_string()]);
        assert!(cs[1].workload().is_none());
    }

    #[test]
    fn mismatched_workload_kind_is_rejected() {
        let text = WEB.replace("kind: deployment\nreplicas", "kind: statefulset\nreplicas");
        let err = parse(&text).unwrap_err();
        assert!(format!("{err:#}").contains("component web"));
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(parse("tenant_id: t1\ncomponent_id: ''\nkind: deployment\n").is_err());
    }
}
