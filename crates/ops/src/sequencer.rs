//! Dependency layering for batch starts.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::Component;

use crate::error::SequenceError;

/// Partition `components` into layers so every component sits one layer above
/// the deepest of its in-batch dependencies. Dependencies on ids outside the
/// batch are assumed satisfied. Input order is kept within a layer.
pub fn layers(components: Vec<Component>) -> Result<Vec<Vec<Component>>, SequenceError> {
    let ids: BTreeSet<String> = components.iter().map(|c| c.id().to_string()).collect();
    let mut pending: Vec<(Component, BTreeSet<String>)> = components
        .into_iter()
        .map(|c| {
            let deps = c.base.dependencies.iter().filter(|d| ids.contains(*d)).cloned().collect();
            (c, deps)
        })
        .collect();

    let mut out = Vec::new();
    while !pending.is_empty() {
        let (layer, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(_, deps)| deps.is_empty());
        if layer.is_empty() {
            let mut stuck: Vec<String> = rest.iter().map(|(c, _)| c.id().to_string()).collect();
            stuck.sort();
            return Err(SequenceError { stuck });
        }
        let placed: BTreeSet<String> = layer.iter().map(|(c, _)| c.id().to_string()).collect();
        pending = rest
            .into_iter()
            .map(|(c, mut deps)| {
                deps.retain(|d| !placed.contains(d));
                (c, deps)
            })
            .collect();
        out.push(layer.into_iter().map(|(c, _)| c).collect());
    }
    Ok(out)
}

/// Layer index per component id; handy for logging a plan.
pub fn layer_index(layers: &[Vec<Component>]) -> BTreeMap<String, usize> {
    layers
        .iter()
        .enumerate()
        .flat_map(|(i, l)| l.iter().map(move |c| (c.id().to_string(), i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ComponentBase, WorkloadKind};

    fn comp(id: &str, deps: &[&str]) -> Component {
        let mut base = ComponentBase::new("t1", id, WorkloadKind::Deployment);
        base.dependencies = deps.iter().map(|d| d.to_string()).collect();
        Component::new(base)
    }

    #[test]
    fn each_component_lands_above_its_dependencies() {
        let batch = vec![comp("web", &["api", "cache"]), comp("api", &["db"]), comp("db", &[]), comp("cache", &[])];
        let deps: BTreeMap<String, Vec<String>> =
            batch.iter().map(|c| (c.id().to_string(), c.base.dependencies.to_vec())).collect();
        let ls = layers(batch).unwrap();
        let idx = layer_index(&ls);
        assert_eq!(ls.len(), 3);
        for (id, ds) in &deps {
            for d in ds {
                assert!(idx[id] > idx[d], "{id} must come after {d}");
            }
        }
        assert_eq!(idx["db"], 0);
        assert_eq!(idx["cache"], 0);
    }

    #[test]
    fn outside_dependencies_are_ignored() {
        let ls = layers(vec![comp("a", &["elsewhere"])]).unwrap();
        assert_eq!(ls.len(), 1);
    }

    #[test]
    fn cycles_are_rejected_with_stuck_ids() {
        let err = layers(vec![comp("a", &["b"]), comp("b", &["a"]), comp("c", &[])]).unwrap_err();
        assert_eq!(err.stuck, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(layers(vec![comp("a", &["a"])]).is_err());
    }
}
