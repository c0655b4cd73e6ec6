//! Generic encoded tree used for structural diffs.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value as Json;

/// Either an opaque encoded scalar (arrays included) or an ordered set of named children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Compact JSON encoding; equality is byte equality.
    Scalar(String),
    Object(BTreeMap<String, Node>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl Node {
    pub fn from_json(v: &Json) -> Result<Self, serde_json::Error> {
        match v {
            Json::Object(map) => {
                let mut fields = BTreeMap::new();
                for (k, child) in map {
                    fields.insert(k.clone(), Node::from_json(child)?);
                }
                Ok(Node::Object(fields))
            }
            other => Ok(Node::Scalar(serde_json::to_string(other)?)),
        }
    }

    pub fn to_json(&self) -> Result<Json, serde_json::Error> {
        match self {
            Node::Scalar(raw) => serde_json::from_str(raw),
            Node::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (k, child) in fields {
                    map.insert(k.clone(), child.to_json()?);
                }
                Ok(Json::Object(map))
            }
        }
    }

    fn is_array(&self) -> bool { matches!(self, Node::Scalar(raw) if raw.starts_with('[')) }

    /// Explicit zero for a field that disappeared. Merge patches ignore absent
    /// keys, so the removal has to be spelled out.
    fn emptied(&self) -> Node {
        match self {
            Node::Object(_) => Node::Scalar("null".into()),
            n if n.is_array() => Node::Scalar("[]".into()),
            _ => Node::Scalar("\"\"".into()),
        }
    }
}

/// Minimal change from `old` to `new`, or `None` when they are equal.
pub fn diff(old: &Node, new: &Node) -> Option<Node> {
    if old == new {
        return None;
    }
    let (Node::Object(o), Node::Object(n)) = (old, new) else {
        return Some(new.clone());
    };
    let mut out = BTreeMap::new();
    for (k, nv) in n {
        match o.get(k) {
            Some(ov) => {
                if let Some(d) = diff(ov, nv) {
                    out.insert(k.clone(), d);
                }
            }
            None => {
                out.insert(k.clone(), nv.clone());
            }
        }
    }
    for (k, ov) in o {
        if !n.contains_key(k) {
            out.insert(k.clone(), ov.emptied());
        }
    }
    Some(Node::Object(out))
}

/// Leaf-level change counts between two trees.
pub fn summarize(old: &Node, new: &Node) -> DiffSummary {
    fn walk(a: &Node, b: &Node, s: &mut DiffSummary) {
        match (a, b) {
            (Node::Object(ao), Node::Object(bo)) => {
                for (k, bv) in bo {
                    match ao.get(k) {
                        Some(av) if av == bv => {}
                        Some(av) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += ao.keys().filter(|k| !bo.contains_key(*k)).count();
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(old, new, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(v: Json) -> Node { Node::from_json(&v).unwrap() }

    #[test]
    fn equal_trees_have_no_diff() {
        let a = node(json!({"spec": {"replicas": 2, "template": {"spec": {"containers": [{"image": "a"}]}}}}));
        assert_eq!(diff(&a, &a.clone()), None);
    }

    #[test]
    fn removed_fields_are_zeroed_by_shape() {
        let old = node(json!({"hostname": "x", "tolerations": [{"key": "k"}], "affinity": {"a": 1}, "keep": 1}));
        let new = node(json!({"keep": 1}));
        let out = diff(&old, &new).unwrap().to_json().unwrap();
        assert_eq!(out, json!({"hostname": "", "tolerations": [], "affinity": null}));
    }

    #[test]
    fn new_keys_are_included_whole() {
        let old = node(json!({"a": {"b": 1}}));
        let new = node(json!({"a": {"b": 1, "c": {"d": 2}}}));
        assert_eq!(diff(&old, &new).unwrap().to_json().unwrap(), json!({"a": {"c": {"d": 2}}}));
    }

    #[test]
    fn arrays_compare_as_opaque_scalars() {
        let old = node(json!({"c": [1, 2]}));
        let new = node(json!({"c": [1, 3]}));
        assert_eq!(diff(&old, &new).unwrap().to_json().unwrap(), json!({"c": [1, 3]}));
        assert_eq!(summarize(&old, &new), DiffSummary { adds: 0, updates: 1, removes: 0 });
    }

    #[test]
    fn summary_counts_adds_updates_removes() {
        let old = node(json!({"a": 1, "b": {"x": 1}, "gone": true}));
        let new = node(json!({"a": 2, "b": {"x": 1, "y": 2}, "d": true}));
        assert_eq!(summarize(&old, &new), DiffSummary { adds: 2, updates: 1, removes: 1 });
    }
}
