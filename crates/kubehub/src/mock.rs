//! In-memory orchestrator used by tests and offline runs.
//!
//! Records every call, keeps objects in a map, hands out increasing
//! resourceVersions, and can forward every mutation as a watch event to a
//! sink, so a store fed from it behaves as if it were watching a cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::ClientError;
use crate::object::{KubeObject, ObjectKey, ObjectKind};
use crate::orchestrator::Orchestrator;
use crate::watch::WatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Replace,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
struct Failure {
    verb: Verb,
    kind: ObjectKind,
    name: Option<String>,
    code: u16,
}

#[derive(Default)]
pub struct MockOrchestrator {
    objects: Mutex<BTreeMap<ObjectKey, KubeObject>>,
    calls: Mutex<Vec<Call>>,
    patches: Mutex<Vec<(ObjectKey, serde_json::Value)>>,
    failures: Mutex<Vec<Failure>>,
    next_rv: AtomicU64,
    auto_ready: AtomicBool,
    sink: Option<EventSink>,
}

type EventSink = Arc<dyn Fn(WatchEvent) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

/// RFC 7386 merge: objects merge recursively, null removes, everything else replaces.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    let Value::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

impl MockOrchestrator {
    pub fn new() -> Self { Self::default() }

    /// Forward every successful mutation, synchronously, as a watch event.
    pub fn with_events(mut self, sink: impl Fn(WatchEvent) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Created or patched workloads report all desired replicas ready.
    pub fn with_auto_ready(self) -> Self {
        self.auto_ready.store(true, Ordering::Relaxed);
        self
    }

    /// Every `verb` on `kind` fails with an API error of `code`.
    pub fn fail(&self, verb: Verb, kind: ObjectKind, code: u16) {
        lock(&self.failures).push(Failure { verb, kind, name: None, code });
    }

    /// Only calls targeting `name` fail.
    pub fn fail_named(&self, verb: Verb, kind: ObjectKind, name: &str, code: u16) {
        lock(&self.failures).push(Failure { verb, kind, name: Some(name.to_string()), code });
    }

    pub fn clear_failures(&self) { lock(&self.failures).clear(); }

    /// Insert an object without recording a call. Assigns a resourceVersion.
    pub fn seed(&self, obj: impl Into<KubeObject>) {
        let mut obj = obj.into();
        self.stamp(&mut obj);
        self.emit(WatchEvent::Applied(obj.clone()));
        lock(&self.objects).insert(obj.key(), obj);
    }

    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<KubeObject> {
        lock(&self.objects).get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn objects_of(&self, kind: ObjectKind) -> Vec<KubeObject> {
        lock(&self.objects).values().filter(|o| o.kind() == kind).cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }

    pub fn count(&self, verb: Verb, kind: ObjectKind) -> usize {
        lock(&self.calls).iter().filter(|c| c.verb == verb && c.kind == kind).count()
    }

    /// Calls other than reads.
    pub fn mutations(&self) -> Vec<Call> { lock(&self.calls).iter().filter(|c| c.verb != Verb::Get).cloned().collect() }

    pub fn patches(&self) -> Vec<(ObjectKey, serde_json::Value)> { lock(&self.patches).clone() }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
        lock(&self.patches).clear();
    }

    fn record(&self, verb: Verb, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), ClientError> {
        lock(&self.calls).push(Call { verb, kind, namespace: namespace.to_string(), name: name.to_string() });
        let failures = lock(&self.failures);
        match failures
            .iter()
            .find(|f| f.verb == verb && f.kind == kind && f.name.as_deref().map_or(true, |n| n == name))
        {
            Some(f) => Err(ClientError::Api { code: f.code, reason: "Injected".into(), message: format!("injected failure on {kind} {name}") }),
            None => Ok(()),
        }
    }

    fn stamp(&self, obj: &mut KubeObject) {
        let rv = self.next_rv.fetch_add(1, Ordering::Relaxed) + 1;
        obj.meta_mut().resource_version = Some(rv.to_string());
        if self.auto_ready.load(Ordering::Relaxed) {
            mark_ready(obj);
        }
    }

    fn emit(&self, ev: WatchEvent) {
        if let Some(sink) = &self.sink {
            sink(ev);
        }
    }
}

fn mark_ready(obj: &mut KubeObject) {
    match obj {
        KubeObject::StatefulSet(s) => {
            let want = s.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1);
            let st = s.status.get_or_insert_with(Default::default);
            st.replicas = want;
            st.ready_replicas = Some(want);
        }
        KubeObject::Deployment(d) => {
            let want = d.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1);
            let st = d.status.get_or_insert_with(Default::default);
            st.replicas = Some(want);
            st.ready_replicas = Some(want);
        }
        _ => {}
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<KubeObject, ClientError> {
        self.record(Verb::Get, kind, namespace, name)?;
        self.object(kind, namespace, name).ok_or_else(|| ClientError::not_found(kind, namespace, name))
    }

    async fn create(&self, obj: &KubeObject) -> Result<KubeObject, ClientError> {
        let (kind, namespace, name) = obj.key();
        self.record(Verb::Create, kind, &namespace, &name)?;
        let mut objects = lock(&self.objects);
        if objects.contains_key(&obj.key()) {
            return Err(ClientError::already_exists(kind, &namespace, &name));
        }
        let mut stored = obj.clone();
        self.stamp(&mut stored);
        objects.insert(stored.key(), stored.clone());
        drop(objects);
        self.emit(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, obj: &KubeObject) -> Result<KubeObject, ClientError> {
        let (kind, namespace, name) = obj.key();
        self.record(Verb::Replace, kind, &namespace, &name)?;
        let mut objects = lock(&self.objects);
        if !objects.contains_key(&obj.key()) {
            return Err(ClientError::not_found(kind, &namespace, &name));
        }
        let mut stored = obj.clone();
        self.stamp(&mut stored);
        objects.insert(stored.key(), stored.clone());
        drop(objects);
        self.emit(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn patch(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<KubeObject, ClientError> {
        self.record(Verb::Patch, kind, namespace, name)?;
        let key = (kind, namespace.to_string(), name.to_string());
        lock(&self.patches).push((key.clone(), patch.clone()));
        let current = self.object(kind, namespace, name).ok_or_else(|| ClientError::not_found(kind, namespace, name))?;
        let mut value = current.to_value()?;
        merge_patch(&mut value, patch);
        let mut stored = KubeObject::from_value(kind, value)?;
        self.stamp(&mut stored);
        lock(&self.objects).insert(key, stored.clone());
        self.emit(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.record(Verb::Delete, kind, namespace, name)?;
        let removed = lock(&self.objects).remove(&(kind, namespace.to_string(), name.to_string()));
        match removed {
            Some(obj) => {
                self.emit(WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(ClientError::not_found(kind, namespace, name)),
        }
    }
}
