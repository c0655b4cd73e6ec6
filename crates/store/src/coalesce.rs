use std::collections::VecDeque;

use keel_kubehub::{ObjectKey, WatchEvent};
use rustc_hash::FxHashMap;

/// Coalescing queue keyed by object key with FIFO order. A newer event for a
/// queued key replaces the older one in place. Nothing is ever evicted: once
/// `cap` distinct keys are pending the caller must drain before the next push.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, WatchEvent>,
    order: VecDeque<ObjectKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { map: FxHashMap::default(), order: VecDeque::with_capacity(cap), cap }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.order.len() >= self.cap }

    /// Queue one object event. Returns true when the queue is full and must
    /// be drained. Relists and sync markers are not queued here.
    pub fn push(&mut self, ev: WatchEvent) -> bool {
        let key = match &ev {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o.key(),
            WatchEvent::Replaced(..) | WatchEvent::Synced(_) => return self.is_full(),
        };
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, ev);
        self.is_full()
    }

    pub fn drain_ready(&mut self) -> Vec<WatchEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use keel_kubehub::KubeObject;

    fn svc(name: &str, rv: &str) -> KubeObject {
        let mut s = Service::default();
        s.metadata.name = Some(name.into());
        s.metadata.namespace = Some("t1".into());
        s.metadata.resource_version = Some(rv.into());
        KubeObject::from(s)
    }

    #[test]
    fn newer_event_replaces_queued_one_in_place() {
        let mut c = Coalescer::with_capacity(8);
        c.push(WatchEvent::Applied(svc("a", "1")));
        c.push(WatchEvent::Applied(svc("b", "2")));
        c.push(WatchEvent::Deleted(svc("a", "3")));
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], WatchEvent::Deleted(o) if o.name() == "a"));
        assert!(c.is_empty());
    }

    #[test]
    fn full_queue_keeps_every_key() {
        let mut c = Coalescer::with_capacity(2);
        assert!(!c.push(WatchEvent::Applied(svc("a", "1"))));
        assert!(c.push(WatchEvent::Applied(svc("b", "1"))));
        // replacing a queued key never grows the queue
        assert!(c.push(WatchEvent::Applied(svc("a", "2"))));
        assert!(c.push(WatchEvent::Deleted(svc("c", "1"))));
        assert_eq!(c.len(), 3);
        let names: Vec<_> = c
            .drain_ready()
            .iter()
            .filter_map(|e| match e {
                WatchEvent::Applied(o) | WatchEvent::Deleted(o) => Some(o.name().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(!c.is_full());
    }
}
