use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What the registry and the views need from a tunnel session.
pub trait Forwarder: Send + Sync {
    fn path(&self) -> &str;

    fn container(&self) -> &str;

    /// `local:remote` port pair.
    fn port_map(&self) -> String;

    fn address(&self) -> &str;

    fn active(&self) -> bool;

    fn age(&self) -> DateTime<Utc>;

    /// Requests cancellation. Safe to call more than once; never blocks.
    fn stop(&self);

    fn id(&self) -> String {
        forward_id(self.path(), self.container(), &self.port_map())
    }
}

/// Registry key: `path|container|local:remote`, or `path|local:remote` when
/// the path already names a container.
pub fn forward_id(path: &str, container: &str, port_map: &str) -> String {
    if path.contains('|') {
        format!("{path}|{port_map}")
    } else {
        format!("{path}|{container}|{port_map}")
    }
}

/// Active tunnels keyed by forward id. At most one session per key.
#[derive(Default, Clone)]
pub struct Forwarders {
    entries: HashMap<String, Arc<dyn Forwarder>>,
}

impl Forwarders {
    pub fn get(&self, id: &str) -> Option<Arc<dyn Forwarder>> {
        self.entries.get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Forwarder>> {
        self.entries.values().cloned().collect()
    }

    /// Registers `forwarder`, stopping any session it replaces.
    pub fn add(&mut self, forwarder: Arc<dyn Forwarder>) {
        let id = forwarder.id();
        if let Some(previous) = self.entries.insert(id.clone(), Arc::clone(&forwarder))
            && !Arc::ptr_eq(&previous, &forwarder)
        {
            debug!(id, "replacing port-forward");
            previous.stop();
        }
    }

    /// Stops and removes the session with exactly this id.
    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn Forwarder>> {
        let removed = self.entries.remove(id)?;
        removed.stop();
        Some(removed)
    }

    /// Drops `forwarder` once its worker has exited, unless the key now
    /// belongs to a newer session.
    pub fn retire(&mut self, forwarder: &Arc<dyn Forwarder>) -> bool {
        let id = forwarder.id();
        match self.entries.get(&id) {
            Some(current) if Arc::ptr_eq(current, forwarder) => {
                self.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Stops every session of `path`: the exact key, or any key nested
    /// under `path|`. Returns how many were stopped.
    pub fn kill(&mut self, path: &str) -> usize {
        let prefix = format!("{path}|");
        let doomed = self
            .entries
            .keys()
            .filter(|id| *id == path || id.starts_with(&prefix))
            .cloned()
            .collect::<Vec<_>>();
        for id in &doomed {
            if let Some(forwarder) = self.entries.remove(id) {
                forwarder.stop();
            }
        }
        doomed.len()
    }

    /// Stops the one session of `path`, `container` and `port_map`.
    pub fn kill_one(&mut self, path: &str, container: &str, port_map: &str) -> bool {
        self.remove(&forward_id(path, container, port_map)).is_some()
    }

    pub fn is_pod_forwarded(&self, path: &str) -> bool {
        let prefix = format!("{path}|");
        self.entries.keys().any(|id| id.starts_with(&prefix))
    }

    pub fn is_container_forwarded(&self, path: &str, container: &str) -> bool {
        let prefix = format!("{path}|{container}|");
        self.entries.keys().any(|id| id.starts_with(&prefix))
    }

    pub fn delete_all(&mut self) {
        for (id, forwarder) in self.entries.drain() {
            debug!(id, "stopping port-forward");
            forwarder.stop();
        }
    }
}
