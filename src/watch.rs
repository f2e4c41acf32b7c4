use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::{self, Config as WatchConfig, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{
    ALL_NAMESPACES, Connection, GET_ACCESS, LIST_ACCESS, is_all_namespace, is_cluster_wide,
    namespaced,
};
use crate::error::{EngineError, EngineResult};
use crate::forwarders::{Forwarder, Forwarders};
use crate::gvr::{Gvr, Selector};

const SYNC_WAIT: Duration = Duration::from_millis(500);

/// One reflector-backed cache for a resource kind within a namespace scope.
///
/// A watch is registered idle and only starts streaming once the factory is
/// running, so lookups against it are valid (and empty) before that.
pub struct Watch {
    gvr: Gvr,
    namespace: String,
    store: Store<DynamicObject>,
    writer: Mutex<Option<Writer<DynamicObject>>>,
    synced: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watch {
    fn new(gvr: Gvr, namespace: &str) -> Self {
        let writer = Writer::new(gvr.api_resource());
        let store = writer.as_reader();
        Self {
            gvr,
            namespace: namespace.to_string(),
            store,
            writer: Mutex::new(Some(writer)),
            synced: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn gvr(&self) -> &Gvr {
        &self.gvr
    }

    /// Scope this watch lists from; empty for every namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.writer
            .lock()
            .map(|writer| writer.is_none())
            .unwrap_or(false)
    }

    pub fn objects(&self) -> Vec<Arc<DynamicObject>> {
        self.store.state()
    }

    async fn wait_synced(&self, limit: Duration) {
        if self.has_synced() {
            return;
        }
        if timeout(limit, self.store.wait_until_ready()).await.is_err() {
            debug!(gvr = %self.gvr, namespace = self.namespace, "cache not synced yet");
        }
    }

    fn start(&self, client: Client, token: CancellationToken) {
        let Some(writer) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let resource = self.gvr.api_resource();
        let api: Api<DynamicObject> = if self.namespace.is_empty() || !self.gvr.is_namespaced() {
            Api::all_with(client, &resource)
        } else {
            Api::namespaced_with(client, &self.namespace, &resource)
        };
        let gvr = self.gvr.clone();
        let namespace = self.namespace.clone();
        let synced = Arc::clone(&self.synced);

        debug!(gvr = %gvr, namespace, "starting watch");
        let handle = tokio::spawn(async move {
            let mut events = watcher(api, WatchConfig::default())
                .default_backoff()
                .reflect(writer)
                .boxed();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = events.next() => match next {
                        Some(Ok(watcher::Event::InitDone)) => {
                            if !synced.swap(true, Ordering::SeqCst) {
                                debug!(gvr = %gvr, namespace, "cache synced");
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(gvr = %gvr, namespace, "watch stream error: {error}");
                        }
                        None => break,
                    },
                }
            }
            debug!(gvr = %gvr, namespace, "watch stopped");
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, objects: Vec<DynamicObject>) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = guard.as_mut() {
            writer.apply_watcher_event(&watcher::Event::Init);
            for object in objects {
                writer.apply_watcher_event(&watcher::Event::InitApply(object));
            }
            writer.apply_watcher_event(&watcher::Event::InitDone);
        }
        self.synced.store(true, Ordering::SeqCst);
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct FactoryState {
    watches: HashMap<String, HashMap<Gvr, Arc<Watch>>>,
    stop: Option<CancellationToken>,
    forwarders: Forwarders,
}

/// Access-gated, namespace-scoped watch caches plus the tunnel registry.
///
/// Both registries are written from the application loop only: watches via
/// `for_resource`, tunnels via the forwarder calls. `list`, `get` and the
/// other reads may run on any task and only ever look entries up.
pub struct Factory {
    client: Arc<dyn Connection>,
    state: RwLock<FactoryState>,
}

fn scope_key(gvr: &Gvr, namespace: &str) -> String {
    if !gvr.is_namespaced() || is_cluster_wide(namespace) {
        ALL_NAMESPACES.to_string()
    } else {
        namespace.to_string()
    }
}

fn in_namespace(object: &DynamicObject, gvr: &Gvr, namespace: &str) -> bool {
    !gvr.is_namespaced()
        || is_cluster_wide(namespace)
        || object.metadata.namespace.as_deref() == Some(namespace)
}

impl Factory {
    pub fn new(client: Arc<dyn Connection>) -> Self {
        Self {
            client,
            state: RwLock::new(FactoryState::default()),
        }
    }

    pub fn client(&self) -> &Arc<dyn Connection> {
        &self.client
    }

    fn read(&self) -> RwLockReadGuard<'_, FactoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FactoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts every registered watch. Watches created later start on demand.
    pub fn start(&self, namespace: &str) {
        let token = CancellationToken::new();
        let watches = {
            let mut state = self.write();
            if let Some(previous) = state.stop.replace(token.clone()) {
                previous.cancel();
            }
            state
                .watches
                .values()
                .flat_map(|scope| scope.values().cloned())
                .collect::<Vec<_>>()
        };
        info!(namespace, watches = watches.len(), "factory started");

        for watch in watches {
            if let Err(error) = self.launch(&watch, &token) {
                warn!(gvr = %watch.gvr(), "unable to start watch: {error}");
            }
        }
    }

    /// Stops every watch, forgets them, and tears down every tunnel.
    pub fn terminate(&self) {
        let mut state = self.write();
        if let Some(stop) = state.stop.take() {
            stop.cancel();
        }
        state.watches.clear();
        state.forwarders.delete_all();
        info!("factory terminated");
    }

    fn launch(&self, watch: &Watch, token: &CancellationToken) -> EngineResult<()> {
        if watch.is_running() {
            return Ok(());
        }
        let client = self.client.dyn_dial()?;
        watch.start(client, token.child_token());
        Ok(())
    }

    pub fn is_cluster_wide(&self) -> bool {
        self.read().watches.contains_key(ALL_NAMESPACES)
    }

    /// Registers the scope for `namespace` unless every namespace is
    /// already covered.
    pub fn set_active_ns(&self, namespace: &str) {
        if self.is_cluster_wide() {
            return;
        }
        let key = if is_cluster_wide(namespace) {
            ALL_NAMESPACES.to_string()
        } else {
            namespace.to_string()
        };
        self.write().watches.entry(key).or_default();
    }

    /// Returns the watch serving `gvr` in `namespace`, registering and
    /// starting it when needed. An all-namespaces watch for the kind serves
    /// every namespace.
    pub fn for_resource(&self, namespace: &str, gvr: &Gvr) -> EngineResult<Arc<Watch>> {
        if !gvr.is_k8s_res() {
            return Err(EngineError::NoWatch(gvr.clone()));
        }

        let key = scope_key(gvr, namespace);
        let (watch, token) = {
            let mut state = self.write();
            let shared = state
                .watches
                .get(ALL_NAMESPACES)
                .and_then(|scope| scope.get(gvr))
                .cloned();
            let watch = match shared {
                Some(watch) => watch,
                None => Arc::clone(
                    state
                        .watches
                        .entry(key.clone())
                        .or_default()
                        .entry(gvr.clone())
                        .or_insert_with(|| {
                            debug!(gvr = %gvr, namespace = key, "registering watch");
                            Arc::new(Watch::new(gvr.clone(), &key))
                        }),
                ),
            };
            (watch, state.stop.clone())
        };

        if let Some(token) = token {
            self.launch(&watch, &token)?;
        }
        Ok(watch)
    }

    fn lookup(&self, namespace: &str, gvr: &Gvr) -> EngineResult<Arc<Watch>> {
        if !gvr.is_k8s_res() {
            return Err(EngineError::NoWatch(gvr.clone()));
        }
        let state = self.read();
        let scoped = |key: &str| state.watches.get(key).and_then(|scope| scope.get(gvr));
        scoped(ALL_NAMESPACES)
            .or_else(|| scoped(&scope_key(gvr, namespace)))
            .cloned()
            .ok_or_else(|| EngineError::NoWatch(gvr.clone()))
    }

    /// Checks `verbs` on `gvr` against the cluster before handing out the
    /// registered watch. Fails with `NoWatch` when nothing serves the kind in
    /// `namespace` yet.
    pub async fn can_for_resource(
        &self,
        namespace: &str,
        gvr: &Gvr,
        verbs: &[&str],
    ) -> EngineResult<Arc<Watch>> {
        if !self.client.can_i(namespace, gvr, verbs).await? {
            warn!(gvr = %gvr, namespace, ?verbs, "access denied");
            return Err(EngineError::access_denied(namespace, gvr, verbs));
        }
        self.lookup(namespace, gvr)
    }

    pub async fn list(
        &self,
        gvr: &Gvr,
        namespace: &str,
        wait: bool,
        selector: &Selector,
    ) -> EngineResult<Vec<Arc<DynamicObject>>> {
        let namespace = if is_all_namespace(namespace) {
            ALL_NAMESPACES
        } else {
            namespace
        };
        let watch = self.can_for_resource(namespace, gvr, &LIST_ACCESS).await?;
        if wait {
            watch.wait_synced(SYNC_WAIT).await;
        }

        Ok(watch
            .objects()
            .into_iter()
            .filter(|object| in_namespace(object, gvr, namespace))
            .filter(|object| {
                selector.is_everything() || selector.matches(object.metadata.labels.as_ref())
            })
            .collect())
    }

    /// Looks up `path` (`namespace/name`, or `name` for cluster kinds).
    pub async fn get(
        &self,
        gvr: &Gvr,
        path: &str,
        wait: bool,
        _selector: &Selector,
    ) -> EngineResult<Arc<DynamicObject>> {
        let (namespace, name) = namespaced(path);
        let watch = self.can_for_resource(&namespace, gvr, &GET_ACCESS).await?;
        if wait {
            watch.wait_synced(SYNC_WAIT).await;
        }

        watch
            .objects()
            .into_iter()
            .find(|object| {
                object.metadata.name.as_deref() == Some(name.as_str())
                    && in_namespace(object, gvr, &namespace)
            })
            .ok_or_else(|| EngineError::NotFound {
                gvr: gvr.clone(),
                path: path.to_string(),
            })
    }

    pub async fn has_synced(&self, gvr: &Gvr, namespace: &str) -> EngineResult<bool> {
        let watch = self.can_for_resource(namespace, gvr, &LIST_ACCESS).await?;
        Ok(watch.has_synced())
    }

    /// Blocks until every running watch has listed once, or the factory stops.
    pub async fn wait_for_cache_sync(&self) {
        let (watches, token) = {
            let state = self.read();
            let watches = state
                .watches
                .values()
                .flat_map(|scope| scope.values().cloned())
                .filter(|watch| watch.is_running())
                .collect::<Vec<_>>();
            (watches, state.stop.clone())
        };
        let Some(token) = token else {
            return;
        };

        for watch in watches {
            tokio::select! {
                _ = token.cancelled() => return,
                ready = watch.store.wait_until_ready() => {
                    if ready.is_ok() {
                        debug!(gvr = %watch.gvr(), namespace = watch.namespace(), "cache loaded");
                    }
                }
            }
        }
    }

    pub fn add_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        self.write().forwarders.add(forwarder);
    }

    /// Stops every tunnel of `path`. Returns how many went away.
    pub fn delete_forwarder(&self, path: &str) -> usize {
        let count = self.write().forwarders.kill(path);
        warn!(path, count, "deleted port-forward");
        count
    }

    pub fn kill_forwarder(&self, path: &str, container: &str, port_map: &str) -> bool {
        self.write().forwarders.kill_one(path, container, port_map)
    }

    /// Removes a session whose worker exited on its own.
    pub fn retire_forwarder(&self, forwarder: &Arc<dyn Forwarder>) -> bool {
        self.write().forwarders.retire(forwarder)
    }

    pub fn forwarder_for(&self, id: &str) -> Option<Arc<dyn Forwarder>> {
        self.read().forwarders.get(id)
    }

    pub fn forwarders(&self) -> Vec<Arc<dyn Forwarder>> {
        self.read().forwarders.snapshot()
    }

    pub fn is_pod_forwarded(&self, path: &str) -> bool {
        self.read().forwarders.is_pod_forwarded(path)
    }

    pub fn is_container_forwarded(&self, path: &str, container: &str) -> bool {
        self.read().forwarders.is_container_forwarded(path, container)
    }

    /// Ids of tunnels whose pod is gone or was recreated after the tunnel
    /// started. Pods whose cache has not synced are left alone.
    pub async fn stale_port_forwards(&self) -> Vec<String> {
        let mut stale = Vec::new();
        for forwarder in self.forwarders() {
            let path = forwarder.path().split('|').next().unwrap_or_default();
            let (namespace, _) = namespaced(path);
            match self.has_synced(&Gvr::pods(), &namespace).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    debug!(path, "skipping port-forward validation: {error}");
                    continue;
                }
            }

            match self
                .get(&Gvr::pods(), path, false, &Selector::everything())
                .await
            {
                Ok(pod) => {
                    let created = pod
                        .metadata
                        .creation_timestamp
                        .as_ref()
                        .map(|time| time.0.as_second());
                    if created.is_some_and(|created| created > forwarder.age().timestamp()) {
                        stale.push(forwarder.id());
                    }
                }
                Err(EngineError::NotFound { .. }) => stale.push(forwarder.id()),
                Err(error) => debug!(path, "skipping port-forward validation: {error}"),
            }
        }
        stale
    }

    /// Stops and forgets the tunnels in `ids`. Returns how many went away.
    pub fn prune_forwarders(&self, ids: &[String]) -> usize {
        let mut state = self.write();
        ids.iter()
            .filter(|id| state.forwarders.remove(id).is_some())
            .inspect(|id| info!(id = id.as_str(), "stopped stale port-forward"))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::Factory;
    use crate::client::testing::FakeConnection;
    use crate::error::EngineError;
    use crate::forwarders::testing::StubForwarder;
    use crate::forwarders::Forwarder;
    use crate::gvr::{Gvr, Selector};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::jiff::Timestamp;
    use kube::api::DynamicObject;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn factory(connection: FakeConnection) -> Factory {
        Factory::new(Arc::new(connection))
    }

    fn pod(namespace: &str, name: &str, app: &str, created: i64) -> DynamicObject {
        let mut object = DynamicObject::new(name, &Gvr::pods().api_resource()).within(namespace);
        object.metadata.labels = Some(BTreeMap::from([("app".to_string(), app.to_string())]));
        object.metadata.creation_timestamp =
            Some(Time(Timestamp::from_second(created).expect("timestamp")));
        object
    }

    #[tokio::test]
    async fn denied_listing_fails_fast() {
        let factory = factory(FakeConnection::default().deny(&Gvr::pods()));
        let error = factory
            .list(&Gvr::pods(), "default", false, &Selector::everything())
            .await
            .expect_err("denied");
        assert!(matches!(error, EngineError::AccessDenied { .. }));
        assert!(error.is_access_error());
        assert!(!factory.is_cluster_wide());
    }

    #[tokio::test]
    async fn access_is_checked_with_list_verbs() {
        let connection = Arc::new(FakeConnection::default());
        let factory = Factory::new(connection.clone());
        factory.for_resource("default", &Gvr::pods()).expect("watch");
        let objects = factory
            .list(&Gvr::pods(), "default", false, &Selector::everything())
            .await
            .expect("list");
        assert!(objects.is_empty());
        factory
            .get(&Gvr::pods(), "default/p1", false, &Selector::everything())
            .await
            .expect_err("empty cache");

        let checks = connection.checks.lock().expect("checks").clone();
        assert_eq!(
            checks,
            vec![
                "default:v1/pods:list,watch".to_string(),
                "default:v1/pods:get".to_string(),
            ]
        );
    }

    fn registered(factory: &Factory) -> usize {
        factory.read().watches.values().map(|scope| scope.len()).sum()
    }

    #[tokio::test]
    async fn background_reads_leave_the_registry_alone() {
        let factory = Arc::new(factory(FakeConnection::default()));
        let reader = Arc::clone(&factory);
        let (listed, found) = tokio::spawn(async move {
            let listed = reader
                .list(&Gvr::pods(), "all", false, &Selector::everything())
                .await;
            let found = reader
                .get(&Gvr::pods(), "ns1/p1", false, &Selector::everything())
                .await;
            (listed, found)
        })
        .await
        .expect("join");
        assert!(matches!(listed, Err(EngineError::NoWatch(_))));
        assert!(matches!(found, Err(EngineError::NoWatch(_))));
        assert!(!factory.is_cluster_wide());
        assert_eq!(registered(&factory), 0);

        factory.for_resource("ns1", &Gvr::pods()).expect("watch");
        let reader = Arc::clone(&factory);
        let listed = tokio::spawn(async move {
            reader
                .list(&Gvr::pods(), "ns1", false, &Selector::everything())
                .await
        })
        .await
        .expect("join")
        .expect("list");
        assert!(listed.is_empty());
        assert_eq!(registered(&factory), 1);
        assert!(!factory.is_cluster_wide());
    }

    #[test]
    fn unknown_kinds_have_no_watch() {
        let factory = factory(FakeConnection::default());
        let error = factory
            .for_resource("default", &Gvr::parse("pods"))
            .err()
            .expect("no watch");
        assert!(matches!(error, EngineError::NoWatch(_)));
    }

    #[test]
    fn all_namespaces_watch_is_shared() {
        let factory = factory(FakeConnection::default());
        let shared = factory.for_resource("", &Gvr::pods()).expect("watch");
        let scoped = factory.for_resource("kube-system", &Gvr::pods()).expect("watch");
        assert!(Arc::ptr_eq(&shared, &scoped));
        assert!(factory.is_cluster_wide());

        let nodes = factory.for_resource("kube-system", &Gvr::nodes()).expect("watch");
        assert_eq!(nodes.namespace(), "");
    }

    #[test]
    fn namespace_watches_are_distinct_until_shared() {
        let factory = factory(FakeConnection::default());
        let first = factory.for_resource("ns1", &Gvr::pods()).expect("watch");
        let second = factory.for_resource("ns2", &Gvr::pods()).expect("watch");
        let again = factory.for_resource("ns1", &Gvr::pods()).expect("watch");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!factory.is_cluster_wide());

        let shared = factory.for_resource("all", &Gvr::pods()).expect("watch");
        let collapsed = factory.for_resource("ns3", &Gvr::pods()).expect("watch");
        assert!(Arc::ptr_eq(&shared, &collapsed));
    }

    #[tokio::test]
    async fn list_filters_namespace_and_labels() {
        let factory = factory(FakeConnection::default());
        let watch = factory.for_resource("", &Gvr::pods()).expect("watch");
        watch.seed(vec![
            pod("ns1", "p1", "web", 100),
            pod("ns1", "p2", "db", 100),
            pod("ns2", "p3", "web", 100),
        ]);

        let all = factory
            .list(&Gvr::pods(), "all", true, &Selector::everything())
            .await
            .expect("list");
        assert_eq!(all.len(), 3);

        let ns1 = factory
            .list(&Gvr::pods(), "ns1", true, &Selector::everything())
            .await
            .expect("list");
        assert_eq!(ns1.len(), 2);

        let web = factory
            .list(
                &Gvr::pods(),
                "ns1",
                false,
                &Selector::parse("app=web").expect("selector"),
            )
            .await
            .expect("list");
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].metadata.name.as_deref(), Some("p1"));

        let found = factory
            .get(&Gvr::pods(), "ns2/p3", false, &Selector::everything())
            .await
            .expect("get");
        assert_eq!(found.metadata.namespace.as_deref(), Some("ns2"));

        let missing = factory
            .get(&Gvr::pods(), "ns1/p3", false, &Selector::everything())
            .await
            .expect_err("p3 lives in ns2");
        assert_eq!(missing.to_string(), r#"v1/pods "ns1/p3" not found"#);

        assert!(factory.has_synced(&Gvr::pods(), "ns1").await.expect("synced"));
    }

    #[test]
    fn active_namespace_is_skipped_once_cluster_wide() {
        let factory = factory(FakeConnection::default());
        factory.set_active_ns("ns1");
        assert!(!factory.is_cluster_wide());
        factory.set_active_ns("all");
        assert!(factory.is_cluster_wide());
    }

    #[tokio::test]
    async fn stale_port_forwards_are_stopped() {
        let factory = factory(FakeConnection::default());
        let watch = factory.for_resource("", &Gvr::pods()).expect("watch");
        watch.seed(vec![pod("ns1", "p1", "web", 1_000)]);

        let at = |seconds| Utc.timestamp_opt(seconds, 0).single().expect("time");
        let live = Arc::new(StubForwarder::aged("ns1/p1", "c1", "8080:80", at(2_000)));
        let gone = Arc::new(StubForwarder::aged("ns1/p9", "c1", "8080:80", at(2_000)));
        let recreated = Arc::new(StubForwarder::aged("ns1/p1", "c2", "9090:90", at(500)));
        factory.add_forwarder(live.clone());
        factory.add_forwarder(gone.clone());
        factory.add_forwarder(recreated.clone());

        let stale = factory.stale_port_forwards().await;
        assert_eq!(stale.len(), 2);
        assert_eq!(factory.forwarders().len(), 3);
        assert_eq!(factory.prune_forwarders(&stale), 2);
        assert_eq!(factory.forwarders().len(), 1);
        assert_eq!(live.stopped(), 0);
        assert_eq!(gone.stopped(), 1);
        assert_eq!(recreated.stopped(), 1);
        assert!(factory.is_container_forwarded("ns1/p1", "c1"));
        assert!(!factory.is_container_forwarded("ns1/p1", "c2"));
    }

    #[tokio::test]
    async fn terminate_clears_watches_and_tunnels() {
        let factory = factory(FakeConnection::default());
        factory.for_resource("ns1", &Gvr::pods()).expect("watch");
        factory.start("ns1");
        let session = Arc::new(StubForwarder::new("ns1/p1", "c1", "8080:80"));
        factory.add_forwarder(session.clone());
        assert!(factory.is_pod_forwarded("ns1/p1"));
        assert_eq!(factory.delete_forwarder("ns1/p2"), 0);

        factory.terminate();
        assert!(factory.forwarders().is_empty());
        assert_eq!(session.stopped(), 1);
        assert!(!session.active());
        factory.wait_for_cache_sync().await;
    }
}
