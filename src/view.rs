use chrono::Utc;
use k8s_openapi::Resource as ApiType;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::{ALL_NAMESPACES, CLUSTER_SCOPE, namespaced};
use crate::error::EngineResult;
use crate::forwarders::Forwarder;
use crate::gvr::{Gvr, Selector};
use crate::model::{NamespaceScope, ResourceKind};
use crate::rbac::{self, SubjectKind};
use crate::render::{Reconciler, Row, Snapshot, TableData};
use crate::resources::{self, decode, format_elapsed_seconds};
use crate::watch::Factory;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RoleKind {
    ClusterRole,
    Role,
}

/// What a table shows. Each kind knows its header and how to load a fresh
/// snapshot from the factory.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ViewKind {
    Resource(ResourceKind),
    /// Expanded rules of one role (`name` or `namespace/name`).
    Rules { role: RoleKind, path: String },
    Subjects(SubjectKind),
    /// Everything one subject is granted.
    Policy { subject: SubjectKind, name: String },
    PortForwards,
}

impl ViewKind {
    /// Maps a command token to a view. Resource aliases win over the rest.
    pub fn from_command(token: &str) -> Option<Self> {
        if let Some(kind) = ResourceKind::from_token(token) {
            return Some(Self::Resource(kind));
        }
        match token.to_ascii_lowercase().as_str() {
            "pf" | "pfs" | "portforward" | "portforwards" => Some(Self::PortForwards),
            other => SubjectKind::from_token(other).map(Self::Subjects),
        }
    }

    pub fn header(&self) -> Row {
        match self {
            Self::Resource(kind) => resources::header(*kind),
            Self::Rules { .. } => rbac::rules_header(),
            Self::Subjects(_) => rbac::subjects_header(),
            Self::Policy { .. } => rbac::policy_header(),
            Self::PortForwards => port_forward_header(),
        }
    }

    pub fn scope(&self, namespace: &str) -> NamespaceScope {
        match self {
            Self::Resource(kind) => NamespaceScope::resolve(&kind.gvr(), namespace),
            Self::PortForwards => NamespaceScope::All,
            Self::Rules { .. } | Self::Subjects(_) | Self::Policy { .. } => {
                NamespaceScope::Cluster
            }
        }
    }

    /// The view a selected row drills into, if any.
    pub fn drill(&self, key: &str) -> Option<Self> {
        match self {
            Self::Resource(ResourceKind::Roles) => Some(Self::Rules {
                role: RoleKind::Role,
                path: key.to_string(),
            }),
            Self::Resource(ResourceKind::ClusterRoles) => Some(Self::Rules {
                role: RoleKind::ClusterRole,
                path: key.to_string(),
            }),
            Self::Subjects(subject) => Some(Self::Policy {
                subject: *subject,
                name: namespaced(key).1,
            }),
            _ => None,
        }
    }

    /// Watches a refresh reads from, as `(namespace, gvr)` pairs. They are
    /// registered on the application loop before the refresh task runs.
    pub fn watches(&self, namespace: &str) -> Vec<(String, Gvr)> {
        let bindings = [
            (CLUSTER_SCOPE.to_string(), Gvr::cluster_role_bindings()),
            (ALL_NAMESPACES.to_string(), Gvr::role_bindings()),
        ];
        match self {
            Self::Resource(kind) => vec![(namespace.to_string(), kind.gvr())],
            Self::Rules {
                role: RoleKind::ClusterRole,
                ..
            } => vec![(CLUSTER_SCOPE.to_string(), Gvr::cluster_roles())],
            Self::Rules {
                role: RoleKind::Role,
                path,
            } => vec![(namespaced(path).0, Gvr::roles())],
            Self::Subjects(_) => bindings.to_vec(),
            Self::Policy { .. } => {
                let mut watches = bindings.to_vec();
                watches.push((CLUSTER_SCOPE.to_string(), Gvr::cluster_roles()));
                watches.push((ALL_NAMESPACES.to_string(), Gvr::roles()));
                watches
            }
            Self::PortForwards => Vec::new(),
        }
    }

    /// Loads a fresh snapshot. Only resource listings honor `selector`.
    pub async fn load(
        &self,
        factory: &Factory,
        namespace: &str,
        selector: &Selector,
    ) -> EngineResult<Snapshot> {
        match self {
            Self::Resource(kind) => {
                let objects = factory.list(&kind.gvr(), namespace, true, selector).await?;
                Ok(resources::snapshot(*kind, &objects, &forwarded_pods(factory)))
            }
            Self::Rules { role, path } => {
                let rules = match role {
                    RoleKind::ClusterRole => {
                        let object = factory
                            .get(&Gvr::cluster_roles(), path, true, &Selector::everything())
                            .await?;
                        decode::<ClusterRole>(&object)?.rules
                    }
                    RoleKind::Role => {
                        let object = factory
                            .get(&Gvr::roles(), path, true, &Selector::everything())
                            .await?;
                        decode::<Role>(&object)?.rules
                    }
                };
                Ok(rbac::parse_rules(&rules.unwrap_or_default()))
            }
            Self::Subjects(subject) => {
                let (cluster_bindings, bindings) = bindings(factory).await?;
                Ok(rbac::subjects(*subject, &cluster_bindings, &bindings))
            }
            Self::Policy { subject, name } => {
                let (cluster_bindings, bindings) = bindings(factory).await?;
                let cluster_roles =
                    list_typed::<ClusterRole>(factory, &Gvr::cluster_roles(), CLUSTER_SCOPE)
                        .await?;
                let roles = list_typed::<Role>(factory, &Gvr::roles(), ALL_NAMESPACES).await?;
                let (rows, missing) = rbac::policies(
                    *subject,
                    name,
                    &cluster_bindings,
                    &bindings,
                    &cluster_roles,
                    &roles,
                );
                if !missing.is_empty() {
                    warn!(subject = %subject, name, ?missing, "bound roles not found");
                }
                Ok(rows)
            }
            Self::PortForwards => Ok(port_forward_rows(&factory.forwarders())),
        }
    }
}

impl Display for ViewKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resource(kind) => write!(f, "{}", kind.title()),
            Self::Rules { role: RoleKind::ClusterRole, path } => write!(f, "ClusterRole({path})"),
            Self::Rules { role: RoleKind::Role, path } => write!(f, "Role({path})"),
            Self::Subjects(subject) => write!(f, "Subject({subject})"),
            Self::Policy { subject, name } => write!(f, "Policy({subject}:{name})"),
            Self::PortForwards => write!(f, "PortForwards"),
        }
    }
}

async fn list_typed<K>(factory: &Factory, gvr: &Gvr, namespace: &str) -> EngineResult<Vec<K>>
where
    K: ApiType + DeserializeOwned,
{
    let objects = factory
        .list(gvr, namespace, true, &Selector::everything())
        .await?;
    Ok(objects
        .iter()
        .filter_map(|object| match decode::<K>(object) {
            Ok(typed) => Some(typed),
            Err(error) => {
                warn!(gvr = %gvr, name = object.name_any(), "skipping object: {error}");
                None
            }
        })
        .collect())
}

async fn bindings(
    factory: &Factory,
) -> EngineResult<(Vec<ClusterRoleBinding>, Vec<RoleBinding>)> {
    let cluster_bindings = list_typed::<ClusterRoleBinding>(
        factory,
        &Gvr::cluster_role_bindings(),
        CLUSTER_SCOPE,
    )
    .await?;
    let bindings =
        list_typed::<RoleBinding>(factory, &Gvr::role_bindings(), ALL_NAMESPACES).await?;
    Ok((cluster_bindings, bindings))
}

/// Pod paths that currently carry at least one tunnel.
fn forwarded_pods(factory: &Factory) -> HashSet<String> {
    factory
        .forwarders()
        .iter()
        .map(|forwarder| {
            forwarder
                .path()
                .split('|')
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

pub fn port_forward_header() -> Row {
    ["NAMESPACE", "NAME", "CONTAINER", "PORTS", "ADDRESS", "ACTIVE", "AGE"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// One row per registered tunnel, keyed by forward id.
pub fn port_forward_rows(forwarders: &[Arc<dyn Forwarder>]) -> Snapshot {
    let now = Utc::now();
    forwarders
        .iter()
        .map(|forwarder| {
            let (namespace, name) = namespaced(forwarder.path());
            let age = (now - forwarder.age()).num_seconds().max(0);
            let row = vec![
                namespace,
                name,
                forwarder.container().to_string(),
                forwarder.port_map(),
                forwarder.address().to_string(),
                forwarder.active().to_string(),
                format_elapsed_seconds(age),
            ];
            (forwarder.id(), row)
        })
        .collect()
}

/// A view kind bound to its reconciler. Refreshes run one at a time, so two
/// diffs never race on the same cache.
pub struct View {
    kind: ViewKind,
    namespace: String,
    selector: Selector,
    reconciler: Reconciler,
}

impl View {
    pub fn new(kind: ViewKind, namespace: &str) -> Self {
        let reconciler = Reconciler::new(kind.header(), kind.scope(namespace));
        Self {
            kind,
            namespace: namespace.to_string(),
            selector: Selector::everything(),
            reconciler,
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn kind(&self) -> &ViewKind {
        &self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Table shown before the first refresh, or after a denied one.
    pub fn empty(&self) -> TableData {
        TableData::new(self.kind.header(), self.kind.scope(&self.namespace))
    }

    pub async fn refresh(&mut self, factory: &Factory) -> EngineResult<TableData> {
        match self.kind.load(factory, &self.namespace, &self.selector).await {
            Ok(snapshot) => {
                debug!(view = %self.kind, rows = snapshot.len(), "view refreshed");
                Ok(self.reconciler.reconcile(snapshot))
            }
            Err(error) => {
                if error.is_access_error() {
                    self.reconciler.reset();
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RoleKind, View, ViewKind, port_forward_rows};
    use crate::client::testing::FakeConnection;
    use crate::error::EngineError;
    use crate::forwarders::Forwarder;
    use crate::forwarders::testing::StubForwarder;
    use crate::gvr::{Gvr, Selector};
    use crate::model::{NamespaceScope, ResourceKind};
    use crate::rbac::{ALLOWED, SubjectKind};
    use crate::render::RowAction;
    use crate::watch::Factory;
    use chrono::{Duration, Utc};
    use kube::api::DynamicObject;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn object(
        gvr: &Gvr,
        namespace: Option<&str>,
        name: &str,
        data: serde_json::Value,
    ) -> DynamicObject {
        let mut object = DynamicObject::new(name, &gvr.api_resource());
        object.metadata.namespace = namespace.map(str::to_string);
        object.data = data;
        object
    }

    fn seed(factory: &Factory, gvr: Gvr, objects: Vec<DynamicObject>) {
        factory.for_resource("", &gvr).expect("watch").seed(objects);
    }

    fn rbac_factory() -> Factory {
        let factory = Factory::new(Arc::new(FakeConnection::default()));
        let role_ref = |kind: &str, name: &str| {
            json!({"apiGroup": "rbac.authorization.k8s.io", "kind": kind, "name": name})
        };
        seed(&factory, Gvr::cluster_role_bindings(), vec![object(
            &Gvr::cluster_role_bindings(),
            None,
            "admins",
            json!({
                "roleRef": role_ref("ClusterRole", "cluster-admin"),
                "subjects": [{"kind": "User", "name": "fernand"}]
            }),
        )]);
        seed(&factory, Gvr::role_bindings(), vec![]);
        seed(&factory, Gvr::cluster_roles(), vec![object(
            &Gvr::cluster_roles(),
            None,
            "cluster-admin",
            json!({"rules": [{"apiGroups": ["*"], "resources": ["*"], "verbs": ["*"]}]}),
        )]);
        seed(&factory, Gvr::roles(), vec![]);
        factory
    }

    #[test]
    fn commands_map_to_views() {
        assert_eq!(
            ViewKind::from_command("po"),
            Some(ViewKind::Resource(ResourceKind::Pods))
        );
        assert_eq!(ViewKind::from_command("pf"), Some(ViewKind::PortForwards));
        assert_eq!(
            ViewKind::from_command("sas"),
            Some(ViewKind::Subjects(SubjectKind::ServiceAccount))
        );
        assert_eq!(ViewKind::from_command("nope"), None);
        assert_eq!(
            ViewKind::Resource(ResourceKind::ClusterRoles).drill("admin"),
            Some(ViewKind::Rules {
                role: RoleKind::ClusterRole,
                path: "admin".to_string()
            })
        );
        assert_eq!(
            ViewKind::Subjects(SubjectKind::User).drill("fernand"),
            Some(ViewKind::Policy {
                subject: SubjectKind::User,
                name: "fernand".to_string()
            })
        );
        assert_eq!(ViewKind::PortForwards.drill("x"), None);
    }

    #[tokio::test]
    async fn resource_views_reconcile_between_refreshes() {
        let factory = Factory::new(Arc::new(FakeConnection::default()));
        let watch = factory.for_resource("", &Gvr::namespaces()).expect("watch");
        watch.seed(vec![
            object(&Gvr::namespaces(), None, "default", json!({"status": {"phase": "Active"}})),
            object(&Gvr::namespaces(), None, "kube-system", json!({})),
        ]);

        let mut view = View::new(ViewKind::Resource(ResourceKind::Namespaces), "ns1");
        assert_eq!(view.empty().namespace, NamespaceScope::Cluster);

        let first = view.refresh(&factory).await.expect("refresh");
        assert_eq!(first.count(RowAction::New), 2);
        assert_eq!(first.rows["default"].fields[..2], ["default", "Active"]);

        let second = view.refresh(&factory).await.expect("refresh");
        assert_eq!(second.count(RowAction::Unchanged), 2);
    }

    #[tokio::test]
    async fn selectors_narrow_resource_views() {
        let factory = Factory::new(Arc::new(FakeConnection::default()));
        let mut labelled = object(&Gvr::namespaces(), None, "team-a", json!({}));
        labelled.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
        seed(&factory, Gvr::namespaces(), vec![
            labelled,
            object(&Gvr::namespaces(), None, "team-b", json!({})),
        ]);

        let mut view = View::new(ViewKind::Resource(ResourceKind::Namespaces), "")
            .with_selector(Selector::parse("team=a").expect("selector"));
        let table = view.refresh(&factory).await.expect("refresh");
        assert_eq!(table.sorted_keys(), vec!["team-a".to_string()]);
        assert_eq!(table.rows["team-a"].fields[2], "1");
    }

    #[tokio::test]
    async fn denied_refreshes_reset_the_reconciler() {
        let connection = Arc::new(FakeConnection::default());
        let factory = Factory::new(connection.clone());
        seed(&factory, Gvr::namespaces(), vec![object(
            &Gvr::namespaces(),
            None,
            "default",
            json!({}),
        )]);
        let mut view = View::new(ViewKind::Resource(ResourceKind::Namespaces), "");
        let first = view.refresh(&factory).await.expect("refresh");
        assert_eq!(first.count(RowAction::New), 1);
        let second = view.refresh(&factory).await.expect("refresh");
        assert_eq!(second.count(RowAction::Unchanged), 1);

        connection.set_denied(&Gvr::namespaces(), true);
        let error = view.refresh(&factory).await.expect_err("denied");
        assert!(error.is_access_error());
        assert!(view.empty().rows.is_empty());
        assert_eq!(view.empty().namespace, NamespaceScope::Cluster);

        connection.set_denied(&Gvr::namespaces(), false);
        let regranted = view.refresh(&factory).await.expect("refresh");
        assert_eq!(regranted.count(RowAction::New), 1);
        assert_eq!(regranted.count(RowAction::Unchanged), 0);
    }

    #[tokio::test]
    async fn other_failures_keep_the_reconciler() {
        let factory = rbac_factory();
        let admin = object(
            &Gvr::cluster_roles(),
            None,
            "cluster-admin",
            json!({"rules": [{"apiGroups": ["*"], "resources": ["*"], "verbs": ["*"]}]}),
        );
        let mut view = View::new(
            ViewKind::Rules {
                role: RoleKind::ClusterRole,
                path: "cluster-admin".to_string(),
            },
            "",
        );
        let first = view.refresh(&factory).await.expect("refresh");
        assert_eq!(first.count(RowAction::New), 1);

        seed(&factory, Gvr::cluster_roles(), vec![]);
        let error = view.refresh(&factory).await.expect_err("role deleted");
        assert!(matches!(error, EngineError::NotFound { .. }));

        seed(&factory, Gvr::cluster_roles(), vec![admin]);
        let again = view.refresh(&factory).await.expect("refresh");
        assert_eq!(again.count(RowAction::Unchanged), 1);
    }

    #[test]
    fn views_name_the_watches_they_read() {
        let pods = ViewKind::Resource(ResourceKind::Pods);
        assert_eq!(pods.watches("ns1"), vec![("ns1".to_string(), Gvr::pods())]);
        let role = ViewKind::Rules {
            role: RoleKind::Role,
            path: "ns1/reader".to_string(),
        };
        assert_eq!(role.watches(""), vec![("ns1".to_string(), Gvr::roles())]);
        let policy = ViewKind::Policy {
            subject: SubjectKind::User,
            name: "fernand".to_string(),
        };
        assert_eq!(policy.watches("ns1").len(), 4);
        assert!(ViewKind::PortForwards.watches("ns1").is_empty());
    }

    #[tokio::test]
    async fn unregistered_views_have_no_watch() {
        let factory = Factory::new(Arc::new(FakeConnection::default()));
        let mut view = View::new(ViewKind::Resource(ResourceKind::Services), "ns1");
        let error = view.refresh(&factory).await.expect_err("nothing registered");
        assert!(matches!(error, EngineError::NoWatch(_)));

        for (namespace, gvr) in view.kind().watches(view.namespace()) {
            factory.for_resource(&namespace, &gvr).expect("watch");
        }
        let table = view.refresh(&factory).await.expect("refresh");
        assert!(table.rows.is_empty());
    }

    #[tokio::test]
    async fn rules_view_expands_the_role() {
        let factory = rbac_factory();
        let mut view = View::new(
            ViewKind::Rules {
                role: RoleKind::ClusterRole,
                path: "cluster-admin".to_string(),
            },
            "ns1",
        );
        let table = view.refresh(&factory).await.expect("refresh");
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows["*.*"];
        assert_eq!(row.action, RowAction::New);
        assert!(row.fields[2..10].iter().all(|cell| cell == ALLOWED));
    }

    #[tokio::test]
    async fn subject_and_policy_views_follow_bindings() {
        let factory = rbac_factory();

        let mut subjects = View::new(ViewKind::Subjects(SubjectKind::User), "");
        let table = subjects.refresh(&factory).await.expect("refresh");
        assert_eq!(
            table.rows["fernand"].fields,
            ["fernand", "ClusterRoleBinding", "admins"]
        );

        let drilled = subjects.kind().drill("fernand").expect("policy");
        let mut policy = View::new(drilled, "");
        let table = policy.refresh(&factory).await.expect("refresh");
        assert_eq!(table.rows["*/*.*"].fields[..4], ["*", "*.*", "*", "CR:cluster-admin"]);
    }

    #[test]
    fn port_forward_rows_describe_tunnels() {
        let started = Utc::now() - Duration::minutes(3);
        let session: Arc<dyn Forwarder> =
            Arc::new(StubForwarder::aged("ns1/web", "c1", "8080:80", started));
        let rows = port_forward_rows(&[session]);
        assert_eq!(
            rows["ns1/web|c1|8080:80"],
            ["ns1", "web", "c1", "8080:80", "localhost", "true", "3m"]
        );
    }
}
