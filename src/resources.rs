use k8s_openapi::Resource as ApiType;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, PodStatus, Service};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::client::fqn;
use crate::error::EngineResult;
use crate::model::ResourceKind;
use crate::port::ContainerPortSpecs;
use crate::render::{Row, Snapshot};

/// Converts a cached dynamic object into its typed form.
pub fn decode<K>(object: &DynamicObject) -> EngineResult<K>
where
    K: ApiType + DeserializeOwned,
{
    let mut value = serde_json::to_value(object)?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert("apiVersion".to_string(), K::API_VERSION.into());
        fields.insert("kind".to_string(), K::KIND.into());
    }
    Ok(serde_json::from_value(value)?)
}

/// A cached object decoded once, tagged with its kind.
#[derive(Debug, Clone)]
pub enum Resource {
    Pod(Box<Pod>),
    Deployment(Box<Deployment>),
    Service(Box<Service>),
    Node(Box<Node>),
    Namespace(Box<Namespace>),
    Role(Box<Role>),
    RoleBinding(Box<RoleBinding>),
    ClusterRole(Box<ClusterRole>),
    ClusterRoleBinding(Box<ClusterRoleBinding>),
}

impl Resource {
    pub fn decode(kind: ResourceKind, object: &DynamicObject) -> EngineResult<Self> {
        Ok(match kind {
            ResourceKind::Pods => Self::Pod(Box::new(decode(object)?)),
            ResourceKind::Deployments => Self::Deployment(Box::new(decode(object)?)),
            ResourceKind::Services => Self::Service(Box::new(decode(object)?)),
            ResourceKind::Nodes => Self::Node(Box::new(decode(object)?)),
            ResourceKind::Namespaces => Self::Namespace(Box::new(decode(object)?)),
            ResourceKind::Roles => Self::Role(Box::new(decode(object)?)),
            ResourceKind::RoleBindings => Self::RoleBinding(Box::new(decode(object)?)),
            ResourceKind::ClusterRoles => Self::ClusterRole(Box::new(decode(object)?)),
            ResourceKind::ClusterRoleBindings => {
                Self::ClusterRoleBinding(Box::new(decode(object)?))
            }
        })
    }

    /// FQN used as the row key.
    pub fn key(&self) -> String {
        let (namespace, name) = match self {
            Self::Pod(pod) => (pod.namespace(), pod.name_any()),
            Self::Deployment(deployment) => (deployment.namespace(), deployment.name_any()),
            Self::Service(service) => (service.namespace(), service.name_any()),
            Self::Node(node) => (None, node.name_any()),
            Self::Namespace(namespace) => (None, namespace.name_any()),
            Self::Role(role) => (role.namespace(), role.name_any()),
            Self::RoleBinding(binding) => (binding.namespace(), binding.name_any()),
            Self::ClusterRole(role) => (None, role.name_any()),
            Self::ClusterRoleBinding(binding) => (None, binding.name_any()),
        };
        fqn(namespace.as_deref().unwrap_or_default(), &name)
    }

    pub fn row(&self, forwarded: &HashSet<String>) -> Row {
        match self {
            Self::Pod(pod) => pod_row(pod, forwarded.contains(&self.key())),
            Self::Deployment(deployment) => deployment_row(deployment),
            Self::Service(service) => service_row(service),
            Self::Node(node) => node_row(node),
            Self::Namespace(namespace) => namespace_row(namespace),
            Self::Role(role) => vec![
                role.namespace().unwrap_or_default(),
                role.name_any(),
                role.rules.as_ref().map_or(0, Vec::len).to_string(),
                human_age(role.metadata.creation_timestamp.as_ref()),
            ],
            Self::RoleBinding(binding) => vec![
                binding.namespace().unwrap_or_default(),
                binding.name_any(),
                truncate(
                    &format!("{}:{}", binding.role_ref.kind, binding.role_ref.name),
                    26,
                ),
                binding.subjects.as_ref().map_or(0, Vec::len).to_string(),
                human_age(binding.metadata.creation_timestamp.as_ref()),
            ],
            Self::ClusterRole(role) => vec![
                role.name_any(),
                role.rules.as_ref().map_or(0, Vec::len).to_string(),
                human_age(role.metadata.creation_timestamp.as_ref()),
            ],
            Self::ClusterRoleBinding(binding) => vec![
                binding.name_any(),
                truncate(
                    &format!("{}:{}", binding.role_ref.kind, binding.role_ref.name),
                    26,
                ),
                binding.subjects.as_ref().map_or(0, Vec::len).to_string(),
                human_age(binding.metadata.creation_timestamp.as_ref()),
            ],
        }
    }
}

pub fn header(kind: ResourceKind) -> Row {
    let columns: &[&str] = match kind {
        ResourceKind::Pods => &[
            "NAMESPACE", "NAME", "PF", "READY", "STATUS", "RESTARTS", "NODE", "AGE",
        ],
        ResourceKind::Deployments => &[
            "NAMESPACE",
            "NAME",
            "READY",
            "UP-TO-DATE",
            "AVAILABLE",
            "AGE",
        ],
        ResourceKind::Services => &["NAMESPACE", "NAME", "TYPE", "CLUSTER-IP", "PORTS", "AGE"],
        ResourceKind::Nodes => &["NAME", "STATUS", "ROLES", "VERSION", "AGE"],
        ResourceKind::Namespaces => &["NAME", "STATUS", "LABELS", "AGE"],
        ResourceKind::Roles => &["NAMESPACE", "NAME", "RULES", "AGE"],
        ResourceKind::RoleBindings => &["NAMESPACE", "NAME", "ROLE", "SUBJECTS", "AGE"],
        ResourceKind::ClusterRoles => &["NAME", "RULES", "AGE"],
        ResourceKind::ClusterRoleBindings => &["NAME", "ROLE", "SUBJECTS", "AGE"],
    };
    columns.iter().map(|column| column.to_string()).collect()
}

/// Builds the unclassified rows of a listing. Objects that fail to decode
/// are logged and left out.
pub fn snapshot(
    kind: ResourceKind,
    objects: &[Arc<DynamicObject>],
    forwarded: &HashSet<String>,
) -> Snapshot {
    objects
        .iter()
        .filter_map(|object| match Resource::decode(kind, object) {
            Ok(resource) => Some((resource.key(), resource.row(forwarded))),
            Err(error) => {
                warn!(
                    kind = kind.title(),
                    name = object.name_any(),
                    "skipping object: {error}"
                );
                None
            }
        })
        .collect()
}

pub fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// TCP ports declared across every container of the pod.
pub fn pod_port_specs(pod: &Pod) -> ContainerPortSpecs {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .flat_map(|container| {
                    ContainerPortSpecs::from_container_ports(
                        &container.name,
                        container.ports.as_deref().unwrap_or_default(),
                    )
                    .0
                })
                .collect()
        })
        .unwrap_or_default()
}

fn pod_row(pod: &Pod, forwarded: bool) -> Row {
    let (ready, total, restarts) = pod.status.as_ref().map(pod_readiness).unwrap_or((0, 0, 0));
    let node = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .unwrap_or_else(|| "-".to_string());

    vec![
        pod.namespace().unwrap_or_default(),
        pod.name_any(),
        if forwarded { "●" } else { "" }.to_string(),
        format!("{ready}/{total}"),
        pod_phase(pod),
        restarts.to_string(),
        node,
        human_age(pod.metadata.creation_timestamp.as_ref()),
    ]
}

fn deployment_row(deployment: &Deployment) -> Row {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let status = deployment.status.as_ref();
    let ready = status.and_then(|status| status.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|status| status.updated_replicas).unwrap_or(0);
    let available = status
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);

    vec![
        deployment.namespace().unwrap_or_default(),
        deployment.name_any(),
        format!("{ready}/{desired}"),
        updated.to_string(),
        available.to_string(),
        human_age(deployment.metadata.creation_timestamp.as_ref()),
    ]
}

fn service_row(service: &Service) -> Row {
    let spec = service.spec.as_ref();
    vec![
        service.namespace().unwrap_or_default(),
        service.name_any(),
        spec.and_then(|spec| spec.type_.clone())
            .unwrap_or_else(|| "ClusterIP".to_string()),
        spec.and_then(|spec| spec.cluster_ip.clone())
            .unwrap_or_else(|| "-".to_string()),
        service_ports_summary(service),
        human_age(service.metadata.creation_timestamp.as_ref()),
    ]
}

fn node_row(node: &Node) -> Row {
    let status = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == "Ready")
        })
        .map(|condition| match condition.status.as_str() {
            "True" => "Ready",
            "False" => "NotReady",
            _ => "Unknown",
        })
        .unwrap_or("Unknown");
    let version = node
        .status
        .as_ref()
        .and_then(|status| status.node_info.as_ref())
        .map(|info| info.kubelet_version.clone())
        .unwrap_or_else(|| "-".to_string());

    vec![
        node.name_any(),
        status.to_string(),
        node_roles(node),
        version,
        human_age(node.metadata.creation_timestamp.as_ref()),
    ]
}

fn namespace_row(namespace: &Namespace) -> Row {
    vec![
        namespace.name_any(),
        namespace
            .status
            .as_ref()
            .and_then(|status| status.phase.clone())
            .unwrap_or_else(|| "Active".to_string()),
        namespace.labels().len().to_string(),
        human_age(namespace.metadata.creation_timestamp.as_ref()),
    ]
}

fn pod_readiness(status: &PodStatus) -> (usize, usize, i32) {
    let container_statuses = status.container_statuses.as_deref().unwrap_or(&[]);
    let total = container_statuses.len();
    let ready = container_statuses
        .iter()
        .filter(|container| container.ready)
        .count();
    let restarts = container_statuses
        .iter()
        .map(|container| container.restart_count)
        .sum();

    (ready, total, restarts)
}

fn node_roles(node: &Node) -> String {
    let Some(labels) = node.metadata.labels.as_ref() else {
        return "-".to_string();
    };

    let mut roles = labels
        .keys()
        .filter_map(|key| key.strip_prefix("node-role.kubernetes.io/"))
        .map(|role| {
            if role.is_empty() {
                "worker".to_string()
            } else {
                role.to_string()
            }
        })
        .collect::<Vec<_>>();

    if roles.is_empty()
        && let Some(role) = labels.get("kubernetes.io/role")
    {
        roles.push(role.clone());
    }

    if roles.is_empty() {
        "-".to_string()
    } else {
        roles.sort();
        roles.dedup();
        roles.join(",")
    }
}

fn service_ports_summary(service: &Service) -> String {
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();
    if ports.is_empty() {
        return "-".to_string();
    }

    ports
        .iter()
        .map(|port| {
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            format!("{}/{}", port.port, protocol)
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }

    let mut out = value
        .chars()
        .take(max.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

pub fn human_age(timestamp: Option<&Time>) -> String {
    let Some(timestamp) = timestamp else {
        return "-".to_string();
    };

    let now = k8s_openapi::jiff::Timestamp::now().as_second();
    format_elapsed_seconds((now - timestamp.0.as_second()).max(0))
}

pub fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}

#[cfg(test)]
mod tests {
    use super::{
        Resource, decode, format_elapsed_seconds, header, pod_port_specs, snapshot, truncate,
    };
    use crate::gvr::Gvr;
    use crate::model::ResourceKind;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::DynamicObject;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pod_object() -> DynamicObject {
        let mut object = DynamicObject::new("p1", &Gvr::pods().api_resource()).within("ns1");
        object.data = json!({
            "spec": {
                "nodeName": "worker-1",
                "containers": [
                    {"name": "c1", "ports": [
                        {"containerPort": 8080, "name": "http"},
                        {"containerPort": 53, "protocol": "UDP"}
                    ]},
                    {"name": "c2", "ports": [{"containerPort": 9090}]}
                ]
            },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "c1", "ready": true, "restartCount": 2, "image": "i", "imageID": ""},
                    {"name": "c2", "ready": false, "restartCount": 1, "image": "i", "imageID": ""}
                ]
            }
        });
        object
    }

    #[test]
    fn dynamic_objects_decode_into_typed_pods() {
        let pod: Pod = decode(&pod_object()).expect("decode pod");
        assert_eq!(pod.metadata.name.as_deref(), Some("p1"));
        assert_eq!(
            pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()),
            Some("worker-1")
        );

        let specs = pod_port_specs(&pod);
        assert_eq!(specs.dump(), "c1::8080(http)\nc2::9090");
    }

    #[test]
    fn pod_rows_follow_header() {
        let resource = Resource::decode(ResourceKind::Pods, &pod_object()).expect("decode");
        assert_eq!(resource.key(), "ns1/p1");

        let forwarded = HashSet::from(["ns1/p1".to_string()]);
        let row = resource.row(&forwarded);
        assert_eq!(row.len(), header(ResourceKind::Pods).len());
        assert_eq!(&row[..7], ["ns1", "p1", "●", "1/2", "Running", "3", "worker-1"]);
        assert_eq!(row[7], "-");
    }

    #[test]
    fn snapshot_skips_undecodable_objects() {
        let mut broken = DynamicObject::new("bad", &Gvr::pods().api_resource()).within("ns1");
        broken.data = json!({"spec": {"containers": "nope"}});
        let objects = vec![Arc::new(pod_object()), Arc::new(broken)];

        let rows = snapshot(ResourceKind::Pods, &objects, &HashSet::new());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["ns1/p1"][2], "");
    }

    #[test]
    fn cluster_kinds_key_by_name() {
        let mut object = DynamicObject::new("worker-1", &Gvr::nodes().api_resource());
        object.data = json!({});
        let resource = Resource::decode(ResourceKind::Nodes, &object).expect("decode");
        assert_eq!(resource.key(), "worker-1");
        assert_eq!(
            resource.row(&HashSet::new()),
            vec!["worker-1", "Unknown", "-", "-", "-"]
        );
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed_seconds(42), "42s");
        assert_eq!(format_elapsed_seconds(120), "2m");
        assert_eq!(format_elapsed_seconds(7_200), "2h");
        assert_eq!(format_elapsed_seconds(172_800), "2d");
        assert_eq!(truncate("cluster-admin", 8), "cluster…");
        assert_eq!(truncate("admin", 8), "admin");
    }
}
