use std::fmt::{Display, Formatter};

use crate::client::{is_all_namespace, is_cluster_scoped};
use crate::gvr::Gvr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Pods,
    Deployments,
    Services,
    Nodes,
    Namespaces,
    Roles,
    RoleBindings,
    ClusterRoles,
    ClusterRoleBindings,
}

impl ResourceKind {
    pub const ALL: [Self; 9] = [
        Self::Pods,
        Self::Deployments,
        Self::Services,
        Self::Nodes,
        Self::Namespaces,
        Self::Roles,
        Self::RoleBindings,
        Self::ClusterRoles,
        Self::ClusterRoleBindings,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Self::Pods => "Pods",
            Self::Deployments => "Deployments",
            Self::Services => "Services",
            Self::Nodes => "Nodes",
            Self::Namespaces => "Namespaces",
            Self::Roles => "Roles",
            Self::RoleBindings => "RoleBindings",
            Self::ClusterRoles => "ClusterRoles",
            Self::ClusterRoleBindings => "ClusterRoleBindings",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "po" | "pod" | "pods" => Some(Self::Pods),
            "deploy" | "deployment" | "deployments" | "dp" => Some(Self::Deployments),
            "svc" | "service" | "services" => Some(Self::Services),
            "no" | "node" | "nodes" => Some(Self::Nodes),
            "ns" | "namespace" | "namespaces" => Some(Self::Namespaces),
            "role" | "roles" => Some(Self::Roles),
            "rb" | "rolebinding" | "rolebindings" | "role-binding" | "role-bindings" => {
                Some(Self::RoleBindings)
            }
            "crole" | "clusterrole" | "clusterroles" | "cluster-role" | "cluster-roles" => {
                Some(Self::ClusterRoles)
            }
            "crb"
            | "clusterrolebinding"
            | "clusterrolebindings"
            | "cluster-role-binding"
            | "cluster-role-bindings" => Some(Self::ClusterRoleBindings),
            _ => None,
        }
    }

    pub fn short_token(self) -> &'static str {
        match self {
            Self::Pods => "po",
            Self::Deployments => "deploy",
            Self::Services => "svc",
            Self::Nodes => "node",
            Self::Namespaces => "ns",
            Self::Roles => "role",
            Self::RoleBindings => "rb",
            Self::ClusterRoles => "crole",
            Self::ClusterRoleBindings => "crb",
        }
    }

    pub fn gvr(self) -> Gvr {
        match self {
            Self::Pods => Gvr::pods(),
            Self::Deployments => Gvr::deployments(),
            Self::Services => Gvr::services(),
            Self::Nodes => Gvr::nodes(),
            Self::Namespaces => Gvr::namespaces(),
            Self::Roles => Gvr::roles(),
            Self::RoleBindings => Gvr::role_bindings(),
            Self::ClusterRoles => Gvr::cluster_roles(),
            Self::ClusterRoleBindings => Gvr::cluster_role_bindings(),
        }
    }
}

/// Scope a table was built for.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum NamespaceScope {
    #[default]
    All,
    Named(String),
    Cluster,
}

impl NamespaceScope {
    /// Scope of a listing of `gvr` requested in `namespace`.
    pub fn resolve(gvr: &Gvr, namespace: &str) -> Self {
        if !gvr.is_namespaced() || is_cluster_scoped(namespace) {
            Self::Cluster
        } else if is_all_namespace(namespace) {
            Self::All
        } else {
            Self::Named(namespace.to_string())
        }
    }

    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl Display for NamespaceScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Named(namespace) => write!(f, "{namespace}"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}
