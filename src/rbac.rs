use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject,
};
use kube::ResourceExt;
use std::fmt::{Display, Formatter};

use crate::client::fqn;
use crate::render::{Row, Snapshot};
use crate::resources::truncate;

pub const ALLOWED: &str = "✓";
pub const DENIED: &str = "✗";
pub const NA: &str = "n/a";

const WILDCARD: &str = "*";
const EXTRAS_WIDTH: usize = 30;

const K8S_VERBS: [&str; 8] = [
    "get",
    "list",
    "deletecollection",
    "watch",
    "create",
    "patch",
    "update",
    "delete",
];

const VERB_COLUMNS: [&str; 9] = [
    "GET", "LIST", "DLIST", "WATCH", "CREATE", "PATCH", "UPDATE", "DELETE", "EXTRAS",
];

/// HTTP verbs that have a Kubernetes spelling.
fn http_to_k8s(verb: &str) -> &str {
    match verb {
        "post" => "create",
        "put" => "update",
        other => other,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

impl SubjectKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "u" | "user" | "users" | "usr" => Some(Self::User),
            "g" | "group" | "groups" | "grp" => Some(Self::Group),
            "s" | "sa" | "sas" | "serviceaccount" | "serviceaccounts" => {
                Some(Self::ServiceAccount)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Group => "Group",
            Self::ServiceAccount => "ServiceAccount",
        }
    }
}

impl Display for SubjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn rules_header() -> Row {
    ["NAME", "GROUP"]
        .into_iter()
        .chain(VERB_COLUMNS)
        .map(str::to_string)
        .collect()
}

pub fn subjects_header() -> Row {
    ["NAME", "KIND", "FIRST LOCATION"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn policy_header() -> Row {
    ["NAMESPACE", "NAME", "API GROUP", "BINDING"]
        .into_iter()
        .chain(VERB_COLUMNS)
        .map(str::to_string)
        .collect()
}

/// True when `verbs` grants `verb`, either directly, through its HTTP
/// alias, or through a lone wildcard.
pub fn has_verb(verbs: &[String], verb: &str) -> bool {
    if let [only] = verbs
        && only == WILDCARD
    {
        return true;
    }
    verbs.iter().any(|candidate| http_to_k8s(candidate) == verb)
}

/// One marker per Kubernetes verb column followed by the unknown verbs.
pub fn as_verbs(verbs: &[String]) -> Row {
    let mut row = K8S_VERBS
        .iter()
        .map(|verb| {
            let marker = if has_verb(verbs, verb) { ALLOWED } else { DENIED };
            marker.to_string()
        })
        .collect::<Row>();

    let extras = verbs
        .iter()
        .map(|verb| http_to_k8s(verb))
        .filter(|verb| *verb != WILDCARD && !K8S_VERBS.contains(verb))
        .collect::<Vec<_>>()
        .join(",");
    row.push(truncate(&extras, EXTRAS_WIDTH));
    row
}

fn to_group(group: &str) -> &str {
    if group.is_empty() { "v1" } else { group }
}

/// Visits every target of `rules` with its key, its API group (`None` for
/// non-resource URLs) and the granted verbs.
fn rule_targets(rules: &[PolicyRule], mut visit: impl FnMut(String, Option<&str>, &[String])) {
    for rule in rules {
        let groups = rule.api_groups.as_deref().unwrap_or_default();
        let resources = rule.resources.as_deref().unwrap_or_default();
        let names = rule.resource_names.as_deref().unwrap_or_default();
        for group in groups {
            for resource in resources {
                let key = if group.is_empty() {
                    resource.clone()
                } else {
                    format!("{resource}.{group}")
                };
                for name in names {
                    visit(format!("{key}/{name}"), Some(group.as_str()), &rule.verbs);
                }
                visit(key, Some(group.as_str()), &rule.verbs);
            }
        }
        for url in rule.non_resource_urls.as_deref().unwrap_or_default() {
            let url = if url.starts_with('/') {
                url.clone()
            } else {
                format!("/{url}")
            };
            visit(url, None, &rule.verbs);
        }
    }
}

/// Expands role rules into one row per resource, resource name and
/// non-resource URL.
pub fn parse_rules(rules: &[PolicyRule]) -> Snapshot {
    let mut rows = Snapshot::new();
    rule_targets(rules, |key, group, verbs| {
        let mut fields = vec![key.clone(), group.map_or(NA, to_group).to_string()];
        fields.extend(as_verbs(verbs));
        rows.insert(key, fields);
    });
    rows
}

/// Policy rows granted to a subject through one binding. `binding` is the
/// `CR:`/`RO:` label of the bound role.
pub fn policy_rules(namespace: &str, binding: &str, rules: &[PolicyRule]) -> Snapshot {
    let mut rows = Snapshot::new();
    rule_targets(rules, |key, group, verbs| {
        let mut fields = vec![
            namespace.to_string(),
            key.clone(),
            group.map_or(NA, to_group).to_string(),
            binding.to_string(),
        ];
        fields.extend(as_verbs(verbs));
        rows.insert(fqn(namespace, &key), fields);
    });
    rows
}

/// Every subject of `kind` with the first binding granting it access.
/// Namespaced bindings take precedence over cluster ones.
pub fn subjects(
    kind: SubjectKind,
    cluster_bindings: &[ClusterRoleBinding],
    bindings: &[RoleBinding],
) -> Snapshot {
    let mut rows = Snapshot::new();
    let located = cluster_bindings
        .iter()
        .map(|binding| (binding.name_any(), "ClusterRoleBinding", binding.subjects.as_deref()))
        .chain(
            bindings
                .iter()
                .map(|binding| (binding.name_any(), "RoleBinding", binding.subjects.as_deref())),
        );
    for (location, binding_kind, binding_subjects) in located {
        for subject in binding_subjects.unwrap_or_default() {
            if subject.kind != kind.as_str() {
                continue;
            }
            rows.insert(
                subject.name.clone(),
                vec![subject.name.clone(), binding_kind.to_string(), location.clone()],
            );
        }
    }
    rows
}

fn binds(subjects: Option<&[Subject]>, kind: SubjectKind, name: &str) -> bool {
    subjects
        .unwrap_or_default()
        .iter()
        .any(|subject| subject.kind == kind.as_str() && subject.name == name)
}

/// Rules granted to one subject, across cluster and namespaced bindings.
/// Returns the rows plus the roles that are referenced but could not be
/// found.
pub fn policies(
    kind: SubjectKind,
    name: &str,
    cluster_bindings: &[ClusterRoleBinding],
    bindings: &[RoleBinding],
    cluster_roles: &[ClusterRole],
    roles: &[Role],
) -> (Snapshot, Vec<String>) {
    let cluster_rules = |role: &str| {
        cluster_roles
            .iter()
            .find(|candidate| candidate.name_any() == role)
            .map(|candidate| candidate.rules.clone().unwrap_or_default())
    };

    let mut rows = Snapshot::new();
    let mut missing = Vec::new();

    for binding in cluster_bindings {
        if !binds(binding.subjects.as_deref(), kind, name) {
            continue;
        }
        let role = &binding.role_ref.name;
        match cluster_rules(role.as_str()) {
            Some(rules) => rows.extend(policy_rules(WILDCARD, &format!("CR:{role}"), &rules)),
            None => missing.push(role.clone()),
        }
    }

    for binding in bindings {
        if !binds(binding.subjects.as_deref(), kind, name) {
            continue;
        }
        let namespace = binding.namespace().unwrap_or_default();
        let role = &binding.role_ref.name;
        let (label, rules) = if binding.role_ref.kind == "ClusterRole" {
            (format!("CR:{role}"), cluster_rules(role.as_str()))
        } else {
            let rules = roles
                .iter()
                .find(|candidate| {
                    candidate.name_any() == *role
                        && candidate.namespace().as_deref() == Some(namespace.as_str())
                })
                .map(|candidate| candidate.rules.clone().unwrap_or_default());
            (format!("RO:{role}"), rules)
        };
        match rules {
            Some(rules) => rows.extend(policy_rules(&namespace, &label, &rules)),
            None => missing.push(fqn(&namespace, role)),
        }
    }

    (rows, missing)
}
