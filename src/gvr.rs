use kube::core::{ApiResource, Expression, SelectorExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use crate::error::{EngineError, EngineResult};

const CLUSTER_SCOPED_RESOURCES: [&str; 10] = [
    "nodes",
    "namespaces",
    "persistentvolumes",
    "storageclasses",
    "ingressclasses",
    "clusterroles",
    "clusterrolebindings",
    "customresourcedefinitions",
    "apiservices",
    "priorityclasses",
];

/// Group/Version/Resource triple, optionally carrying a sub-resource.
///
/// Encoded as `group/version/resource[:subresource]`; the group is elided for
/// the core API group, so pods are `v1/pods`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Gvr {
    group: String,
    version: String,
    resource: String,
    subresource: Option<String>,
}

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            subresource: None,
        }
    }

    /// Parses the string encoding. Anything with fewer than two segments is
    /// kept as a bare resource and will not resolve to a watch.
    #[cfg(test)]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (body, subresource) = match raw.split_once(':') {
            Some((body, sub)) if !sub.is_empty() => (body, Some(sub.to_string())),
            Some((body, _)) => (body, None),
            None => (raw, None),
        };
        let tokens = body.split('/').collect::<Vec<_>>();
        let (group, version, resource) = match tokens.as_slice() {
            [group, version, resource] => (*group, *version, *resource),
            [version, resource] => ("", *version, *resource),
            [resource] => ("", "", *resource),
            _ => ("", "", body),
        };

        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            subresource,
        }
    }

    pub fn with_subresource(&self, subresource: &str) -> Self {
        Self {
            subresource: Some(subresource.to_string()),
            ..self.clone()
        }
    }

    pub fn pods() -> Self {
        Self::new("", "v1", "pods")
    }

    pub fn services() -> Self {
        Self::new("", "v1", "services")
    }

    pub fn nodes() -> Self {
        Self::new("", "v1", "nodes")
    }

    pub fn namespaces() -> Self {
        Self::new("", "v1", "namespaces")
    }

    pub fn deployments() -> Self {
        Self::new("apps", "v1", "deployments")
    }

    pub fn cluster_roles() -> Self {
        Self::new("rbac.authorization.k8s.io", "v1", "clusterroles")
    }

    pub fn roles() -> Self {
        Self::new("rbac.authorization.k8s.io", "v1", "roles")
    }

    pub fn cluster_role_bindings() -> Self {
        Self::new("rbac.authorization.k8s.io", "v1", "clusterrolebindings")
    }

    pub fn role_bindings() -> Self {
        Self::new("rbac.authorization.k8s.io", "v1", "rolebindings")
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn subresource(&self) -> Option<&str> {
        self.subresource.as_deref()
    }

    /// True when the triple can be listed and watched against an API server.
    pub fn is_k8s_res(&self) -> bool {
        !self.version.is_empty() && !self.resource.is_empty() && !self.resource.contains(' ')
    }

    pub fn is_namespaced(&self) -> bool {
        !CLUSTER_SCOPED_RESOURCES.contains(&self.resource.as_str())
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Dynamic type used by the dynamic client. The kind is not needed to
    /// list or watch, only the plural.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: String::new(),
            plural: self.resource.clone(),
        }
    }
}

impl Display for Gvr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if !self.group.is_empty() {
            write!(f, "{}/", self.group)?;
        }
        if !self.version.is_empty() {
            write!(f, "{}/", self.version)?;
        }
        write!(f, "{}", self.resource)?;
        if let Some(sub) = &self.subresource {
            write!(f, ":{sub}")?;
        }
        Ok(())
    }
}

/// Label selector in its textual form: `app=web,tier!=db`, `env in (dev,qa)`,
/// `canary`, `!legacy`. Matching is kube's own.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Selector(kube::core::Selector);

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        split_terms(raw)
            .into_iter()
            .map(|term| {
                expression(term).ok_or_else(|| EngineError::InvalidSelector(raw.to_string()))
            })
            .collect::<EngineResult<Vec<_>>>()
            .map(|expressions| Self(expressions.into_iter().collect()))
    }

    pub fn is_everything(&self) -> bool {
        self.0.selects_all()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(labels) => self.0.matches(labels),
            None => self.0.matches(&BTreeMap::new()),
        }
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Splits on commas that sit outside a `( ... )` value set.
fn split_terms(raw: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&raw[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    terms.push(&raw[start..]);
    terms
        .into_iter()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .collect()
}

fn expression(term: &str) -> Option<Expression> {
    if let Some((head, values)) = term
        .strip_suffix(')')
        .and_then(|rest| rest.split_once('('))
    {
        let mut words = head.split_whitespace();
        let (Some(key), Some(operator), None) = (words.next(), words.next(), words.next()) else {
            return None;
        };
        let key = label_key(key)?;
        let values = values
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        if values.is_empty() {
            return None;
        }
        return match operator {
            "in" => Some(Expression::In(key, values)),
            "notin" => Some(Expression::NotIn(key, values)),
            _ => None,
        };
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Some(Expression::NotEqual(label_key(key)?, value.trim().to_string()));
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Some(Expression::Equal(label_key(key)?, value.trim().to_string()));
    }
    if let Some(key) = term.strip_prefix('!') {
        return Some(Expression::DoesNotExist(label_key(key)?));
    }
    Some(Expression::Exists(label_key(term)?))
}

fn label_key(raw: &str) -> Option<String> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && !key.contains(char::is_whitespace)
        && !key.contains(['(', ')', '=', '!', ',']);
    valid.then(|| key.to_string())
}
