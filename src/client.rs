use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::EngineResult;
use crate::gvr::Gvr;

/// Namespace value selecting every namespace.
pub const ALL_NAMESPACES: &str = "";
/// Alternate spelling of all namespaces used on the command line.
pub const NAMESPACE_ALL: &str = "all";
/// Namespace value used for cluster scoped kinds.
pub const CLUSTER_SCOPE: &str = "-";

pub const LIST_ACCESS: [&str; 2] = ["list", "watch"];
pub const GET_ACCESS: [&str; 1] = ["get"];
pub const CREATE_ACCESS: [&str; 1] = ["create"];

const ACCESS_CACHE_TTL: Duration = Duration::from_secs(60);

pub fn is_all_namespace(namespace: &str) -> bool {
    namespace == ALL_NAMESPACES || namespace == NAMESPACE_ALL
}

pub fn is_cluster_scoped(namespace: &str) -> bool {
    namespace == CLUSTER_SCOPE
}

pub fn is_cluster_wide(namespace: &str) -> bool {
    is_all_namespace(namespace) || is_cluster_scoped(namespace)
}

/// Splits `namespace/name` into its parts. Bare names have no namespace.
pub fn namespaced(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

pub fn fqn(namespace: &str, name: &str) -> String {
    if namespace.is_empty() || is_cluster_scoped(namespace) {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Everything the engine needs from a cluster connection. Components take
/// this as an injected value rather than reaching for a shared handle.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Client used for typed calls.
    fn dial(&self) -> EngineResult<Client>;

    /// Client used for dynamic (schema-less) calls.
    fn dyn_dial(&self) -> EngineResult<Client> {
        self.dial()
    }

    /// Live access check for every verb against `gvr` in `namespace`.
    async fn can_i(&self, namespace: &str, gvr: &Gvr, verbs: &[&str]) -> EngineResult<bool>;

    fn context(&self) -> &str;

    fn cluster(&self) -> &str;

    fn user(&self) -> &str;

    fn default_namespace(&self) -> &str;

    /// Drops every cached access decision, for instance after RBAC edits.
    fn reset_access(&self) {}
}

#[derive(Debug, Default)]
struct AccessCache {
    entries: Mutex<HashMap<String, (bool, Instant)>>,
}

impl AccessCache {
    fn lookup(&self, key: &str, ttl: Duration) -> Option<bool> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(_, stamped)| stamped.elapsed() < ttl)
            .map(|(allowed, _)| *allowed)
    }

    fn store(&self, key: String, allowed: bool) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, (allowed, Instant::now()));
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

fn access_key(namespace: &str, gvr: &Gvr, verbs: &[&str]) -> String {
    format!("{namespace}:{gvr}:{}", verbs.join(","))
}

/// Kubeconfig backed connection.
pub struct KubeConnection {
    client: Client,
    context: String,
    cluster: String,
    user: String,
    default_namespace: String,
    access: AccessCache,
}

impl KubeConnection {
    pub async fn new(context: Option<String>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().ok();

        let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
            let options = KubeConfigOptions {
                context: context.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig_value, &options)
                .await
                .context("failed to infer Kubernetes configuration")?
        } else {
            if context.is_some() {
                anyhow::bail!("kubeconfig not found; context selection is unavailable");
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let cluster = config.cluster_url.to_string();
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

        let active_context = context
            .or_else(|| {
                kubeconfig
                    .as_ref()
                    .and_then(|cfg| cfg.current_context.clone())
            })
            .unwrap_or_else(|| "in-cluster".to_string());
        let user = kubeconfig
            .as_ref()
            .and_then(|cfg| {
                cfg.contexts
                    .iter()
                    .find(|named| named.name == active_context)
                    .and_then(|named| named.context.as_ref())
                    .and_then(|ctx| ctx.user.clone())
            })
            .unwrap_or_else(|| "-".to_string());

        Ok(Self {
            client,
            context: active_context,
            cluster,
            user,
            default_namespace,
            access: AccessCache::default(),
        })
    }
}

#[async_trait]
impl Connection for KubeConnection {
    fn dial(&self) -> EngineResult<Client> {
        Ok(self.client.clone())
    }

    fn reset_access(&self) {
        self.access.clear();
    }

    async fn can_i(&self, namespace: &str, gvr: &Gvr, verbs: &[&str]) -> EngineResult<bool> {
        let key = access_key(namespace, gvr, verbs);
        if let Some(allowed) = self.access.lookup(&key, ACCESS_CACHE_TTL) {
            return Ok(allowed);
        }

        let reviews: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let scope = (!is_cluster_wide(namespace)).then(|| namespace.to_string());
        for verb in verbs {
            let review = SelfSubjectAccessReview {
                spec: SelfSubjectAccessReviewSpec {
                    resource_attributes: Some(ResourceAttributes {
                        namespace: scope.clone(),
                        group: Some(gvr.group().to_string()),
                        version: Some(gvr.version().to_string()),
                        resource: Some(gvr.resource().to_string()),
                        subresource: gvr.subresource().map(str::to_string),
                        verb: Some(verb.to_string()),
                        ..ResourceAttributes::default()
                    }),
                    ..SelfSubjectAccessReviewSpec::default()
                },
                ..SelfSubjectAccessReview::default()
            };
            let response = reviews.create(&PostParams::default(), &review).await?;
            let allowed = response.status.is_some_and(|status| status.allowed);
            if !allowed {
                debug!(namespace, gvr = %gvr, verb = *verb, "access check denied");
                self.access.store(key, false);
                return Ok(false);
            }
        }

        self.access.store(key, true);
        Ok(true)
    }

    fn context(&self) -> &str {
        &self.context
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn default_namespace(&self) -> &str {
        &self.default_namespace
    }
}
