/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/clients.rs
*
* Client factory and the live-cluster status reader.
*
* `build_clients` turns a resolved credential context into two handles over
* one shared `kube::Client`: an `ApiClient` for typed object reads and a
* `DiscoveryClient` that maps the kinds users write in `watch_resources`
* ("deployment", "deploy", "Deployment", "deployments.apps") onto API
* resources.
*
* Built-in kinds resolve from a static table without touching the server.
* Anything else is looked up group by group: only the named group for the
* `plural.group` form, every served group otherwise. A group that fails
* discovery (an unavailable aggregated API, say) is skipped, and every group
* that answered is cached so an interrupted lookup resumes where it stopped.
*
* `LiveCluster` combines both into the `StatusReader` the poller and the
* version generator consume; `KubeConnector` is the orchestrator's way in.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::ResourceReference;
use crate::credentials::ResolvedClientContext;
use crate::error::{Error, Result};
use crate::poller::StatusReader;
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    autoscaling::v2::HorizontalPodAutoscaler,
    batch::v1::{CronJob, Job},
    core::v1::{
        ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
    },
    networking::v1::Ingress,
    policy::v1::PodDisruptionBudget,
};
use kube::api::{Api, DynamicObject, ListParams, TypeMeta};
use kube::config::KubeConfigOptions;
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource, Scope};
use kube::{Client, Config, Resource};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// kubectl's short names for the built-in kinds.
const SHORT_NAMES: &[(&str, &str)] = &[
    ("cm", "configmap"),
    ("cj", "cronjob"),
    ("deploy", "deployment"),
    ("ds", "daemonset"),
    ("hpa", "horizontalpodautoscaler"),
    ("ing", "ingress"),
    ("ns", "namespace"),
    ("pdb", "poddisruptionbudget"),
    ("po", "pod"),
    ("pvc", "persistentvolumeclaim"),
    ("rs", "replicaset"),
    ("sa", "serviceaccount"),
    ("sts", "statefulset"),
    ("svc", "service"),
];

/// Groups preferred when a kind exists in more than one of them.
const PREFERRED_GROUPS: &[&str] = &["", "apps", "batch"];

/// Typed read access to the cluster.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
}

impl ApiClient {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// Fetches one named object, or lists every object of the kind.
    /// A named object that does not exist yields an empty list.
    pub async fn get_objects(
        &self,
        kind: &DiscoveredKind,
        namespace: &str,
        name: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = if kind.namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &kind.resource)
        } else {
            Api::all_with(self.client.clone(), &kind.resource)
        };

        let mut objects = match name {
            Some(name) => api.get_opt(name).await?.into_iter().collect::<Vec<_>>(),
            None => api.list(&ListParams::default()).await?.items,
        };
        // List items come back without apiVersion/kind.
        for object in &mut objects {
            object.types = Some(TypeMeta {
                api_version: kind.resource.api_version.clone(),
                kind: kind.resource.kind.clone(),
            });
        }
        Ok(objects)
    }
}

/// An API resource located through discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl DiscoveredKind {
    fn of<K: Resource<DynamicType = ()>>(namespaced: bool) -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespaced,
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.resource.kind.to_lowercase() == name || self.resource.plural == name
    }
}

/// The built-in kind called `name` (lowercase kind or plural), if any.
fn builtin_kind(name: &str) -> Option<DiscoveredKind> {
    let kind = match name {
        "deployment" | "deployments" => DiscoveredKind::of::<Deployment>(true),
        "statefulset" | "statefulsets" => DiscoveredKind::of::<StatefulSet>(true),
        "daemonset" | "daemonsets" => DiscoveredKind::of::<DaemonSet>(true),
        "replicaset" | "replicasets" => DiscoveredKind::of::<ReplicaSet>(true),
        "pod" | "pods" => DiscoveredKind::of::<Pod>(true),
        "service" | "services" => DiscoveredKind::of::<Service>(true),
        "configmap" | "configmaps" => DiscoveredKind::of::<ConfigMap>(true),
        "secret" | "secrets" => DiscoveredKind::of::<Secret>(true),
        "serviceaccount" | "serviceaccounts" => DiscoveredKind::of::<ServiceAccount>(true),
        "persistentvolumeclaim" | "persistentvolumeclaims" => {
            DiscoveredKind::of::<PersistentVolumeClaim>(true)
        }
        "namespace" | "namespaces" => DiscoveredKind::of::<Namespace>(false),
        "job" | "jobs" => DiscoveredKind::of::<Job>(true),
        "cronjob" | "cronjobs" => DiscoveredKind::of::<CronJob>(true),
        "ingress" | "ingresses" => DiscoveredKind::of::<Ingress>(true),
        "horizontalpodautoscaler" | "horizontalpodautoscalers" => {
            DiscoveredKind::of::<HorizontalPodAutoscaler>(true)
        }
        "poddisruptionbudget" | "poddisruptionbudgets" => {
            DiscoveredKind::of::<PodDisruptionBudget>(true)
        }
        _ => return None,
    };
    Some(kind)
}

/// Maps user-written kinds onto API resources.
pub struct DiscoveryClient {
    client: Client,
    group_names: OnceCell<Vec<String>>,
    groups: Mutex<HashMap<String, Vec<DiscoveredKind>>>,
}

impl DiscoveryClient {
    fn new(client: Client) -> Self {
        Self {
            client,
            group_names: OnceCell::new(),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Every group the server serves, core ("") first.
    async fn group_names(&self) -> Result<&[String]> {
        let names = self
            .group_names
            .get_or_try_init(|| async {
                debug!("Listing API groups");
                let list = self
                    .client
                    .list_api_groups()
                    .await
                    .map_err(|e| Error::Connection(format!("cannot list API groups: {}", e)))?;
                let mut names = vec![String::new()];
                names.extend(list.groups.into_iter().map(|g| g.name));
                Ok::<_, Error>(names)
            })
            .await?;
        Ok(names)
    }

    /// The recommended resources of one group, fetched once.
    async fn group_kinds(&self, group: &str) -> Result<Vec<DiscoveredKind>> {
        let cached = self.cached_groups().get(group).cloned();
        if let Some(kinds) = cached {
            return Ok(kinds);
        }
        debug!(group, "Discovering API group");
        let api_group = discovery::group(&self.client, group)
            .await
            .map_err(|e| Error::Connection(format!("discovery of group '{}' failed: {}", group, e)))?;
        let kinds: Vec<DiscoveredKind> = api_group
            .recommended_resources()
            .into_iter()
            .map(|(resource, caps)| DiscoveredKind {
                resource,
                namespaced: caps.scope == Scope::Namespaced,
            })
            .collect();
        self.cached_groups().insert(group.to_string(), kinds.clone());
        Ok(kinds)
    }

    fn cached_groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<DiscoveredKind>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the reference's kind. An `api_version` on the reference pins
    /// the group/version; otherwise kind names, plurals, short names and the
    /// `plural.group` form are all accepted.
    pub async fn resolve(&self, reference: &ResourceReference) -> Result<DiscoveredKind> {
        if let Some(api_version) = reference.api_version.as_deref() {
            return self.resolve_pinned(api_version, &reference.kind).await;
        }

        let needle = reference.kind.to_lowercase();
        let (name, group) = match needle.split_once('.') {
            Some((name, group)) => (name, Some(group)),
            None => (needle.as_str(), None),
        };
        let name = SHORT_NAMES
            .iter()
            .find(|(short, _)| *short == name)
            .map(|(_, full)| *full)
            .unwrap_or(name);

        if let Some(kind) = builtin_kind(name) {
            if group.map_or(true, |g| g == kind.resource.group) {
                return Ok(kind);
            }
        }

        let mut candidates: Vec<DiscoveredKind> = match group {
            Some(group) => self.group_kinds(group).await?,
            None => {
                let names = self.group_names().await?;
                let results = join_all(names.iter().map(|g| self.group_kinds(g))).await;
                names
                    .iter()
                    .zip(results)
                    .filter_map(|(group, result)| match result {
                        Ok(kinds) => Some(kinds),
                        Err(e) => {
                            warn!(group = %group, error = %e, "Skipping API group");
                            None
                        }
                    })
                    .flatten()
                    .collect()
            }
        };
        candidates.retain(|k| k.matches(name));

        candidates.sort_by_key(|k| {
            PREFERRED_GROUPS
                .iter()
                .position(|g| *g == k.resource.group)
                .unwrap_or(PREFERRED_GROUPS.len())
        });
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::Connection(format!("unknown resource kind '{}'", reference.kind)))
    }

    async fn resolve_pinned(&self, api_version: &str, kind: &str) -> Result<DiscoveredKind> {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| Error::Connection(format!("cannot resolve {}/{}: {}", api_version, kind, e)))?;
        Ok(DiscoveredKind {
            resource,
            namespaced: caps.scope == Scope::Namespaced,
        })
    }
}

/// Builds the API and discovery clients for a resolved context. Nothing is
/// sent to the server here; connection problems surface on first use.
pub async fn build_clients(context: &ResolvedClientContext) -> Result<(ApiClient, DiscoveryClient)> {
    let mut config = match context.in_cluster_config() {
        Some(config) => config.clone(),
        None => Config::from_custom_kubeconfig(context.raw_config().clone(), &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Connection(format!("invalid REST configuration: {}", e)))?,
    };
    config.default_namespace = context.namespace().to_string();
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);

    info!(
        cluster = %config.cluster_url,
        namespace = %config.default_namespace,
        "Building Kubernetes clients"
    );
    let client = Client::try_from(config)
        .map_err(|e| Error::Connection(format!("failed to create client: {}", e)))?;

    Ok((
        ApiClient {
            client: client.clone(),
        },
        DiscoveryClient::new(client),
    ))
}

/// The `StatusReader` backed by a real API server.
pub struct LiveCluster {
    api: ApiClient,
    discovery: DiscoveryClient,
}

impl LiveCluster {
    pub fn new(api: ApiClient, discovery: DiscoveryClient) -> Self {
        Self { api, discovery }
    }
}

#[async_trait]
impl StatusReader for LiveCluster {
    async fn fetch(
        &self,
        namespace: &str,
        reference: &ResourceReference,
    ) -> Result<Vec<DynamicObject>> {
        let kind = self.discovery.resolve(reference).await?;
        self.api
            .get_objects(&kind, namespace, reference.name.as_deref())
            .await
    }
}

/// Turns a resolved context into something that can read cluster state.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, context: &ResolvedClientContext) -> Result<Box<dyn StatusReader>>;
}

/// Connects through `build_clients`.
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, context: &ResolvedClientContext) -> Result<Box<dyn StatusReader>> {
        let (api, discovery) = build_clients(context).await?;
        Ok(Box::new(LiveCluster::new(api, discovery)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Source;
    use crate::credentials::{self, tests::URL};

    fn token_source() -> Source {
        Source {
            api_server_url: Some(URL.to_string()),
            client_token: Some("token".to_string()),
            namespace: "test".to_string(),
            insecure_skip_tls_verify: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_clients_from_token_context() {
        let context = credentials::resolve(&token_source()).unwrap();
        let (api, _discovery) = build_clients(&context).await.unwrap();
        assert_eq!(api.default_namespace(), "test");
    }

    /// The shared kubeconfig fixture with its client certificate swapped for
    /// a bearer token.
    fn token_kubeconfig() -> String {
        let document = credentials::tests::kubeconfig_document();
        let user = document.find("      client-certificate-data:").unwrap();
        format!("{}      token: token\n", &document[..user])
    }

    #[tokio::test]
    async fn test_build_clients_from_kubeconfig_context() {
        let source = Source {
            kubeconfig: Some(token_kubeconfig()),
            ..Default::default()
        };
        let context = credentials::resolve(&source).unwrap();
        let (api, _discovery) = build_clients(&context).await.unwrap();
        assert_eq!(api.default_namespace(), "test");
    }

    #[tokio::test]
    async fn test_build_clients_rejects_unusable_client_certificate() {
        // The fixture certificate is X.509 v1, which the TLS stack refuses.
        let source = Source {
            kubeconfig: Some(credentials::tests::kubeconfig_document()),
            ..Default::default()
        };
        let context = credentials::resolve(&source).unwrap();
        let err = build_clients(&context).await.err().unwrap();
        assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_builtin_kinds_resolve_without_the_server() {
        // Nothing listens on the test URL, so any request would fail.
        let context = credentials::resolve(&token_source()).unwrap();
        let (_api, discovery) = build_clients(&context).await.unwrap();

        let deploy = discovery.resolve(&ResourceReference::kind_only("deploy")).await.unwrap();
        assert_eq!(deploy.resource.api_version, "apps/v1");
        assert_eq!(deploy.resource.kind, "Deployment");
        assert_eq!(deploy.resource.plural, "deployments");
        assert!(deploy.namespaced);

        let job = discovery.resolve(&ResourceReference::new("jobs.batch", "migrate")).await.unwrap();
        assert_eq!(job.resource.api_version, "batch/v1");

        let pod = discovery.resolve(&ResourceReference::kind_only("Pod")).await.unwrap();
        assert_eq!(pod.resource.api_version, "v1");
        assert_eq!(pod.resource.group, "");

        let namespace = discovery.resolve(&ResourceReference::kind_only("ns")).await.unwrap();
        assert!(!namespace.namespaced);
    }

    #[test]
    fn test_every_short_name_expands_to_a_builtin_kind() {
        for (short, full) in SHORT_NAMES {
            assert!(builtin_kind(full).is_some(), "{} -> {}", short, full);
        }
    }

    #[tokio::test]
    async fn test_build_clients_rejects_unusable_server_url() {
        let source = Source {
            api_server_url: Some("not a url".to_string()),
            ..token_source()
        };
        let context = credentials::resolve(&source).unwrap();
        let err = build_clients(&context).await.err().unwrap();
        assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    }

    #[test]
    fn test_short_names_are_unique() {
        let mut shorts: Vec<_> = SHORT_NAMES.iter().map(|(s, _)| *s).collect();
        shorts.sort_unstable();
        shorts.dedup();
        assert_eq!(shorts.len(), SHORT_NAMES.len());
    }
}
