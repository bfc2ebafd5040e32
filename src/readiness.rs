/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/readiness.rs
*
* Kind-specific readiness rules. The poller hands every live object it finds
* to `classify`, which parses the well-known workload kinds into their typed
* k8s-openapi structs and inspects `.status`:
*
* - Deployment: the controller has observed the latest generation and the
*   updated, ready and available replica counts all reach the desired count.
*   A `Progressing=False` condition with `ProgressDeadlineExceeded` fails.
* - StatefulSet / DaemonSet / ReplicaSet: the same idea with their own fields.
* - Pod: the `Ready` condition is true (or the pod `Succeeded`); phase
*   `Failed` fails.
* - Job: `Complete` is ready; `Failed` fails.
*
* Kinds are matched on group and kind, so a custom resource that happens to
* be called `Job` or `Deployment` is not read as the built-in type. Any other
* kind has no generic readiness signal and counts as ready as soon as it
* exists.
*
* SPDX-License-Identifier: Apache-2.0 */

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    batch::v1::Job,
    core::v1::Pod,
};
use kube::api::{DynamicObject, TypeMeta};
use serde::de::DeserializeOwned;

/// The state of a single watched object, or of a whole reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending(String),
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Classifies a live object according to its group and kind.
pub fn classify(object: &DynamicObject) -> Readiness {
    let (group, kind) = group_kind(object);
    let result = match (group, kind) {
        ("apps", "Deployment") => parse_as::<Deployment>(object).map(|d| deployment_readiness(&d)),
        ("apps", "StatefulSet") => parse_as::<StatefulSet>(object).map(|s| stateful_set_readiness(&s)),
        ("apps", "DaemonSet") => parse_as::<DaemonSet>(object).map(|d| daemon_set_readiness(&d)),
        ("apps", "ReplicaSet") => parse_as::<ReplicaSet>(object).map(|r| replica_set_readiness(&r)),
        ("", "Pod") => parse_as::<Pod>(object).map(|p| pod_readiness(&p)),
        ("batch", "Job") => parse_as::<Job>(object).map(|j| job_readiness(&j)),
        _ => Ok(Readiness::Ready),
    };
    result.unwrap_or_else(|e| Readiness::Pending(format!("malformed status: {}", e)))
}

/// Whether a pod matched by a kind-only reference is debris from an earlier
/// rollout rather than part of the current one: a terminated pod that was
/// evicted or that belongs to a controller (a Job's failed attempt, an old
/// ReplicaSet's crashed pod).
pub fn is_leftover(object: &DynamicObject) -> bool {
    if group_kind(object) != ("", "Pod") {
        return false;
    }
    let status = &object.data["status"];
    let terminated = matches!(status["phase"].as_str(), Some("Failed") | Some("Succeeded"));
    let evicted = status["reason"].as_str() == Some("Evicted");
    let controlled = object
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true));
    terminated && (evicted || controlled)
}

/// The API group (empty for the core group) and kind from the type meta.
fn group_kind(object: &DynamicObject) -> (&str, &str) {
    let Some(types) = object.types.as_ref() else {
        return ("", "");
    };
    let group = types
        .api_version
        .split_once('/')
        .map_or("", |(group, _)| group);
    (group, types.kind.as_str())
}

/// Re-reads a dynamic object as a typed one. The type meta is forced to the
/// target's so that list items (which carry no apiVersion/kind) parse too.
fn parse_as<K>(object: &DynamicObject) -> Result<K, serde_json::Error>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    let mut object = object.clone();
    object.types = Some(TypeMeta {
        api_version: K::API_VERSION.to_string(),
        kind: K::KIND.to_string(),
    });
    serde_json::from_value(serde_json::to_value(&object)?)
}

/// `Some(reason)` when the controller has not yet observed the latest generation.
fn generation_lag(generation: Option<i64>, observed: Option<i64>) -> Option<String> {
    let generation = generation.unwrap_or(0);
    let observed = observed.unwrap_or(0);
    if observed < generation {
        Some(format!(
            "waiting for generation {} to be observed (observed {})",
            generation, observed
        ))
    } else {
        None
    }
}

fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let Some(status) = deployment.status.as_ref() else {
        return Readiness::Pending("no status reported yet".to_string());
    };

    let deadline_exceeded = status.conditions.iter().flatten().find(|c| {
        c.type_ == "Progressing"
            && c.status == "False"
            && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if let Some(condition) = deadline_exceeded {
        return Readiness::Failed(
            condition
                .message
                .clone()
                .unwrap_or_else(|| "progress deadline exceeded".to_string()),
        );
    }

    if let Some(reason) = generation_lag(deployment.metadata.generation, status.observed_generation) {
        return Readiness::Pending(reason);
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let total = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        Readiness::Pending(format!("{}/{} replicas updated", updated, desired))
    } else if total > updated {
        Readiness::Pending(format!(
            "{} old replicas pending termination",
            total - updated
        ))
    } else if ready < desired {
        Readiness::Pending(format!("{}/{} replicas ready", ready, desired))
    } else if available < desired {
        Readiness::Pending(format!("{}/{} replicas available", available, desired))
    } else {
        Readiness::Ready
    }
}

fn stateful_set_readiness(set: &StatefulSet) -> Readiness {
    let Some(status) = set.status.as_ref() else {
        return Readiness::Pending("no status reported yet".to_string());
    };
    if let Some(reason) = generation_lag(set.metadata.generation, status.observed_generation) {
        return Readiness::Pending(reason);
    }

    let spec = set.spec.as_ref();
    let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
    let on_delete = spec
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.type_.as_deref())
        == Some("OnDelete");
    let ready = status.ready_replicas.unwrap_or(0);

    if ready < desired {
        return Readiness::Pending(format!("{}/{} replicas ready", ready, desired));
    }
    if on_delete {
        return Readiness::Ready;
    }
    if let Some(updated) = status.updated_replicas {
        if updated < desired {
            return Readiness::Pending(format!("{}/{} replicas updated", updated, desired));
        }
    }
    match (&status.current_revision, &status.update_revision) {
        (Some(current), Some(update)) if current != update => Readiness::Pending(format!(
            "rolling out revision {} (current {})",
            update, current
        )),
        _ => Readiness::Ready,
    }
}

fn daemon_set_readiness(set: &DaemonSet) -> Readiness {
    let Some(status) = set.status.as_ref() else {
        return Readiness::Pending("no status reported yet".to_string());
    };
    if let Some(reason) = generation_lag(set.metadata.generation, status.observed_generation) {
        return Readiness::Pending(reason);
    }

    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    let available = status.number_available.unwrap_or(0);

    if updated < desired {
        Readiness::Pending(format!("{}/{} pods updated", updated, desired))
    } else if status.number_ready < desired {
        Readiness::Pending(format!("{}/{} pods ready", status.number_ready, desired))
    } else if available < desired {
        Readiness::Pending(format!("{}/{} pods available", available, desired))
    } else {
        Readiness::Ready
    }
}

fn replica_set_readiness(set: &ReplicaSet) -> Readiness {
    let Some(status) = set.status.as_ref() else {
        return Readiness::Pending("no status reported yet".to_string());
    };
    if let Some(reason) = generation_lag(set.metadata.generation, status.observed_generation) {
        return Readiness::Pending(reason);
    }

    let desired = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.ready_replicas.unwrap_or(0);
    if ready < desired {
        Readiness::Pending(format!("{}/{} replicas ready", ready, desired))
    } else {
        Readiness::Ready
    }
}

fn pod_readiness(pod: &Pod) -> Readiness {
    let Some(status) = pod.status.as_ref() else {
        return Readiness::Pending("no status reported yet".to_string());
    };
    let phase = status.phase.as_deref().unwrap_or("Unknown");
    match phase {
        "Succeeded" => return Readiness::Ready,
        "Failed" => {
            return Readiness::Failed(
                status
                    .message
                    .clone()
                    .or_else(|| status.reason.clone())
                    .unwrap_or_else(|| "pod phase is Failed".to_string()),
            )
        }
        _ => {}
    }

    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if ready {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("pod is {} and not ready", phase))
    }
}

fn job_readiness(job: &Job) -> Readiness {
    let Some(status) = job.status.as_ref() else {
        return Readiness::Pending("no status reported yet".to_string());
    };
    let condition = |type_: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == type_ && c.status == "True")
    };

    if let Some(failed) = condition("Failed") {
        return Readiness::Failed(
            failed
                .message
                .clone()
                .or_else(|| failed.reason.clone())
                .unwrap_or_else(|| "job failed".to_string()),
        );
    }
    if condition("Complete").is_some() {
        return Readiness::Ready;
    }
    Readiness::Pending(format!(
        "{} succeeded, {} active",
        status.succeeded.unwrap_or(0),
        status.active.unwrap_or(0)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn object(api_version: &str, kind: &str, body: Value) -> DynamicObject {
        let mut value = json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": "web", "namespace": "test", "generation": 2 },
        });
        if let (Some(target), Some(extra)) = (value.as_object_mut(), body.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(value).unwrap()
    }

    fn deployment(status: Value) -> DynamicObject {
        object(
            "apps/v1",
            "Deployment",
            json!({
                "spec": {
                    "replicas": 2,
                    "selector": { "matchLabels": { "app": "web" } },
                    "template": { "spec": { "containers": [{ "name": "web", "image": "nginx:1.25" }] } }
                },
                "status": status,
            }),
        )
    }

    #[test]
    fn test_deployment_ready() {
        let obj = deployment(json!({
            "observedGeneration": 2,
            "replicas": 2,
            "updatedReplicas": 2,
            "readyReplicas": 2,
            "availableReplicas": 2
        }));
        assert_eq!(classify(&obj), Readiness::Ready);
    }

    #[test]
    fn test_deployment_waits_for_generation_and_replicas() {
        let stale = deployment(json!({
            "observedGeneration": 1,
            "replicas": 2, "updatedReplicas": 2, "readyReplicas": 2, "availableReplicas": 2
        }));
        assert!(matches!(classify(&stale), Readiness::Pending(r) if r.contains("generation 2")));

        let rolling = deployment(json!({
            "observedGeneration": 2,
            "replicas": 3, "updatedReplicas": 2, "readyReplicas": 2, "availableReplicas": 2
        }));
        assert!(matches!(classify(&rolling), Readiness::Pending(r) if r.contains("old replicas")));

        let unready = deployment(json!({
            "observedGeneration": 2,
            "replicas": 2, "updatedReplicas": 2, "readyReplicas": 1
        }));
        assert_eq!(
            classify(&unready),
            Readiness::Pending("1/2 replicas ready".to_string())
        );
    }

    #[test]
    fn test_deployment_progress_deadline_fails() {
        let obj = deployment(json!({
            "observedGeneration": 2,
            "replicas": 2,
            "conditions": [{
                "type": "Progressing",
                "status": "False",
                "reason": "ProgressDeadlineExceeded",
                "message": "ReplicaSet \"web-7d9\" has timed out progressing."
            }]
        }));
        assert!(matches!(classify(&obj), Readiness::Failed(m) if m.contains("timed out")));
    }

    #[test]
    fn test_deployment_without_status_is_pending() {
        let obj = object(
            "apps/v1",
            "Deployment",
            json!({ "spec": { "selector": {}, "template": {} } }),
        );
        assert!(matches!(classify(&obj), Readiness::Pending(_)));
    }

    #[test]
    fn test_stateful_set_revision_rollout() {
        let spec = json!({
            "replicas": 1,
            "serviceName": "db",
            "selector": { "matchLabels": { "app": "db" } },
            "template": {}
        });
        let rolling = object(
            "apps/v1",
            "StatefulSet",
            json!({
                "spec": spec.clone(),
                "status": {
                    "observedGeneration": 2, "replicas": 1, "readyReplicas": 1, "updatedReplicas": 1,
                    "currentRevision": "db-1", "updateRevision": "db-2"
                }
            }),
        );
        assert!(matches!(classify(&rolling), Readiness::Pending(r) if r.contains("db-2")));

        let done = object(
            "apps/v1",
            "StatefulSet",
            json!({
                "spec": spec,
                "status": {
                    "observedGeneration": 2, "replicas": 1, "readyReplicas": 1, "updatedReplicas": 1,
                    "currentRevision": "db-2", "updateRevision": "db-2"
                }
            }),
        );
        assert_eq!(classify(&done), Readiness::Ready);
    }

    #[test]
    fn test_daemon_set() {
        let status = |ready: i32| {
            json!({
                "observedGeneration": 2,
                "currentNumberScheduled": 3,
                "desiredNumberScheduled": 3,
                "numberMisscheduled": 0,
                "numberReady": ready,
                "numberAvailable": ready,
                "updatedNumberScheduled": 3
            })
        };
        let spec = json!({ "selector": {}, "template": {} });
        let partial = object("apps/v1", "DaemonSet", json!({ "spec": spec.clone(), "status": status(2) }));
        assert_eq!(
            classify(&partial),
            Readiness::Pending("2/3 pods ready".to_string())
        );
        let full = object("apps/v1", "DaemonSet", json!({ "spec": spec, "status": status(3) }));
        assert_eq!(classify(&full), Readiness::Ready);
    }

    #[test]
    fn test_pod_phases() {
        let pod = |status: Value| object("v1", "Pod", json!({ "spec": { "containers": [] }, "status": status }));

        let ready = pod(json!({ "phase": "Running", "conditions": [{ "type": "Ready", "status": "True" }] }));
        assert_eq!(classify(&ready), Readiness::Ready);

        let starting = pod(json!({ "phase": "Pending", "conditions": [{ "type": "Ready", "status": "False" }] }));
        assert!(matches!(classify(&starting), Readiness::Pending(r) if r.contains("Pending")));

        let failed = pod(json!({ "phase": "Failed", "reason": "Evicted" }));
        assert_eq!(classify(&failed), Readiness::Failed("Evicted".to_string()));

        let done = pod(json!({ "phase": "Succeeded" }));
        assert_eq!(classify(&done), Readiness::Ready);
    }

    #[test]
    fn test_job_conditions() {
        let job = |status: Value| object("batch/v1", "Job", json!({ "spec": { "template": {} }, "status": status }));

        let complete = job(json!({ "succeeded": 1, "conditions": [{ "type": "Complete", "status": "True" }] }));
        assert_eq!(classify(&complete), Readiness::Ready);

        let failed = job(json!({ "failed": 6, "conditions": [{ "type": "Failed", "status": "True", "reason": "BackoffLimitExceeded" }] }));
        assert_eq!(
            classify(&failed),
            Readiness::Failed("BackoffLimitExceeded".to_string())
        );

        let running = job(json!({ "active": 1 }));
        assert!(matches!(classify(&running), Readiness::Pending(_)));
    }

    #[test]
    fn test_unknown_kind_is_ready_once_it_exists() {
        let obj = object("v1", "ConfigMap", json!({ "data": { "key": "value" } }));
        assert_eq!(classify(&obj), Readiness::Ready);
    }

    #[test]
    fn test_malformed_status_is_pending() {
        let obj = deployment(json!({ "replicas": "two" }));
        assert!(matches!(classify(&obj), Readiness::Pending(r) if r.starts_with("malformed status")));
    }

    #[test]
    fn test_other_versions_of_a_group_parse_as_typed() {
        let mut obj = deployment(json!({
            "observedGeneration": 2,
            "replicas": 2, "updatedReplicas": 1, "readyReplicas": 1, "availableReplicas": 1
        }));
        obj.types = Some(TypeMeta {
            api_version: "apps/v1beta2".to_string(),
            kind: "Deployment".to_string(),
        });
        assert_eq!(
            classify(&obj),
            Readiness::Pending("1/2 replicas updated".to_string())
        );
    }

    #[test]
    fn test_custom_resources_sharing_a_builtin_kind_name() {
        let volcano_job = object(
            "batch.volcano.sh/v1alpha1",
            "Job",
            json!({ "spec": { "tasks": [] }, "status": { "state": { "phase": "Failed" } } }),
        );
        assert_eq!(classify(&volcano_job), Readiness::Ready);

        let custom_deployment = object(
            "example.com/v1",
            "Deployment",
            json!({ "spec": { "replicas": "many" } }),
        );
        assert_eq!(classify(&custom_deployment), Readiness::Ready);

        let core_job = object(
            "batch/v1",
            "Job",
            json!({ "spec": { "template": {} }, "status": { "active": 1 } }),
        );
        assert!(matches!(classify(&core_job), Readiness::Pending(_)));
    }

    #[test]
    fn test_leftover_pods() {
        let pod = |status: Value, owners: Value| {
            let mut obj = object("v1", "Pod", json!({ "spec": { "containers": [] }, "status": status }));
            obj.metadata.owner_references = serde_json::from_value(owners).unwrap();
            obj
        };
        let job_owner = json!([{
            "apiVersion": "batch/v1", "kind": "Job", "name": "migrate", "uid": "uid-migrate", "controller": true
        }]);

        let evicted = pod(json!({ "phase": "Failed", "reason": "Evicted" }), Value::Null);
        assert!(is_leftover(&evicted));

        let failed_attempt = pod(json!({ "phase": "Failed", "message": "OOMKilled" }), job_owner.clone());
        assert!(is_leftover(&failed_attempt));

        let bare_failure = pod(json!({ "phase": "Failed", "message": "OOMKilled" }), Value::Null);
        assert!(!is_leftover(&bare_failure));

        let running = pod(
            json!({ "phase": "Running", "conditions": [{ "type": "Ready", "status": "True" }] }),
            job_owner,
        );
        assert!(!is_leftover(&running));

        let evicted_job = object("batch/v1", "Job", json!({ "status": { "phase": "Failed", "reason": "Evicted" } }));
        assert!(!is_leftover(&evicted_job));
    }
}
