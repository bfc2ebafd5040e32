/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/version.rs
*
* Version and metadata generation. Both are computed from the live state of
* the watched resources after a successful apply.
*
* The version is a SHA-256 over every observed object's kind, namespace,
* name, uid, generation and spec, taken in sorted order so that an unchanged
* cluster always produces the same digest. Status is not part of the digest.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::{MetadataField, Source, Version};
use crate::error::{Error, Result};
use crate::poller::StatusReader;
use futures::future::try_join_all;
use kube::api::DynamicObject;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// What version and metadata generation need from one live object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Observed {
    kind: String,
    namespace: String,
    name: String,
    uid: String,
    generation: i64,
    spec: String,
    images: Vec<String>,
}

impl Observed {
    fn from_object(kind: &str, object: &DynamicObject) -> Self {
        let spec = object.data.get("spec");
        Self {
            kind: object
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .unwrap_or_else(|| kind.to_string()),
            namespace: object.metadata.namespace.clone().unwrap_or_default(),
            name: object.metadata.name.clone().unwrap_or_default(),
            uid: object.metadata.uid.clone().unwrap_or_default(),
            generation: object.metadata.generation.unwrap_or(0),
            spec: spec.map(Value::to_string).unwrap_or_default(),
            images: spec.map(container_images).unwrap_or_default(),
        }
    }
}

/// Images of the pod spec embedded in a workload spec, or of a pod's own spec.
fn container_images(spec: &Value) -> Vec<String> {
    let pod_spec = spec
        .pointer("/template/spec")
        .or_else(|| spec.pointer("/jobTemplate/spec/template/spec"))
        .unwrap_or(spec);
    ["initContainers", "containers"]
        .iter()
        .filter_map(|key| pod_spec.get(key)?.as_array())
        .flatten()
        .filter_map(|c| c.get("image")?.as_str())
        .map(str::to_string)
        .collect()
}

async fn observe<R>(reader: &R, source: &Source, namespace: &str) -> Result<Vec<Observed>>
where
    R: StatusReader + ?Sized,
{
    let fetches = source.watch_resources.iter().map(|reference| async move {
        let objects = reader
            .fetch(reference.namespace_or(namespace), reference)
            .await
            .map_err(|e| Error::PostApplyRead(format!("cannot read {}: {}", reference, e)))?;
        Ok::<_, Error>(
            objects
                .iter()
                .map(|o| Observed::from_object(&reference.kind, o))
                .collect::<Vec<_>>(),
        )
    });

    let mut observed: Vec<Observed> = try_join_all(fetches).await?.into_iter().flatten().collect();
    observed.sort();
    observed.dedup_by(|a, b| a.kind == b.kind && a.namespace == b.namespace && a.name == b.name);
    Ok(observed)
}

/// Computes the fingerprint of the watched resources' current state.
pub async fn current_version<R>(reader: &R, source: &Source, namespace: &str) -> Result<Version>
where
    R: StatusReader + ?Sized,
{
    let observed = observe(reader, source, namespace).await?;

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for object in &observed {
        for field in [
            object.kind.as_str(),
            object.namespace.as_str(),
            object.name.as_str(),
            object.uid.as_str(),
            object.generation.to_string().as_str(),
            object.spec.as_str(),
        ] {
            hasher.update(b"|");
            hasher.update(field.as_bytes());
        }
        hasher.update(b"\n");
    }
    let digest = format!("sha256:{:x}", hasher.finalize());
    debug!(objects = observed.len(), %digest, "Computed version");

    Ok(Version {
        digest: Some(digest),
    })
}

/// Describes the watched resources: the namespace first, then one entry per
/// observed object.
pub async fn metadata<R>(reader: &R, source: &Source, namespace: &str) -> Result<Vec<MetadataField>>
where
    R: StatusReader + ?Sized,
{
    let observed = observe(reader, source, namespace).await?;

    let mut fields = vec![MetadataField::new("namespace", namespace)];
    fields.extend(observed.into_iter().map(|o| {
        let mut value = format!("generation {}", o.generation);
        if !o.images.is_empty() {
            value.push_str(&format!(", images: {}", o.images.join(", ")));
        }
        MetadataField::new(format!("{}/{}", o.kind, o.name), value)
    }));
    Ok(fields)
}
