/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/config.rs
*
* This file defines the resource protocol payloads. Concourse writes an
* `OutRequest` as JSON to the stdin of the `out` executable and expects an
* `OutResponse` on stdout. Everything here is deserialized once at the
* boundary so that the rest of the crate only sees validated, typed values.
*
* Concourse fills unset template variables with empty strings, so optional
* text fields treat "" the same as an absent key.
*
* SPDX-License-Identifier: Apache-2.0 */

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Upper bound for `status_check_timeout` and `command_timeout`: one year.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The top-level payload for `out`.
#[derive(Deserialize, Debug, Clone)]
pub struct OutRequest {
    pub source: Source,
    #[serde(default)]
    pub params: OutParams,
}

/// Describes how to connect to the cluster and what to watch afterwards.
#[derive(Deserialize, Debug, Clone)]
pub struct Source {
    #[serde(default)]
    pub api_server_url: Option<String>,
    /// PEM encoded certificate authority of the API server.
    #[serde(default)]
    pub api_server_ca: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub client_token: Option<String>,
    /// A complete kubeconfig document.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Only honoured when no `api_server_ca` is given.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default)]
    pub watch_resources: Vec<ResourceReference>,
    #[serde(default)]
    pub debug: bool,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            api_server_url: None,
            api_server_ca: None,
            client_cert: None,
            client_key: None,
            client_token: None,
            kubeconfig: None,
            namespace: default_namespace(),
            insecure_skip_tls_verify: false,
            watch_resources: Vec::new(),
            debug: false,
        }
    }
}

impl Source {
    /// The declared namespace, with `"default"` substituted for a blank value.
    pub fn namespace(&self) -> &str {
        let trimmed = self.namespace.trim();
        if trimmed.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            trimmed
        }
    }

    pub fn api_server_url(&self) -> Option<&str> {
        non_empty(&self.api_server_url)
    }

    pub fn api_server_ca(&self) -> Option<&str> {
        non_blank(&self.api_server_ca)
    }

    pub fn client_cert(&self) -> Option<&str> {
        non_blank(&self.client_cert)
    }

    pub fn client_key(&self) -> Option<&str> {
        non_blank(&self.client_key)
    }

    pub fn client_token(&self) -> Option<&str> {
        non_empty(&self.client_token)
    }

    pub fn kubeconfig(&self) -> Option<&str> {
        non_blank(&self.kubeconfig)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Like `non_empty`, but keeps the text as supplied. PEM material and
/// kubeconfig documents are embedded byte for byte.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Identifies the Kubernetes object(s) to wait for.
///
/// On the wire this is either an object (`{"kind": "Deployment", "name": "web"}`)
/// or a kubectl-style string (`"deployment/web"`, or just `"deployment"` to
/// cover every object of that kind in the namespace).
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "RawReference")]
pub struct ResourceReference {
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Pins the group/version, e.g. `apps/v1` or `example.com/v1alpha1`.
    pub api_version: Option<String>,
}

impl ResourceReference {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: Some(name.into()),
            namespace: None,
            api_version: None,
        }
    }

    pub fn kind_only(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            namespace: None,
            api_version: None,
        }
    }

    /// The namespace the reference lives in, inheriting `fallback` when unset.
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(fallback)
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}:", ns)?;
        }
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.kind, name),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawReference {
    Short(String),
    Full {
        kind: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default, alias = "apiVersion")]
        api_version: Option<String>,
    },
}

impl TryFrom<RawReference> for ResourceReference {
    type Error = String;

    fn try_from(raw: RawReference) -> Result<Self, Self::Error> {
        let reference = match raw {
            RawReference::Short(text) => {
                let text = text.trim();
                match text.split_once('/') {
                    Some((kind, name)) => ResourceReference {
                        kind: kind.trim().to_string(),
                        name: Some(name.trim().to_string()).filter(|n| !n.is_empty()),
                        namespace: None,
                        api_version: None,
                    },
                    None => ResourceReference::kind_only(text),
                }
            }
            RawReference::Full {
                kind,
                name,
                namespace,
                api_version,
            } => ResourceReference {
                kind: kind.trim().to_string(),
                name: name.filter(|n| !n.trim().is_empty()),
                namespace: namespace.filter(|n| !n.trim().is_empty()),
                api_version: api_version.filter(|v| !v.trim().is_empty()),
            },
        };

        if reference.kind.is_empty() {
            return Err("watch resource is missing a kind".to_string());
        }
        if reference.kind.contains('/') {
            return Err(format!(
                "watch resource '{}' has an invalid kind",
                reference.kind
            ));
        }
        Ok(reference)
    }
}

/// Per-run flags for `out`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct OutParams {
    /// Manifest files or directories, relative to the build directory.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Treat each path as a kustomization directory (`kubectl -k`).
    #[serde(default)]
    pub kustomize: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub server_dry_run: bool,
    #[serde(default)]
    pub diff: bool,
    /// Absent means "do not wait"; zero means "check once".
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub status_check_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub command_timeout: Option<Duration>,
}

impl OutParams {
    /// Convergence is only meaningful when something real was mutated.
    pub fn requires_status_check(&self) -> bool {
        !self.delete && !self.server_dry_run && !self.diff
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(i64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => seconds(secs, 1)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(out_of_range(&secs.to_string()))),
        Some(RawDuration::Text(text)) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parses `"90"`, `"30s"`, `"5m"` or `"2h"`. A blank string is `None`.
pub fn parse_duration(s: &str) -> Result<Option<Duration>, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let invalid = || format!("invalid duration '{}', expected e.g. 30s, 5m or 1h", s);

    let (number, multiplier) = if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else {
        (s, 1)
    };
    let value = number.trim().parse::<i64>().map_err(|_| invalid())?;
    seconds(value, multiplier)
        .map(Some)
        .ok_or_else(|| out_of_range(s))
}

/// Negative counts clamp to zero. Anything past `MAX_DURATION` is `None`.
fn seconds(value: i64, multiplier: u64) -> Option<Duration> {
    let secs = u64::try_from(value.max(0)).ok()?.checked_mul(multiplier)?;
    let duration = Duration::from_secs(secs);
    (duration <= MAX_DURATION).then_some(duration)
}

fn out_of_range(s: &str) -> String {
    format!(
        "duration '{}' is out of range, the maximum is {}s",
        s,
        MAX_DURATION.as_secs()
    )
}

/// Opaque fingerprint of the applied state. Serializes to `{}` when unknown.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Version {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Version {
    pub fn is_empty(&self) -> bool {
        self.digest.is_none()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct OutResponse {
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<MetadataField>>,
}

impl OutResponse {
    pub fn empty() -> Self {
        Self::default()
    }
}
