/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/credentials.rs
*
* Credential resolution. A `Source` may describe the cluster in one of three
* mutually exclusive shapes:
*
* 1. `kubeconfig`: a complete document. Its current context decides the
*    cluster, the user and (when set) the namespace.
* 2. `client_cert` + `client_key`: an in-memory kubeconfig is synthesized with
*    a cluster named `default` (from `api_server_url` / `api_server_ca`) and a
*    user named `concourse` holding the pair.
* 3. `client_token`: the same synthesized cluster, with a `concourse` user that
*    only carries the bearer token.
*
* With none of them, the service account mounted into the pod is used.
*
* Every shape ends up as a `kube::config::Kubeconfig`, which is both the input
* for the REST client and the file handed to `kubectl`. Resolution never
* touches the network.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::Source;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use kube::config::{AuthInfo, Cluster, Context as KubeContext, Kubeconfig};
use serde_json::json;
use std::io::BufReader;
use tracing::{debug, info};

/// Name of the synthesized cluster entry.
pub const CLUSTER_NAME: &str = "default";
/// Name of the synthesized user entry.
pub const AUTH_INFO_NAME: &str = "concourse";
/// Name of the synthesized context entry.
pub const CONTEXT_NAME: &str = "concourse";

const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Which credential shape produced a `ResolvedClientContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialShape {
    Kubeconfig,
    ClientCertificate,
    Token,
    InCluster,
}

/// The outcome of resolution: a loadable raw config plus the effective namespace.
#[derive(Debug, Clone)]
pub struct ResolvedClientContext {
    raw: Kubeconfig,
    namespace: String,
    shape: CredentialShape,
    /// Ready-made REST configuration for the in-cluster shape, where the
    /// credentials live in files rather than in the kubeconfig.
    in_cluster: Option<kube::Config>,
}

impl ResolvedClientContext {
    /// The namespace every namespaced operation of this run targets. Never empty.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn shape(&self) -> CredentialShape {
        self.shape
    }

    pub fn raw_config(&self) -> &Kubeconfig {
        &self.raw
    }

    pub(crate) fn in_cluster_config(&self) -> Option<&kube::Config> {
        self.in_cluster.as_ref()
    }

    pub fn current_context(&self) -> Option<&KubeContext> {
        let name = self.raw.current_context.as_deref()?;
        self.raw
            .contexts
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.context.as_ref())
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.raw
            .clusters
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.cluster.as_ref())
    }

    pub fn auth_info(&self, name: &str) -> Option<&AuthInfo> {
        self.raw
            .auth_infos
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.auth_info.as_ref())
    }

    pub fn current_cluster(&self) -> Option<&Cluster> {
        self.cluster(&self.current_context()?.cluster)
    }

    pub fn current_auth_info(&self) -> Option<&AuthInfo> {
        let user = self.current_context()?.user.as_deref()?;
        self.auth_info(user)
    }

    pub fn server_url(&self) -> Option<&str> {
        self.current_cluster()?.server.as_deref()
    }

    /// The PEM bytes of the cluster CA, when embedded in the config.
    pub fn cluster_ca(&self) -> Option<Vec<u8>> {
        let data = self.current_cluster()?.certificate_authority_data.as_deref()?;
        STANDARD.decode(data.trim()).ok()
    }
}

/// Resolves `source` into a client context. See the module docs for the shapes.
pub fn resolve(source: &Source) -> Result<ResolvedClientContext> {
    let shape = detect_shape(source)?;
    debug!(?shape, "Resolving cluster credentials");

    let context = match shape {
        CredentialShape::Kubeconfig => from_kubeconfig(source)?,
        CredentialShape::ClientCertificate | CredentialShape::Token => {
            from_explicit_credentials(source, shape)?
        }
        CredentialShape::InCluster => from_service_account(source)?,
    };

    info!(
        shape = ?context.shape,
        namespace = %context.namespace,
        server = context.server_url().unwrap_or("<unknown>"),
        "Resolved cluster credentials"
    );
    Ok(context)
}

fn detect_shape(source: &Source) -> Result<CredentialShape> {
    let has_pair = match (source.client_cert(), source.client_key()) {
        (Some(_), Some(_)) => true,
        (None, None) => false,
        _ => {
            return Err(Error::Credential(
                "client_cert and client_key must be supplied together".to_string(),
            ))
        }
    };

    let supplied: Vec<(&str, CredentialShape)> = [
        (source.kubeconfig().is_some(), "kubeconfig", CredentialShape::Kubeconfig),
        (has_pair, "client_cert/client_key", CredentialShape::ClientCertificate),
        (source.client_token().is_some(), "client_token", CredentialShape::Token),
    ]
    .into_iter()
    .filter(|(present, _, _)| *present)
    .map(|(_, label, shape)| (label, shape))
    .collect();

    match supplied.as_slice() {
        [] => Ok(CredentialShape::InCluster),
        [(_, shape)] => Ok(*shape),
        many => Err(Error::Credential(format!(
            "ambiguous credentials, supply only one of: {}",
            many.iter().map(|(label, _)| *label).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn from_kubeconfig(source: &Source) -> Result<ResolvedClientContext> {
    let text = source.kubeconfig().unwrap_or_default();
    let raw = Kubeconfig::from_yaml(text).map_err(|e| Error::parse("kubeconfig", e))?;

    let current = raw
        .current_context
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::parse("kubeconfig", "current-context is not set"))?;
    let context = raw
        .contexts
        .iter()
        .find(|c| c.name == current)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| {
            Error::parse("kubeconfig", format!("context '{}' is not defined", current))
        })?;

    let cluster = raw
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| {
            Error::parse(
                "kubeconfig",
                format!("cluster '{}' is not defined", context.cluster),
            )
        })?;
    if let Some(data) = cluster.certificate_authority_data.as_deref() {
        validate_certificates("certificate-authority-data", &decode_embedded(data)?)?;
    }

    if let Some(user) = context.user.as_deref().filter(|u| !u.is_empty()) {
        let auth = raw
            .auth_infos
            .iter()
            .find(|a| a.name == user)
            .and_then(|a| a.auth_info.as_ref())
            .ok_or_else(|| {
                Error::parse("kubeconfig", format!("user '{}' is not defined", user))
            })?;
        if let Some(data) = auth.client_certificate_data.as_deref() {
            validate_certificates("client-certificate-data", &decode_embedded(data)?)?;
        }
        if let Some(data) = auth.client_key_data.as_ref() {
            use secrecy::ExposeSecret;
            validate_private_key("client-key-data", &decode_embedded(data.expose_secret())?)?;
        }
    }

    let namespace = context
        .namespace
        .as_deref()
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| source.namespace())
        .to_string();

    Ok(ResolvedClientContext {
        raw,
        namespace,
        shape: CredentialShape::Kubeconfig,
        in_cluster: None,
    })
}

fn from_explicit_credentials(
    source: &Source,
    shape: CredentialShape,
) -> Result<ResolvedClientContext> {
    let server = source.api_server_url().ok_or_else(|| {
        Error::Credential("api_server_url is required with client_cert or client_token".to_string())
    })?;
    let namespace = source.namespace().to_string();

    let mut cluster = json!({ "server": server });
    match source.api_server_ca() {
        Some(ca) => {
            validate_certificates("api_server_ca", ca.as_bytes())?;
            cluster["certificate-authority-data"] = json!(STANDARD.encode(ca));
            cluster["insecure-skip-tls-verify"] = json!(false);
        }
        None if source.insecure_skip_tls_verify => {
            cluster["insecure-skip-tls-verify"] = json!(true);
        }
        None => {}
    }

    let user = match shape {
        CredentialShape::ClientCertificate => {
            let cert = source.client_cert().unwrap_or_default();
            let key = source.client_key().unwrap_or_default();
            validate_certificates("client_cert", cert.as_bytes())?;
            validate_private_key("client_key", key.as_bytes())?;
            json!({
                "client-certificate-data": STANDARD.encode(cert),
                "client-key-data": STANDARD.encode(key),
            })
        }
        _ => json!({ "token": source.client_token().unwrap_or_default() }),
    };

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": CLUSTER_NAME, "cluster": cluster }],
        "users": [{ "name": AUTH_INFO_NAME, "user": user }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": {
                "cluster": CLUSTER_NAME,
                "user": AUTH_INFO_NAME,
                "namespace": namespace,
            }
        }],
        "current-context": CONTEXT_NAME,
    });
    let raw: Kubeconfig =
        serde_json::from_value(document).map_err(|e| Error::parse("kubeconfig", e))?;

    Ok(ResolvedClientContext {
        raw,
        namespace,
        shape,
        in_cluster: None,
    })
}

fn from_service_account(source: &Source) -> Result<ResolvedClientContext> {
    let mut config = kube::Config::incluster().map_err(|e| {
        Error::Credential(format!(
            "no kubeconfig, client certificate or token supplied and in-cluster configuration is unavailable: {}",
            e
        ))
    })?;
    let namespace = source.namespace().to_string();
    config.default_namespace = namespace.clone();

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": CLUSTER_NAME,
            "cluster": {
                "server": config.cluster_url.to_string(),
                "certificate-authority": SERVICE_ACCOUNT_CA,
            }
        }],
        "users": [{ "name": AUTH_INFO_NAME, "user": { "tokenFile": SERVICE_ACCOUNT_TOKEN } }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": {
                "cluster": CLUSTER_NAME,
                "user": AUTH_INFO_NAME,
                "namespace": namespace,
            }
        }],
        "current-context": CONTEXT_NAME,
    });
    let raw: Kubeconfig =
        serde_json::from_value(document).map_err(|e| Error::parse("kubeconfig", e))?;

    Ok(ResolvedClientContext {
        raw,
        namespace,
        shape: CredentialShape::InCluster,
        in_cluster: Some(config),
    })
}

fn decode_embedded(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| Error::parse("kubeconfig", format!("invalid base64 data: {}", e)))
}

fn validate_certificates(what: &'static str, pem: &[u8]) -> Result<()> {
    let mut reader = BufReader::new(pem);
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        cert.map_err(|e| Error::parse(what, e))?;
        count += 1;
    }
    if count == 0 {
        return Err(Error::parse(what, "no PEM certificate found"));
    }
    Ok(())
}

fn validate_private_key(what: &'static str, pem: &[u8]) -> Result<()> {
    let mut reader = BufReader::new(pem);
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::parse(what, "no PEM private key found")),
        Err(e) => Err(Error::parse(what, e)),
    }
}
