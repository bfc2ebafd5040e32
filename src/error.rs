/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/error.rs
*
* The error taxonomy shared by every stage of an `out` run. Resolution and
* connection errors are fatal and happen before anything is mutated; the
* convergence errors fail a run whose apply already went through; read errors
* after the apply are downgraded by the orchestrator instead of propagated.
*
* SPDX-License-Identifier: Apache-2.0 */

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed PEM material or kubeconfig text.
    #[error("Failed to parse {what}: {reason}")]
    ConfigParse { what: &'static str, reason: String },

    /// No usable credential material, or several conflicting shapes at once.
    #[error("Invalid credentials: {0}")]
    Credential(String),

    /// The REST configuration could not be turned into a client, or the API
    /// server could not be reached.
    #[error("Kubernetes connection error: {0}")]
    Connection(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// `kubectl` exited unsuccessfully or could not be started.
    #[error("kubectl {verb} failed: {reason}")]
    Command { verb: String, reason: String },

    /// The poller ran out of time with some references still pending.
    #[error("Resources not ready after {timeout:?}: {}", pending.join(", "))]
    ConvergenceTimeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    /// A watched resource reported an explicit failure status.
    #[error("Resource {reference} failed: {reason}")]
    ResourceFailed { reference: String, reason: String },

    /// Reading version or metadata after a successful apply failed.
    #[error("Failed to read applied state: {0}")]
    PostApplyRead(String),

    #[error("Invalid request: {0}")]
    Request(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn parse(what: &'static str, reason: impl ToString) -> Self {
        Error::ConfigParse {
            what,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
