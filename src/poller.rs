/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/poller.rs
*
* The convergence poller. After kubectl has applied the manifests, the
* watched references are polled until every one of them is ready, one of them
* reports a failure, or the overall timeout runs out.
*
* Architecture:
* - A fixed settle delay gives the controllers a chance to observe the new
*   spec before the first poll.
* - Every tick checks all references concurrently with `join_all`; each check
*   is bounded by a per-request timeout that never exceeds what is left of the
*   overall deadline, so one hanging call cannot stall the tick. Once the
*   deadline has passed no further tick starts. The only exception is a zero
*   timeout, whose single poll is bounded by the per-request timeout alone.
* - Kind-only references ignore leftover pods (evicted, or terminated under a
*   controller) when aggregating.
* - Transient read errors and missing objects are "pending", not fatal. The
*   error is logged and the reference retried on the next tick.
* - Reading live objects is abstracted behind `StatusReader` so the loop can
*   be driven by an in-memory cluster in tests.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::{ResourceReference, MAX_DURATION};
use crate::error::{Error, Result};
use crate::readiness::{classify, is_leftover, Readiness};
use async_trait::async_trait;
use futures::future::join_all;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Delay between the apply and the first poll.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Delay between two polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound for a single status read.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read access to live objects, as needed by the poller and by version
/// generation.
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Returns the objects that currently match `reference` in `namespace`.
    /// A named reference yields at most one object; a kind-only reference
    /// yields every object of that kind. Nothing found is an empty list, not
    /// an error. Returned objects must carry their kind in `types`.
    async fn fetch(&self, namespace: &str, reference: &ResourceReference)
        -> Result<Vec<DynamicObject>>;
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub settle_delay: Duration,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            interval: POLL_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Outcome of a convergence wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Ready,
    Failed { reference: String, reason: String },
    /// The deadline passed; `pending` holds "reference: reason" entries.
    TimedOut { pending: Vec<String> },
}

impl Convergence {
    pub fn is_ready(&self) -> bool {
        matches!(self, Convergence::Ready)
    }

    /// Maps the outcome onto the crate's error taxonomy.
    pub fn into_result(self, timeout: Duration) -> Result<()> {
        match self {
            Convergence::Ready => Ok(()),
            Convergence::Failed { reference, reason } => {
                Err(Error::ResourceFailed { reference, reason })
            }
            Convergence::TimedOut { pending } => Err(Error::ConvergenceTimeout { timeout, pending }),
        }
    }
}

/// Waits until every reference in `references` is ready.
///
/// An empty watch-set converges immediately without the settle delay. A zero
/// `timeout` still performs exactly one poll after the settle delay, bounded
/// by `settings.request_timeout`. Otherwise the wait never runs past the
/// settle delay plus `timeout`. Timeouts beyond `MAX_DURATION` are clamped.
pub async fn await_ready<R>(
    reader: &R,
    namespace: &str,
    references: &[ResourceReference],
    timeout: Duration,
    settings: &PollSettings,
) -> Convergence
where
    R: StatusReader + ?Sized,
{
    if references.is_empty() {
        info!("No resources to watch");
        return Convergence::Ready;
    }

    info!(
        resources = references.len(),
        timeout_secs = timeout.as_secs(),
        "Waiting {:?} before checking resource status",
        settings.settle_delay
    );
    sleep(settings.settle_delay).await;

    let start = Instant::now();
    let deadline = start.checked_add(timeout.min(MAX_DURATION)).unwrap_or(start);
    let mut attempt: u32 = 0;
    let mut pending: Vec<String> = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = match (attempt, remaining.is_zero()) {
            (_, false) => settings.request_timeout.min(remaining),
            (0, true) => settings.request_timeout,
            (_, true) => {
                warn!(attempt, pending = pending.len(), "Timed out waiting for resources");
                return Convergence::TimedOut { pending };
            }
        };
        attempt += 1;

        let states = join_all(
            references
                .iter()
                .map(|reference| check_reference(reader, namespace, reference, budget)),
        )
        .await;

        pending.clear();
        for (reference, state) in references.iter().zip(states) {
            match state {
                Readiness::Ready => debug!(%reference, attempt, "Resource is ready"),
                Readiness::Failed(reason) => {
                    warn!(%reference, %reason, "Resource reported a failure");
                    return Convergence::Failed {
                        reference: reference.to_string(),
                        reason,
                    };
                }
                Readiness::Pending(reason) => {
                    debug!(%reference, attempt, %reason, "Resource is not ready");
                    pending.push(format!("{}: {}", reference, reason));
                }
            }
        }

        if pending.is_empty() {
            info!(attempt, "All watched resources are ready");
            return Convergence::Ready;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(attempt, pending = pending.len(), "Timed out waiting for resources");
            return Convergence::TimedOut { pending };
        }

        info!(
            attempt,
            pending = pending.len(),
            "Waiting for {}",
            pending.join("; ")
        );
        sleep(settings.interval.min(remaining)).await;
    }
}

async fn check_reference<R>(
    reader: &R,
    namespace: &str,
    reference: &ResourceReference,
    budget: Duration,
) -> Readiness
where
    R: StatusReader + ?Sized,
{
    let namespace = reference.namespace_or(namespace);
    let objects = match timeout(budget, reader.fetch(namespace, reference)).await {
        Err(_) => {
            return Readiness::Pending(format!("status request timed out after {:?}", budget))
        }
        Ok(Err(e)) => {
            debug!(%reference, error = %e, "Status read failed, retrying on next poll");
            return Readiness::Pending(format!("status unavailable: {}", e));
        }
        Ok(Ok(objects)) => objects,
    };

    match objects.as_slice() {
        [] => Readiness::Pending("not found".to_string()),
        [object] if reference.name.is_some() => classify(object),
        objects => aggregate(objects),
    }
}

/// Combines the states of several objects matched by one kind-only
/// reference. Leftover pods are skipped; among the rest any failure wins,
/// then any pending object.
fn aggregate(objects: &[DynamicObject]) -> Readiness {
    let live: Vec<&DynamicObject> = objects.iter().filter(|o| !is_leftover(o)).collect();
    if live.is_empty() {
        return Readiness::Pending("only leftover objects found".to_string());
    }

    let mut pending = Vec::new();
    for object in live {
        match classify(object) {
            Readiness::Ready => {}
            Readiness::Failed(reason) => {
                return Readiness::Failed(format!("{}: {}", object.name_any(), reason))
            }
            Readiness::Pending(reason) => pending.push(format!("{} {}", object.name_any(), reason)),
        }
    }
    if pending.is_empty() {
        Readiness::Ready
    } else {
        Readiness::Pending(pending.join(", "))
    }
}
