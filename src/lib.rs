/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/lib.rs
*
* Library behind the Concourse `out` step for Kubernetes: resolve cluster
* credentials, run kubectl, wait for the watched workloads to converge and
* report a version fingerprint of what was applied.
*
* SPDX-License-Identifier: Apache-2.0 */

pub mod clients;
pub mod config;
pub mod credentials;
pub mod error;
pub mod kubectl;
pub mod out;
pub mod poller;
pub mod readiness;
pub mod telemetry;
pub mod version;

pub use error::{Error, Result};
