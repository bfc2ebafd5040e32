/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/telemetry.rs
*
* Logging setup for the `out` binary. Everything goes to stderr, which
* Concourse shows as the build log; stdout carries only the JSON response.
* `RUST_LOG` wins when set, otherwise the `debug` source flag picks between
* debug and info for this crate.
*
* SPDX-License-Identifier: Apache-2.0 */

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug))
}

fn default_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("info,concourse_k8s_resource=debug,out=debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(debug: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter(debug))
        .with(fmt_layer)
        .try_init()
}
