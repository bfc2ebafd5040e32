/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/main.rs
*
* Entry point of the `out` executable. Concourse runs it with the build
* directory as its only argument and the request JSON on stdin, and expects
* the response JSON on stdout.
*
* SPDX-License-Identifier: Apache-2.0 */

use anyhow::{Context, Result};
use clap::Parser;
use concourse_k8s_resource::clients::KubeConnector;
use concourse_k8s_resource::config::OutRequest;
use concourse_k8s_resource::kubectl::Kubectl;
use concourse_k8s_resource::out::Out;
use concourse_k8s_resource::{telemetry, Error};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::info;

/// Applies Kubernetes manifests and waits for them to become ready.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The build directory holding the step's inputs.
    build_dir: PathBuf,

    /// Path of the kubectl binary.
    #[arg(long, env = "KUBECTL_PATH", default_value = "kubectl")]
    kubectl: PathBuf,
}

async fn run_async_logic(cli: Cli) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read the request from stdin")?;

    let parsed = serde_json::from_str::<OutRequest>(&input).map_err(Error::from);
    let debug = parsed.as_ref().map(|r| r.source.debug).unwrap_or(false);
    telemetry::init(debug).context("Failed to initialize logging")?;
    let request = parsed.context("Illegal input format")?;

    info!(build_dir = %cli.build_dir.display(), "Starting out");
    let runner = Kubectl::new(cli.kubectl);
    let response = Out::new(&runner, &KubeConnector, &cli.build_dir)
        .run(&request, &mut std::io::stderr())
        .await?;

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &response).context("Failed to write the response")?;
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run_async_logic(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
