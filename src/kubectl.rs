/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/kubectl.rs
*
* The command executor. The mutation itself (apply, delete or diff) is done by
* `kubectl`, invoked once per run against the manifests in the build
* directory.
*
* Architecture:
* - The resolved kubeconfig is written to a private temporary file that lives
*   exactly as long as the child process. `kubectl` never sees the user's own
*   kubeconfig or environment-derived context.
* - The child runs with piped stdout/stderr; both are returned to the caller,
*   which echoes them to the build console.
* - `kubectl diff` exits with status 1 when it finds differences, which is a
*   successful run for this resource.
* - `CommandRunner` is the seam the orchestrator depends on, so a run can be
*   exercised without a kubectl binary.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::config::OutParams;
use crate::credentials::ResolvedClientContext;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// The kubectl subcommand a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Delete,
    Diff,
}

impl Operation {
    pub fn from_params(params: &OutParams) -> Self {
        if params.delete {
            Operation::Delete
        } else if params.diff {
            Operation::Diff
        } else {
            Operation::Apply
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Delete => "delete",
            Operation::Diff => "diff",
        }
    }
}

/// Everything needed to build one kubectl command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub operation: Operation,
    pub namespace: String,
    pub paths: Vec<PathBuf>,
    pub kustomize: bool,
    pub server_dry_run: bool,
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Builds the invocation for `params`. Relative paths are resolved
    /// against `build_dir`.
    pub fn from_params(params: &OutParams, namespace: &str, build_dir: &Path) -> Result<Self> {
        let operation = Operation::from_params(params);
        let invalid = |reason: &str| Error::Command {
            verb: operation.verb().to_string(),
            reason: reason.to_string(),
        };

        if params.paths.is_empty() {
            return Err(invalid("no manifest paths given"));
        }
        if params.kustomize && params.paths.len() > 1 {
            return Err(invalid("kustomize accepts exactly one directory"));
        }

        Ok(Self {
            operation,
            namespace: namespace.to_string(),
            paths: params.paths.iter().map(|p| build_dir.join(p)).collect(),
            kustomize: params.kustomize,
            server_dry_run: params.server_dry_run,
            timeout: params.command_timeout,
        })
    }

    /// The kubectl arguments, reading credentials from `kubeconfig`.
    pub fn args(&self, kubeconfig: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--kubeconfig".into(),
            kubeconfig.into(),
            "--namespace".into(),
            self.namespace.clone().into(),
            self.operation.verb().into(),
        ];
        match self.operation {
            Operation::Apply if self.server_dry_run => args.push("--dry-run=server".into()),
            Operation::Delete => {
                args.push("--ignore-not-found".into());
                if self.server_dry_run {
                    args.push("--dry-run=server".into());
                }
            }
            _ => {}
        }
        let flag = if self.kustomize { "-k" } else { "-f" };
        for path in &self.paths {
            args.push(flag.into());
            args.push(path.into());
        }
        args
    }
}

/// Captured output of a successful kubectl run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        context: &ResolvedClientContext,
        invocation: &Invocation,
    ) -> Result<CommandOutput>;
}

/// Runs the real kubectl binary.
pub struct Kubectl {
    program: PathBuf,
}

impl Kubectl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn write_kubeconfig(context: &ResolvedClientContext) -> Result<tempfile::NamedTempFile> {
        let yaml = serde_yaml::to_string(context.raw_config())
            .map_err(|e| Error::parse("kubeconfig", e))?;
        let mut file = tempfile::Builder::new()
            .prefix("kubeconfig-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl CommandRunner for Kubectl {
    async fn run(
        &self,
        context: &ResolvedClientContext,
        invocation: &Invocation,
    ) -> Result<CommandOutput> {
        let verb = invocation.operation.verb();
        let kubeconfig = Self::write_kubeconfig(context)?;
        let args = invocation.args(kubeconfig.path());
        info!(
            verb,
            namespace = %invocation.namespace,
            paths = invocation.paths.len(),
            "Running kubectl"
        );
        debug!(program = %self.program.display(), ?args, "kubectl command line");

        let failed = |reason: String| Error::Command {
            verb: verb.to_string(),
            reason,
        };

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("cannot start {}: {}", self.program.display(), e)))?;

        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| failed(format!("timed out after {:?}", limit)))??,
            None => child.wait_with_output().await?,
        };
        drop(kubeconfig);

        let code = output.status.code();
        let differences = invocation.operation == Operation::Diff && code == Some(1);
        if !output.status.success() && !differences {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "exit status {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            )));
        }

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
