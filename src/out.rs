/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/out.rs
*
* The `out` orchestrator. One run is strictly sequential:
*
*   resolve credentials -> connect -> kubectl -> (poll) -> version/metadata
*
* Anything that can fail before kubectl runs aborts the run without touching
* the cluster. Once kubectl has succeeded, a convergence failure still fails
* the run, while a failure to read back the version or metadata only degrades
* the response to an empty one.
*
* Console output for the build log goes to the sink passed in by the caller,
* never to stdout, which carries the response.
*
* SPDX-License-Identifier: Apache-2.0 */

use crate::clients::ClusterConnector;
use crate::config::{OutRequest, OutResponse};
use crate::credentials;
use crate::error::{Error, Result};
use crate::kubectl::{CommandRunner, Invocation};
use crate::poller::{await_ready, PollSettings};
use crate::version;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Sequences one `out` run over its collaborators.
pub struct Out<'a> {
    runner: &'a dyn CommandRunner,
    connector: &'a dyn ClusterConnector,
    build_dir: PathBuf,
    settings: PollSettings,
}

impl<'a> Out<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        connector: &'a dyn ClusterConnector,
        build_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            connector,
            build_dir: build_dir.into(),
            settings: PollSettings::default(),
        }
    }

    pub fn with_poll_settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn run(&self, request: &OutRequest, console: &mut dyn Write) -> Result<OutResponse> {
        let OutRequest { source, params } = request;

        let context = credentials::resolve(source)?;
        let namespace = context.namespace();
        let invocation = Invocation::from_params(params, namespace, &self.build_dir)?;
        let cluster = self.connector.connect(&context).await?;

        writeln!(
            console,
            "kubectl {} in namespace {}",
            invocation.operation.verb(),
            namespace
        )?;
        let output = self.runner.run(&context, &invocation).await?;
        console.write_all(&output.stdout)?;
        console.write_all(&output.stderr)?;

        if params.requires_status_check() {
            match params.status_check_timeout {
                Some(timeout) => {
                    writeln!(console, "Waiting for {} resource(s) to become ready", source.watch_resources.len())?;
                    await_ready(
                        cluster.as_ref(),
                        namespace,
                        &source.watch_resources,
                        timeout,
                        &self.settings,
                    )
                    .await
                    .into_result(timeout)?;
                    writeln!(console, "All resources are ready")?;
                }
                None => info!("No status_check_timeout configured, skipping status check"),
            }
        }

        if params.delete {
            return Ok(OutResponse::empty());
        }

        let read_back = async {
            let version = version::current_version(cluster.as_ref(), source, namespace).await?;
            let metadata = version::metadata(cluster.as_ref(), source, namespace).await?;
            Ok::<_, Error>(OutResponse {
                version,
                metadata: Some(metadata),
            })
        };
        match read_back.await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(error = %e, "Could not read back applied state, reporting an empty version");
                writeln!(console, "warning: {}", e)?;
                Ok(OutResponse::empty())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutParams, ResourceReference, Source, Version};
    use crate::credentials::{tests::URL, ResolvedClientContext};
    use crate::kubectl::{CommandOutput, Operation};
    use crate::poller::tests::{pod, FakeCluster};
    use crate::poller::StatusReader;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRunner {
        invocations: Mutex<Vec<Invocation>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            _context: &ResolvedClientContext,
            invocation: &Invocation,
        ) -> Result<CommandOutput> {
            self.invocations.lock().unwrap().push(invocation.clone());
            if self.fail {
                return Err(Error::Command {
                    verb: invocation.operation.verb().to_string(),
                    reason: "exit status 1: forbidden".to_string(),
                });
            }
            Ok(CommandOutput {
                stdout: b"pod/worker configured\n".to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    struct FakeConnector(Arc<FakeCluster>);

    struct SharedCluster(Arc<FakeCluster>);

    #[async_trait]
    impl StatusReader for SharedCluster {
        async fn fetch(
            &self,
            namespace: &str,
            reference: &ResourceReference,
        ) -> Result<Vec<kube::api::DynamicObject>> {
            self.0.fetch(namespace, reference).await
        }
    }

    #[async_trait]
    impl ClusterConnector for FakeConnector {
        async fn connect(&self, _context: &ResolvedClientContext) -> Result<Box<dyn StatusReader>> {
            Ok(Box::new(SharedCluster(self.0.clone())))
        }
    }

    fn fast() -> PollSettings {
        PollSettings {
            settle_delay: Duration::from_millis(5),
            interval: Duration::from_millis(10),
            request_timeout: Duration::from_millis(50),
        }
    }

    fn request(params: OutParams) -> OutRequest {
        OutRequest {
            source: Source {
                api_server_url: Some(URL.to_string()),
                client_token: Some("token".to_string()),
                namespace: "test".to_string(),
                watch_resources: vec![ResourceReference::new("Pod", "worker")],
                ..Source::default()
            },
            params,
        }
    }

    fn apply(timeout: Option<Duration>) -> OutParams {
        OutParams {
            paths: vec!["manifests".to_string()],
            status_check_timeout: timeout,
            ..OutParams::default()
        }
    }

    #[tokio::test]
    async fn test_apply_waits_and_reports_version() {
        let runner = RecordingRunner::default();
        let cluster = Arc::new(FakeCluster::new().script(
            "Pod/worker",
            vec![vec![pod("worker", false)], vec![pod("worker", true)]],
        ));
        let connector = FakeConnector(cluster.clone());
        let mut console = Vec::new();

        let response = Out::new(&runner, &connector, "/build")
            .with_poll_settings(fast())
            .run(&request(apply(Some(Duration::from_secs(5)))), &mut console)
            .await
            .unwrap();

        assert!(!response.version.is_empty());
        let metadata = response.metadata.unwrap();
        assert_eq!(metadata[0].value, "test");
        assert_eq!(metadata[1].name, "Pod/worker");

        let invocations = runner.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].operation, Operation::Apply);
        assert_eq!(invocations[0].namespace, "test");
        assert_eq!(invocations[0].paths, vec![PathBuf::from("/build/manifests")]);

        let console = String::from_utf8(console).unwrap();
        assert!(console.contains("pod/worker configured"));
        assert!(console.contains("All resources are ready"));
    }

    #[tokio::test]
    async fn test_timeout_fails_the_run() {
        let runner = RecordingRunner::default();
        let connector = FakeConnector(Arc::new(FakeCluster::new().with("Pod/worker", vec![pod("worker", false)])));

        let err = Out::new(&runner, &connector, "/build")
            .with_poll_settings(fast())
            .run(&request(apply(Some(Duration::from_millis(50)))), &mut Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConvergenceTimeout { .. }));
    }

    #[tokio::test]
    async fn test_no_timeout_skips_polling() {
        let runner = RecordingRunner::default();
        let cluster = Arc::new(FakeCluster::new().with("Pod/worker", vec![pod("worker", false)]));
        let connector = FakeConnector(cluster.clone());

        let response = Out::new(&runner, &connector, "/build")
            .with_poll_settings(fast())
            .run(&request(apply(None)), &mut Vec::new())
            .await
            .unwrap();

        assert!(!response.version.is_empty());
        // Only the two read-backs, no status polls.
        assert_eq!(cluster.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_returns_empty_response_without_polling() {
        let runner = RecordingRunner::default();
        let cluster = Arc::new(FakeCluster::new());
        let connector = FakeConnector(cluster.clone());
        let params = OutParams {
            delete: true,
            ..apply(Some(Duration::from_secs(5)))
        };

        let response = Out::new(&runner, &connector, "/build")
            .with_poll_settings(fast())
            .run(&request(params), &mut Vec::new())
            .await
            .unwrap();

        assert_eq!(response, OutResponse::empty());
        assert_eq!(serde_json::to_string(&response).unwrap(), r#"{"version":{}}"#);
        assert_eq!(cluster.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(runner.invocations.lock().unwrap()[0].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_read_back_failure_degrades_to_empty_response() {
        let runner = RecordingRunner::default();
        let connector = FakeConnector(Arc::new(FakeCluster::new().failing("Pod/worker")));
        let mut console = Vec::new();

        let response = Out::new(&runner, &connector, "/build")
            .run(&request(apply(None)), &mut console)
            .await
            .unwrap();

        assert_eq!(response.version, Version::default());
        assert!(response.metadata.is_none());
        assert!(String::from_utf8(console).unwrap().contains("warning"));
    }

    #[tokio::test]
    async fn test_kubectl_failure_is_fatal() {
        let runner = RecordingRunner {
            fail: true,
            ..Default::default()
        };
        let connector = FakeConnector(Arc::new(FakeCluster::new()));

        let err = Out::new(&runner, &connector, "/build")
            .run(&request(apply(Some(Duration::from_secs(5)))), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[tokio::test]
    async fn test_credential_error_aborts_before_kubectl() {
        let runner = RecordingRunner::default();
        let connector = FakeConnector(Arc::new(FakeCluster::new()));
        let mut bad = request(apply(None));
        bad.source.kubeconfig = Some("apiVersion: v1".to_string());

        let err = Out::new(&runner, &connector, "/build")
            .run(&bad, &mut Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Credential(_)));
        assert!(runner.invocations.lock().unwrap().is_empty());
    }
}
