//! Execution backends for session sandboxes.
//!
//! A driver provisions one sandbox per session, hands out a single duplex
//! byte stream to its terminal, and runs one-shot commands inside it. The
//! sandbox name is derived from the session id, so a retried or interrupted
//! create can always be found and removed again.

pub mod docker;
pub mod kubernetes;
pub mod mock;

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::errors::{BackendError, ProvisionError};

use super::models::{BackendKind, PullPolicy, ResourceLimits, Session, sandbox_name};

pub use docker::DockerDriver;
pub use kubernetes::KubernetesDriver;
pub use mock::MockDriver;

// ── Driver types ──────────────────────────────────────────────────────

/// Everything a driver needs to provision a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub resources: ResourceLimits,
    pub pull_policy: PullPolicy,
    pub storage_class: Option<String>,
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    /// Overrides the image's entrypoint command when set.
    pub command: Option<Vec<String>>,
    /// Upper bound for one create attempt, readiness included.
    pub timeout: Duration,
}

impl SandboxSpec {
    pub fn for_session(session: &Session, env: Vec<(String, String)>, timeout: Duration) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("harbor.session".to_string(), session.id.clone());
        labels.insert("app.kubernetes.io/managed-by".to_string(), "harbor".to_string());
        Self {
            name: sandbox_name(&session.id),
            image: session.execution.image.clone(),
            resources: session.execution.resources.clone(),
            pull_policy: session.execution.pull_policy,
            storage_class: session.execution.storage_class.clone(),
            workdir: session.workspace.workdir.clone(),
            env,
            labels,
            command: None,
            timeout,
        }
    }

    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle::new(self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    pub name: String,
}

impl SandboxHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// The sandbox terminal as two independently owned halves.
pub struct SandboxStream {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub writer: Pin<Box<dyn AsyncWrite + Send>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr when present, stdout otherwise, trimmed.
    pub fn detail(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

// ── Driver trait ──────────────────────────────────────────────────────

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Provision and start the sandbox named `spec.name`. Safe to retry:
    /// leftovers from an earlier attempt are removed first.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProvisionError>;

    /// Open the sandbox terminal. Only one stream per handle is supported.
    async fn attach_stream(&self, handle: &SandboxHandle) -> Result<SandboxStream, BackendError>;

    /// Run a command to completion, giving up after `timeout`.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError>;

    async fn resize(&self, _handle: &SandboxHandle, _rows: u16, _cols: u16) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("resize"))
    }

    /// Graceful stop. A sandbox that is already gone is not an error.
    async fn stop(&self, handle: &SandboxHandle) -> Result<(), BackendError>;

    /// Forced removal. A sandbox that is already gone is not an error.
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), BackendError>;

    async fn exists(&self, handle: &SandboxHandle) -> Result<bool, BackendError>;

    /// Exit code of the sandbox's main process once it has exited.
    async fn exit_status(&self, _handle: &SandboxHandle) -> Result<Option<i64>, BackendError> {
        Ok(None)
    }
}

/// Run `fut` under `timeout`, mapping expiry to `BackendError::TimedOut`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, BackendError>
where
    F: std::future::Future<Output = Result<T, BackendError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BackendError::TimedOut(timeout))?
}

// ── Provision retry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Create a sandbox, retrying transient failures.
///
/// Each attempt is bounded by `spec.timeout`. When `cancel` fires, the
/// in-flight attempt is abandoned and the deterministic sandbox name is
/// removed so nothing leaks.
pub async fn provision_with_retry(
    driver: &dyn BackendDriver,
    spec: &SandboxSpec,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<SandboxHandle, ProvisionError> {
    let attempts = policy.retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cleanup_cancelled(driver, spec).await;
                return Err(ProvisionError::Unavailable("provisioning cancelled".to_string()));
            }
            r = tokio::time::timeout(spec.timeout, driver.create(spec)) => r,
        };

        let err = match result {
            Ok(Ok(_)) if cancel.is_cancelled() => {
                cleanup_cancelled(driver, spec).await;
                return Err(ProvisionError::Unavailable("provisioning cancelled".to_string()));
            }
            Ok(Ok(handle)) => {
                tracing::info!(sandbox = %handle, attempt, backend = driver.kind().as_str(), "sandbox ready");
                return Ok(handle);
            }
            Ok(Err(e)) => e,
            Err(_) => ProvisionError::Timeout {
                attempts: attempt,
                timeout: spec.timeout,
            },
        };

        if !err.is_transient() || attempt >= attempts {
            tracing::warn!(sandbox = %spec.name, attempt, kind = err.kind(), error = %err, "provisioning failed");
            return Err(match err {
                ProvisionError::Timeout { timeout, .. } => ProvisionError::Timeout {
                    attempts: attempt,
                    timeout,
                },
                other => other,
            });
        }

        let delay = policy.backoff * attempt;
        tracing::info!(sandbox = %spec.name, attempt, ?delay, error = %err, "retrying sandbox creation");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cleanup_cancelled(driver, spec).await;
                return Err(ProvisionError::Unavailable("provisioning cancelled".to_string()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn cleanup_cancelled(driver: &dyn BackendDriver, spec: &SandboxSpec) {
    if let Err(e) = driver.remove(&spec.handle()).await {
        tracing::warn!(sandbox = %spec.name, error = %e, "failed to remove sandbox after cancelled provisioning");
    }
}

// ── Driver set ────────────────────────────────────────────────────────

/// The drivers configured for this process, by backend kind.
#[derive(Clone, Default)]
pub struct Drivers {
    drivers: HashMap<BackendKind, Arc<dyn BackendDriver>>,
}

impl Drivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.insert(driver);
        self
    }

    pub fn insert(&mut self, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendDriver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.drivers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
