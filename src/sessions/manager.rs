//! Orchestration facade.
//!
//! `SessionManager` is the one entry point the HTTP and websocket handlers
//! call. It reads and writes session state only through the [`Registry`],
//! performs side effects through the configured backend drivers, and runs
//! the background loops: console notices, the idle sweeper and the PR poller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{MergeError, SessionError};

use super::activity::{self, ActivityMonitor};
use super::backend::{BackendDriver, Drivers, RetryPolicy, SandboxHandle, SandboxSpec, provision_with_retry};
use super::console::{Attachment, StreamMultiplexer, StreamNotice};
use super::events::Subscription;
use super::github::{PrStatusReport, summarize_pr_status};
use super::models::{
    AccessMode, AgentActivity, BackendKind, CheckStatus, ExecutionDescriptor, MergeMethod,
    PullPolicy, ResourceLimits, Session, SessionStatus, WorkspaceDescriptor, branch_name_for,
    repo_name, sandbox_name, slugify,
};
use super::poller::PrPoller;
use super::registry::Registry;
use super::state;
use super::workflow::{self, GitSettings, SandboxExec, WorkflowFailure};

pub const DEFAULT_IMAGE: &str = "ghcr.io/harbor/agent:latest";
const NOTICE_QUEUE: usize = 1024;

/// Tunables for the facade and its background loops.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub quiet_window: Duration,
    pub provision_timeout: Duration,
    pub retry: RetryPolicy,
    pub exec_timeout: Duration,
    pub poll_interval: Duration,
    pub workdir: String,
    pub images: HashMap<BackendKind, String>,
    pub resources: ResourceLimits,
    /// Default storage class for cluster pods.
    pub storage_class: Option<String>,
    pub git: GitSettings,
    /// Extra environment passed into every sandbox.
    pub sandbox_env: Vec<(String, String)>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            quiet_window: Duration::from_secs(60),
            provision_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            exec_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(30),
            workdir: "/workspace".to_string(),
            images: HashMap::new(),
            resources: ResourceLimits::default(),
            storage_class: None,
            git: GitSettings::default(),
            sandbox_env: Vec::new(),
        }
    }
}

impl ManagerSettings {
    pub fn default_image(&self, kind: BackendKind) -> String {
        self.images
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub repo_url: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    pub backend: BackendKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    #[serde(default)]
    pub pull_policy: Option<PullPolicy>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub access_mode: Option<AccessMode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSession {
    pub session: Session,
    pub warnings: Vec<String>,
}

pub struct SessionManager {
    registry: Arc<Registry>,
    drivers: Drivers,
    streams: StreamMultiplexer,
    activity: ActivityMonitor,
    settings: ManagerSettings,
    lanes: DashMap<String, Arc<Mutex<()>>>,
    tokens: DashMap<String, CancellationToken>,
    publishing: DashSet<String>,
    notices: std::sync::Mutex<Option<mpsc::Receiver<StreamNotice>>>,
}

enum BringUpFailure {
    Cancelled,
    Failed(String),
}

impl SessionManager {
    pub fn new(registry: Arc<Registry>, drivers: Drivers, settings: ManagerSettings) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(NOTICE_QUEUE);
        Arc::new(Self {
            registry,
            drivers,
            streams: StreamMultiplexer::new(tx),
            activity: ActivityMonitor::new(),
            settings,
            lanes: DashMap::new(),
            tokens: DashMap::new(),
            publishing: DashSet::new(),
            notices: std::sync::Mutex::new(Some(rx)),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn streams(&self) -> &StreamMultiplexer {
        &self.streams
    }

    pub fn subscribe(&self) -> Subscription {
        self.registry.bus().subscribe()
    }

    fn token_for(&self, id: &str) -> CancellationToken {
        self.tokens
            .entry(id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn lane_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.lanes
            .entry(id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn driver_for(&self, session: &Session) -> Result<Arc<dyn BackendDriver>, SessionError> {
        self.drivers.get(session.execution.backend).ok_or_else(|| {
            SessionError::InvalidRequest(format!(
                "backend {} is not configured",
                session.execution.backend.as_str()
            ))
        })
    }

    fn handle_of(session: &Session) -> SandboxHandle {
        SandboxHandle::new(
            session
                .backend_handle
                .clone()
                .unwrap_or_else(|| sandbox_name(&session.id)),
        )
    }

    fn exec_for(&self, session: &Session) -> Result<SandboxExec, SessionError> {
        Ok(SandboxExec::new(
            self.driver_for(session)?,
            Self::handle_of(session),
            self.lane_for(&session.id),
            self.token_for(&session.id),
            self.settings.exec_timeout,
        ))
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.registry.get(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, SessionError> {
        self.registry.list().await
    }

    // ── Create ────────────────────────────────────────────────────────

    /// Record a new session and provision it in the background. The
    /// returned session is still `Creating`; progress arrives as events.
    pub async fn create_session(
        self: &Arc<Self>,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SessionError> {
        let kind = request.backend;
        if self.drivers.get(kind).is_none() {
            return Err(SessionError::InvalidRequest(format!(
                "backend {} is not configured",
                kind.as_str()
            )));
        }

        let mut warnings = Vec::new();
        let resources = request
            .resources
            .unwrap_or_else(|| self.settings.resources.clone());
        if resources.cpus <= 0.0 {
            return Err(SessionError::InvalidRequest(format!(
                "cpus must be positive, got {}",
                resources.cpus
            )));
        }
        if resources.memory_bytes().is_none() {
            return Err(SessionError::InvalidRequest(format!(
                "invalid memory limit '{}'",
                resources.memory
            )));
        }

        let image = match request.image.filter(|i| !i.trim().is_empty()) {
            Some(image) => image,
            None => {
                let image = self.settings.default_image(kind);
                warnings.push(format!("image not set; using {}", image));
                image
            }
        };

        let storage_class = match kind {
            BackendKind::LocalContainer => {
                if request.storage_class.is_some() {
                    warnings.push("storage_class is ignored for local_container sessions".to_string());
                }
                None
            }
            BackendKind::ClusterPod => request
                .storage_class
                .or_else(|| self.settings.storage_class.clone()),
        };

        let base_branch = match request.base_branch.filter(|b| !b.trim().is_empty()) {
            Some(branch) => branch,
            None => {
                warnings.push("base_branch not set; using main".to_string());
                "main".to_string()
            }
        };

        let id = Uuid::new_v4().to_string();
        let short: String = id.chars().take(8).collect();
        let name = slugify(
            &format!(
                "{}-{}",
                repo_name(&request.repo_url).unwrap_or_else(|| "session".to_string()),
                short
            ),
            48,
        );
        let session = Session::new(
            id.clone(),
            name,
            ExecutionDescriptor {
                backend: kind,
                image,
                resources,
                pull_policy: request.pull_policy.unwrap_or_default(),
                storage_class,
            },
            WorkspaceDescriptor {
                branch_name: branch_name_for(&request.repo_url, &id),
                repo_url: request.repo_url,
                base_branch,
                workdir: self.settings.workdir.clone(),
            },
            request.access_mode.unwrap_or_default(),
        );

        let session = self.registry.create(session).await?;
        let cancel = self.token_for(&id);
        tokio::spawn(self.clone().provision(session.clone(), cancel));
        Ok(CreatedSession { session, warnings })
    }

    async fn provision(self: Arc<Self>, session: Session, cancel: CancellationToken) {
        let id = session.id.clone();
        match self.bring_up(&session, &cancel).await {
            Ok(()) => {}
            Err(BringUpFailure::Cancelled) => {
                tracing::info!(session_id = %id, "provisioning cancelled");
            }
            Err(BringUpFailure::Failed(reason)) => {
                tracing::warn!(session_id = %id, error = %reason, "session failed to start");
                self.fail_session(&id, reason).await;
            }
        }
    }

    async fn bring_up(&self, session: &Session, cancel: &CancellationToken) -> Result<(), BringUpFailure> {
        let id = session.id.as_str();
        workflow::validate_repo_url(&session.workspace.repo_url)
            .map_err(|e| BringUpFailure::Failed(format!("invalid repository URL: {}", e)))?;
        let driver = self
            .driver_for(session)
            .map_err(|e| BringUpFailure::Failed(e.to_string()))?;

        let mut env = self.settings.sandbox_env.clone();
        env.push(("HARBOR_SESSION_ID".to_string(), id.to_string()));
        let spec = SandboxSpec::for_session(session, env, self.settings.provision_timeout);

        let handle = match provision_with_retry(driver.as_ref(), &spec, self.settings.retry, cancel).await {
            Ok(handle) => handle,
            Err(_) if cancel.is_cancelled() => return Err(BringUpFailure::Cancelled),
            Err(e) => return Err(BringUpFailure::Failed(e.to_string())),
        };

        let recorded = self
            .registry
            .update(id, |s| {
                s.backend_handle = Some(handle.name.clone());
                Ok(())
            })
            .await;
        if let Err(e) = recorded {
            tracing::info!(session_id = %id, error = %e, "session went away during provisioning; removing sandbox");
            Self::discard_sandbox(driver.as_ref(), &handle, id).await;
            return Err(BringUpFailure::Cancelled);
        }

        let exec = SandboxExec::new(
            driver.clone(),
            handle.clone(),
            self.lane_for(id),
            cancel.clone(),
            self.settings.exec_timeout,
        );
        match workflow::prepare(&exec, &session.workspace).await {
            Ok(()) => {}
            Err(WorkflowFailure::Cancelled) => {
                Self::discard_sandbox(driver.as_ref(), &handle, id).await;
                return Err(BringUpFailure::Cancelled);
            }
            Err(WorkflowFailure::Failed(e)) => return Err(BringUpFailure::Failed(e.to_string())),
        }
        if cancel.is_cancelled() {
            Self::discard_sandbox(driver.as_ref(), &handle, id).await;
            return Err(BringUpFailure::Cancelled);
        }

        self.registry
            .transition(id, SessionStatus::Running, None)
            .await
            .map_err(|e| BringUpFailure::Failed(e.to_string()))?;
        self.activity.touch(id);
        if let Err(e) = self.streams.open(id, driver, handle).await {
            tracing::warn!(session_id = %id, error = %e, "could not open console stream");
        }
        Ok(())
    }

    /// Remove a sandbox whose provisioning was abandoned after create.
    async fn discard_sandbox(driver: &dyn BackendDriver, handle: &SandboxHandle, id: &str) {
        if let Err(e) = driver.remove(handle).await {
            tracing::warn!(session_id = %id, sandbox = %handle, error = %e, "failed to remove orphaned sandbox");
        }
    }

    /// Record a permanent failure. Sessions that already left the active
    /// states keep their status.
    async fn fail_session(&self, id: &str, reason: String) {
        match self
            .registry
            .transition(id, SessionStatus::Failed, Some(reason))
            .await
        {
            Ok(_) => {}
            Err(SessionError::NotFound { .. }) | Err(SessionError::InvalidTransition { .. }) => {
                tracing::debug!(session_id = %id, "not marking session failed; it has moved on");
            }
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "failed to record session failure");
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────

    /// Cancel in-flight work, close the console and remove the sandbox.
    async fn teardown(&self, session: &Session) -> Result<(), SessionError> {
        let id = session.id.as_str();
        if let Some((_, token)) = self.tokens.remove(id) {
            token.cancel();
        }
        self.streams.close(id).await;

        let Some(driver) = self.drivers.get(session.execution.backend) else {
            tracing::warn!(session_id = %id, backend = session.execution.backend.as_str(), "backend not configured; sandbox left in place");
            return Ok(());
        };
        let handle = Self::handle_of(session);
        if let Err(e) = driver.stop(&handle).await {
            tracing::warn!(session_id = %id, sandbox = %handle, error = %e, "failed to stop sandbox");
        }
        driver.remove(&handle).await?;
        let deterministic = SandboxHandle::new(sandbox_name(id));
        if deterministic != handle {
            driver.remove(&deterministic).await?;
        }
        Ok(())
    }

    /// Teardown for delete and archive. In-flight work is gone by the time
    /// removal can fail, so a failure fails the session; deleting again
    /// finishes the job.
    async fn teardown_or_fail(&self, session: &Session) -> Result<(), SessionError> {
        if let Err(e) = self.teardown(session).await {
            tracing::warn!(session_id = %session.id, error = %e, "teardown interrupted");
            self.fail_session(&session.id, format!("teardown interrupted: {}", e))
                .await;
            return Err(e);
        }
        Ok(())
    }

    fn forget(&self, id: &str) {
        self.lanes.remove(id);
        self.activity.forget(id);
        self.publishing.remove(id);
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self.registry.get(id).await?;
        if !state::can_delete(session.status) {
            return Err(SessionError::NotDeletable {
                id: id.to_string(),
                status: session.status,
            });
        }
        self.teardown_or_fail(&session).await?;
        self.registry.delete(id).await?;
        self.forget(id);
        tracing::info!(session_id = %id, "session deleted");
        Ok(())
    }

    pub async fn archive_session(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.registry.get(id).await?;
        if session.status == SessionStatus::Archived {
            return Ok(session);
        }
        if !state::can_transition(session.status, SessionStatus::Archived) {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                from: session.status,
                to: SessionStatus::Archived,
            });
        }
        self.teardown_or_fail(&session).await?;
        let archived = self
            .registry
            .transition(id, SessionStatus::Archived, None)
            .await?;
        self.forget(id);
        Ok(archived)
    }

    /// Replace an active session's sandbox under the same deterministic
    /// name and put it back on the session branch. The status is kept; a
    /// replacement that cannot be brought up fails the session.
    pub async fn recreate_session(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.registry.get(id).await?;
        if !session.status.is_attachable() {
            return Err(SessionError::NotActive {
                id: id.to_string(),
                status: session.status,
            });
        }
        let driver = self.driver_for(&session)?;
        tracing::info!(session_id = %id, backend = session.execution.backend.as_str(), "recreating sandbox");

        if let Some((_, token)) = self.tokens.remove(id) {
            token.cancel();
        }
        self.streams.close(id).await;
        let old = Self::handle_of(&session);
        if let Err(e) = driver.stop(&old).await {
            tracing::warn!(session_id = %id, sandbox = %old, error = %e, "failed to stop sandbox");
        }
        driver.remove(&old).await?;

        let cancel = self.token_for(id);
        let mut env = self.settings.sandbox_env.clone();
        env.push(("HARBOR_SESSION_ID".to_string(), id.to_string()));
        let spec = SandboxSpec::for_session(&session, env, self.settings.provision_timeout);
        let handle = match provision_with_retry(driver.as_ref(), &spec, self.settings.retry, &cancel).await {
            Ok(handle) => handle,
            Err(_) if cancel.is_cancelled() => return self.registry.get(id).await,
            Err(e) => {
                self.fail_session(id, format!("recreate failed: {}", e)).await;
                return self.registry.get(id).await;
            }
        };

        let recorded = self
            .registry
            .update(id, |s| {
                if !s.status.is_attachable() {
                    return Err(SessionError::NotActive {
                        id: s.id.clone(),
                        status: s.status,
                    });
                }
                s.backend_handle = Some(handle.name.clone());
                Ok(())
            })
            .await;
        if let Err(e) = recorded {
            Self::discard_sandbox(driver.as_ref(), &handle, id).await;
            return Err(e);
        }

        let exec = SandboxExec::new(
            driver.clone(),
            handle.clone(),
            self.lane_for(id),
            cancel.clone(),
            self.settings.exec_timeout,
        );
        match workflow::restore(&exec, &session.workspace).await {
            Ok(()) => {}
            Err(WorkflowFailure::Cancelled) => {
                Self::discard_sandbox(driver.as_ref(), &handle, id).await;
                return self.registry.get(id).await;
            }
            Err(WorkflowFailure::Failed(e)) => {
                tracing::warn!(session_id = %id, error = %e, "could not restore workspace");
                self.fail_session(id, e.to_string()).await;
                return self.registry.get(id).await;
            }
        }

        self.activity.touch(id);
        if let Err(e) = self.streams.open(id, driver, handle).await {
            tracing::warn!(session_id = %id, error = %e, "could not open console stream");
        }
        tracing::info!(session_id = %id, "sandbox recreated");
        self.registry.get(id).await
    }

    // ── Access / activity ─────────────────────────────────────────────

    pub async fn update_access_mode(&self, id: &str, mode: AccessMode) -> Result<Session, SessionError> {
        self.registry
            .update(id, move |s| {
                if !s.status.is_attachable() {
                    return Err(SessionError::NotActive {
                        id: s.id.clone(),
                        status: s.status,
                    });
                }
                s.access_mode = mode;
                Ok(())
            })
            .await
    }

    /// Record activity reported by the agent. A working agent wakes an idle
    /// session.
    pub async fn report_activity(&self, id: &str, activity: AgentActivity) -> Result<Session, SessionError> {
        if activity != AgentActivity::Idle {
            self.activity.touch(id);
        }
        self.activity.note_activity(id, activity);
        self.registry
            .update(id, move |s| {
                if s.status.is_terminal() {
                    return Ok(());
                }
                s.agent_activity = activity;
                if activity == AgentActivity::Working && s.status == SessionStatus::Idle {
                    s.status = SessionStatus::Running;
                }
                Ok(())
            })
            .await
    }

    async fn set_activity(&self, id: &str, activity: AgentActivity) {
        let result = self
            .registry
            .update(id, move |s| {
                if !s.status.is_terminal() {
                    s.agent_activity = activity;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::debug!(session_id = %id, error = %e, "could not record agent activity");
        }
    }

    // ── Console ───────────────────────────────────────────────────────

    pub async fn attach(&self, id: &str) -> Result<Attachment, SessionError> {
        let session = self.registry.get(id).await?;
        if !session.status.is_attachable() {
            return Err(SessionError::NotAttachable {
                id: id.to_string(),
                status: session.status,
            });
        }
        let driver = self.driver_for(&session)?;
        Ok(self
            .streams
            .attach(id, driver, Self::handle_of(&session))
            .await?)
    }

    /// Apply one console notice. Exit handling asks the backend for the
    /// exit code, so it runs on its own task and the loop stays free for
    /// other sessions.
    async fn handle_notice(self: &Arc<Self>, notice: StreamNotice) {
        match notice {
            StreamNotice::Output { session_id, chunk } => {
                if let Some(activity) = self.activity.record_output(&session_id, &chunk) {
                    self.set_activity(&session_id, activity).await;
                }
            }
            StreamNotice::Input { session_id } => {
                self.activity.touch(&session_id);
                let result = self
                    .registry
                    .update(&session_id, |s| {
                        if s.status == SessionStatus::Idle {
                            s.status = SessionStatus::Running;
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    tracing::debug!(session_id = %session_id, error = %e, "input on a session that is gone");
                }
            }
            StreamNotice::Closed { session_id } => {
                let manager = self.clone();
                tokio::spawn(async move { manager.stream_closed(&session_id).await });
            }
        }
    }

    /// The agent's terminal ended: its exit code decides the outcome.
    async fn stream_closed(&self, id: &str) {
        let Ok(session) = self.registry.get(id).await else {
            return;
        };
        if !session.status.is_attachable() {
            return;
        }
        let Ok(driver) = self.driver_for(&session) else {
            return;
        };
        match driver.exit_status(&Self::handle_of(&session)).await {
            Ok(Some(0)) => {
                if let Err(e) = self
                    .registry
                    .transition(id, SessionStatus::Completed, None)
                    .await
                {
                    tracing::debug!(session_id = %id, error = %e, "could not complete session");
                }
            }
            Ok(Some(code)) => {
                self.fail_session(id, format!("agent exited with code {}", code))
                    .await;
            }
            Ok(None) => {
                tracing::debug!(session_id = %id, "console closed but the agent is still running");
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "could not read agent exit status");
            }
        }
    }

    /// Move sessions that produced no output for the quiet window to Idle.
    pub async fn sweep_idle(&self) {
        for id in self.activity.quiet_sessions(self.settings.quiet_window) {
            let Ok(session) = self.registry.get(&id).await else {
                self.activity.forget(&id);
                continue;
            };
            if session.status != SessionStatus::Running {
                continue;
            }
            let result = self
                .registry
                .compare_and_set(&id, session.version, |s| {
                    s.status = SessionStatus::Idle;
                    s.agent_activity = AgentActivity::Idle;
                    Ok(())
                })
                .await;
            match result {
                Ok(_) => tracing::debug!(session_id = %id, "session idle"),
                Err(SessionError::VersionConflict { .. }) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "idle transition failed"),
            }
        }
    }

    // ── Git / PR ──────────────────────────────────────────────────────

    /// Commit, push and open a PR. A failing step fails the session; the
    /// resulting record is returned either way.
    pub async fn publish(&self, id: &str, message: Option<String>) -> Result<Session, SessionError> {
        let session = self.registry.get(id).await?;
        if !session.status.is_attachable() {
            return Err(SessionError::NotActive {
                id: id.to_string(),
                status: session.status,
            });
        }
        if !self.publishing.insert(id.to_string()) {
            return Err(SessionError::InvalidRequest(
                "a publish is already running for this session".to_string(),
            ));
        }
        let result = self.run_publish(&session, message.as_deref()).await;
        self.publishing.remove(id);
        result
    }

    async fn run_publish(&self, session: &Session, message: Option<&str>) -> Result<Session, SessionError> {
        let id = session.id.as_str();
        let exec = self.exec_for(session)?;
        match workflow::publish(&exec, session, &self.settings.git, message).await {
            Ok(outcome) => match outcome.opened {
                Some(pr) => {
                    self.registry
                        .update(id, move |s| {
                            if s.pr.is_none() {
                                s.pr = Some(pr);
                            }
                            Ok(())
                        })
                        .await
                }
                None => self.registry.get(id).await,
            },
            Err(WorkflowFailure::Cancelled) => self.registry.get(id).await,
            Err(WorkflowFailure::Failed(e)) => {
                tracing::warn!(session_id = %id, error = %e, "publish failed");
                self.fail_session(id, e.to_string()).await;
                self.registry.get(id).await
            }
        }
    }

    /// Apply an observed PR state. The only writer of PR check fields.
    pub async fn record_pr_status(&self, id: &str, report: &PrStatusReport) -> Result<Session, SessionError> {
        let status = summarize_pr_status(report);
        let review = report.review();
        self.registry
            .update(id, move |s| {
                let active = s.status.is_attachable();
                let Some(pr) = s.pr.as_mut() else {
                    return Err(SessionError::InvalidRequest(
                        "session has no pull request".to_string(),
                    ));
                };
                if pr.check_status == CheckStatus::Merged {
                    return Ok(());
                }
                pr.check_status = status;
                pr.review_decision = review;
                if status == CheckStatus::Merged && active {
                    s.status = SessionStatus::Completed;
                }
                Ok(())
            })
            .await
    }

    /// Poll the PR inside the sandbox and record what was seen.
    pub async fn refresh_pr_status(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.registry.get(id).await?;
        let Some(pr) = session.pr.as_ref() else {
            return Err(SessionError::InvalidRequest(
                "session has no pull request".to_string(),
            ));
        };
        let exec = self.exec_for(&session)?;
        let report = workflow::fetch_pr_status(&exec, &pr.url)
            .await
            .map_err(|e| MergeError::RemoteError(e.to_string()))?;
        self.record_pr_status(id, &report).await
    }

    /// Link a PR opened outside `publish`, such as one the agent opened
    /// from its terminal. A session that already has a PR is returned as is.
    pub async fn discover_pr(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.registry.get(id).await?;
        if session.pr.is_some() {
            return Ok(session);
        }
        if !session.status.is_attachable() {
            return Err(SessionError::NotActive {
                id: id.to_string(),
                status: session.status,
            });
        }
        let exec = self.exec_for(&session)?;
        let found = workflow::discover_pr(&exec, &session)
            .await
            .map_err(|e| MergeError::RemoteError(e.to_string()))?;
        match found {
            Some(pr) => {
                self.registry
                    .update(id, move |s| {
                        if s.pr.is_none() {
                            s.pr = Some(pr);
                        }
                        Ok(())
                    })
                    .await
            }
            None => Ok(session),
        }
    }

    pub async fn merge(
        &self,
        id: &str,
        method: Option<MergeMethod>,
        delete_branch: Option<bool>,
    ) -> Result<Session, SessionError> {
        let session = self.registry.get(id).await?;
        let pr = match &session.pr {
            Some(pr) if pr.check_status == CheckStatus::Mergeable => pr.clone(),
            _ => {
                return Err(MergeError::NotMergeable {
                    status: session.check_status(),
                }
                .into());
            }
        };
        if !session.status.is_attachable() {
            return Err(SessionError::NotActive {
                id: id.to_string(),
                status: session.status,
            });
        }
        let method = method
            .or(pr.default_merge_method)
            .unwrap_or(MergeMethod::Merge);
        if !pr.merge_methods.is_empty() && !pr.merge_methods.contains(&method) {
            return Err(MergeError::MethodNotAllowed { method }.into());
        }
        let delete_branch = delete_branch.unwrap_or(pr.delete_branch_on_merge);

        let exec = self.exec_for(&session)?;
        let report = workflow::fetch_pr_status(&exec, &pr.url)
            .await
            .map_err(|e| MergeError::RemoteError(e.to_string()))?;
        let observed = self.record_pr_status(id, &report).await?;
        if report.is_conflicting() {
            return Err(MergeError::MergeConflict(
                "pull request conflicts with its base branch".to_string(),
            )
            .into());
        }
        match observed.check_status() {
            Some(CheckStatus::Merged) => return Ok(observed),
            Some(CheckStatus::Mergeable) => {}
            status => return Err(MergeError::NotMergeable { status }.into()),
        }

        workflow::merge_pr(&exec, &pr.url, method, delete_branch).await?;
        self.registry
            .update(id, |s| {
                if let Some(pr) = s.pr.as_mut() {
                    pr.check_status = CheckStatus::Merged;
                }
                if s.status.is_attachable() {
                    s.status = SessionStatus::Completed;
                }
                Ok(())
            })
            .await
    }

    // ── Startup / background ──────────────────────────────────────────

    /// Bring persisted sessions in line with what the backends report.
    /// Returns how many sessions were marked failed.
    pub async fn reconcile(&self) -> Result<usize, SessionError> {
        let mut failed = 0;
        for session in self.registry.list().await? {
            let id = session.id.as_str();
            match session.status {
                SessionStatus::Creating => {
                    self.fail_session(id, "interrupted by restart".to_string())
                        .await;
                    failed += 1;
                    if let Some(driver) = self.drivers.get(session.execution.backend) {
                        if let Err(e) = driver.remove(&Self::handle_of(&session)).await {
                            tracing::warn!(session_id = %id, error = %e, "failed to remove interrupted sandbox");
                        }
                    }
                }
                SessionStatus::Running | SessionStatus::Idle => {
                    let Some(driver) = self.drivers.get(session.execution.backend) else {
                        self.fail_session(
                            id,
                            format!("backend {} is not configured", session.execution.backend.as_str()),
                        )
                        .await;
                        failed += 1;
                        continue;
                    };
                    let handle = Self::handle_of(&session);
                    match driver.exists(&handle).await {
                        Ok(true) => {
                            self.activity.touch(id);
                            if let Err(e) = self.streams.open(id, driver, handle).await {
                                tracing::warn!(session_id = %id, error = %e, "could not reopen console stream");
                            }
                        }
                        Ok(false) => {
                            self.fail_session(id, "sandbox no longer exists".to_string())
                                .await;
                            failed += 1;
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %id, error = %e, "could not check sandbox; leaving session as is");
                        }
                    }
                }
                _ => {}
            }
        }
        tracing::info!(failed, "reconciled sessions");
        Ok(failed)
    }

    /// Spawn the notice loop, the idle sweeper and the PR poller. All stop
    /// when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let receiver = self.notices.lock().ok().and_then(|mut slot| slot.take());
        match receiver {
            Some(mut notices) => {
                let manager = self.clone();
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            notice = notices.recv() => match notice {
                                Some(notice) => manager.handle_notice(notice).await,
                                None => break,
                            },
                        }
                    }
                }));
            }
            None => tracing::warn!("session manager already started"),
        }

        let manager = self.clone();
        let sweep_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(activity::sweep_interval(manager.settings.quiet_window));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = interval.tick() => manager.sweep_idle().await,
                }
            }
        }));

        let poller = PrPoller::new(self.clone(), self.settings.poll_interval);
        tasks.push(tokio::spawn(poller.run(cancel)));
        tasks
    }

    /// Cancel all in-flight session work. Sandboxes are left running so a
    /// restart can rediscover them.
    pub async fn shutdown(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::backend::{ExecOutput, MockDriver};
    use crate::sessions::db::{DbHandle, SessionDb};
    use crate::sessions::events::EventBus;

    fn harness() -> (Arc<SessionManager>, MockDriver) {
        let driver = MockDriver::new();
        let registry = Arc::new(Registry::new(
            DbHandle::new(SessionDb::new_in_memory().unwrap()),
            EventBus::new(),
        ));
        let settings = ManagerSettings {
            provision_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                retries: 1,
                backoff: Duration::from_millis(10),
            },
            exec_timeout: Duration::from_secs(5),
            ..ManagerSettings::default()
        };
        let manager = SessionManager::new(
            registry,
            Drivers::new().with(Arc::new(driver.clone())),
            settings,
        );
        (manager, driver)
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            repo_url: "https://github.com/acme/widgets.git".into(),
            base_branch: Some("main".into()),
            backend: BackendKind::LocalContainer,
            image: Some("ghcr.io/acme/agent:1".into()),
            resources: None,
            pull_policy: None,
            storage_class: None,
            access_mode: None,
        }
    }

    async fn wait_for(manager: &SessionManager, id: &str, status: SessionStatus) -> Session {
        for _ in 0..200 {
            let session = manager.get_session(id).await.unwrap();
            if session.status == status {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_create_reports_warnings() {
        let (manager, _driver) = harness();
        let mut req = request();
        req.image = None;
        req.storage_class = Some("fast".into());
        req.base_branch = None;

        let created = manager.create_session(req).await.unwrap();
        assert_eq!(created.session.status, SessionStatus::Creating);
        assert_eq!(created.session.execution.image, DEFAULT_IMAGE);
        assert!(created.session.execution.storage_class.is_none());
        assert_eq!(created.session.workspace.base_branch, "main");
        assert_eq!(created.warnings.len(), 3);
        assert!(created.session.workspace.branch_name.starts_with("harbor/widgets-"));
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_rejected() {
        let (manager, _driver) = harness();
        let mut req = request();
        req.backend = BackendKind::ClusterPod;
        let err = manager.create_session(req).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        assert!(manager.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_resources_are_rejected() {
        let (manager, _driver) = harness();
        let mut req = request();
        req.resources = Some(ResourceLimits {
            cpus: 1.0,
            memory: "lots".into(),
        });
        assert!(matches!(
            manager.create_session(req).await,
            Err(SessionError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_provision_reaches_running() {
        let (manager, driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let session = wait_for(&manager, &created.session.id, SessionStatus::Running).await;

        let handle = sandbox_name(&session.id);
        assert_eq!(session.backend_handle.as_deref(), Some(handle.as_str()));
        assert!(driver.is_live(&handle));
        let spec = driver.spec_of(&handle).unwrap();
        assert!(spec.env.iter().any(|(k, v)| k == "HARBOR_SESSION_ID" && v == &session.id));
        assert!(driver
            .exec_commands()
            .iter()
            .any(|c| c.contains("checkout -b harbor/widgets-")));
    }

    #[tokio::test]
    async fn test_provision_failure_marks_failed() {
        let (manager, driver) = harness();
        driver.fail_next_create(crate::errors::ProvisionError::ImagePullFailed {
            image: "ghcr.io/acme/agent:1".into(),
            reason: "manifest unknown".into(),
        });
        let created = manager.create_session(request()).await.unwrap();
        let session = wait_for(&manager, &created.session.id, SessionStatus::Failed).await;
        assert!(session.error.unwrap().contains("manifest unknown"));
        assert_eq!(driver.create_attempts(), 1);
    }

    #[tokio::test]
    async fn test_access_mode_requires_active_session() {
        let (manager, _driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        wait_for(&manager, &id, SessionStatus::Running).await;

        let updated = manager.update_access_mode(&id, AccessMode::ReadOnly).await.unwrap();
        assert_eq!(updated.access_mode, AccessMode::ReadOnly);

        manager.archive_session(&id).await.unwrap();
        assert!(matches!(
            manager.update_access_mode(&id, AccessMode::AllowAll).await,
            Err(SessionError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_archive_tears_down_and_is_idempotent() {
        let (manager, driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        wait_for(&manager, &id, SessionStatus::Running).await;

        let archived = manager.archive_session(&id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Archived);
        assert!(!driver.is_live(&sandbox_name(&id)));
        let again = manager.archive_session(&id).await.unwrap();
        assert_eq!(again.version, archived.version);
        assert!(matches!(
            manager.delete_session(&id).await,
            Err(SessionError::NotDeletable { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_during_provisioning_removes_sandbox() {
        let (manager, driver) = harness();
        driver.set_create_delay(Duration::from_millis(200));
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.delete_session(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(matches!(
            manager.get_session(&id).await,
            Err(SessionError::NotFound { .. })
        ));
        assert!(!driver.is_live(&sandbox_name(&id)));
        assert!(matches!(
            manager.delete_session(&id).await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_teardown_leaves_session_failed_and_retryable() {
        let (manager, driver) = harness();
        driver.set_create_delay(Duration::from_millis(200));
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One for the delete, one for the cancelled create's cleanup.
        driver.fail_next_remove(crate::errors::BackendError::Engine("engine hiccup".into()));
        driver.fail_next_remove(crate::errors::BackendError::Engine("engine hiccup".into()));
        assert!(matches!(
            manager.delete_session(&id).await,
            Err(SessionError::Backend(_))
        ));
        let session = manager.get_session(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.unwrap().starts_with("teardown interrupted"));

        for _ in 0..100 {
            if driver.remove_calls().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.get_session(&id).await.unwrap().status, SessionStatus::Failed);

        manager.delete_session(&id).await.unwrap();
        assert!(matches!(
            manager.get_session(&id).await,
            Err(SessionError::NotFound { .. })
        ));
        assert!(!driver.is_live(&sandbox_name(&id)));
    }

    #[tokio::test]
    async fn test_shutdown_during_prepare_removes_sandbox() {
        let (manager, driver) = harness();
        driver.on_exec_delayed("fetch origin", ExecOutput::default(), Duration::from_secs(30));
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        let name = sandbox_name(&id);

        for _ in 0..200 {
            if driver.exec_commands().iter().any(|c| c.contains("fetch origin")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(driver.is_live(&name));
        manager.shutdown().await;

        for _ in 0..200 {
            if !driver.is_live(&name) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!driver.is_live(&name));
        assert_eq!(driver.removed(), vec![name]);
    }

    #[tokio::test]
    async fn test_slow_exit_status_does_not_delay_other_sessions() {
        let (manager, driver) = harness();
        let cancel = CancellationToken::new();
        let tasks = manager.start(cancel.clone());

        let exiting = manager.create_session(request()).await.unwrap().session.id;
        let idle = manager.create_session(request()).await.unwrap().session.id;
        wait_for(&manager, &exiting, SessionStatus::Running).await;
        wait_for(&manager, &idle, SessionStatus::Running).await;
        manager.registry().transition(&idle, SessionStatus::Idle, None).await.unwrap();

        driver.set_exit_status_delay(Duration::from_secs(3));
        driver.exit(&sandbox_name(&exiting), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager
            .streams()
            .write(&idle, bytes::Bytes::from_static(b"echo wake\n"))
            .await
            .unwrap();
        tokio::time::timeout(
            Duration::from_millis(500),
            wait_for(&manager, &idle, SessionStatus::Running),
        )
        .await
        .expect("input to an idle session waited on another session's exit");

        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }
    }

    #[tokio::test]
    async fn test_recreate_replaces_sandbox_and_keeps_branch() {
        let (manager, driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        let before = wait_for(&manager, &id, SessionStatus::Running).await;
        let name = sandbox_name(&id);

        let session = manager.recreate_session(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.backend_handle.as_deref(), Some(name.as_str()));
        assert_eq!(session.workspace.branch_name, before.workspace.branch_name);
        assert!(session.version > before.version);
        assert_eq!(driver.created(), vec![name.clone(), name.clone()]);
        assert!(driver.is_live(&name));
        assert!(driver
            .exec_commands()
            .iter()
            .any(|c| c.ends_with(&format!("checkout {}", before.workspace.branch_name))));
        assert!(manager.streams().is_open(&id).await);

        manager.archive_session(&id).await.unwrap();
        assert!(matches!(
            manager.recreate_session(&id).await,
            Err(SessionError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_recreate_failure_fails_session() {
        let (manager, driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        wait_for(&manager, &id, SessionStatus::Running).await;

        driver.fail_next_create(crate::errors::ProvisionError::ResourceQuotaExceeded("cpu".into()));
        let session = manager.recreate_session(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.unwrap().starts_with("recreate failed"));
    }

    #[tokio::test]
    async fn test_report_activity_wakes_idle_session() {
        let (manager, _driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        wait_for(&manager, &id, SessionStatus::Running).await;
        manager.registry().transition(&id, SessionStatus::Idle, None).await.unwrap();

        let session = manager.report_activity(&id, AgentActivity::Working).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.agent_activity, AgentActivity::Working);
    }

    #[tokio::test]
    async fn test_record_pr_status_requires_pr_and_is_sticky_when_merged() {
        let (manager, _driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        wait_for(&manager, &id, SessionStatus::Running).await;

        let report = PrStatusReport {
            merged: true,
            ..PrStatusReport::default()
        };
        assert!(matches!(
            manager.record_pr_status(&id, &report).await,
            Err(SessionError::InvalidRequest(_))
        ));

        manager
            .registry()
            .update(&id, |s| {
                s.pr = Some(crate::sessions::models::PullRequest::opened(
                    "https://github.com/acme/widgets/pull/3".into(),
                ));
                Ok(())
            })
            .await
            .unwrap();
        let merged = manager.record_pr_status(&id, &report).await.unwrap();
        assert_eq!(merged.check_status(), Some(CheckStatus::Merged));
        assert_eq!(merged.status, SessionStatus::Completed);

        let later = manager
            .record_pr_status(&id, &PrStatusReport::default())
            .await
            .unwrap();
        assert_eq!(later.check_status(), Some(CheckStatus::Merged));
        assert_eq!(later.version, merged.version);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_session() {
        let (manager, driver) = harness();
        let created = manager.create_session(request()).await.unwrap();
        let id = created.session.id.clone();
        wait_for(&manager, &id, SessionStatus::Running).await;
        driver.on_exec(
            "push -u",
            ExecOutput {
                stdout: String::new(),
                stderr: "remote rejected".into(),
                exit_code: 1,
            },
        );

        let session = manager.publish(&id, None).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        let error = session.error.unwrap();
        assert!(error.starts_with("push failed"));
        assert!(error.contains("stage, commit"));
    }

    #[tokio::test]
    async fn test_reconcile_fails_interrupted_and_missing() {
        let (manager, driver) = harness();
        let registry = manager.registry().clone();

        let first = manager.create_session(request()).await.unwrap().session.id;
        let running = wait_for(&manager, &first, SessionStatus::Running).await;
        driver.remove(&SandboxHandle::new(sandbox_name(&running.id))).await.unwrap();

        let mut stuck = running.clone();
        stuck.id = "stuck".into();
        stuck.status = SessionStatus::Creating;
        stuck.backend_handle = None;
        stuck.workspace.branch_name = "harbor/widgets-stuck".into();
        registry.create(stuck).await.unwrap();

        assert_eq!(manager.reconcile().await.unwrap(), 2);
        let stuck = manager.get_session("stuck").await.unwrap();
        assert_eq!(stuck.status, SessionStatus::Failed);
        assert_eq!(stuck.error.as_deref(), Some("interrupted by restart"));
        let gone = manager.get_session(&first).await.unwrap();
        assert_eq!(gone.status, SessionStatus::Failed);
    }
}
