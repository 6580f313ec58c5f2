//! Git and pull-request steps, executed inside the session sandbox.
//!
//! Every command goes through [`SandboxExec`], which holds the session's
//! exec lane so the workflow, the PR poller and merges never run commands
//! in the same sandbox at once. Each call is raced against the session's
//! cancellation token.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::{BackendError, MergeError, WorkflowError};

use super::backend::{BackendDriver, ExecOutput, SandboxHandle};
use super::github::{self, PrStatusReport, RepoMergeSettings};
use super::models::{MergeMethod, PullRequest, Session, WorkspaceDescriptor, repo_name};

/// Identity used for commits made on the agent's behalf.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GitSettings {
    pub author_name: String,
    pub author_email: String,
    pub commit_message: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            author_name: "Harbor Agent".to_string(),
            author_email: "agent@harbor.local".to_string(),
            commit_message: "Changes from harbor session".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecFailure {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Command(String),
}

/// Command runner bound to one session's sandbox.
#[derive(Clone)]
pub struct SandboxExec {
    driver: Arc<dyn BackendDriver>,
    handle: SandboxHandle,
    lane: Arc<Mutex<()>>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl SandboxExec {
    pub fn new(
        driver: Arc<dyn BackendDriver>,
        handle: SandboxHandle,
        lane: Arc<Mutex<()>>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            driver,
            handle,
            lane,
            cancel,
            timeout,
        }
    }

    pub async fn run(&self, argv: Vec<String>) -> Result<ExecOutput, ExecFailure> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ExecFailure::Cancelled),
            result = async {
                let _lane = self.lane.lock().await;
                tracing::debug!(sandbox = %self.handle, command = %argv.join(" "), "exec");
                self.driver.exec(&self.handle, &argv, self.timeout).await
            } => result.map_err(ExecFailure::from),
        }
    }

    /// Run and require exit code 0.
    pub async fn run_ok(&self, argv: Vec<String>) -> Result<ExecOutput, ExecFailure> {
        let output = self.run(argv).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecFailure::Command(failure_detail(&output)))
        }
    }
}

fn failure_detail(output: &ExecOutput) -> String {
    let detail = output.detail();
    if detail.is_empty() {
        format!("exit code {}", output.exit_code)
    } else {
        detail
    }
}

#[derive(Debug)]
pub enum WorkflowFailure {
    Cancelled,
    Failed(WorkflowError),
}

/// Tracks finished steps so a failure can report how far the run got.
struct Steps<'a> {
    exec: &'a SandboxExec,
    completed: Vec<String>,
}

impl<'a> Steps<'a> {
    fn new(exec: &'a SandboxExec) -> Self {
        Self {
            exec,
            completed: Vec::new(),
        }
    }

    fn fail(&self, step: &str, reason: impl Into<String>) -> WorkflowFailure {
        WorkflowFailure::Failed(WorkflowError {
            step: step.to_string(),
            completed: self.completed.clone(),
            reason: reason.into(),
        })
    }

    fn done(&mut self, step: &str) {
        self.completed.push(step.to_string());
    }

    /// Run one command; `accept` decides whether a non-zero exit still counts
    /// as success.
    async fn run(
        &mut self,
        step: &str,
        argv: Vec<String>,
        accept: impl Fn(&ExecOutput) -> bool,
    ) -> Result<ExecOutput, WorkflowFailure> {
        let output = match self.exec.run(argv).await {
            Ok(output) => output,
            Err(ExecFailure::Cancelled) => return Err(WorkflowFailure::Cancelled),
            Err(e) => return Err(self.fail(step, e.to_string())),
        };
        if output.success() || accept(&output) {
            self.done(step);
            Ok(output)
        } else {
            Err(self.fail(step, failure_detail(&output)))
        }
    }

    async fn run_ok(&mut self, step: &str, argv: Vec<String>) -> Result<ExecOutput, WorkflowFailure> {
        self.run(step, argv, |_| false).await
    }
}

fn git(workdir: &str, args: &[&str]) -> Vec<String> {
    let mut argv = vec!["git".to_string(), "-C".to_string(), workdir.to_string()];
    argv.extend(args.iter().map(|s| s.to_string()));
    argv
}

/// Reject URLs git cannot clone before a sandbox is spent on them.
pub fn validate_repo_url(url: &str) -> Result<(), String> {
    let url = url.trim();
    if url.is_empty() {
        return Err("repository URL is empty".to_string());
    }
    if url.chars().any(char::is_whitespace) {
        return Err(format!("repository URL '{}' contains whitespace", url));
    }
    let scheme_ok = ["https://", "http://", "ssh://", "git://", "file://"]
        .iter()
        .any(|p| url.starts_with(p))
        || (url.starts_with("git@") && url.contains(':'));
    if !scheme_ok {
        return Err(format!("'{}' is not a git URL", url));
    }
    if repo_name(url).is_none() {
        return Err(format!("'{}' does not name a repository", url));
    }
    Ok(())
}

/// Clone the repository into the workdir unless a checkout is already
/// there. Returns whether one was.
async fn ensure_checkout(steps: &mut Steps<'_>, workspace: &WorkspaceDescriptor) -> Result<bool, WorkflowFailure> {
    let workdir = workspace.workdir.as_str();
    let git_dir = format!("{}/.git", workdir);
    let has_checkout = match steps.exec.run(vec!["test".into(), "-d".into(), git_dir]).await {
        Ok(output) => output.success(),
        Err(ExecFailure::Cancelled) => return Err(WorkflowFailure::Cancelled),
        Err(e) => return Err(steps.fail("clone", e.to_string())),
    };
    if !has_checkout {
        steps
            .run_ok(
                "clone",
                vec![
                    "git".into(),
                    "clone".into(),
                    "--branch".into(),
                    workspace.base_branch.clone(),
                    workspace.repo_url.clone(),
                    workdir.into(),
                ],
            )
            .await?;
    }
    Ok(has_checkout)
}

/// Clone the repository when the workdir has none, then cut the session
/// branch from the freshly fetched base.
pub async fn prepare(exec: &SandboxExec, workspace: &WorkspaceDescriptor) -> Result<(), WorkflowFailure> {
    let mut steps = Steps::new(exec);
    let workdir = workspace.workdir.as_str();
    let base = workspace.base_branch.as_str();

    ensure_checkout(&mut steps, workspace).await?;
    steps.run_ok("fetch", git(workdir, &["fetch", "origin", base])).await?;
    steps.run_ok("checkout base", git(workdir, &["checkout", base])).await?;
    steps
        .run_ok(
            "create branch",
            git(workdir, &["checkout", "-b", &workspace.branch_name]),
        )
        .await?;
    tracing::info!(branch = %workspace.branch_name, base, "workspace prepared");
    Ok(())
}

/// Put a replacement sandbox back on the session branch. A surviving local
/// branch wins, then the pushed branch, then a fresh cut from the base.
pub async fn restore(exec: &SandboxExec, workspace: &WorkspaceDescriptor) -> Result<(), WorkflowFailure> {
    let mut steps = Steps::new(exec);
    let workdir = workspace.workdir.as_str();
    let base = workspace.base_branch.as_str();
    let branch = workspace.branch_name.as_str();

    if ensure_checkout(&mut steps, workspace).await? {
        let local = format!("refs/heads/{}", branch);
        let found = steps
            .run("find branch", git(workdir, &["rev-parse", "--verify", "--quiet", &local]), |_| true)
            .await?;
        if found.success() {
            steps.run_ok("checkout branch", git(workdir, &["checkout", branch])).await?;
            tracing::info!(branch, "workspace restored from local branch");
            return Ok(());
        }
    }

    steps.run_ok("fetch", git(workdir, &["fetch", "origin", base])).await?;
    let pushed = steps
        .run("fetch branch", git(workdir, &["fetch", "origin", branch]), |_| true)
        .await?;
    if pushed.success() {
        steps
            .run_ok("checkout branch", git(workdir, &["checkout", "-B", branch, "FETCH_HEAD"]))
            .await?;
        tracing::info!(branch, "workspace restored from pushed branch");
    } else {
        steps.run_ok("checkout base", git(workdir, &["checkout", base])).await?;
        steps
            .run_ok("create branch", git(workdir, &["checkout", "-B", branch]))
            .await?;
        tracing::info!(branch, base, "session branch was never pushed; cut again from base");
    }
    Ok(())
}

/// Result of a publish run. `opened` is set when this run created the PR.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub opened: Option<PullRequest>,
}

/// Commit everything, push the session branch, and open a PR if the session
/// does not have one yet.
pub async fn publish(
    exec: &SandboxExec,
    session: &Session,
    settings: &GitSettings,
    message: Option<&str>,
) -> Result<PublishOutcome, WorkflowFailure> {
    let mut steps = Steps::new(exec);
    let workspace = &session.workspace;
    let workdir = workspace.workdir.as_str();
    let message = message
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(&settings.commit_message);

    steps.run_ok("stage", git(workdir, &["add", "-A"])).await?;

    let name = format!("user.name={}", settings.author_name);
    let email = format!("user.email={}", settings.author_email);
    steps
        .run(
            "commit",
            git(workdir, &["-c", &name, "-c", &email, "commit", "-m", message]),
            |out| {
                let text = format!("{}{}", out.stdout, out.stderr).to_lowercase();
                text.contains("nothing to commit") || text.contains("nothing added to commit")
            },
        )
        .await?;

    steps
        .run_ok(
            "push",
            git(workdir, &["push", "-u", "origin", &workspace.branch_name]),
        )
        .await?;

    if session.pr.is_some() {
        return Ok(PublishOutcome::default());
    }

    let slug = match github::repo_slug(&workspace.repo_url) {
        Some(slug) => slug,
        None => {
            let output = steps
                .run_ok("resolve repository", github::repo_view_command(&workspace.repo_url))
                .await?;
            github::parse_repo_slug(&output.stdout).map_err(|e| steps.fail("resolve repository", e))?
        }
    };

    let title = message.lines().next().unwrap_or(message);
    let body = format!(
        "Opened from harbor session `{}`.\n\nBranch `{}` based on `{}`.",
        session.id, workspace.branch_name, workspace.base_branch
    );
    let output = steps
        .run_ok(
            "open pull request",
            github::pr_create_command(&slug, &workspace.base_branch, &workspace.branch_name, title, &body),
        )
        .await?;
    let url = github::parse_pr_url(&output.stdout)
        .ok_or_else(|| steps.fail("open pull request", "gh pr create printed no pull request URL"))?;

    let mut pr = PullRequest::opened(url);
    match fetch_merge_settings(exec, &slug).await {
        Ok(repo) => {
            pr.merge_methods = repo.methods();
            pr.default_merge_method = repo.default_method();
            pr.delete_branch_on_merge = repo.delete_branch_on_merge;
        }
        Err(ExecFailure::Cancelled) => return Err(WorkflowFailure::Cancelled),
        Err(e) => {
            tracing::warn!(session_id = %session.id, repo = %slug, error = %e, "could not read merge settings; merge methods unknown");
        }
    }
    tracing::info!(session_id = %session.id, url = %pr.url, "pull request opened");
    Ok(PublishOutcome { opened: Some(pr) })
}

/// Look for an open PR whose head is the session branch, e.g. one the agent
/// opened itself. Merge settings are filled in when they can be read.
pub async fn discover_pr(exec: &SandboxExec, session: &Session) -> Result<Option<PullRequest>, ExecFailure> {
    let workspace = &session.workspace;
    let slug = github::repo_slug(&workspace.repo_url);
    let repo = slug.as_deref().unwrap_or(&workspace.repo_url);
    let output = exec
        .run_ok(github::pr_list_command(repo, &workspace.branch_name))
        .await?;
    let Some(url) = github::parse_pr_list(&output.stdout).map_err(ExecFailure::Command)? else {
        return Ok(None);
    };

    let mut pr = PullRequest::opened(url);
    if let Some(slug) = slug.or_else(|| github::pr_repo_slug(&pr.url)) {
        match fetch_merge_settings(exec, &slug).await {
            Ok(repo) => {
                pr.merge_methods = repo.methods();
                pr.default_merge_method = repo.default_method();
                pr.delete_branch_on_merge = repo.delete_branch_on_merge;
            }
            Err(ExecFailure::Cancelled) => return Err(ExecFailure::Cancelled),
            Err(e) => {
                tracing::warn!(session_id = %session.id, repo = %slug, error = %e, "could not read merge settings; merge methods unknown");
            }
        }
    }
    tracing::info!(session_id = %session.id, branch = %workspace.branch_name, url = %pr.url, "discovered pull request");
    Ok(Some(pr))
}

async fn fetch_merge_settings(exec: &SandboxExec, slug: &str) -> Result<RepoMergeSettings, ExecFailure> {
    let output = exec.run_ok(github::repo_api_command(slug)).await?;
    RepoMergeSettings::parse(&output.stdout).map_err(ExecFailure::Command)
}

/// Observe the PR's checks, review decision and merge state.
pub async fn fetch_pr_status(exec: &SandboxExec, pr_url: &str) -> Result<PrStatusReport, ExecFailure> {
    let checks_output = exec.run(github::pr_checks_command(pr_url)).await?;
    let checks = github::parse_checks(&checks_output).map_err(ExecFailure::Command)?;
    let view = exec.run_ok(github::pr_view_command(pr_url)).await?;
    github::parse_pr_view(&view.stdout, checks).map_err(ExecFailure::Command)
}

/// Merge the PR with `gh pr merge`.
pub async fn merge_pr(
    exec: &SandboxExec,
    pr_url: &str,
    method: MergeMethod,
    delete_branch: bool,
) -> Result<(), MergeError> {
    let output = exec
        .run(github::pr_merge_command(pr_url, method, delete_branch))
        .await
        .map_err(|e| match e {
            ExecFailure::Cancelled => MergeError::RemoteError("merge cancelled".to_string()),
            other => MergeError::RemoteError(other.to_string()),
        })?;
    if output.success() {
        tracing::info!(url = pr_url, method = method.as_str(), delete_branch, "pull request merged");
        Ok(())
    } else {
        Err(github::classify_merge_failure(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::backend::{MockDriver, SandboxSpec};
    use crate::sessions::models::*;

    fn session() -> Session {
        Session::new(
            "0a1b2c3d-0000-4000-8000-000000000000".into(),
            "widgets-0a1b2c3d".into(),
            ExecutionDescriptor {
                backend: BackendKind::LocalContainer,
                image: "img".into(),
                resources: ResourceLimits::default(),
                pull_policy: PullPolicy::Never,
                storage_class: None,
            },
            WorkspaceDescriptor {
                repo_url: "https://github.com/acme/widgets.git".into(),
                base_branch: "main".into(),
                branch_name: "harbor/widgets-0a1b2c3d".into(),
                workdir: "/workspace".into(),
            },
            AccessMode::Ask,
        )
    }

    fn out(stdout: &str, stderr: &str, code: i64) -> ExecOutput {
        ExecOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: code,
        }
    }

    async fn setup() -> (MockDriver, SandboxExec, Session, CancellationToken) {
        let driver = MockDriver::new();
        let session = session();
        let spec = SandboxSpec::for_session(&session, vec![], Duration::from_secs(5));
        let handle = driver.create(&spec).await.unwrap();
        let cancel = CancellationToken::new();
        let exec = SandboxExec::new(
            Arc::new(driver.clone()),
            handle,
            Arc::new(Mutex::new(())),
            cancel.clone(),
            Duration::from_secs(5),
        );
        (driver, exec, session, cancel)
    }

    #[test]
    fn test_validate_repo_url() {
        assert!(validate_repo_url("https://github.com/acme/widgets.git").is_ok());
        assert!(validate_repo_url("git@github.com:acme/widgets.git").is_ok());
        assert!(validate_repo_url("file:///srv/git/widgets").is_ok());
        assert!(validate_repo_url("").is_err());
        assert!(validate_repo_url("not a url").is_err());
        assert!(validate_repo_url("widgets").is_err());
        assert!(validate_repo_url("https://").is_err());
    }

    #[tokio::test]
    async fn test_prepare_clones_when_workdir_is_empty() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("test -d", out("", "", 1));

        prepare(&exec, &session.workspace).await.unwrap();

        let commands = driver.exec_commands();
        assert_eq!(commands[0], "test -d /workspace/.git");
        assert_eq!(
            commands[1],
            "git clone --branch main https://github.com/acme/widgets.git /workspace"
        );
        assert_eq!(commands[2], "git -C /workspace fetch origin main");
        assert_eq!(commands[3], "git -C /workspace checkout main");
        assert_eq!(
            commands[4],
            "git -C /workspace checkout -b harbor/widgets-0a1b2c3d"
        );
    }

    #[tokio::test]
    async fn test_prepare_reuses_existing_checkout() {
        let (driver, exec, session, _) = setup().await;
        prepare(&exec, &session.workspace).await.unwrap();
        assert!(!driver.exec_commands().iter().any(|c| c.contains("clone")));
    }

    #[tokio::test]
    async fn test_prepare_failure_reports_step() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("test -d", out("", "", 1));
        driver.on_exec("git clone", out("", "fatal: repository not found", 128));

        match prepare(&exec, &session.workspace).await {
            Err(WorkflowFailure::Failed(err)) => {
                assert_eq!(err.step, "clone");
                assert!(err.completed.is_empty());
                assert!(err.reason.contains("repository not found"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restore_prefers_surviving_local_branch() {
        let (driver, exec, session, _) = setup().await;
        restore(&exec, &session.workspace).await.unwrap();
        assert_eq!(
            driver.exec_commands(),
            vec![
                "test -d /workspace/.git",
                "git -C /workspace rev-parse --verify --quiet refs/heads/harbor/widgets-0a1b2c3d",
                "git -C /workspace checkout harbor/widgets-0a1b2c3d",
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_fresh_sandbox_tracks_pushed_branch() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("test -d", out("", "", 1));

        restore(&exec, &session.workspace).await.unwrap();
        let commands = driver.exec_commands();
        assert!(commands[1].starts_with("git clone --branch main"));
        assert_eq!(commands[2], "git -C /workspace fetch origin main");
        assert_eq!(commands[3], "git -C /workspace fetch origin harbor/widgets-0a1b2c3d");
        assert_eq!(
            commands[4],
            "git -C /workspace checkout -B harbor/widgets-0a1b2c3d FETCH_HEAD"
        );
        assert_eq!(commands.len(), 5);
    }

    #[tokio::test]
    async fn test_restore_unpushed_branch_is_cut_from_base() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("test -d", out("", "", 1));
        driver.on_exec(
            "fetch origin harbor/",
            out("", "fatal: couldn't find remote ref harbor/widgets-0a1b2c3d", 128),
        );

        restore(&exec, &session.workspace).await.unwrap();
        let commands = driver.exec_commands();
        assert_eq!(commands[4], "git -C /workspace checkout main");
        assert_eq!(commands[5], "git -C /workspace checkout -B harbor/widgets-0a1b2c3d");
    }

    #[tokio::test]
    async fn test_discover_pr_finds_agent_opened_pr() {
        let (driver, exec, session, _) = setup().await;
        assert!(discover_pr(&exec, &session).await.unwrap().is_none());

        driver.on_exec(
            "gh pr list",
            out(r#"[{"number":12,"url":"https://github.com/acme/widgets/pull/12"}]"#, "", 0),
        );
        driver.on_exec(
            "gh api repos/acme/widgets",
            out(r#"{"allow_merge_commit":false,"allow_squash_merge":true,"allow_rebase_merge":false}"#, "", 0),
        );

        let pr = discover_pr(&exec, &session).await.unwrap().unwrap();
        assert_eq!(pr.url, "https://github.com/acme/widgets/pull/12");
        assert_eq!(pr.merge_methods, vec![MergeMethod::Squash]);
        assert!(driver.exec_commands().iter().any(|c| {
            c.starts_with("gh pr list --repo acme/widgets --head harbor/widgets-0a1b2c3d")
        }));
    }

    #[tokio::test]
    async fn test_discover_pr_surfaces_gh_failure() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("gh pr list", out("", "HTTP 401: Bad credentials", 1));
        assert!(matches!(
            discover_pr(&exec, &session).await,
            Err(ExecFailure::Command(msg)) if msg.contains("401")
        ));
    }

    #[tokio::test]
    async fn test_publish_opens_pull_request() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("gh pr create", out("https://github.com/acme/widgets/pull/7\n", "", 0));
        driver.on_exec(
            "gh api repos/acme/widgets",
            out(r#"{"allow_merge_commit":true,"allow_squash_merge":true,"allow_rebase_merge":false,"delete_branch_on_merge":true}"#, "", 0),
        );

        let outcome = publish(&exec, &session, &GitSettings::default(), Some("Add widgets"))
            .await
            .unwrap();
        let pr = outcome.opened.unwrap();
        assert_eq!(pr.url, "https://github.com/acme/widgets/pull/7");
        assert_eq!(pr.check_status, CheckStatus::Pending);
        assert_eq!(pr.merge_methods, vec![MergeMethod::Merge, MergeMethod::Squash]);
        assert_eq!(pr.default_merge_method, Some(MergeMethod::Merge));
        assert!(pr.delete_branch_on_merge);

        let commands = driver.exec_commands();
        assert!(commands.iter().any(|c| c.contains("commit -m Add widgets")));
        assert!(commands.iter().any(|c| c.ends_with("push -u origin harbor/widgets-0a1b2c3d")));
        assert!(commands.iter().any(|c| c.contains("--repo acme/widgets --base main")));
    }

    #[tokio::test]
    async fn test_publish_nothing_to_commit_is_fine() {
        let (driver, exec, mut session, _) = setup().await;
        session.pr = Some(PullRequest::opened("https://github.com/acme/widgets/pull/7".into()));
        driver.on_exec("commit -m", out("nothing to commit, working tree clean", "", 1));

        let outcome = publish(&exec, &session, &GitSettings::default(), None).await.unwrap();
        assert!(outcome.opened.is_none());
        assert!(!driver.exec_commands().iter().any(|c| c.contains("gh pr create")));
    }

    #[tokio::test]
    async fn test_publish_push_failure_lists_completed_steps() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec("push -u", out("", "! [remote rejected] (permission denied)", 1));

        match publish(&exec, &session, &GitSettings::default(), None).await {
            Err(WorkflowFailure::Failed(err)) => {
                assert_eq!(err.step, "push");
                assert_eq!(err.completed, vec!["stage".to_string(), "commit".to_string()]);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_timeout_is_a_step_failure() {
        let (driver, exec, session, _) = setup().await;
        driver.on_exec_delayed("push -u", out("", "", 0), Duration::from_secs(60));
        let exec = SandboxExec {
            timeout: Duration::from_millis(50),
            ..exec
        };

        match publish(&exec, &session, &GitSettings::default(), None).await {
            Err(WorkflowFailure::Failed(err)) => {
                assert_eq!(err.step, "push");
                assert!(err.reason.contains("timed out"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_step() {
        let (driver, exec, session, cancel) = setup().await;
        driver.on_exec_delayed("push -u", out("", "", 0), Duration::from_secs(60));

        let task = tokio::spawn({
            let exec = exec.clone();
            async move { publish(&exec, &session, &GitSettings::default(), None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WorkflowFailure::Cancelled)));
    }

    #[tokio::test]
    async fn test_fetch_pr_status_combines_checks_and_view() {
        let (driver, exec, _, _) = setup().await;
        driver.on_exec("gh pr checks", out(r#"[{"name":"build","state":"SUCCESS"}]"#, "", 0));
        driver.on_exec(
            "gh pr view",
            out(r#"{"state":"OPEN","reviewDecision":"APPROVED","mergeable":"MERGEABLE"}"#, "", 0),
        );

        let report = fetch_pr_status(&exec, "https://github.com/acme/widgets/pull/7")
            .await
            .unwrap();
        assert_eq!(github::summarize_pr_status(&report), CheckStatus::Mergeable);
    }

    #[tokio::test]
    async fn test_merge_pr_classifies_failures() {
        let (driver, exec, _, _) = setup().await;
        let url = "https://github.com/acme/widgets/pull/7";
        assert!(merge_pr(&exec, url, MergeMethod::Squash, false).await.is_ok());

        driver.on_exec("gh pr merge", out("", "merge conflict between base and head", 1));
        assert!(matches!(
            merge_pr(&exec, url, MergeMethod::Squash, false).await,
            Err(MergeError::MergeConflict(_))
        ));

        driver.on_exec("gh pr merge", out("", "HTTP 500", 1));
        assert!(matches!(
            merge_pr(&exec, url, MergeMethod::Squash, false).await,
            Err(MergeError::RemoteError(_))
        ));
    }
}
