//! GitHub plumbing over the `gh` CLI: command lines, output parsing, and
//! the mapping from raw check/review state to a session's `CheckStatus`.
//!
//! Nothing here runs a process. The workflow executes these command lines
//! inside the session sandbox and hands the output back for parsing.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::MergeError;

use super::backend::ExecOutput;
use super::models::{CheckStatus, MergeMethod, ReviewDecision};

static PR_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://\S+/pull/\d+").unwrap());

const FAILING_STATES: &[&str] = &[
    "FAILURE",
    "CANCELLED",
    "ERROR",
    "TIMED_OUT",
    "ACTION_REQUIRED",
    "STARTUP_FAILURE",
];
const PASSED_STATES: &[&str] = &["SUCCESS", "SKIPPED", "NEUTRAL"];

/// One CI check as reported by `gh pr checks --json name,state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRun {
    pub name: String,
    pub state: String,
}

/// Observed PR state, from the poller or the status webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrStatusReport {
    #[serde(default)]
    pub checks: Vec<CheckRun>,
    #[serde(default, alias = "reviewDecision")]
    pub review_decision: Option<String>,
    #[serde(default)]
    pub mergeable: Option<String>,
    #[serde(default)]
    pub merged: bool,
}

impl PrStatusReport {
    pub fn review(&self) -> Option<ReviewDecision> {
        self.review_decision
            .as_deref()
            .and_then(|r| ReviewDecision::from_github(&r.to_uppercase()))
    }

    pub fn is_conflicting(&self) -> bool {
        self.mergeable
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("conflicting"))
    }
}

/// Collapse a report into the session's check status.
pub fn summarize_pr_status(report: &PrStatusReport) -> CheckStatus {
    if report.merged {
        return CheckStatus::Merged;
    }

    let states: Vec<String> = report.checks.iter().map(|c| c.state.to_uppercase()).collect();
    if states.iter().any(|s| FAILING_STATES.contains(&s.as_str())) {
        return CheckStatus::Failing;
    }
    if states.is_empty() || states.iter().any(|s| !PASSED_STATES.contains(&s.as_str())) {
        return CheckStatus::Pending;
    }

    let review_ok = match report.review_decision.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(_) => report.review() == Some(ReviewDecision::Approved),
    };
    if review_ok && !report.is_conflicting() {
        CheckStatus::Mergeable
    } else {
        CheckStatus::Passing
    }
}

// ── Output parsing ────────────────────────────────────────────────────

/// First PR URL printed by `gh pr create`.
pub fn parse_pr_url(stdout: &str) -> Option<String> {
    PR_URL_REGEX.find(stdout).map(|m| m.as_str().to_string())
}

/// Parse `gh pr checks --json name,state`. The command exits 8 while checks
/// are pending and 1 when some failed, so those codes still carry a result.
pub fn parse_checks(output: &ExecOutput) -> Result<Vec<CheckRun>, String> {
    let combined = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
    if combined.contains("no checks reported") {
        return Ok(Vec::new());
    }
    if !matches!(output.exit_code, 0 | 1 | 8) {
        return Err(output.detail());
    }
    let stdout = output.stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(stdout).map_err(|e| format!("unexpected gh pr checks output: {}", e))
}

#[derive(Debug, Clone, Deserialize)]
struct PrView {
    #[serde(default)]
    state: String,
    #[serde(default, rename = "reviewDecision")]
    review_decision: Option<String>,
    #[serde(default)]
    mergeable: Option<String>,
}

/// Combine `gh pr view --json state,reviewDecision,mergeable` with the
/// parsed checks into one report.
pub fn parse_pr_view(stdout: &str, checks: Vec<CheckRun>) -> Result<PrStatusReport, String> {
    let view: PrView = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("unexpected gh pr view output: {}", e))?;
    Ok(PrStatusReport {
        checks,
        review_decision: view.review_decision.filter(|r| !r.is_empty()),
        mergeable: view.mergeable,
        merged: view.state.eq_ignore_ascii_case("merged"),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct PrListEntry {
    url: String,
}

/// URL of the first PR in `gh pr list --json number,url` output.
pub fn parse_pr_list(stdout: &str) -> Result<Option<String>, String> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(None);
    }
    let entries: Vec<PrListEntry> =
        serde_json::from_str(stdout).map_err(|e| format!("unexpected gh pr list output: {}", e))?;
    Ok(entries.into_iter().next().map(|e| e.url))
}

/// `owner/name` from a github.com pull request URL.
pub fn pr_repo_slug(pr_url: &str) -> Option<String> {
    let (repo, _) = pr_url.split_once("/pull/")?;
    repo_slug(repo)
}

#[derive(Debug, Clone, Deserialize)]
struct RepoOwner {
    login: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RepoView {
    owner: RepoOwner,
    name: String,
}

/// `owner/name` for a GitHub clone URL, or `None` for other hosts.
pub fn repo_slug(repo_url: &str) -> Option<String> {
    let url = repo_url.trim().trim_end_matches('/').trim_end_matches(".git");
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("ssh://git@"))
        .or_else(|| url.strip_prefix("git@"))?;
    let (host, path) = rest.split_once(['/', ':'])?;
    if !host.ends_with("github.com") {
        return None;
    }
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(format!("{}/{}", owner, name))
}

/// `owner/name` from `gh repo view --json owner,name`.
pub fn parse_repo_slug(stdout: &str) -> Result<String, String> {
    let view: RepoView = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("unexpected gh repo view output: {}", e))?;
    Ok(format!("{}/{}", view.owner.login, view.name))
}

/// Merge settings from `gh api repos/<owner>/<name>`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RepoMergeSettings {
    #[serde(default)]
    pub allow_merge_commit: bool,
    #[serde(default)]
    pub allow_squash_merge: bool,
    #[serde(default)]
    pub allow_rebase_merge: bool,
    #[serde(default)]
    pub delete_branch_on_merge: bool,
}

impl RepoMergeSettings {
    pub fn parse(stdout: &str) -> Result<Self, String> {
        serde_json::from_str(stdout.trim()).map_err(|e| format!("unexpected gh api output: {}", e))
    }

    pub fn methods(&self) -> Vec<MergeMethod> {
        let mut methods = Vec::new();
        if self.allow_merge_commit {
            methods.push(MergeMethod::Merge);
        }
        if self.allow_squash_merge {
            methods.push(MergeMethod::Squash);
        }
        if self.allow_rebase_merge {
            methods.push(MergeMethod::Rebase);
        }
        methods
    }

    pub fn default_method(&self) -> Option<MergeMethod> {
        self.methods().first().copied()
    }
}

/// Map a failed `gh pr merge` to a merge error.
pub fn classify_merge_failure(output: &ExecOutput) -> MergeError {
    let detail = output.detail();
    let lower = detail.to_lowercase();
    if lower.contains("conflict") || lower.contains("not mergeable") {
        MergeError::MergeConflict(detail)
    } else {
        MergeError::RemoteError(detail)
    }
}

// ── Command lines ─────────────────────────────────────────────────────

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn pr_create_command(repo: &str, base: &str, head: &str, title: &str, body: &str) -> Vec<String> {
    argv(&[
        "gh", "pr", "create", "--repo", repo, "--base", base, "--head", head, "--title", title,
        "--body", body,
    ])
}

/// Open PRs whose head is `branch`, newest first.
pub fn pr_list_command(repo: &str, branch: &str) -> Vec<String> {
    argv(&[
        "gh", "pr", "list", "--repo", repo, "--head", branch, "--json", "number,url", "--limit", "1",
    ])
}

pub fn pr_checks_command(pr_url: &str) -> Vec<String> {
    argv(&["gh", "pr", "checks", pr_url, "--json", "name,state"])
}

pub fn pr_view_command(pr_url: &str) -> Vec<String> {
    argv(&["gh", "pr", "view", pr_url, "--json", "state,reviewDecision,mergeable"])
}

pub fn pr_merge_command(pr_url: &str, method: MergeMethod, delete_branch: bool) -> Vec<String> {
    let mut cmd = argv(&["gh", "pr", "merge", pr_url, method.gh_flag()]);
    if delete_branch {
        cmd.push("--delete-branch".to_string());
    }
    cmd
}

pub fn repo_view_command(repo_url: &str) -> Vec<String> {
    argv(&["gh", "repo", "view", repo_url, "--json", "owner,name"])
}

pub fn repo_api_command(slug: &str) -> Vec<String> {
    vec!["gh".to_string(), "api".to_string(), format!("repos/{}", slug)]
}
