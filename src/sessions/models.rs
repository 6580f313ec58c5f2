use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Session status ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Running,
    Idle,
    Completed,
    Failed,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    /// Completed, Failed and Archived accept no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Archived)
    }

    /// Only a live sandbox can have consoles attached.
    pub fn is_attachable(&self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "idle" => Ok(Self::Idle),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

// ── Execution descriptor ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LocalContainer,
    ClusterPod,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalContainer => "local_container",
            Self::ClusterPod => "cluster_pod",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_container" | "docker" => Ok(Self::LocalContainer),
            "cluster_pod" | "kubernetes" | "k8s" => Ok(Self::ClusterPod),
            _ => Err(format!("Invalid backend kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::IfNotPresent => "if_not_present",
            Self::Never => "never",
        }
    }

    /// Spelling used by the Kubernetes pod spec.
    pub fn as_k8s(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "if_not_present" => Ok(Self::IfNotPresent),
            "never" => Ok(Self::Never),
            _ => Err(format!("Invalid pull policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub cpus: f64,
    /// Docker-style size string: "4g", "512m", "1048576".
    pub memory: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 2.0,
            memory: "4g".to_string(),
        }
    }
}

impl ResourceLimits {
    /// Memory limit in bytes, or `None` when the string does not parse.
    pub fn memory_bytes(&self) -> Option<i64> {
        let raw = self.memory.trim().to_lowercase();
        let raw = raw.trim_end_matches('b');
        let (digits, multiplier) = match raw.chars().last()? {
            'k' => (&raw[..raw.len() - 1], 1024_i64),
            'm' => (&raw[..raw.len() - 1], 1024 * 1024),
            'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
            c if c.is_ascii_digit() => (raw, 1),
            _ => return None,
        };
        let value: f64 = digits.trim().parse().ok()?;
        if value <= 0.0 {
            return None;
        }
        Some((value * multiplier as f64) as i64)
    }

    /// Memory limit as a Kubernetes quantity ("4g" becomes "4Gi").
    pub fn k8s_memory(&self) -> String {
        let raw = self.memory.trim();
        match raw.chars().last() {
            Some('g' | 'G') => format!("{}Gi", &raw[..raw.len() - 1]),
            Some('m' | 'M') => format!("{}Mi", &raw[..raw.len() - 1]),
            Some('k' | 'K') => format!("{}Ki", &raw[..raw.len() - 1]),
            _ => raw.to_string(),
        }
    }

    /// CPU limit in the nano-CPU units the Docker API expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionDescriptor {
    pub backend: BackendKind,
    pub image: String,
    pub resources: ResourceLimits,
    pub pull_policy: PullPolicy,
    /// Storage class hint for the workspace volume. Cluster pods only.
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceDescriptor {
    pub repo_url: String,
    pub base_branch: String,
    pub branch_name: String,
    pub workdir: String,
}

// ── Access / activity ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Ask,
    AllowAll,
    ReadOnly,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ask => "ask",
            Self::AllowAll => "allow_all",
            Self::ReadOnly => "read_only",
        }
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(Self::Ask),
            "allow_all" => Ok(Self::AllowAll),
            "read_only" => Ok(Self::ReadOnly),
            _ => Err(format!("Invalid access mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    #[default]
    Unknown,
    Working,
    WaitingApproval,
    WaitingInput,
    Idle,
}

impl AgentActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Working => "working",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingInput => "waiting_input",
            Self::Idle => "idle",
        }
    }
}

impl FromStr for AgentActivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "working" => Ok(Self::Working),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "waiting_input" => Ok(Self::WaitingInput),
            "idle" => Ok(Self::Idle),
            _ => Err(format!("Invalid agent activity: {}", s)),
        }
    }
}

// ── Pull request / CI ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Passing,
    Failing,
    Mergeable,
    Merged,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passing => "passing",
            Self::Failing => "failing",
            Self::Mergeable => "mergeable",
            Self::Merged => "merged",
        }
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "passing" => Ok(Self::Passing),
            "failing" => Ok(Self::Failing),
            "mergeable" => Ok(Self::Mergeable),
            "merged" => Ok(Self::Merged),
            _ => Err(format!("Invalid check status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
}

impl ReviewDecision {
    /// Parse GitHub's `reviewDecision` field. An empty string means the
    /// repository does not require review.
    pub fn from_github(value: &str) -> Option<Self> {
        match value {
            "APPROVED" => Some(Self::Approved),
            "CHANGES_REQUESTED" => Some(Self::ChangesRequested),
            "REVIEW_REQUIRED" => Some(Self::ReviewRequired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }

    /// Flag passed to `gh pr merge`.
    pub fn gh_flag(&self) -> &'static str {
        match self {
            Self::Merge => "--merge",
            Self::Squash => "--squash",
            Self::Rebase => "--rebase",
        }
    }
}

impl FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            _ => Err(format!("Invalid merge method: {}", s)),
        }
    }
}

/// PR state attached to a session once the workflow has opened one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub url: String,
    pub check_status: CheckStatus,
    pub review_decision: Option<ReviewDecision>,
    pub merge_methods: Vec<MergeMethod>,
    pub default_merge_method: Option<MergeMethod>,
    pub delete_branch_on_merge: bool,
}

impl PullRequest {
    pub fn opened(url: String) -> Self {
        Self {
            url,
            check_status: CheckStatus::Pending,
            review_decision: None,
            merge_methods: Vec::new(),
            default_merge_method: None,
            delete_branch_on_merge: false,
        }
    }

    /// PR number parsed from the trailing URL segment.
    pub fn number(&self) -> Option<u64> {
        self.url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
    }
}

// ── Session ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub execution: ExecutionDescriptor,
    pub workspace: WorkspaceDescriptor,
    pub status: SessionStatus,
    pub access_mode: AccessMode,
    pub agent_activity: AgentActivity,
    pub backend_handle: Option<String>,
    pub pr: Option<PullRequest>,
    pub error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh record in `Creating`, version 1.
    pub fn new(
        id: String,
        name: String,
        execution: ExecutionDescriptor,
        workspace: WorkspaceDescriptor,
        access_mode: AccessMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            execution,
            workspace,
            status: SessionStatus::Creating,
            access_mode,
            agent_activity: AgentActivity::Unknown,
            backend_handle: None,
            pr: None,
            error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn check_status(&self) -> Option<CheckStatus> {
        self.pr.as_ref().map(|pr| pr.check_status)
    }
}

/// Deterministic sandbox name for a session. Teardown relies on this to
/// find sandboxes whose handle was never recorded.
pub fn sandbox_name(session_id: &str) -> String {
    format!("harbor-{}", session_id)
}

/// Convert free text to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Repository name from a clone URL: `https://github.com/o/widgets.git` → `widgets`.
pub fn repo_name(repo_url: &str) -> Option<String> {
    let trimmed = repo_url.trim().trim_end_matches('/').trim_end_matches(".git");
    let last = trimmed.rsplit(['/', ':']).next()?;
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

/// Working branch for a session: `harbor/<repo-slug>-<id prefix>`.
pub fn branch_name_for(repo_url: &str, session_id: &str) -> String {
    let slug = repo_name(repo_url)
        .map(|name| slugify(&name, 32))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "session".to_string());
    let short: String = session_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("harbor/{}-{}", slug, short)
}
