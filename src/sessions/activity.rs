//! Agent activity tracking.
//!
//! Two sources feed a session's advisory `agent_activity`: terminal output
//! classified by [`detect_activity`], and hook events posted by the agent
//! from inside the sandbox. The monitor also remembers when each session
//! last produced output so quiet sessions can be moved to Idle.

use std::sync::LazyLock;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::models::AgentActivity;

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

static APPROVAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(do you want to|\(y/n\)|\[y/n\]|allow (this|once|always)|approve|permission to)")
        .unwrap()
});

static WORKING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(esc to interrupt|running…|running\.\.\.|thinking…|[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏])").unwrap()
});

static PROMPT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(^|\n)\s*[>$❯]\s*$").unwrap());

/// Remove terminal escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_REGEX.replace_all(text, "").into_owned()
}

/// Classify a chunk of terminal output. `None` means the chunk says
/// nothing about what the agent is doing.
pub fn detect_activity(chunk: &[u8]) -> Option<AgentActivity> {
    let text = strip_ansi(&String::from_utf8_lossy(chunk));
    if APPROVAL_REGEX.is_match(&text) {
        Some(AgentActivity::WaitingApproval)
    } else if WORKING_REGEX.is_match(&text) {
        Some(AgentActivity::Working)
    } else if PROMPT_REGEX.is_match(text.trim_end_matches(['\r', '\n'])) {
        Some(AgentActivity::WaitingInput)
    } else {
        None
    }
}

/// Lifecycle hooks the agent reports from inside its sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    UserPromptSubmit,
    PreToolUse,
    PermissionRequest,
    Stop,
    IdlePrompt,
}

impl HookEvent {
    pub fn activity(&self) -> AgentActivity {
        match self {
            Self::UserPromptSubmit | Self::PreToolUse => AgentActivity::Working,
            Self::PermissionRequest => AgentActivity::WaitingApproval,
            Self::Stop => AgentActivity::WaitingInput,
            Self::IdlePrompt => AgentActivity::Idle,
        }
    }
}

/// Last-seen bookkeeping per session.
#[derive(Default)]
pub struct ActivityMonitor {
    last_seen: DashMap<String, Instant>,
    last_activity: DashMap<String, AgentActivity>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the session as active now.
    pub fn touch(&self, session_id: &str) {
        self.last_seen.insert(session_id.to_string(), Instant::now());
    }

    /// Record output and return the detected activity when it differs from
    /// the last one reported for this session.
    pub fn record_output(&self, session_id: &str, chunk: &[u8]) -> Option<AgentActivity> {
        self.touch(session_id);
        let detected = detect_activity(chunk)?;
        self.note_activity(session_id, detected)
    }

    /// Remember `activity`, returning it only if it changed.
    pub fn note_activity(&self, session_id: &str, activity: AgentActivity) -> Option<AgentActivity> {
        let previous = self
            .last_activity
            .insert(session_id.to_string(), activity);
        if previous == Some(activity) {
            None
        } else {
            Some(activity)
        }
    }

    /// Sessions that have been silent for at least `window`.
    pub fn quiet_sessions(&self, window: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut quiet: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) >= window)
            .map(|entry| entry.key().clone())
            .collect();
        quiet.sort();
        quiet
    }

    pub fn forget(&self, session_id: &str) {
        self.last_seen.remove(session_id);
        self.last_activity.remove(session_id);
    }
}

/// How often the idle sweeper runs for a given quiet window.
pub fn sweep_interval(window: Duration) -> Duration {
    (window / 4).max(Duration::from_secs(1))
}
