//! Periodic PR status polling.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::manager::SessionManager;
use super::models::{CheckStatus, Session};

pub struct PrPoller {
    manager: Arc<SessionManager>,
    interval: Duration,
}

/// Sessions whose PR state can still change.
pub fn needs_poll(session: &Session) -> bool {
    session.status.is_attachable()
        && session
            .check_status()
            .is_some_and(|status| status != CheckStatus::Merged)
}

/// Active sessions with no PR yet; the agent may have opened one itself.
pub fn needs_discovery(session: &Session) -> bool {
    session.status.is_attachable() && session.pr.is_none()
}

impl PrPoller {
    pub fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        tracing::debug!("PR poller stopped");
    }

    /// Refresh every session with an open PR and look for PRs on sessions
    /// without one. Returns how many sessions were refreshed or linked.
    pub async fn poll_once(&self) -> usize {
        let sessions = match self.manager.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "PR poll could not list sessions");
                return 0;
            }
        };
        let refreshes = sessions.iter().filter(|s| needs_poll(s)).map(|session| {
            let manager = self.manager.clone();
            let id = session.id.clone();
            async move {
                match manager.refresh_pr_status(&id).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "PR status refresh failed");
                        false
                    }
                }
            }
        });
        let discoveries = sessions.iter().filter(|s| needs_discovery(s)).map(|session| {
            let manager = self.manager.clone();
            let id = session.id.clone();
            async move {
                match manager.discover_pr(&id).await {
                    Ok(session) => session.pr.is_some(),
                    Err(e) => {
                        // No PR yet is the common case; a failing gh is not.
                        tracing::debug!(session_id = %id, error = %e, "PR discovery failed");
                        false
                    }
                }
            }
        });
        let (refreshed, linked) = futures::join!(join_all(refreshes), join_all(discoveries));
        refreshed.into_iter().chain(linked).filter(|ok| *ok).count()
    }
}
