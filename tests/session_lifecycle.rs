//! End-to-end session scenarios on the in-process mock backend.

use std::sync::Arc;
use std::time::Duration;

use harbor::errors::{MergeError, SessionError};
use harbor::sessions::backend::{Drivers, ExecOutput, MockDriver, RetryPolicy};
use harbor::sessions::console::Attachment;
use harbor::sessions::db::{DbHandle, SessionDb};
use harbor::sessions::events::{Event, EventBus, Subscription};
use harbor::sessions::github::PrStatusReport;
use harbor::sessions::manager::{CreateSessionRequest, ManagerSettings, SessionManager};
use harbor::sessions::models::{BackendKind, CheckStatus, Session, SessionStatus, sandbox_name};
use harbor::sessions::registry::Registry;
use harbor::sessions::state::is_valid_walk;
use tokio_util::sync::CancellationToken;

const PR_URL: &str = "https://github.com/acme/widgets/pull/7";

fn harness_with(settings: ManagerSettings) -> (Arc<SessionManager>, MockDriver) {
    let driver = MockDriver::new();
    let registry = Arc::new(Registry::new(
        DbHandle::new(SessionDb::new_in_memory().unwrap()),
        EventBus::new(),
    ));
    let manager = SessionManager::new(
        registry,
        Drivers::new().with(Arc::new(driver.clone())),
        settings,
    );
    (manager, driver)
}

fn harness() -> (Arc<SessionManager>, MockDriver) {
    harness_with(ManagerSettings {
        provision_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            retries: 1,
            backoff: Duration::from_millis(10),
        },
        exec_timeout: Duration::from_secs(5),
        ..ManagerSettings::default()
    })
}

fn request(repo_url: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        repo_url: repo_url.into(),
        base_branch: Some("main".into()),
        backend: BackendKind::LocalContainer,
        image: Some("ghcr.io/acme/agent:1".into()),
        resources: None,
        pull_policy: None,
        storage_class: None,
        access_mode: None,
    }
}

fn out(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

async fn wait_for(manager: &SessionManager, id: &str, status: SessionStatus) -> Session {
    for _ in 0..300 {
        let session = manager.get_session(id).await.unwrap();
        if session.status == status {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached {}", id, status);
}

async fn running_session(manager: &Arc<SessionManager>) -> Session {
    let created = manager
        .create_session(request("https://github.com/acme/widgets.git"))
        .await
        .unwrap();
    wait_for(manager, &created.session.id, SessionStatus::Running).await
}

async fn read_until(attachment: &mut Attachment, needle: &str) -> String {
    let mut seen = Vec::new();
    let read = async {
        while let Some(chunk) = attachment.recv().await {
            seen.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&seen).contains(needle) {
                return;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), read).await;
    String::from_utf8_lossy(&seen).into_owned()
}

/// Script the sandbox so publish opens a PR and polls report a green,
/// approved, mergeable PR.
fn script_green_pr(driver: &MockDriver) {
    driver.on_exec("gh pr create", out(&format!("{}\n", PR_URL)));
    driver.on_exec(
        "gh pr checks",
        out(r#"[{"name":"build","state":"SUCCESS"},{"name":"lint","state":"SKIPPED"}]"#),
    );
    driver.on_exec(
        "gh pr view",
        out(r#"{"state":"OPEN","reviewDecision":"APPROVED","mergeable":"MERGEABLE"}"#),
    );
}

async fn statuses_until(
    events: &mut Subscription,
    id: &str,
    terminal: SessionStatus,
) -> Vec<SessionStatus> {
    let mut walk = vec![SessionStatus::Creating];
    let collect = async {
        while let Some(event) = events.recv().await {
            if let Event::StatusChanged { id: event_id, new, .. } = event {
                if event_id == id {
                    walk.push(new);
                    if new == terminal {
                        return;
                    }
                }
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), collect).await;
    walk
}

// =============================================================================
// Console
// =============================================================================

#[tokio::test]
async fn test_two_clients_share_one_console() {
    let (manager, driver) = harness();
    let session = running_session(&manager).await;

    let mut first = manager.attach(&session.id).await.unwrap();
    let mut second = manager.attach(&session.id).await.unwrap();
    assert_eq!(manager.streams().attachment_count(&session.id).await, 2);

    first.write(&b"echo hi\n"[..]).await.unwrap();

    assert!(read_until(&mut first, "hi\r\n").await.contains("hi\r\n"));
    assert!(read_until(&mut second, "hi\r\n").await.contains("hi\r\n"));
    assert_eq!(
        driver.transcript(&sandbox_name(&session.id)),
        b"echo hi\n".to_vec()
    );
}

#[tokio::test]
async fn test_detach_keeps_session_and_stream() {
    let (manager, _driver) = harness();
    let session = running_session(&manager).await;

    let attachment = manager.attach(&session.id).await.unwrap();
    attachment.detach();

    assert_eq!(manager.streams().attachment_count(&session.id).await, 0);
    assert!(manager.streams().is_open(&session.id).await);
    let after = manager.get_session(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Running);

    // A later client can still attach.
    assert!(manager.attach(&session.id).await.is_ok());
}

#[tokio::test]
async fn test_attach_to_failed_session_is_refused() {
    let (manager, _driver) = harness();
    let created = manager.create_session(request("not a url")).await.unwrap();
    wait_for(&manager, &created.session.id, SessionStatus::Failed).await;

    let err = manager.attach(&created.session.id).await.err().unwrap();
    assert!(matches!(
        err,
        SessionError::NotAttachable {
            status: SessionStatus::Failed,
            ..
        }
    ));
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
async fn test_invalid_repo_url_fails_without_sandbox() {
    let (manager, driver) = harness();
    let created = manager.create_session(request("not a url")).await.unwrap();
    let session = wait_for(&manager, &created.session.id, SessionStatus::Failed).await;

    assert!(session.error.unwrap().contains("invalid repository URL"));
    assert!(driver.created().is_empty());
}

#[tokio::test]
async fn test_delete_during_workflow_removes_sandbox() {
    let (manager, driver) = harness();
    driver.on_exec_delayed("fetch origin", out(""), Duration::from_secs(30));

    let created = manager
        .create_session(request("https://github.com/acme/widgets.git"))
        .await
        .unwrap();
    let id = created.session.id.clone();
    let name = sandbox_name(&id);

    // Wait until the sandbox exists and the workflow is blocked in fetch.
    for _ in 0..300 {
        if driver.exec_commands().iter().any(|c| c.contains("fetch origin")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(driver.is_live(&name));

    manager.delete_session(&id).await.unwrap();

    assert!(!driver.is_live(&name));
    assert!(driver.removed().contains(&name));
    assert!(matches!(
        manager.get_session(&id).await,
        Err(SessionError::NotFound { .. })
    ));
    // The cancelled bring-up must not resurrect the record.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.list_sessions().await.unwrap().is_empty());
}

// =============================================================================
// Agent lifecycle
// =============================================================================

#[tokio::test]
async fn test_agent_exit_code_decides_outcome() {
    let (manager, driver) = harness();
    let cancel = CancellationToken::new();
    let tasks = manager.start(cancel.clone());

    let failing = running_session(&manager).await;
    let succeeding = running_session(&manager).await;

    driver.exit(&sandbox_name(&failing.id), 3);
    driver.exit(&sandbox_name(&succeeding.id), 0);

    let failed = wait_for(&manager, &failing.id, SessionStatus::Failed).await;
    assert_eq!(failed.error.as_deref(), Some("agent exited with code 3"));
    wait_for(&manager, &succeeding.id, SessionStatus::Completed).await;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
}

#[tokio::test]
async fn test_quiet_session_goes_idle_and_input_wakes_it() {
    let (manager, _driver) = harness_with(ManagerSettings {
        quiet_window: Duration::from_millis(50),
        exec_timeout: Duration::from_secs(5),
        ..ManagerSettings::default()
    });
    let cancel = CancellationToken::new();
    let tasks = manager.start(cancel.clone());

    let session = running_session(&manager).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.sweep_idle().await;
    wait_for(&manager, &session.id, SessionStatus::Idle).await;

    let attachment = manager.attach(&session.id).await.unwrap();
    attachment.write(&b"ls\n"[..]).await.unwrap();
    wait_for(&manager, &session.id, SessionStatus::Running).await;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
}

// =============================================================================
// Publish and merge
// =============================================================================

#[tokio::test]
async fn test_publish_review_merge_completes_session() {
    let (manager, driver) = harness();
    let mut events = manager.subscribe();
    script_green_pr(&driver);

    let session = running_session(&manager).await;
    let published = manager.publish(&session.id, Some("Add widgets".into())).await.unwrap();
    let pr = published.pr.clone().unwrap();
    assert_eq!(pr.url, PR_URL);
    assert_eq!(pr.check_status, CheckStatus::Pending);
    assert_eq!(published.status, SessionStatus::Running);

    let commands = driver.exec_commands();
    let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
    assert!(position("add -A") < position("commit"));
    assert!(position("commit") < position("push"));
    assert!(position("push") < position("gh pr create"));

    // Status webhook: checks green, review approved.
    let report: PrStatusReport = serde_json::from_str(
        r#"{"checks":[{"name":"build","state":"SUCCESS"}],"reviewDecision":"APPROVED","mergeable":"MERGEABLE"}"#,
    )
    .unwrap();
    let observed = manager.record_pr_status(&session.id, &report).await.unwrap();
    assert_eq!(observed.check_status(), Some(CheckStatus::Mergeable));

    let merged = manager.merge(&session.id, None, None).await.unwrap();
    assert_eq!(merged.status, SessionStatus::Completed);
    assert_eq!(merged.check_status(), Some(CheckStatus::Merged));
    assert!(driver.exec_commands().iter().any(|c| c.contains("gh pr merge")));

    let walk = statuses_until(&mut events, &session.id, SessionStatus::Completed).await;
    assert_eq!(walk.last(), Some(&SessionStatus::Completed));
    assert!(is_valid_walk(&walk), "invalid status walk: {:?}", walk);
}

#[tokio::test]
async fn test_merge_refused_leaves_session_untouched() {
    let (manager, driver) = harness();
    script_green_pr(&driver);
    let session = running_session(&manager).await;

    // No PR yet.
    let err = manager.merge(&session.id, None, None).await.unwrap_err();
    assert!(matches!(err, SessionError::Merge(MergeError::NotMergeable { .. })));
    let after = manager.get_session(&session.id).await.unwrap();
    assert_eq!(after.version, session.version);

    // PR open but still pending.
    let published = manager.publish(&session.id, None).await.unwrap();
    let err = manager.merge(&session.id, None, None).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Merge(MergeError::NotMergeable {
            status: Some(CheckStatus::Pending)
        })
    ));
    let after = manager.get_session(&session.id).await.unwrap();
    assert_eq!(after.version, published.version);
    assert!(!driver.exec_commands().iter().any(|c| c.contains("gh pr merge")));
}

#[tokio::test]
async fn test_failing_checks_block_merge_until_fixed() {
    let (manager, driver) = harness();
    script_green_pr(&driver);
    let session = running_session(&manager).await;
    manager.publish(&session.id, None).await.unwrap();

    let red: PrStatusReport =
        serde_json::from_str(r#"{"checks":[{"name":"build","state":"FAILURE"}],"reviewDecision":"APPROVED"}"#)
            .unwrap();
    let observed = manager.record_pr_status(&session.id, &red).await.unwrap();
    assert_eq!(observed.check_status(), Some(CheckStatus::Failing));
    assert!(manager.merge(&session.id, None, None).await.is_err());

    // The poller sees the fixed build.
    let refreshed = manager.refresh_pr_status(&session.id).await.unwrap();
    assert_eq!(refreshed.check_status(), Some(CheckStatus::Mergeable));
    let merged = manager.merge(&session.id, None, None).await.unwrap();
    assert_eq!(merged.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_publish_push_failure_fails_session() {
    let (manager, driver) = harness();
    driver.on_exec(
        "push",
        ExecOutput {
            stdout: String::new(),
            stderr: "remote: Permission denied".into(),
            exit_code: 128,
        },
    );
    let session = running_session(&manager).await;

    let result = manager.publish(&session.id, None).await.unwrap();
    assert_eq!(result.status, SessionStatus::Failed);
    assert!(result.error.unwrap().contains("push"));
    assert!(result.pr.is_none());
    assert!(!driver.exec_commands().iter().any(|c| c.contains("gh pr create")));
}
