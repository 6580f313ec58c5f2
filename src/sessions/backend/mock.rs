//! In-process sandbox for tests and local development.
//!
//! The terminal is a tiny line shell over an in-memory duplex pipe: input is
//! echoed back, `echo <text>` prints `<text>`, and `exit <code>` ends the
//! stream with that exit status. One-shot commands answer from a rule table
//! matched by substring, most recently added rule first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::errors::{BackendError, ProvisionError};
use crate::sessions::models::BackendKind;

use super::{BackendDriver, ExecOutput, SandboxHandle, SandboxSpec, SandboxStream, with_timeout};

const PIPE_CAPACITY: usize = 64 * 1024;

enum ShellCommand {
    Output(Vec<u8>),
    Exit(i64),
    HangUp,
}

struct ExecRule {
    pattern: String,
    output: ExecOutput,
    delay: Duration,
}

struct MockSandbox {
    spec: SandboxSpec,
    running: bool,
    attached: bool,
    exit_code: Option<i64>,
    transcript: Arc<Mutex<Vec<u8>>>,
    shell: Option<mpsc::UnboundedSender<ShellCommand>>,
}

type CreateHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct MockState {
    sandboxes: HashMap<String, MockSandbox>,
    created: Vec<String>,
    removed: Vec<String>,
    remove_calls: Vec<String>,
    remove_failures: VecDeque<BackendError>,
    exit_status_delay: Duration,
    create_attempts: usize,
    create_failures: VecDeque<ProvisionError>,
    create_delay: Duration,
    create_hook: Option<CreateHook>,
    exec_rules: Vec<ExecRule>,
    exec_log: Vec<Vec<String>>,
    resizes: Vec<(String, u16, u16)>,
    resize_unsupported: bool,
}

#[derive(Clone)]
pub struct MockDriver {
    kind: BackendKind,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_kind(BackendKind::LocalContainer)
    }

    /// A mock standing in for the given backend kind.
    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    // ── Scripting ─────────────────────────────────────────────────────

    pub fn fail_next_create(&self, err: ProvisionError) {
        self.lock().create_failures.push_back(err);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = delay;
    }

    /// Run `hook` with the sandbox name each time a create succeeds.
    pub fn on_create(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.lock().create_hook = Some(Arc::new(hook));
    }

    pub fn fail_next_remove(&self, err: BackendError) {
        self.lock().remove_failures.push_back(err);
    }

    /// Make `exit_status` take `delay`, like a slow engine inspect.
    pub fn set_exit_status_delay(&self, delay: Duration) {
        self.lock().exit_status_delay = delay;
    }

    pub fn set_resize_supported(&self, supported: bool) {
        self.lock().resize_unsupported = !supported;
    }

    /// Answer any command whose joined argv contains `pattern`.
    pub fn on_exec(&self, pattern: &str, output: ExecOutput) {
        self.on_exec_delayed(pattern, output, Duration::ZERO);
    }

    pub fn on_exec_delayed(&self, pattern: &str, output: ExecOutput, delay: Duration) {
        self.lock().exec_rules.push(ExecRule {
            pattern: pattern.to_string(),
            output,
            delay,
        });
    }

    /// Push bytes to the sandbox terminal as if the agent printed them.
    pub fn emit(&self, name: &str, bytes: &[u8]) -> bool {
        self.shell_send(name, ShellCommand::Output(bytes.to_vec()))
    }

    /// End the sandbox's main process with `code`.
    pub fn exit(&self, name: &str, code: i64) {
        let mut state = self.lock();
        if let Some(sandbox) = state.sandboxes.get_mut(name) {
            sandbox.exit_code = Some(code);
            sandbox.running = false;
            if let Some(shell) = &sandbox.shell {
                let _ = shell.send(ShellCommand::Exit(code));
            }
        }
    }

    /// Close the terminal stream while the sandbox keeps running.
    pub fn hang_up(&self, name: &str) -> bool {
        self.shell_send(name, ShellCommand::HangUp)
    }

    fn shell_send(&self, name: &str, cmd: ShellCommand) -> bool {
        let state = self.lock();
        state
            .sandboxes
            .get(name)
            .and_then(|s| s.shell.as_ref())
            .is_some_and(|shell| shell.send(cmd).is_ok())
    }

    // ── Inspection ────────────────────────────────────────────────────

    pub fn create_attempts(&self) -> usize {
        self.lock().create_attempts
    }

    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// Every `remove` call, including those for sandboxes that did not exist.
    pub fn remove_calls(&self) -> Vec<String> {
        self.lock().remove_calls.clone()
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.lock().sandboxes.contains_key(name)
    }

    pub fn spec_of(&self, name: &str) -> Option<SandboxSpec> {
        self.lock().sandboxes.get(name).map(|s| s.spec.clone())
    }

    /// Every byte written to the sandbox terminal, in arrival order.
    pub fn transcript(&self, name: &str) -> Vec<u8> {
        let state = self.lock();
        match state.sandboxes.get(name) {
            Some(s) => lock_bytes(&s.transcript).clone(),
            None => Vec::new(),
        }
    }

    /// Commands run through `exec`, joined with spaces.
    pub fn exec_commands(&self) -> Vec<String> {
        self.lock().exec_log.iter().map(|argv| argv.join(" ")).collect()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.lock().resizes.clone()
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_bytes(bytes: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BackendDriver for MockDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProvisionError> {
        let delay = {
            let mut state = self.lock();
            state.create_attempts += 1;
            if let Some(err) = state.create_failures.pop_front() {
                return Err(err);
            }
            state.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let hook = {
            let mut state = self.lock();
            if state.sandboxes.remove(&spec.name).is_some() {
                state.removed.push(spec.name.clone());
            }
            state.sandboxes.insert(
                spec.name.clone(),
                MockSandbox {
                    spec: spec.clone(),
                    running: true,
                    attached: false,
                    exit_code: None,
                    transcript: Arc::new(Mutex::new(Vec::new())),
                    shell: None,
                },
            );
            state.created.push(spec.name.clone());
            state.create_hook.clone()
        };
        if let Some(hook) = hook {
            hook(&spec.name);
        }
        Ok(spec.handle())
    }

    async fn attach_stream(&self, handle: &SandboxHandle) -> Result<SandboxStream, BackendError> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let transcript = {
            let mut state = self.lock();
            let sandbox = state
                .sandboxes
                .get_mut(&handle.name)
                .ok_or_else(|| BackendError::NotFound(handle.name.clone()))?;
            if sandbox.attached {
                return Err(BackendError::StreamBusy(handle.name.clone()));
            }
            if !sandbox.running {
                return Err(BackendError::Engine(format!("{} is not running", handle.name)));
            }
            sandbox.attached = true;
            sandbox.shell = Some(tx);
            sandbox.transcript.clone()
        };

        tokio::spawn(run_shell(
            handle.name.clone(),
            server,
            rx,
            transcript,
            self.state.clone(),
        ));

        let (reader, writer) = tokio::io::split(client);
        Ok(SandboxStream {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError> {
        let (output, delay) = {
            let mut state = self.lock();
            if !state.sandboxes.contains_key(&handle.name) {
                return Err(BackendError::NotFound(handle.name.clone()));
            }
            state.exec_log.push(argv.to_vec());
            let joined = argv.join(" ");
            state
                .exec_rules
                .iter()
                .rev()
                .find(|rule| joined.contains(&rule.pattern))
                .map(|rule| (rule.output.clone(), rule.delay))
                .unwrap_or_default()
        };

        with_timeout(timeout, async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(output)
        })
        .await
    }

    async fn resize(&self, handle: &SandboxHandle, rows: u16, cols: u16) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.resize_unsupported {
            return Err(BackendError::Unsupported("resize"));
        }
        state.resizes.push((handle.name.clone(), rows, cols));
        Ok(())
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        if let Some(sandbox) = state.sandboxes.get_mut(&handle.name) {
            sandbox.running = false;
            sandbox.shell = None;
        }
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.remove_calls.push(handle.name.clone());
        if let Some(err) = state.remove_failures.pop_front() {
            return Err(err);
        }
        if state.sandboxes.remove(&handle.name).is_some() {
            state.removed.push(handle.name.clone());
        }
        Ok(())
    }

    async fn exists(&self, handle: &SandboxHandle) -> Result<bool, BackendError> {
        Ok(self.lock().sandboxes.contains_key(&handle.name))
    }

    async fn exit_status(&self, handle: &SandboxHandle) -> Result<Option<i64>, BackendError> {
        let delay = self.lock().exit_status_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .lock()
            .sandboxes
            .get(&handle.name)
            .and_then(|s| s.exit_code))
    }
}

async fn run_shell(
    name: String,
    mut io: DuplexStream,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
    transcript: Arc<Mutex<Vec<u8>>>,
    state: Arc<Mutex<MockState>>,
) {
    let mut line = Vec::new();
    let mut buf = [0u8; 1024];
    let mut exit_code = None;

    loop {
        tokio::select! {
            read = io.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                lock_bytes(&transcript).extend_from_slice(chunk);

                let mut out = chunk.to_vec();
                for &byte in chunk {
                    match byte {
                        b'\n' => {
                            let text = String::from_utf8_lossy(&line).trim().to_string();
                            line.clear();
                            if let Some(rest) = text.strip_prefix("echo ") {
                                out.extend_from_slice(rest.as_bytes());
                                out.extend_from_slice(b"\r\n");
                            } else if text == "exit" {
                                exit_code = Some(0);
                            } else if let Some(code) = text.strip_prefix("exit ") {
                                exit_code = Some(code.trim().parse().unwrap_or(1));
                            }
                        }
                        b'\r' => {}
                        other => line.push(other),
                    }
                }
                if io.write_all(&out).await.is_err() {
                    break;
                }
                if exit_code.is_some() {
                    break;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(ShellCommand::Output(bytes)) => {
                    if io.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(ShellCommand::Exit(code)) => {
                    exit_code = Some(code);
                    break;
                }
                Some(ShellCommand::HangUp) | None => break,
            },
        }
    }

    let mut state = lock_state(&state);
    if let Some(sandbox) = state.sandboxes.get_mut(&name) {
        sandbox.attached = false;
        sandbox.shell = None;
        if let Some(code) = exit_code {
            sandbox.exit_code = Some(code);
            sandbox.running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::models::{PullPolicy, ResourceLimits};
    use std::collections::BTreeMap;

    fn spec(name: &str) -> SandboxSpec {
        SandboxSpec {
            name: name.to_string(),
            image: "img".into(),
            resources: ResourceLimits::default(),
            pull_policy: PullPolicy::IfNotPresent,
            storage_class: None,
            workdir: "/workspace".into(),
            env: vec![],
            labels: BTreeMap::new(),
            command: None,
            timeout: Duration::from_secs(5),
        }
    }

    async fn read_until(stream: &mut SandboxStream, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.reader.read(&mut buf))
                .await
                .expect("timed out waiting for output")
                .unwrap();
            assert!(n > 0, "stream closed before {:?}", String::from_utf8_lossy(needle));
            seen.extend_from_slice(&buf[..n]);
        }
        seen
    }

    #[tokio::test]
    async fn test_shell_answers_echo() {
        let driver = MockDriver::new();
        let handle = driver.create(&spec("s1")).await.unwrap();
        let mut stream = driver.attach_stream(&handle).await.unwrap();

        stream.writer.write_all(b"echo hi\n").await.unwrap();
        read_until(&mut stream, b"hi\r\n").await;
        assert_eq!(driver.transcript("s1"), b"echo hi\n");
    }

    #[tokio::test]
    async fn test_second_attach_is_busy() {
        let driver = MockDriver::new();
        let handle = driver.create(&spec("s1")).await.unwrap();
        let _first = driver.attach_stream(&handle).await.unwrap();
        assert!(matches!(
            driver.attach_stream(&handle).await,
            Err(BackendError::StreamBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_ends_stream_and_records_code() {
        let driver = MockDriver::new();
        let handle = driver.create(&spec("s1")).await.unwrap();
        let mut stream = driver.attach_stream(&handle).await.unwrap();

        stream.writer.write_all(b"exit 3\n").await.unwrap();
        let mut rest = Vec::new();
        stream.reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(driver.exit_status(&handle).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_exec_rules_and_timeout() {
        let driver = MockDriver::new();
        let handle = driver.create(&spec("s1")).await.unwrap();
        driver.on_exec(
            "gh pr create",
            ExecOutput {
                stdout: "https://github.com/acme/widgets/pull/1\n".into(),
                ..Default::default()
            },
        );
        driver.on_exec_delayed("git push", ExecOutput::default(), Duration::from_secs(5));

        let argv: Vec<String> = ["gh", "pr", "create"].iter().map(|s| s.to_string()).collect();
        let out = driver.exec(&handle, &argv, Duration::from_secs(1)).await.unwrap();
        assert!(out.stdout.contains("/pull/1"));

        let push: Vec<String> = ["git", "push"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            driver.exec(&handle, &push, Duration::from_millis(20)).await,
            Err(BackendError::TimedOut(_))
        ));
        assert_eq!(driver.exec_commands(), vec!["gh pr create", "git push"]);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_remove_tolerates_missing() {
        let driver = MockDriver::new();
        driver.create(&spec("s1")).await.unwrap();
        driver.create(&spec("s1")).await.unwrap();
        assert_eq!(driver.created(), vec!["s1", "s1"]);
        assert_eq!(driver.removed(), vec!["s1"]);

        let handle = SandboxHandle::new("s1");
        driver.remove(&handle).await.unwrap();
        driver.remove(&handle).await.unwrap();
        assert!(!driver.exists(&handle).await.unwrap());
        assert_eq!(driver.remove_calls(), vec!["s1", "s1"]);
    }

    #[tokio::test]
    async fn test_scripted_remove_failure_keeps_sandbox() {
        let driver = MockDriver::new();
        let handle = driver.create(&spec("s1")).await.unwrap();
        driver.fail_next_remove(BackendError::Engine("engine hiccup".into()));

        assert!(matches!(driver.remove(&handle).await, Err(BackendError::Engine(_))));
        assert!(driver.is_live("s1"));
        driver.remove(&handle).await.unwrap();
        assert!(!driver.is_live("s1"));
    }
}
