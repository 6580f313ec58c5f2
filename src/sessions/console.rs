//! Console stream multiplexer.
//!
//! Each session has at most one open backend stream. A reader task copies its
//! output into a broadcast channel that every attachment subscribes to, and
//! a writer task applies input and resize requests one at a time, so two
//! clients typing at once never interleave partial writes. The stream stays
//! open when the last attachment leaves; it is reopened on the next attach
//! if the backend closed it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::errors::BackendError;

use super::backend::{BackendDriver, SandboxHandle};

/// Output chunks buffered per stream before a slow attachment is dropped.
pub const OUTPUT_BUFFER: usize = 1024;

const READ_CHUNK: usize = 8192;
const INPUT_QUEUE: usize = 256;

/// What the multiplexer reports back to the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotice {
    Output { session_id: String, chunk: Bytes },
    Input { session_id: String },
    Closed { session_id: String },
}

enum WriteRequest {
    Bytes(Bytes),
    Resize { rows: u16, cols: u16 },
}

struct SessionStream {
    output: broadcast::Sender<Bytes>,
    input: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
    attachments: AtomicUsize,
}

impl SessionStream {
    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.input.is_closed()
    }
}

type Slot = Arc<Mutex<Option<Arc<SessionStream>>>>;

struct Inner {
    slots: DashMap<String, Slot>,
    geometry: DashMap<String, (u16, u16)>,
    notices: mpsc::Sender<StreamNotice>,
    buffer: usize,
}

#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl StreamMultiplexer {
    pub fn new(notices: mpsc::Sender<StreamNotice>) -> Self {
        Self::with_buffer(OUTPUT_BUFFER, notices)
    }

    pub fn with_buffer(buffer: usize, notices: mpsc::Sender<StreamNotice>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                geometry: DashMap::new(),
                notices,
                buffer,
            }),
        }
    }

    fn slot(&self, session_id: &str) -> Slot {
        self.inner
            .slots
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn current(&self, session_id: &str) -> Option<Arc<SessionStream>> {
        let slot = self.inner.slots.get(session_id)?.value().clone();
        let guard = slot.lock().await;
        guard.as_ref().filter(|s| s.is_open()).cloned()
    }

    /// Open the backend stream for a session unless one is already open.
    pub async fn open(
        &self,
        session_id: &str,
        driver: Arc<dyn BackendDriver>,
        handle: SandboxHandle,
    ) -> Result<(), BackendError> {
        self.open_stream(session_id, driver, handle).await.map(|_| ())
    }

    async fn open_stream(
        &self,
        session_id: &str,
        driver: Arc<dyn BackendDriver>,
        handle: SandboxHandle,
    ) -> Result<Arc<SessionStream>, BackendError> {
        let slot = self.slot(session_id);
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref().filter(|s| s.is_open()) {
            return Ok(existing.clone());
        }

        let sandbox = driver.attach_stream(&handle).await?;
        let (output, _) = broadcast::channel(self.inner.buffer);
        let (input, requests) = mpsc::channel(INPUT_QUEUE);
        let cancel = CancellationToken::new();

        tokio::spawn(pump_output(
            session_id.to_string(),
            sandbox.reader,
            output.clone(),
            self.inner.notices.clone(),
            cancel.clone(),
        ));
        tokio::spawn(pump_input(
            session_id.to_string(),
            sandbox.writer,
            requests,
            driver,
            handle,
            cancel.clone(),
        ));

        let stream = Arc::new(SessionStream {
            output,
            input,
            cancel,
            attachments: AtomicUsize::new(0),
        });
        if let Some(geometry) = self.inner.geometry.get(session_id).map(|g| *g.value()) {
            let _ = stream
                .input
                .send(WriteRequest::Resize {
                    rows: geometry.0,
                    cols: geometry.1,
                })
                .await;
        }
        tracing::debug!(session_id, "console stream opened");
        *guard = Some(stream.clone());
        Ok(stream)
    }

    /// Attach a client, opening the backend stream when needed.
    pub async fn attach(
        &self,
        session_id: &str,
        driver: Arc<dyn BackendDriver>,
        handle: SandboxHandle,
    ) -> Result<Attachment, BackendError> {
        let stream = self.open_stream(session_id, driver, handle).await?;
        let count = stream.attachments.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(session_id, attachments = count, "console attached");
        Ok(Attachment {
            session_id: session_id.to_string(),
            output: stream.output.subscribe(),
            dropped: false,
            stream,
            mux: self.clone(),
        })
    }

    /// Queue input for the session's open stream.
    pub async fn write(&self, session_id: &str, bytes: Bytes) -> Result<(), BackendError> {
        let stream = self
            .current(session_id)
            .await
            .ok_or_else(|| BackendError::NotFound(format!("console stream for {}", session_id)))?;
        self.send_input(session_id, &stream, bytes).await
    }

    async fn send_input(
        &self,
        session_id: &str,
        stream: &SessionStream,
        bytes: Bytes,
    ) -> Result<(), BackendError> {
        stream
            .input
            .send(WriteRequest::Bytes(bytes))
            .await
            .map_err(|_| BackendError::Engine("console stream closed".to_string()))?;
        // Input wakes idle sessions, so it must not be lost to a queue full
        // of output. The writer never waits on the manager either.
        let notice = StreamNotice::Input {
            session_id: session_id.to_string(),
        };
        if let Err(mpsc::error::TrySendError::Full(notice)) = self.inner.notices.try_send(notice) {
            let notices = self.inner.notices.clone();
            tokio::spawn(async move {
                let _ = notices.send(notice).await;
            });
        }
        Ok(())
    }

    /// Record the terminal size and forward it when a stream is open. The
    /// size is reapplied whenever the stream is reopened.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) {
        self.inner
            .geometry
            .insert(session_id.to_string(), (rows, cols));
        if let Some(stream) = self.current(session_id).await {
            let _ = stream.input.send(WriteRequest::Resize { rows, cols }).await;
        }
    }

    pub fn geometry(&self, session_id: &str) -> Option<(u16, u16)> {
        self.inner.geometry.get(session_id).map(|g| *g.value())
    }

    pub async fn is_open(&self, session_id: &str) -> bool {
        self.current(session_id).await.is_some()
    }

    pub async fn attachment_count(&self, session_id: &str) -> usize {
        match self.current(session_id).await {
            Some(stream) => stream.attachments.load(Ordering::SeqCst),
            None => 0,
        }
    }

    /// Tear down the session's stream. Attachments see end of output.
    pub async fn close(&self, session_id: &str) {
        self.inner.geometry.remove(session_id);
        if let Some((_, slot)) = self.inner.slots.remove(session_id) {
            if let Some(stream) = slot.lock().await.take() {
                stream.cancel.cancel();
                tracing::debug!(session_id, "console stream closed");
            }
        }
    }
}

/// One client's view of a session console.
pub struct Attachment {
    session_id: String,
    output: broadcast::Receiver<Bytes>,
    dropped: bool,
    stream: Arc<SessionStream>,
    mux: StreamMultiplexer,
}

impl Attachment {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next output chunk. `None` once the stream has ended, or when this
    /// attachment fell too far behind and was dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.dropped {
            return None;
        }
        tokio::select! {
            biased;
            chunk = self.output.recv() => match chunk {
                Ok(chunk) => Some(chunk),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %self.session_id, skipped, "console attachment lagged; dropping it");
                    self.dropped = true;
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            },
            _ = self.stream.cancel.cancelled() => None,
        }
    }

    pub async fn write(&self, bytes: impl Into<Bytes>) -> Result<(), BackendError> {
        self.mux
            .send_input(&self.session_id, &self.stream, bytes.into())
            .await
    }

    pub async fn resize(&self, rows: u16, cols: u16) {
        self.mux.resize(&self.session_id, rows, cols).await;
    }

    pub fn geometry(&self) -> Option<(u16, u16)> {
        self.mux.geometry(&self.session_id)
    }

    pub fn detach(self) {}
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let left = self.stream.attachments.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(session_id = %self.session_id, attachments = left, "console detached");
    }
}

async fn pump_output(
    session_id: String,
    mut reader: std::pin::Pin<Box<dyn AsyncRead + Send>>,
    output: broadcast::Sender<Bytes>,
    notices: mpsc::Sender<StreamNotice>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    let _ = output.send(chunk.clone());
                    let _ = notices.try_send(StreamNotice::Output {
                        session_id: session_id.clone(),
                        chunk,
                    });
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "console read failed");
                    break;
                }
            },
        }
    }
    tracing::info!(session_id = %session_id, "console stream ended");
    cancel.cancel();
    let _ = notices.send(StreamNotice::Closed { session_id }).await;
}

async fn pump_input(
    session_id: String,
    mut writer: std::pin::Pin<Box<dyn AsyncWrite + Send>>,
    mut requests: mpsc::Receiver<WriteRequest>,
    driver: Arc<dyn BackendDriver>,
    handle: SandboxHandle,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                None => break,
                Some(WriteRequest::Bytes(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        tracing::warn!(session_id = %session_id, error = %e, "console write failed");
                        break;
                    }
                    let _ = writer.flush().await;
                }
                Some(WriteRequest::Resize { rows, cols }) => {
                    match driver.resize(&handle, rows, cols).await {
                        Ok(()) => {}
                        Err(BackendError::Unsupported(_)) => {
                            tracing::debug!(session_id = %session_id, "backend does not support resize");
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "resize failed");
                        }
                    }
                }
            },
        }
    }
    let _ = writer.shutdown().await;
}
