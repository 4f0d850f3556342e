use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::buffer::ReplayBuffer;
use crate::config::Config;
use crate::fanout::{SubscriberSet, Subscription};
use crate::pty::{LaunchSpec, PtyError, PtyProcess, PtyWriter};
use crate::workspace;

/// Session lifecycle status. Monotonic: once `Stopped`, a session never
/// returns to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// Broadcast reader lifecycle. At most one reader task exists per session;
/// `Finished` is terminal — the reader is never restarted once the PTY has
/// reached EOF or errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Idle,
    Running,
    Finished,
}

/// The broadcast reader's one-shot claim on the PTY read half.
///
/// The read handle lives here until the reader task takes it; after that no
/// other actor can ever read the descriptor. This makes the single-reader
/// discipline structural rather than conventional.
struct ReaderSlot {
    state: ReaderState,
    read_half: Option<Box<dyn Read + Send>>,
}

/// One managed shell process: PTY, replay buffer, subscriber set, write
/// lock. Cheap to clone; all state is shared behind `Arc`s.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub project: String,
    pub name: String,
    pub pid: Option<u32>,
    pub created_at: SystemTime,
    stopped: Arc<AtomicBool>,
    buffer: Arc<Mutex<ReplayBuffer>>,
    subscribers: SubscriberSet,
    reader: Arc<Mutex<ReaderSlot>>,
    writer: Arc<tokio::sync::Mutex<PtyWriter>>,
    pty: Arc<Mutex<Option<PtyProcess>>>,
    cancelled: CancellationToken,
    read_chunk_bytes: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Snapshot of session metadata for list/status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub project: String,
    pub name: String,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub created_at_unix: u64,
    pub buffer_bytes: usize,
    pub subscribers: usize,
}

impl Session {
    fn new(
        id: String,
        project: String,
        name: String,
        mut pty: PtyProcess,
        config: &Config,
    ) -> Self {
        let pid = pty.pid();
        let read_half = pty.take_reader();
        let writer = pty
            .take_writer()
            .map(PtyWriter::new)
            .unwrap_or_else(PtyWriter::detached);
        Self {
            id,
            project,
            name,
            pid,
            created_at: SystemTime::now(),
            stopped: Arc::new(AtomicBool::new(false)),
            buffer: Arc::new(Mutex::new(ReplayBuffer::new(config.buffer_cap_bytes))),
            subscribers: SubscriberSet::new(config.subscriber_capacity),
            reader: Arc::new(Mutex::new(ReaderSlot {
                state: ReaderState::Idle,
                read_half,
            })),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            pty: Arc::new(Mutex::new(Some(pty))),
            cancelled: CancellationToken::new(),
            read_chunk_bytes: config.read_chunk_bytes,
        }
    }

    pub fn status(&self) -> SessionStatus {
        if self.stopped.load(Ordering::Acquire) {
            SessionStatus::Stopped
        } else {
            SessionStatus::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            project: self.project.clone(),
            name: self.name.clone(),
            pid: self.pid,
            status: self.status(),
            created_at_unix: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            buffer_bytes: self.buffer.lock().len_bytes(),
            subscribers: self.subscribers.len(),
        }
    }

    /// Current replay buffer contents, oldest first.
    ///
    /// Attaching clients should use the snapshot returned by
    /// [`Session::subscribe`] instead; this accessor serves the standalone
    /// buffer-read surfaces.
    pub fn snapshot(&self) -> Bytes {
        self.buffer.lock().snapshot()
    }

    pub fn clear_buffer(&self) {
        self.buffer.lock().clear();
    }

    /// Register a subscriber channel and take the replay snapshot, lazily
    /// starting the broadcast reader.
    ///
    /// The subscription and snapshot are taken together under the buffer
    /// lock, which the reader holds across append-and-fanout: every chunk
    /// lands either in this snapshot or on the returned channel, never both.
    ///
    /// Subscribing to a stopped session (or one whose reader has already
    /// finished) yields the snapshot and an immediate end-of-stream sentinel.
    pub fn subscribe(&self) -> (Subscription, Bytes) {
        let (sub, snapshot) = {
            let buffer = self.buffer.lock();
            (self.subscribers.subscribe(), buffer.snapshot())
        };
        if !self.ensure_reader() {
            self.subscribers.close(sub.id);
        }
        (sub, snapshot)
    }

    /// Idempotent removal of a subscriber channel.
    pub fn unsubscribe(&self, subscriber_id: u64) {
        self.subscribers.unsubscribe(subscriber_id);
    }

    /// The per-session write lock guarding the only PTY write handle.
    ///
    /// Transports hold the guard for the duration of one client message so
    /// concurrent clients' input never interleaves at the byte level.
    pub fn write_lock(&self) -> Arc<tokio::sync::Mutex<PtyWriter>> {
        Arc::clone(&self.writer)
    }

    /// Acquire the write lock and write one chunk of input to the PTY.
    ///
    /// Returns `false` (never errors) if the session is not running or the
    /// OS write fails.
    pub async fn write(&self, data: &[u8]) -> bool {
        if !self.is_running() {
            return false;
        }
        self.writer.lock().await.write(data)
    }

    /// Set the PTY window size and deliver SIGWINCH to the child's process
    /// group. Returns `false` if the session is not running.
    pub fn resize(&self, rows: u16, cols: u16) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.pty.lock().as_ref() {
            Some(pty) => pty.resize(rows, cols).is_ok(),
            None => false,
        }
    }

    /// Non-blocking reap poll: returns `false` (and flips status to stopped)
    /// if the child has already exited. Lets presentation layers refresh
    /// status without waiting on the reader loop.
    pub fn check_alive(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut pty = self.pty.lock();
        match pty.as_mut() {
            Some(p) => {
                if p.try_reap() {
                    drop(pty);
                    self.mark_stopped();
                    false
                } else {
                    true
                }
            }
            None => {
                drop(pty);
                self.mark_stopped();
                false
            }
        }
    }

    /// Best-effort signal to the child's process group. Delivery to an
    /// already-exited process is swallowed.
    fn signal(&self, sig: i32) {
        if let Some(pty) = self.pty.lock().as_ref() {
            pty.signal(sig);
        }
    }

    /// Start the broadcast reader if it is not already running.
    ///
    /// Returns `true` if a reader is (now) running. Re-entrant start attempts
    /// are no-ops; a reader that reached `Finished` is never restarted, and a
    /// stopped session never gets a first reader.
    fn ensure_reader(&self) -> bool {
        let mut slot = self.reader.lock();
        match slot.state {
            ReaderState::Running => return true,
            ReaderState::Finished => return false,
            ReaderState::Idle => {}
        }
        if !self.is_running() {
            slot.state = ReaderState::Finished;
            return false;
        }
        let Some(read_half) = slot.read_half.take() else {
            slot.state = ReaderState::Finished;
            return false;
        };
        slot.state = ReaderState::Running;
        drop(slot);

        self.spawn_reader(read_half);
        true
    }

    /// The broadcast reader: sole reader of the PTY, one task per session.
    ///
    /// Runs on the blocking pool because the PTY read blocks; everything it
    /// touches (buffer, subscriber set) is non-blocking. Exits on EOF, read
    /// error, or cancellation, then finalizes exactly once: status to
    /// stopped, sentinel to every subscriber.
    fn spawn_reader(&self, mut read_half: Box<dyn Read + Send>) {
        let session_id = self.id.clone();
        let stopped = Arc::clone(&self.stopped);
        let buffer = Arc::clone(&self.buffer);
        let subscribers = self.subscribers.clone();
        let slot = Arc::clone(&self.reader);
        let cancelled = self.cancelled.clone();
        let chunk_size = self.read_chunk_bytes;

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut buf = vec![0u8; chunk_size];
                loop {
                    match read_half.read(&mut buf) {
                        Ok(0) => {
                            tracing::debug!(session = %session_id, "pty reached EOF");
                            break;
                        }
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            Self::publish(&buffer, &subscribers, data);
                        }
                        Err(e) => {
                            // EIO when the child side closes is the normal
                            // end of a session, not a fault.
                            tracing::debug!(session = %session_id, error = %e, "pty read ended");
                            break;
                        }
                    }
                    if cancelled.is_cancelled() {
                        break;
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!(session = %session_id, "pty reader panicked: {e:?}");
            }

            // Finalize: status transition, terminal state, one sentinel per
            // currently registered subscriber.
            stopped.store(true, Ordering::Release);
            slot.lock().state = ReaderState::Finished;
            subscribers.close_all();
            tracing::debug!(session = %session_id, "broadcast reader finished");
        });
    }

    /// Append a chunk to the replay buffer and fan it out to subscribers,
    /// holding the buffer lock across both steps. `subscribe` takes its
    /// snapshot under the same lock, so an attaching client can never see a
    /// chunk in its snapshot and again on its live channel.
    fn publish(buffer: &Mutex<ReplayBuffer>, subscribers: &SubscriberSet, data: Bytes) {
        let mut buffer = buffer.lock();
        buffer.push(data.clone());
        subscribers.broadcast(&data);
    }

    /// Tear down shared state after a kill/remove: cancel the reader, close
    /// the write handle and descriptor, release the read half if no reader
    /// ever claimed it, flush the sentinel to any remaining subscribers.
    /// Safe to call more than once.
    async fn teardown(&self) {
        self.cancelled.cancel();
        self.writer.lock().await.close();
        {
            let mut slot = self.reader.lock();
            slot.read_half = None;
            if slot.state == ReaderState::Idle {
                slot.state = ReaderState::Finished;
            }
        }
        if let Some(pty) = self.pty.lock().as_mut() {
            pty.close();
        }
        self.subscribers.close_all();
    }

    #[cfg(test)]
    fn reader_state_finished(&self) -> bool {
        self.reader.lock().state == ReaderState::Finished
    }
}

/// Owns the id → session map and mediates every lifecycle transition.
///
/// Explicitly constructed and handed to the transport layer (no process-wide
/// singleton); `cleanup_all` is the shutdown hook.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
    config: Arc<Config>,
}

impl SessionRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a session: resolve the project workspace, launch a shell in a
    /// fresh PTY, and register the session under a new opaque id.
    ///
    /// Launch failures (workspace creation, PTY allocation, spawn) surface
    /// to the caller and register nothing — there is no partial session.
    pub async fn create(&self, project: &str, name: &str) -> Result<Session, PtyError> {
        let spec = LaunchSpec {
            cwd: workspace::resolve(&self.config.workspace_root, project),
            shell: self.config.shell.clone(),
            rows: self.config.rows,
            cols: self.config.cols,
        };
        // fork/exec happens off the async runtime.
        let pty = tokio::task::spawn_blocking(move || PtyProcess::launch(&spec))
            .await
            .map_err(|e| PtyError::SpawnCommand(anyhow::anyhow!(e)))??;

        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(
            id.clone(),
            project.to_string(),
            name.to_string(),
            pty,
            &self.config,
        );
        self.inner.write().insert(id.clone(), session.clone());
        tracing::info!(session = %id, project, name, pid = ?session.pid, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().get(id).cloned()
    }

    /// All sessions, optionally filtered by project, creation order not
    /// guaranteed.
    pub fn list(&self, project: Option<&str>) -> Vec<Session> {
        let inner = self.inner.read();
        inner
            .values()
            .filter(|s| project.map_or(true, |p| s.project == p))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request graceful termination: SIGTERM to the process group, status to
    /// stopped. Does not close the descriptor — the reader drains remaining
    /// output and finalizes on EOF. Returns `false` for unknown ids and
    /// sessions that were already stopped.
    pub fn stop(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !session.is_running() {
            return false;
        }
        session.signal(libc::SIGTERM);
        session.mark_stopped();
        tracing::info!(session = %id, "session stopped");
        true
    }

    /// Forceful termination: SIGKILL, status to stopped, descriptor closed
    /// (exactly once), reader cancelled, sentinel flushed to every
    /// subscriber, write handle dropped. The session stays listed until
    /// `remove`. Returns `false` only for unknown ids.
    pub async fn kill(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        session.signal(libc::SIGKILL);
        session.mark_stopped();
        session.teardown().await;
        tracing::info!(session = %id, "session killed");
        true
    }

    /// Kill if still running, tear down, reap the child non-blockingly, and
    /// delete the registry entry. Returns `false` for unknown ids.
    pub async fn remove(&self, id: &str) -> bool {
        let Some(session) = self.inner.write().remove(id) else {
            return false;
        };
        if session.is_running() {
            session.signal(libc::SIGKILL);
            session.mark_stopped();
        }
        session.teardown().await;
        // Reap without blocking; if the child needs a moment to die the
        // handle is dropped and the OS parents it away on process exit.
        if let Some(mut pty) = session.pty.lock().take() {
            pty.try_reap();
        }
        tracing::info!(session = %id, "session removed");
        true
    }

    /// Remove every session. Invoked at process shutdown so no child
    /// process or descriptor outlives a controlled exit.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.inner.read().keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.remove(&id).await;
        }
        if count > 0 {
            tracing::info!(count, "all sessions cleaned up");
        }
    }

    /// Non-blocking liveness poll for one session; see
    /// [`Session::check_alive`]. Unknown ids report `false`.
    pub fn check_alive(&self, id: &str) -> bool {
        self.get(id).map(|s| s.check_alive()).unwrap_or(false)
    }

    /// Subscribe a new client to a session's output, returning the channel
    /// and the atomically taken replay snapshot. `None` for unknown ids.
    pub fn subscribe(&self, id: &str) -> Option<(Subscription, Bytes)> {
        self.get(id).map(|s| s.subscribe())
    }

    /// Idempotent unsubscribe; unknown session or subscriber ids are no-ops.
    pub fn unsubscribe(&self, id: &str, subscriber_id: u64) {
        if let Some(session) = self.get(id) {
            session.unsubscribe(subscriber_id);
        }
    }

    /// Replay snapshot for a session; empty for unknown ids.
    pub fn get_buffer(&self, id: &str) -> Bytes {
        self.get(id).map(|s| s.snapshot()).unwrap_or_default()
    }

    pub fn clear_buffer(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.clear_buffer();
                true
            }
            None => false,
        }
    }

    /// Serialized write of client input; see [`Session::write`].
    pub async fn write(&self, id: &str, data: &[u8]) -> bool {
        match self.get(id) {
            Some(session) => session.write(data).await,
            None => false,
        }
    }

    pub fn resize(&self, id: &str, rows: u16, cols: u16) -> bool {
        self.get(id).map(|s| s.resize(rows, cols)).unwrap_or(false)
    }
}
