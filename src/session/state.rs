//! Per-account session state and the registry that owns it.

use super::transport::FrameSink;
use crate::automation::MessageSender;
use crate::clock::Clock;
use crate::events::CloseReason;
use crate::protocol::{self, Envelope};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registering,
    Ready,
    Closing,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Ready => "ready",
            Self::Closing => "closing",
        }
    }
}

/// One account's live connection and protocol state.
pub struct SessionHandle {
    account_id: String,
    local_user_id: String,
    credential: String,
    state: RwLock<SessionState>,
    session_id: RwLock<Option<String>>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    frames_sent: AtomicU64,
    sends_confirmed: AtomicU64,
    last_heartbeat_ack_ms: AtomicI64,
    pending_heartbeat: Mutex<Option<String>>,
    close_reason: Mutex<Option<CloseReason>>,
    closed: watch::Sender<Option<CloseReason>>,
    shutdown: CancellationToken,
    log_frames: bool,
    clock: Arc<dyn Clock>,
}

impl SessionHandle {
    pub fn new(
        account_id: impl Into<String>,
        local_user_id: impl Into<String>,
        credential: impl Into<String>,
        clock: Arc<dyn Clock>,
        log_frames: bool,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(None);
        Arc::new(Self {
            account_id: account_id.into(),
            local_user_id: local_user_id.into(),
            credential: credential.into(),
            state: RwLock::new(SessionState::Connecting),
            session_id: RwLock::new(None),
            writer: tokio::sync::Mutex::new(None),
            frames_sent: AtomicU64::new(0),
            sends_confirmed: AtomicU64::new(0),
            last_heartbeat_ack_ms: AtomicI64::new(0),
            pending_heartbeat: Mutex::new(None),
            close_reason: Mutex::new(None),
            closed,
            shutdown: CancellationToken::new(),
            log_frames,
            clock,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        if *state != next {
            tracing::debug!(
                "Session[{}]: {} -> {}",
                self.account_id,
                state.as_str(),
                next.as_str()
            );
            *state = next;
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub(crate) fn set_session_id(&self, sid: &str) {
        *self.session_id.write() = Some(sid.to_string());
    }

    pub(crate) async fn attach(&self, sink: Box<dyn FrameSink>) {
        *self.writer.lock().await = Some(sink);
    }

    /// Serialize and write one envelope. Writers queue on the sink mutex, so
    /// frames never interleave.
    pub async fn write(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.to_text();
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            anyhow::bail!("transport is not open");
        };
        if self.log_frames {
            tracing::debug!("Session[{}] >> {}", self.account_id, text);
        }
        sink.send_text(text).await?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Frames written over the lifetime of this session.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn record_send_confirmation(&self) {
        self.sends_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sends_confirmed(&self) -> u64 {
        self.sends_confirmed.load(Ordering::Relaxed)
    }

    /// Remember the mid of an outgoing heartbeat. Returns the previous one if
    /// it was never acknowledged.
    pub(crate) fn heartbeat_sent(&self, mid: &str) -> Option<String> {
        self.pending_heartbeat.lock().replace(mid.to_string())
    }

    /// Clear the pending heartbeat when `mid` matches it.
    pub(crate) fn heartbeat_acked(&self, mid: &str) -> bool {
        let mut pending = self.pending_heartbeat.lock();
        if pending.as_deref() == Some(mid) {
            *pending = None;
            self.last_heartbeat_ack_ms
                .store(self.clock.now_millis(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn last_heartbeat_ack_ms(&self) -> i64 {
        self.last_heartbeat_ack_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin closing. The first reason wins; the reader task finishes teardown.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut current = self.close_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        if self.state() != SessionState::Disconnected {
            self.set_state(SessionState::Closing);
        }
        self.shutdown.cancel();
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Close the transport and publish the final reason. Idempotent.
    pub(crate) async fn finish(&self, reason: CloseReason) {
        self.shutdown.cancel();
        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!("Session[{}]: close failed: {e}", self.account_id);
            }
        }
        self.set_state(SessionState::Disconnected);
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the session has fully shut down.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.subscribe();
        // The guard borrows `rx`, so it must drop before `rx` does.
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::TransportClosed),
            Err(_) => CloseReason::TransportClosed,
        };
        reason
    }
}

/// Account → live session map, shared by the manager, the router handlers
/// and the automation sender.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        })
    }

    /// Claim the account slot. Fails when a session is already registered.
    pub(crate) fn try_insert(&self, handle: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(handle.account_id()) {
            return false;
        }
        sessions.insert(handle.account_id().to_string(), handle);
        true
    }

    pub fn get(&self, account_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(account_id).cloned()
    }

    /// Remove `handle` if it is still the registered session for its account.
    pub(crate) fn remove_if_same(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(handle.account_id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(handle.account_id());
                true
            }
            _ => false,
        }
    }

    pub fn is_ready(&self, account_id: &str) -> bool {
        self.get(account_id).is_some_and(|h| h.is_ready())
    }

    pub fn accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Send a text message on the account's session. Fails fast (no write,
    /// no queueing) unless the session is Ready.
    pub async fn send(
        &self,
        account_id: &str,
        conversation_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> bool {
        let Some(handle) = self.get(account_id) else {
            tracing::warn!("Session[{account_id}]: send skipped, no session");
            return false;
        };
        if !handle.is_ready() {
            tracing::warn!(
                "Session[{account_id}]: send skipped, state is {}",
                handle.state().as_str()
            );
            return false;
        }
        let envelope = protocol::send_text(
            conversation_id,
            recipient_id,
            handle.local_user_id(),
            text,
            self.clock.now_millis(),
        );
        match handle.write(&envelope).await {
            Ok(()) => {
                tracing::info!(
                    "Session[{account_id}]: sent {} to {recipient_id}",
                    crate::util::truncate_with_ellipsis(text, 40)
                );
                true
            }
            Err(e) => {
                tracing::warn!("Session[{account_id}]: send failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl MessageSender for SessionRegistry {
    async fn send_text(
        &self,
        account_id: &str,
        conversation_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> bool {
        self.send(account_id, conversation_id, recipient_id, text).await
    }
}
