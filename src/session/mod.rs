//! Session manager: one authenticated gateway connection per account.
//!
//! `start` opens the transport, performs the registration handshake and only
//! returns once the gateway has assigned a session id. The reader marks the
//! session Ready as soon as the registration ack arrives. From then on it
//! acks every inbound frame, intercepts protocol responses (registration,
//! heartbeat) and hands everything else to the [`Router`] through the shared
//! [`MessageScheduler`]. A heartbeat task runs while the session is Ready.

pub mod state;
pub mod transport;

pub use state::{SessionHandle, SessionRegistry, SessionState};
pub use transport::{Connector, FrameSink, FrameSource, TransportRequest, WsConnector};

use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::events::{CloseReason, EventSender, SessionEvent};
use crate::protocol::{self, sign, Envelope};
use crate::router::{RouteContext, Router};
use crate::scheduler::MessageScheduler;
use crate::token::{TokenManager, TokenOutcome};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no usable cookie (missing or without unb)")]
    NoCookie,
    #[error("no credential available")]
    NoCredential,
    #[error("verification required: {0}")]
    VerificationRequired(String),
    #[error("handshake did not complete in time")]
    HandshakeTimeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("registration rejected with code {code}")]
    Rejected { code: i64 },
    #[error("a session for this account is already running")]
    AlreadyRunning,
}

/// Inputs for [`SessionManager::start`].
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub account_id: String,
    pub cookie: String,
    pub device_id: String,
    /// Use this credential instead of asking the token manager.
    pub credential: Option<String>,
}

/// A session that completed registration.
#[derive(Clone)]
pub struct ReadySession {
    pub account_id: String,
    pub session_id: String,
    pub handle: Arc<SessionHandle>,
}

impl std::fmt::Debug for ReadySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadySession")
            .field("account_id", &self.account_id)
            .field("session_id", &self.session_id)
            .field("state", &self.handle.state())
            .finish()
    }
}

impl ReadySession {
    /// Resolves when the session shuts down, with the reason.
    pub async fn closed(&self) -> CloseReason {
        self.handle.closed().await
    }
}

type RegistrationSignal = oneshot::Sender<Result<String, SessionError>>;

struct ManagerInner {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    router: Arc<Router>,
    scheduler: Arc<MessageScheduler>,
    tokens: Option<Arc<TokenManager>>,
    events: EventSender,
    clock: Arc<dyn Clock>,
    transport: TransportConfig,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn Connector>,
        router: Arc<Router>,
        scheduler: Arc<MessageScheduler>,
        tokens: Option<Arc<TokenManager>>,
        events: EventSender,
        clock: Arc<dyn Clock>,
        transport: TransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                connector,
                router,
                scheduler,
                tokens,
                events,
                clock,
                transport,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn is_ready(&self, account_id: &str) -> bool {
        self.inner.registry.is_ready(account_id)
    }

    /// Fails fast unless the account's session is Ready.
    pub async fn send(
        &self,
        account_id: &str,
        conversation_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> bool {
        self.inner
            .registry
            .send(account_id, conversation_id, recipient_id, text)
            .await
    }

    /// Connect and register. On any failure nothing is left behind: the
    /// registry entry is removed and the transport closed.
    pub async fn start(&self, request: StartRequest) -> Result<ReadySession, SessionError> {
        let inner = &self.inner;
        let account_id = request.account_id.as_str();
        let cookie = request.cookie.trim();
        if cookie.is_empty() {
            return Err(SessionError::NoCookie);
        }
        let local_user_id = sign::user_id(cookie).ok_or(SessionError::NoCookie)?;
        if inner.registry.get(account_id).is_some() {
            return Err(SessionError::AlreadyRunning);
        }

        let credential = inner.resolve_credential(&request).await?;
        let handle = SessionHandle::new(
            account_id,
            local_user_id,
            credential,
            Arc::clone(&inner.clock),
            inner.transport.log_frames,
        );
        if !inner.registry.try_insert(Arc::clone(&handle)) {
            return Err(SessionError::AlreadyRunning);
        }

        tracing::info!("Session[{account_id}]: connecting to {}", inner.transport.ws_url);
        let handshake = inner.handshake(&handle, cookie, &request.device_id);
        let outcome = match tokio::time::timeout(inner.transport.connect_timeout(), handshake).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::HandshakeTimeout),
        };
        let session_id = match outcome {
            Ok(sid) => sid,
            Err(e) => {
                tracing::warn!("Session[{account_id}]: start failed: {e}");
                let reason = CloseReason::TransportError(e.to_string());
                handle.close(reason.clone());
                handle.finish(reason).await;
                inner.registry.remove_if_same(&handle);
                return Err(e);
            }
        };

        inner.spawn_heartbeat(Arc::clone(&handle));
        tracing::info!("Session[{account_id}]: ready (sid={session_id})");
        inner.events.emit(SessionEvent::Registered {
            account_id: account_id.to_string(),
            session_id: session_id.clone(),
            credential: handle.credential().to_string(),
        });
        Ok(ReadySession {
            account_id: account_id.to_string(),
            session_id,
            handle,
        })
    }

    /// Close the account's session and wait for teardown. `false` when no
    /// session was running.
    pub async fn stop(&self, account_id: &str) -> bool {
        let Some(handle) = self.inner.registry.get(account_id) else {
            return false;
        };
        tracing::info!("Session[{account_id}]: stopping");
        handle.close(CloseReason::Stopped);
        self.inner.registry.remove_if_same(&handle);
        handle.closed().await;
        true
    }

    pub async fn stop_all(&self) {
        for account_id in self.inner.registry.accounts() {
            self.stop(&account_id).await;
        }
    }
}

impl ManagerInner {
    async fn resolve_credential(&self, request: &StartRequest) -> Result<String, SessionError> {
        if let Some(credential) = request.credential.as_deref().filter(|c| !c.is_empty()) {
            return Ok(credential.to_string());
        }
        let Some(tokens) = &self.tokens else {
            return Err(SessionError::NoCredential);
        };
        match tokens.current(&request.account_id, &request.device_id).await {
            Ok(TokenOutcome::Issued(state)) => Ok(state.credential),
            Ok(TokenOutcome::VerificationRequired { url }) => {
                Err(SessionError::VerificationRequired(url))
            }
            Err(e) => {
                tracing::warn!("Session[{}]: credential unavailable: {e}", request.account_id);
                Err(SessionError::NoCredential)
            }
        }
    }

    async fn handshake(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        cookie: &str,
        device_id: &str,
    ) -> Result<String, SessionError> {
        let request = TransportRequest {
            url: self.transport.ws_url.clone(),
            cookie: cookie.to_string(),
            user_agent: self.transport.user_agent.clone(),
            origin: self.transport.origin.clone(),
            host: self.transport.host.clone(),
        };
        let (sink, source) = self
            .connector
            .connect(&request)
            .await
            .map_err(|e| SessionError::Transport(format!("{e:#}")))?;
        handle.attach(sink).await;
        handle.set_state(SessionState::Registering);

        let registration = protocol::registration(
            handle.credential(),
            device_id,
            &self.transport.user_agent,
            self.clock.now_millis(),
        );
        let registration_mid = registration.mid().unwrap_or_default().to_string();
        let (registered_tx, registered_rx) = oneshot::channel();
        let reader = Arc::clone(self);
        let reader_handle = Arc::clone(handle);
        tokio::spawn(async move {
            reader
                .read_loop(reader_handle, source, registration_mid, Some(registered_tx))
                .await;
        });

        handle
            .write(&registration)
            .await
            .map_err(|e| SessionError::Transport(format!("{e:#}")))?;
        self.clock.sleep(self.transport.handshake_delay()).await;
        handle
            .write(&protocol::sync_ack(self.clock.now_millis()))
            .await
            .map_err(|e| SessionError::Transport(format!("{e:#}")))?;

        match registered_rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Transport(
                "connection closed before registration completed".into(),
            )),
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        mut source: Box<dyn FrameSource>,
        registration_mid: String,
        mut registered: Option<RegistrationSignal>,
    ) {
        let account_id = handle.account_id().to_string();
        let shutdown = handle.shutdown_token();
        let reason = loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => {
                    break handle.close_reason().unwrap_or(CloseReason::Stopped);
                }
                frame = source.next_text() => frame,
            };
            let text = match frame {
                None => break CloseReason::TransportClosed,
                Some(Err(e)) => {
                    tracing::error!("Session[{account_id}]: read failed: {e:#}");
                    break CloseReason::TransportError(format!("{e:#}"));
                }
                Some(Ok(text)) => text,
            };
            if self.transport.log_frames {
                tracing::debug!("Session[{account_id}]: <- {text}");
            }
            let envelope = match Envelope::parse(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Session[{account_id}]: dropping malformed frame: {e}");
                    continue;
                }
            };

            if envelope.has_headers() {
                let ack = protocol::ack_for(&envelope, handle.session_id().as_deref());
                if let Err(e) = handle.write(&ack).await {
                    tracing::warn!("Session[{account_id}]: ack failed: {e}");
                }
            }

            if let Some(signal) = registered.take() {
                match registration_result(&envelope, &registration_mid, handle.state()) {
                    Some(result) => {
                        // Ready before the next frame is read, so pushes that
                        // follow the ack can already send.
                        if let Ok(sid) = &result {
                            handle.set_session_id(sid);
                            handle.set_state(SessionState::Ready);
                        }
                        let _ = signal.send(result);
                        continue;
                    }
                    None => registered = Some(signal),
                }
            }

            if envelope.is_response() {
                if let Some(mid) = envelope.mid() {
                    if handle.heartbeat_acked(mid) {
                        continue;
                    }
                }
            }

            let ctx = RouteContext {
                account_id: account_id.clone(),
                local_user_id: handle.local_user_id().to_string(),
                session: Arc::clone(&handle),
                events: self.events.clone(),
            };
            let router = Arc::clone(&self.router);
            let admitted = self
                .scheduler
                .submit(async move {
                    router.dispatch(&ctx, &envelope).await;
                })
                .await;
            if !admitted {
                tracing::warn!("Session[{account_id}]: scheduler closed, frame dropped");
            }
        };

        let was_ready = handle.session_id().is_some();
        handle.finish(reason.clone()).await;
        self.registry.remove_if_same(&handle);
        if was_ready {
            tracing::info!("Session[{account_id}]: closed ({reason})");
            self.events.emit(SessionEvent::Closed {
                account_id,
                reason,
            });
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, handle: Arc<SessionHandle>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = handle.shutdown_token();
            let interval = inner.transport.heartbeat_interval();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = inner.clock.sleep(interval) => {}
                }
                if !handle.is_ready() {
                    break;
                }
                let beat = protocol::heartbeat(inner.clock.now_millis());
                let mid = beat.mid().unwrap_or_default().to_string();
                if let Some(missed) = handle.heartbeat_sent(&mid) {
                    tracing::warn!(
                        "Session[{}]: heartbeat {missed} was never acknowledged",
                        handle.account_id()
                    );
                }
                if let Err(e) = handle.write(&beat).await {
                    tracing::warn!("Session[{}]: heartbeat write failed: {e}", handle.account_id());
                    handle.close(CloseReason::TransportError(e.to_string()));
                    break;
                }
            }
        });
    }
}

/// Whether `envelope` answers the registration request, and how.
fn registration_result(
    envelope: &Envelope,
    registration_mid: &str,
    state: SessionState,
) -> Option<Result<String, SessionError>> {
    if !envelope.is_response() {
        return None;
    }
    let code = envelope.code?;
    let mid_matches = !registration_mid.is_empty() && envelope.mid() == Some(registration_mid);
    if code == 200 {
        let sid = envelope.sid();
        if mid_matches || (state == SessionState::Registering && sid.is_some()) {
            return Some(Ok(sid.unwrap_or_default().to_string()));
        }
        return None;
    }
    mid_matches.then_some(Err(SessionError::Rejected { code }))
}
