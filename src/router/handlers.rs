use super::{message_identity, Handler, RouteContext};
use crate::automation::Pipeline;
use crate::codec::{self, DecryptedMessage, MessageDirection};
use crate::events::{CloseReason, SessionEvent};
use crate::protocol::{self, Envelope};
use crate::store::MessageStore;
use crate::token::TokenManager;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `/s/para` and `/s/sync`: decode every pushed payload, log the chat
/// messages and hand them to the automation pipeline without waiting on it.
pub struct SyncPushHandler {
    messages: Arc<dyn MessageStore>,
    pipeline: Option<Arc<Pipeline>>,
}

impl SyncPushHandler {
    pub fn new(messages: Arc<dyn MessageStore>, pipeline: Option<Arc<Pipeline>>) -> Self {
        Self { messages, pipeline }
    }
}

#[async_trait]
impl Handler for SyncPushHandler {
    type Params = Vec<String>;

    fn name(&self) -> &'static str {
        "sync_push"
    }

    fn matches(&self, _ctx: &RouteContext, envelope: &Envelope) -> bool {
        envelope
            .body
            .as_ref()
            .is_some_and(|body| body.get("syncPushPackage").is_some())
    }

    fn parse(&self, _ctx: &RouteContext, envelope: &Envelope) -> Option<Vec<String>> {
        let payloads = protocol::sync_push_payloads(envelope);
        (!payloads.is_empty()).then_some(payloads)
    }

    async fn execute(&self, ctx: &RouteContext, payloads: Vec<String>) -> Result<()> {
        for raw in payloads {
            let Some(tree) = codec::decode_payload(&raw).into_tree() else {
                tracing::debug!("SyncPush[{}]: payload is not structured; skipped", ctx.account_id);
                continue;
            };
            if codec::classify_direction(&tree, &ctx.local_user_id) == MessageDirection::ReadReceipt {
                tracing::debug!("SyncPush[{}]: read receipt", ctx.account_id);
                continue;
            }
            let Some(message) = DecryptedMessage::from_tree(&tree, &ctx.local_user_id) else {
                tracing::debug!("SyncPush[{}]: non-chat record skipped", ctx.account_id);
                continue;
            };

            tracing::info!(
                "SyncPush[{}]: {} {} from {} ({}): {}",
                ctx.account_id,
                message.direction.as_str(),
                message.pnm_id,
                message.sender_name,
                message.sender_user_id,
                crate::util::truncate_with_ellipsis(&message.msg_content, 60)
            );

            match self.messages.append(&ctx.account_id, &message).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    "SyncPush[{}]: {} already logged",
                    ctx.account_id,
                    message.pnm_id
                ),
                Err(e) => tracing::warn!("SyncPush[{}]: message log failed: {e:#}", ctx.account_id),
            }

            if let Some(pipeline) = &self.pipeline {
                let pipeline = Arc::clone(pipeline);
                let account_id = ctx.account_id.clone();
                let local_user_id = ctx.local_user_id.clone();
                tokio::spawn(async move {
                    pipeline.process(&account_id, &local_user_id, message).await;
                });
            }
        }
        Ok(())
    }
}

/// 200 response carrying the id of a message we sent.
#[derive(Debug, Default)]
pub struct SendConfirmationHandler;

#[async_trait]
impl Handler for SendConfirmationHandler {
    type Params = String;

    fn name(&self) -> &'static str {
        "send_confirmation"
    }

    fn parse(&self, _ctx: &RouteContext, envelope: &Envelope) -> Option<String> {
        message_identity(envelope.body.as_ref())
    }

    async fn execute(&self, ctx: &RouteContext, message_id: String) -> Result<()> {
        ctx.session.record_send_confirmation();
        tracing::debug!("Session[{}]: send confirmed as {message_id}", ctx.account_id);
        Ok(())
    }
}

/// 401 while Ready: drop the cached credential, announce the expiry and
/// close the session so the owner reconnects with a fresh one.
pub struct TokenExpiryHandler {
    tokens: Option<Arc<TokenManager>>,
}

impl TokenExpiryHandler {
    pub fn new(tokens: Option<Arc<TokenManager>>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Handler for TokenExpiryHandler {
    type Params = ();

    fn name(&self) -> &'static str {
        "token_expiry"
    }

    fn matches(&self, ctx: &RouteContext, _envelope: &Envelope) -> bool {
        ctx.session.is_ready()
    }

    fn parse(&self, _ctx: &RouteContext, _envelope: &Envelope) -> Option<()> {
        Some(())
    }

    async fn execute(&self, ctx: &RouteContext, _params: ()) -> Result<()> {
        tracing::warn!("Session[{}]: credential rejected (401); closing", ctx.account_id);
        if let Some(tokens) = &self.tokens {
            tokens.invalidate(&ctx.account_id);
        }
        ctx.events.emit(SessionEvent::TokenExpired {
            account_id: ctx.account_id.clone(),
        });
        ctx.session.close(CloseReason::TokenExpired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventSender;
    use crate::router::{Dispatch, FrameHandler};
    use crate::session::{SessionHandle, SessionState};
    use crate::store::SqliteStore;
    use serde_json::json;

    fn ctx(events: EventSender) -> RouteContext {
        RouteContext {
            account_id: "acct-1".into(),
            local_user_id: "1001".into(),
            session: SessionHandle::new("acct-1", "1001", "cred", ManualClock::new(0), false),
            events,
        }
    }

    fn push_frame(payloads: &[String]) -> Envelope {
        let data: Vec<_> = payloads.iter().map(|p| json!({"data": p})).collect();
        Envelope::parse(
            &json!({
                "lwp": "/s/para",
                "headers": {"mid": "9 0"},
                "body": {"syncPushPackage": {"data": data}}
            })
            .to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sync_push_logs_chat_messages_once() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let handler = SyncPushHandler::new(store.clone(), None);
        let chat = codec::encode_payload(&json!({
            "1": {
                "2": "55012@goofish",
                "3": "3381.PNM",
                "5": 1,
                "6": {"3": {"4": 1}},
                "10": {"senderUserId": "2201", "receiverUserId": "1001", "reminderContent": "在吗"}
            }
        }))
        .unwrap();
        let receipt = codec::encode_payload(&json!({"2": 2, "1": {}})).unwrap();
        let frame = push_frame(&[chat.clone(), receipt, "!!".into()]);

        let ctx = ctx(EventSender::detached());
        assert_eq!(handler.handle(&ctx, &frame).await, Dispatch::Handled("sync_push"));
        assert_eq!(handler.handle(&ctx, &frame).await, Dispatch::Handled("sync_push"));

        let message = DecryptedMessage::from_tree(
            &codec::decode_payload(&chat).into_tree().unwrap(),
            "1001",
        )
        .unwrap();
        assert!(!store.append("acct-1", &message).await.unwrap());
    }

    #[tokio::test]
    async fn sync_push_declines_frames_without_payloads() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let handler = SyncPushHandler::new(store, None);
        let ctx = ctx(EventSender::detached());
        let empty = push_frame(&[]);
        assert_eq!(handler.handle(&ctx, &empty).await, Dispatch::Declined("sync_push"));
    }

    #[tokio::test]
    async fn token_expiry_closes_ready_session_and_emits_event() {
        let (events, mut rx) = EventSender::channel();
        let ctx = ctx(events);
        let handler = TokenExpiryHandler::new(None);
        let frame = Envelope::parse(r#"{"code":401,"headers":{"mid":"1 0"}}"#).unwrap();

        assert_eq!(handler.handle(&ctx, &frame).await, Dispatch::Declined("token_expiry"));
        assert!(rx.try_recv().is_err());

        ctx.session.set_state(SessionState::Ready);
        assert_eq!(handler.handle(&ctx, &frame).await, Dispatch::Handled("token_expiry"));
        assert_eq!(ctx.session.state(), SessionState::Closing);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::TokenExpired {
                account_id: "acct-1".into()
            }
        );
    }

    #[tokio::test]
    async fn send_confirmation_counts_on_session() {
        let ctx = ctx(EventSender::detached());
        let frame =
            Envelope::parse(r#"{"code":200,"headers":{"mid":"1 0"},"body":{"messageId":"m-1"}}"#)
                .unwrap();
        assert_eq!(
            SendConfirmationHandler.handle(&ctx, &frame).await,
            Dispatch::Handled("send_confirmation")
        );
        assert_eq!(ctx.session.sends_confirmed(), 1);
    }
}
