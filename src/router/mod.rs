//! Path-addressed dispatch for inbound envelopes.
//!
//! Handlers are built from independent optional stages (`matches`, `parse`,
//! `execute`, `after`); any type implementing [`Handler`] is usable as a
//! [`FrameHandler`] through the blanket impl, so the router only ever stores
//! trait objects.

pub mod handlers;

pub use handlers::{SendConfirmationHandler, SyncPushHandler, TokenExpiryHandler};

use crate::events::EventSender;
use crate::protocol::Envelope;
use crate::session::SessionHandle;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a handler may need about the session a frame arrived on.
#[derive(Clone)]
pub struct RouteContext {
    pub account_id: String,
    pub local_user_id: String,
    pub session: Arc<SessionHandle>,
    pub events: EventSender,
}

/// Staged handler contract. Only `parse` and `execute` are required.
#[async_trait]
pub trait Handler: Send + Sync {
    type Params: Send + 'static;

    fn name(&self) -> &'static str;

    fn matches(&self, _ctx: &RouteContext, _envelope: &Envelope) -> bool {
        true
    }

    fn parse(&self, ctx: &RouteContext, envelope: &Envelope) -> Option<Self::Params>;

    async fn execute(&self, ctx: &RouteContext, params: Self::Params) -> Result<()>;

    async fn after(&self, _ctx: &RouteContext, _result: &Result<()>) {}
}

/// Object-safe form stored in the routing table.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &RouteContext, envelope: &Envelope) -> Dispatch;
}

#[async_trait]
impl<H: Handler> FrameHandler for H {
    fn name(&self) -> &'static str {
        Handler::name(self)
    }

    async fn handle(&self, ctx: &RouteContext, envelope: &Envelope) -> Dispatch {
        let name = Handler::name(self);
        if !self.matches(ctx, envelope) {
            return Dispatch::Declined(name);
        }
        let Some(params) = self.parse(ctx, envelope) else {
            return Dispatch::Declined(name);
        };
        let result = self.execute(ctx, params).await;
        self.after(ctx, &result).await;
        match result {
            Ok(()) => Dispatch::Handled(name),
            Err(e) => {
                tracing::warn!("Router[{}]: {name} failed: {e:#}", ctx.account_id);
                Dispatch::Failed(name)
            }
        }
    }
}

/// What the router did with one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled(&'static str),
    /// The handler's `matches`/`parse` stage turned the envelope down.
    Declined(&'static str),
    Failed(&'static str),
    /// Plain 200 response with nothing to act on.
    Acknowledged,
    /// Non-200/401 response, logged only.
    StatusLogged(i64),
    Unrouted,
}

/// How a path-less response is classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    SendConfirmation(String),
    Ack,
    Unauthorized,
    Other(i64),
}

/// Message identity carried by a send confirmation body.
pub fn message_identity(body: Option<&Value>) -> Option<String> {
    let body = body?;
    ["messageId", "msgId", "pnmId"]
        .iter()
        .find_map(|key| body.get(*key))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

pub fn classify_response(envelope: &Envelope) -> Option<ResponseKind> {
    if envelope.path.is_some() {
        return None;
    }
    let code = envelope.code?;
    Some(match code {
        200 => match message_identity(envelope.body.as_ref()) {
            Some(id) => ResponseKind::SendConfirmation(id),
            None => ResponseKind::Ack,
        },
        401 => ResponseKind::Unauthorized,
        other => ResponseKind::Other(other),
    })
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Vec<Arc<dyn FrameHandler>>>,
    send_confirmation: Option<Arc<dyn FrameHandler>>,
    unauthorized: Option<Arc<dyn FrameHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `path`. Several handlers may share a path; the
    /// first one that does not decline wins.
    pub fn route(mut self, path: &str, handler: Arc<dyn FrameHandler>) -> Self {
        self.routes.entry(path.to_string()).or_default().push(handler);
        self
    }

    pub fn on_send_confirmation(mut self, handler: Arc<dyn FrameHandler>) -> Self {
        self.send_confirmation = Some(handler);
        self
    }

    pub fn on_unauthorized(mut self, handler: Arc<dyn FrameHandler>) -> Self {
        self.unauthorized = Some(handler);
        self
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub async fn dispatch(&self, ctx: &RouteContext, envelope: &Envelope) -> Dispatch {
        if let Some(path) = envelope.path.as_deref() {
            let Some(handlers) = self.routes.get(path) else {
                tracing::debug!("Router[{}]: no handler for {path}; dropped", ctx.account_id);
                return Dispatch::Unrouted;
            };
            let mut outcome = Dispatch::Unrouted;
            for handler in handlers {
                outcome = handler.handle(ctx, envelope).await;
                if !matches!(outcome, Dispatch::Declined(_)) {
                    break;
                }
            }
            return outcome;
        }

        match classify_response(envelope) {
            Some(ResponseKind::SendConfirmation(_)) => match &self.send_confirmation {
                Some(handler) => handler.handle(ctx, envelope).await,
                None => Dispatch::Acknowledged,
            },
            Some(ResponseKind::Ack) => Dispatch::Acknowledged,
            Some(ResponseKind::Unauthorized) => match &self.unauthorized {
                Some(handler) => handler.handle(ctx, envelope).await,
                None => {
                    tracing::warn!("Router[{}]: 401 with no expiry handler", ctx.account_id);
                    Dispatch::StatusLogged(401)
                }
            },
            Some(ResponseKind::Other(code)) => {
                tracing::warn!(
                    "Router[{}]: response code {code} (mid={})",
                    ctx.account_id,
                    envelope.mid().unwrap_or("-")
                );
                Dispatch::StatusLogged(code)
            }
            None => {
                tracing::debug!("Router[{}]: frame without path or code; dropped", ctx.account_id);
                Dispatch::Unrouted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> RouteContext {
        RouteContext {
            account_id: "acct-1".into(),
            local_user_id: "1001".into(),
            session: SessionHandle::new("acct-1", "1001", "cred", ManualClock::new(0), false),
            events: EventSender::detached(),
        }
    }

    struct Counting {
        name: &'static str,
        accept: bool,
        hits: Arc<AtomicUsize>,
        afters: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for Counting {
        type Params = String;

        fn name(&self) -> &'static str {
            self.name
        }

        fn matches(&self, _ctx: &RouteContext, _envelope: &Envelope) -> bool {
            self.accept
        }

        fn parse(&self, _ctx: &RouteContext, envelope: &Envelope) -> Option<String> {
            envelope.mid().map(str::to_string)
        }

        async fn execute(&self, _ctx: &RouteContext, params: String) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if params == "boom" {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn after(&self, _ctx: &RouteContext, _result: &Result<()>) {
            self.afters.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting(name: &'static str, accept: bool) -> (Arc<Counting>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let afters = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Counting {
                name,
                accept,
                hits: Arc::clone(&hits),
                afters: Arc::clone(&afters),
            }),
            hits,
            afters,
        )
    }

    #[tokio::test]
    async fn routes_by_path_and_falls_through_declines() {
        let (declining, declined_hits, _) = counting("declining", false);
        let (accepting, hits, afters) = counting("accepting", true);
        let router = Router::new()
            .route("/s/para", declining)
            .route("/s/para", accepting);

        let env = Envelope::parse(r#"{"lwp":"/s/para","headers":{"mid":"1 0"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &env).await, Dispatch::Handled("accepting"));
        assert_eq!(declined_hits.load(Ordering::SeqCst), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(afters.load(Ordering::SeqCst), 1);

        let failing = Envelope::parse(r#"{"lwp":"/s/para","headers":{"mid":"boom"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &failing).await, Dispatch::Failed("accepting"));
        assert_eq!(afters.load(Ordering::SeqCst), 2);

        let no_mid = Envelope::parse(r#"{"lwp":"/s/para"}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &no_mid).await, Dispatch::Declined("accepting"));
    }

    #[tokio::test]
    async fn unknown_paths_are_dropped() {
        let router = Router::new();
        let env = Envelope::parse(r#"{"lwp":"/s/unknown","headers":{"mid":"1"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &env).await, Dispatch::Unrouted);
    }

    #[tokio::test]
    async fn responses_are_classified_by_code() {
        let (confirm, confirm_hits, _) = counting("confirm", true);
        let (expiry, expiry_hits, _) = counting("expiry", true);
        let router = Router::new()
            .on_send_confirmation(confirm)
            .on_unauthorized(expiry);

        let sent = Envelope::parse(r#"{"code":200,"headers":{"mid":"5 0"},"body":{"messageId":"3381.PNM"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &sent).await, Dispatch::Handled("confirm"));
        assert_eq!(confirm_hits.load(Ordering::SeqCst), 1);

        let ack = Envelope::parse(r#"{"code":200,"headers":{"mid":"6 0"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &ack).await, Dispatch::Acknowledged);

        let expired = Envelope::parse(r#"{"code":401,"headers":{"mid":"7 0"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &expired).await, Dispatch::Handled("expiry"));
        assert_eq!(expiry_hits.load(Ordering::SeqCst), 1);

        let other = Envelope::parse(r#"{"code":500,"headers":{"mid":"8 0"}}"#).unwrap();
        assert_eq!(router.dispatch(&ctx(), &other).await, Dispatch::StatusLogged(500));
    }

    #[test]
    fn message_identity_reads_known_keys() {
        assert_eq!(
            message_identity(Some(&serde_json::json!({"msgId": 42}))),
            Some("42".to_string())
        );
        assert_eq!(message_identity(Some(&serde_json::json!({"messageId": ""}))), None);
        assert_eq!(message_identity(None), None);
    }
}
