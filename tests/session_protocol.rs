//! Session protocol tests against a scripted in-memory gateway.
//!
//! The scripted connector records every frame the client writes in one
//! ordered log; test handlers append markers to the same log so ordering
//! between wire writes and handler execution can be asserted directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use xyrelay::automation::{HumanTiming, Pipeline};
use xyrelay::clock::{Clock, FixedJitter, SystemClock};
use xyrelay::codec;
use xyrelay::config::{AccountConfig, GoodsConfig, TimingConfig, TransportConfig};
use xyrelay::events::{CloseReason, EventSender, SessionEvent};
use xyrelay::protocol::Envelope;
use xyrelay::router::{Handler, RouteContext, Router, SyncPushHandler, TokenExpiryHandler};
use xyrelay::scheduler::MessageScheduler;
use xyrelay::store::{AutoDeliveryConfig, DeliveryState, DeliveryStore, SqliteStore};
use xyrelay::session::{
    Connector, FrameSink, FrameSource, SessionError, SessionManager, SessionRegistry,
    SessionState, StartRequest, TransportRequest,
};

// ─────────────────────────────────────────────────────────────────────────────
// Scripted gateway
// ─────────────────────────────────────────────────────────────────────────────

type Log = Arc<Mutex<Vec<String>>>;

struct ScriptedGateway {
    log: Log,
    inbound: mpsc::UnboundedSender<String>,
    source: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    answer_registration: bool,
    /// Frames pushed as soon as the client writes its sync ack.
    after_sync_ack: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedGateway {
    fn new(answer_registration: bool) -> Arc<Self> {
        let (inbound, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            inbound,
            source: Mutex::new(Some(rx)),
            answer_registration,
            after_sync_ack: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn push_after_sync_ack(&self, frame: Value) {
        self.after_sync_ack.lock().push(frame);
    }

    fn push(&self, frame: Value) {
        self.inbound.send(frame.to_string()).unwrap();
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Client-written frames, parsed.
    fn frames(&self) -> Vec<Value> {
        self.log()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn frames_on(&self, path: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["lwp"] == path)
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedGateway {
    async fn connect(
        &self,
        _request: &TransportRequest,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let rx = self.source.lock().take().context("gateway accepts one connection")?;
        let sink = ScriptedSink {
            log: Arc::clone(&self.log),
            inbound: self.inbound.clone(),
            answer_registration: self.answer_registration,
            after_sync_ack: Arc::clone(&self.after_sync_ack),
        };
        Ok((Box::new(sink), Box::new(ScriptedSource { rx })))
    }
}

struct ScriptedSink {
    log: Log,
    inbound: mpsc::UnboundedSender<String>,
    answer_registration: bool,
    after_sync_ack: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl FrameSink for ScriptedSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        let frame: Value = serde_json::from_str(&text)?;
        self.log.lock().push(text);
        let mid = frame["headers"]["mid"].clone();
        if frame["lwp"] == "/reg" && self.answer_registration {
            let _ = self.inbound.send(
                json!({"code": 200, "headers": {"mid": mid, "sid": "sid-test"}}).to_string(),
            );
        }
        if frame["lwp"] == "/r/SyncStatus/ackDiff" {
            for push in self.after_sync_ack.lock().drain(..) {
                let _ = self.inbound.send(push.to_string());
            }
        }
        if frame["lwp"] == "/!" {
            let _ = self
                .inbound
                .send(json!({"code": 200, "headers": {"mid": mid}}).to_string());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ScriptedSource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_text(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Appends `handled:<mid>` to the gateway log when it runs.
struct RecordingHandler {
    log: Log,
}

#[async_trait]
impl Handler for RecordingHandler {
    type Params = String;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn parse(&self, _ctx: &RouteContext, envelope: &Envelope) -> Option<String> {
        envelope.mid().map(str::to_string)
    }

    async fn execute(&self, _ctx: &RouteContext, mid: String) -> Result<()> {
        self.log.lock().push(format!("handled:{mid}"));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn manager(gateway: &Arc<ScriptedGateway>, router: Router, events: EventSender) -> SessionManager {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    manager_on(gateway, SessionRegistry::new(clock), router, events)
}

fn manager_on(
    gateway: &Arc<ScriptedGateway>,
    registry: Arc<SessionRegistry>,
    router: Router,
    events: EventSender,
) -> SessionManager {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = TransportConfig {
        connect_timeout_secs: 1,
        handshake_delay_ms: 10,
        heartbeat_interval_secs: 1,
        ..TransportConfig::default()
    };
    SessionManager::new(
        registry,
        gateway.clone(),
        Arc::new(router),
        Arc::new(MessageScheduler::new(4, 16)),
        None,
        events,
        clock,
        transport,
    )
}

fn request() -> StartRequest {
    StartRequest {
        account_id: "acct-1".into(),
        cookie: "unb=1001; _m_h5_tk=abc_1717000000000".into(),
        device_id: "DEV-1001".into(),
        credential: Some("cred-1".into()),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_registers_then_sends_sync_ack() {
    let gateway = ScriptedGateway::new(true);
    let (events, mut rx) = EventSender::channel();
    let manager = manager(&gateway, Router::new(), events);

    let ready = manager.start(request()).await.unwrap();
    assert_eq!(ready.session_id, "sid-test");
    assert_eq!(ready.handle.state(), SessionState::Ready);
    assert!(manager.is_ready("acct-1"));

    let frames = gateway.frames();
    assert_eq!(frames[0]["lwp"], "/reg");
    assert_eq!(frames[0]["headers"]["token"], "cred-1");
    assert_eq!(frames[0]["headers"]["did"], "DEV-1001");
    assert_eq!(frames[0]["headers"]["app-key"], "444e9908a51d1cb236a27862abc769c9");
    let sync_ack = &gateway.frames_on("/r/SyncStatus/ackDiff")[0];
    assert_eq!(sync_ack["body"][0]["seq"], 0);

    assert_eq!(
        rx.recv().await.unwrap(),
        SessionEvent::Registered {
            account_id: "acct-1".into(),
            session_id: "sid-test".into(),
            credential: "cred-1".into(),
        }
    );
}

#[tokio::test]
async fn start_validates_cookie_and_credential_before_connecting() {
    let gateway = ScriptedGateway::new(true);
    let manager = manager(&gateway, Router::new(), EventSender::detached());

    let mut no_cookie = request();
    no_cookie.cookie = "  ".into();
    assert_eq!(manager.start(no_cookie).await.unwrap_err(), SessionError::NoCookie);

    let mut no_unb = request();
    no_unb.cookie = "_m_h5_tk=abc_1".into();
    assert_eq!(manager.start(no_unb).await.unwrap_err(), SessionError::NoCookie);

    let mut no_credential = request();
    no_credential.credential = None;
    assert_eq!(
        manager.start(no_credential).await.unwrap_err(),
        SessionError::NoCredential
    );

    assert!(gateway.log().is_empty());
}

#[tokio::test]
async fn handshake_timeout_leaves_no_partial_state() {
    let gateway = ScriptedGateway::new(false);
    let (events, mut rx) = EventSender::channel();
    let manager = manager(&gateway, Router::new(), events);

    let started = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start(request()).await }
    });

    assert!(eventually(|| !gateway.frames_on("/reg").is_empty()).await);
    // Registered but not Ready: sends fail fast and write nothing.
    assert!(!manager.send("acct-1", "55012@goofish", "2201", "hi").await);

    let err = started.await.unwrap().err().unwrap();
    assert_eq!(err, SessionError::HandshakeTimeout);
    assert!(manager.registry().get("acct-1").is_none());
    assert!(!manager.is_ready("acct-1"));
    assert!(gateway.frames_on("/r/MessageSend/sendByReceiverScope").is_empty());
    assert!(rx.try_recv().is_err(), "no events for a session that never became ready");
}

#[tokio::test]
async fn second_start_for_same_account_is_rejected() {
    let gateway = ScriptedGateway::new(true);
    let manager = manager(&gateway, Router::new(), EventSender::detached());
    let _ready = manager.start(request()).await.unwrap();
    assert_eq!(
        manager.start(request()).await.unwrap_err(),
        SessionError::AlreadyRunning
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound frames
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn inbound_frames_are_acked_before_their_handler_runs() {
    let gateway = ScriptedGateway::new(true);
    let router = Router::new().route(
        "/s/test",
        Arc::new(RecordingHandler {
            log: Arc::clone(&gateway.log),
        }),
    );
    let manager = manager(&gateway, router, EventSender::detached());
    manager.start(request()).await.unwrap();

    gateway.push(json!({"lwp": "/s/test", "headers": {"mid": "42 0", "sid": "srv-sid"}, "body": {}}));
    assert!(eventually(|| gateway.log().iter().any(|l| l == "handled:42 0")).await);

    let log = gateway.log();
    let ack_at = log
        .iter()
        .position(|line| {
            serde_json::from_str::<Value>(line)
                .is_ok_and(|f| f["code"] == 200 && f["headers"]["mid"] == "42 0")
        })
        .expect("ack written");
    let handled_at = log.iter().position(|l| l == "handled:42 0").unwrap();
    assert!(ack_at < handled_at, "ack must precede handler: {log:?}");

    let ack: Value = serde_json::from_str(&log[ack_at]).unwrap();
    assert_eq!(ack["headers"]["sid"], "srv-sid");
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let gateway = ScriptedGateway::new(true);
    let router = Router::new().route(
        "/s/test",
        Arc::new(RecordingHandler {
            log: Arc::clone(&gateway.log),
        }),
    );
    let manager = manager(&gateway, router, EventSender::detached());
    manager.start(request()).await.unwrap();

    gateway.inbound.send("not json at all".into()).unwrap();
    gateway.push(json!({"lwp": "/unknown/path", "headers": {"mid": "7 0"}}));
    gateway.push(json!({"lwp": "/s/test", "headers": {"mid": "8 0"}}));

    assert!(eventually(|| gateway.log().iter().any(|l| l == "handled:8 0")).await);
    assert!(manager.is_ready("acct-1"));
}

#[tokio::test]
async fn unauthorized_response_closes_with_token_expired() {
    let gateway = ScriptedGateway::new(true);
    let (events, mut rx) = EventSender::channel();
    let router = Router::new().on_unauthorized(Arc::new(TokenExpiryHandler::new(None)));
    let manager = manager(&gateway, router, events);
    let ready = manager.start(request()).await.unwrap();
    assert!(matches!(rx.recv().await, Some(SessionEvent::Registered { .. })));

    gateway.push(json!({"code": 401, "headers": {"mid": "99 0"}}));

    let reason = tokio::time::timeout(Duration::from_secs(2), ready.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::TokenExpired);
    assert!(reason.reconnect_immediately());
    assert_eq!(
        rx.recv().await.unwrap(),
        SessionEvent::TokenExpired {
            account_id: "acct-1".into()
        }
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        SessionEvent::Closed {
            account_id: "acct-1".into(),
            reason: CloseReason::TokenExpired,
        }
    );
    assert!(manager.registry().get("acct-1").is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn send_writes_text_envelope_when_ready() {
    let gateway = ScriptedGateway::new(true);
    let manager = manager(&gateway, Router::new(), EventSender::detached());
    assert!(!manager.send("acct-1", "55012@goofish", "2201", "hi").await);

    manager.start(request()).await.unwrap();
    assert!(manager.send("acct-1", "55012", "2201", "9.9元包邮").await);

    let sent = &gateway.frames_on("/r/MessageSend/sendByReceiverScope")[0];
    assert_eq!(sent["body"][0]["cid"], "55012@goofish");
    let receivers = sent["body"][1]["actualReceivers"].as_array().unwrap();
    assert!(receivers.contains(&json!("2201@goofish")));
    assert!(receivers.contains(&json!("1001@goofish")));
}

#[tokio::test]
async fn heartbeats_flow_while_ready_and_stop_cancels_them() {
    let gateway = ScriptedGateway::new(true);
    let manager = manager(&gateway, Router::new(), EventSender::detached());
    let ready = manager.start(request()).await.unwrap();

    assert!(eventually(|| !gateway.frames_on("/!").is_empty()).await);
    assert!(eventually(|| ready.handle.last_heartbeat_ack_ms() > 0).await);

    assert!(manager.stop("acct-1").await);
    assert_eq!(ready.handle.state(), SessionState::Disconnected);
    assert!(!manager.stop("acct-1").await);

    let beats = gateway.frames_on("/!").len();
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(gateway.frames_on("/!").len(), beats);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync push to automation
// ─────────────────────────────────────────────────────────────────────────────

fn paid_order_push(pnm_id: &str) -> Value {
    let payload = codec::encode_payload(&json!({
        "1": {
            "2": "55012@goofish",
            "3": pnm_id,
            "5": 1_717_000_000_000_i64,
            "6": {"3": {"4": 32}},
            "10": {
                "senderUserId": "2201",
                "receiverUserId": "1001",
                "reminderTitle": "小王",
                "reminderContent": "[已付款，待发货] 请尽快发货",
                "reminderUrl": "fleamarket://message_chat?itemId=7712&orderId=9001"
            }
        }
    }))
    .unwrap();
    json!({
        "lwp": "/s/para",
        "headers": {"mid": "501 0", "sid": "srv-sid"},
        "body": {"syncPushPackage": {"data": [{"data": payload}]}}
    })
}

#[tokio::test]
async fn paid_order_pushed_right_after_sync_ack_is_delivered() {
    let gateway = ScriptedGateway::new(true);
    gateway.push_after_sync_ack(paid_order_push("5120.PNM"));

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store
        .sync_accounts(&[AccountConfig {
            id: "acct-1".into(),
            cookie: "unb=1001".into(),
            device_id: None,
            enabled: true,
            goods: vec![GoodsConfig {
                goods_id: "7712".into(),
                delivery: AutoDeliveryConfig {
                    enabled: true,
                    content: "卡密：XY-7712".into(),
                    auto_confirm_shipment: false,
                },
                replies: Vec::new(),
            }],
        }])
        .unwrap();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = SessionRegistry::new(Arc::clone(&clock));
    let timing = HumanTiming::new(
        TimingConfig {
            enabled: false,
            ..TimingConfig::default()
        },
        clock,
        Arc::new(FixedJitter::Low),
    );
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        store.clone(),
        store.clone(),
        registry.clone(),
        timing,
    ));
    let router = Router::new().route(
        "/s/para",
        Arc::new(SyncPushHandler::new(store.clone(), Some(pipeline))),
    );
    let manager = manager_on(&gateway, registry, router, EventSender::detached());
    manager.start(request()).await.unwrap();

    assert!(eventually(|| !gateway.frames_on("/r/MessageSend/sendByReceiverScope").is_empty()).await);
    let sent = &gateway.frames_on("/r/MessageSend/sendByReceiverScope")[0];
    assert_eq!(sent["body"][0]["cid"], "55012@goofish");
    assert!(sent.to_string().contains("2201@goofish"));

    let mut record = None;
    for _ in 0..100 {
        record = store.get("acct-1", "5120.PNM").await.unwrap();
        if record.as_ref().is_some_and(|r| r.state != DeliveryState::Pending) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record.map(|r| r.state), Some(DeliveryState::Success));
}
