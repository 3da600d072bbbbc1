//! Long-running process: wires the components together and keeps one
//! session per enabled account alive until Ctrl+C.

use crate::automation::{HumanTiming, MtopShipmentConfirmer, Pipeline};
use crate::clock::{Clock, Jitter, RandomJitter, SystemClock};
use crate::config::{AccountConfig, Config};
use crate::events::{CloseReason, EventSender, SessionEvent};
use crate::protocol::{self, sign, PATH_SYNC_PUSH, PATH_SYNC_PUSH_ALT};
use crate::router::{Router, SendConfirmationHandler, SyncPushHandler, TokenExpiryHandler};
use crate::scheduler::MessageScheduler;
use crate::session::{SessionError, SessionManager, SessionRegistry, StartRequest, WsConnector};
use crate::store::{CredentialStore, SqliteStore};
use crate::token::{MtopClient, TokenManager, TokenOutcome};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Every long-lived component, shared by the account runners.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<SqliteStore>,
    pub tokens: Arc<TokenManager>,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<MessageScheduler>,
    pub manager: SessionManager,
    pub clock: Arc<dyn Clock>,
}

impl Runtime {
    /// Open the store, mirror the configured accounts into it and assemble
    /// the session stack around the production clock and transport.
    pub fn build(config: &Config, events: EventSender) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.db_path())?);
        store.sync_accounts(&config.accounts)?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let jitter: Arc<dyn Jitter> = Arc::new(RandomJitter);
        let client = MtopClient::new(
            &config.token,
            &config.transport.user_agent,
            &config.transport.origin,
        )?;
        let tokens = Arc::new(TokenManager::new(
            client.clone(),
            config.token.clone(),
            store.clone(),
            Arc::clone(&clock),
            Arc::clone(&jitter),
        ));

        let registry = SessionRegistry::new(Arc::clone(&clock));
        let timing = HumanTiming::new(config.timing.clone(), Arc::clone(&clock), jitter);
        let pipeline = Arc::new(
            Pipeline::new(
                store.clone(),
                store.clone(),
                store.clone(),
                registry.clone(),
                timing,
            )
            .with_shipment(Arc::new(MtopShipmentConfirmer::new(
                client,
                store.clone(),
                Arc::clone(&clock),
            ))),
        );

        let sync = Arc::new(SyncPushHandler::new(store.clone(), Some(Arc::clone(&pipeline))));
        let router = Router::new()
            .route(PATH_SYNC_PUSH, sync.clone())
            .route(PATH_SYNC_PUSH_ALT, sync)
            .on_send_confirmation(Arc::new(SendConfirmationHandler))
            .on_unauthorized(Arc::new(TokenExpiryHandler::new(Some(Arc::clone(&tokens)))));

        let scheduler = Arc::new(MessageScheduler::from_config(&config.scheduler));
        let manager = SessionManager::new(
            registry,
            Arc::new(WsConnector),
            Arc::new(router),
            Arc::clone(&scheduler),
            Some(Arc::clone(&tokens)),
            events,
            Arc::clone(&clock),
            config.transport.clone(),
        );

        Ok(Self {
            store,
            tokens,
            pipeline,
            scheduler,
            manager,
            clock,
        })
    }

    /// Stored device id, else the configured one, else a fresh one derived
    /// from the cookie's user id. The result is persisted for reconnects.
    pub fn device_id_for(&self, account: &AccountConfig) -> Result<String> {
        if let Some(existing) = self.store.device_id(&account.id)? {
            return Ok(existing);
        }
        let device_id = match account.device_id.as_deref().filter(|d| !d.is_empty()) {
            Some(configured) => configured.to_string(),
            None => {
                let user_id = sign::user_id(&account.cookie)
                    .with_context(|| format!("cookie for account {} has no unb", account.id))?;
                protocol::generate_device_id(&user_id)
            }
        };
        self.store.set_device_id(&account.id, &device_id)?;
        Ok(device_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial_secs: u64,
    max_secs: u64,
    verification_retry_secs: u64,
    stable_after: Duration,
    min_reconnect: Duration,
}

impl Backoff {
    fn from_config(config: &Config) -> Self {
        let initial_secs = config.reliability.initial_backoff_secs.max(1);
        Self {
            initial_secs,
            max_secs: config.reliability.max_backoff_secs.max(initial_secs),
            verification_retry_secs: config.token.verification_retry_secs.max(1),
            stable_after: Duration::from_secs(config.reliability.stable_session_secs),
            min_reconnect: Duration::from_millis(config.reliability.min_reconnect_ms),
        }
    }
}

/// Restart delay for one account runner.
///
/// The delay only resets once a session has stayed Ready for `stable_after`,
/// so a gateway that drops every session right after registration is retried
/// with growing waits instead of in a loop.
#[derive(Debug)]
struct ReconnectPolicy {
    backoff: Backoff,
    delay_secs: u64,
}

impl ReconnectPolicy {
    fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            delay_secs: backoff.initial_secs,
        }
    }

    /// Wait after a session that stayed Ready for `uptime` closed with `reason`.
    fn after_session(&mut self, uptime: Duration, reason: &CloseReason) -> Duration {
        let stable = uptime >= self.backoff.stable_after;
        if stable {
            self.delay_secs = self.backoff.initial_secs;
            if reason.reconnect_immediately() {
                return self.backoff.min_reconnect;
            }
        }
        self.escalate()
    }

    fn after_start_failure(&mut self) -> Duration {
        self.escalate()
    }

    fn after_verification(&self) -> Duration {
        Duration::from_secs(self.backoff.verification_retry_secs)
    }

    /// Current delay; the next one doubles up to the cap.
    fn escalate(&mut self) -> Duration {
        let wait = Duration::from_secs(self.delay_secs).max(self.backoff.min_reconnect);
        self.delay_secs = self.delay_secs.saturating_mul(2).min(self.backoff.max_secs);
        wait
    }
}

fn elapsed_since(clock: &dyn Clock, start_ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(clock.now_millis() - start_ms).unwrap_or(0))
}

pub async fn run(config: Config) -> Result<()> {
    let (events, rx) = EventSender::channel();
    let runtime = Runtime::build(&config, events.clone())?;
    let accounts: Vec<AccountConfig> = config
        .accounts
        .iter()
        .filter(|a| a.enabled)
        .cloned()
        .collect();
    if accounts.is_empty() {
        anyhow::bail!(
            "no enabled accounts in {}; add an [[accounts]] entry",
            config.config_path.display()
        );
    }

    let backoff = Backoff::from_config(&config);

    let shutdown = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = vec![spawn_event_loop(runtime.clone(), rx)];
    for account in &accounts {
        let device_id = runtime.device_id_for(account)?;
        handles.push(runtime.tokens.spawn_refresh_loop(
            account.id.clone(),
            device_id.clone(),
            events.clone(),
            shutdown.child_token(),
        ));
        handles.push(spawn_account_runner(
            runtime.clone(),
            account.id.clone(),
            device_id,
            backoff,
            shutdown.child_token(),
        ));
    }

    println!("xyrelay daemon started");
    println!("   Accounts: {}", accounts.len());
    println!("   Database: {}", config.db_path().display());
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Daemon: shutdown requested");
    shutdown.cancel();
    runtime.manager.stop_all().await;
    runtime.scheduler.close();

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Request a credential for one account without opening a session.
pub async fn issue_token(config: &Config, account_id: &str) -> Result<TokenOutcome> {
    let account = config
        .account(account_id)
        .with_context(|| format!("unknown account {account_id}"))?;
    let runtime = Runtime::build(config, EventSender::detached())?;
    let device_id = runtime.device_id_for(account)?;
    Ok(runtime.tokens.acquire(account_id, &device_id).await?)
}

fn spawn_account_runner(
    runtime: Runtime,
    account_id: String,
    device_id: String,
    backoff: Backoff,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let clock = Arc::clone(&runtime.clock);
        let mut policy = ReconnectPolicy::new(backoff);
        while !shutdown.is_cancelled() {
            let wait = match start_once(&runtime, &account_id, &device_id).await {
                Ok(session) => {
                    let ready_at = clock.now_millis();
                    let reason = tokio::select! {
                        () = shutdown.cancelled() => break,
                        reason = session.closed() => reason,
                    };
                    if reason == CloseReason::Stopped {
                        break;
                    }
                    let wait = policy.after_session(elapsed_since(clock.as_ref(), ready_at), &reason);
                    if reason.reconnect_immediately() {
                        tracing::info!(
                            "Daemon[{account_id}]: {reason}; reconnecting in {}ms",
                            wait.as_millis()
                        );
                    } else {
                        tracing::warn!(
                            "Daemon[{account_id}]: session ended ({reason}); retrying in {}s",
                            wait.as_secs()
                        );
                    }
                    wait
                }
                Err(SessionError::VerificationRequired(url)) => {
                    runtime.pipeline.pause(&account_id);
                    let wait = policy.after_verification();
                    tracing::warn!(
                        "Daemon[{account_id}]: complete the verification at {url}; retrying in {}s",
                        wait.as_secs()
                    );
                    wait
                }
                Err(e) => {
                    let wait = policy.after_start_failure();
                    tracing::error!(
                        "Daemon[{account_id}]: start failed: {e}; retrying in {}s",
                        wait.as_secs()
                    );
                    wait
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = clock.sleep(wait) => {}
            }
        }
        tracing::info!("Daemon[{account_id}]: runner stopped");
    })
}

async fn start_once(
    runtime: &Runtime,
    account_id: &str,
    device_id: &str,
) -> Result<crate::session::ReadySession, SessionError> {
    let cookie = match runtime.store.get_cookie(account_id).await {
        Ok(cookie) => cookie.unwrap_or_default(),
        Err(e) => {
            tracing::error!("Daemon[{account_id}]: cookie lookup failed: {e:#}");
            String::new()
        }
    };
    runtime
        .manager
        .start(StartRequest {
            account_id: account_id.to_string(),
            cookie,
            device_id: device_id.to_string(),
            credential: None,
        })
        .await
}

fn spawn_event_loop(runtime: Runtime, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_event(&runtime, event).await;
        }
    })
}

async fn handle_event(runtime: &Runtime, event: SessionEvent) {
    match event {
        SessionEvent::Registered {
            account_id,
            credential,
            ..
        } => {
            let known = runtime
                .tokens
                .cached(&account_id)
                .is_some_and(|state| state.credential == credential);
            if !known {
                if let Err(e) = runtime.tokens.remember(&account_id, &credential).await {
                    tracing::warn!("Daemon[{account_id}]: failed to persist credential: {e}");
                }
            }
            runtime.pipeline.resume(&account_id);
        }
        SessionEvent::CredentialRefreshed { account_id } => {
            if let Some(handle) = runtime.manager.registry().get(&account_id) {
                handle.close(CloseReason::CredentialRefreshed);
            }
        }
        SessionEvent::VerificationRequired { account_id, url } => {
            runtime.pipeline.pause(&account_id);
            tracing::warn!("Daemon[{account_id}]: verification required at {url}");
        }
        SessionEvent::TokenExpired { account_id } => {
            tracing::info!("Daemon[{account_id}]: credential expired; session will reconnect");
        }
        SessionEvent::Closed { account_id, reason } => {
            tracing::debug!("Daemon[{account_id}]: session closed ({reason})");
        }
    }
}
