//! Access credential lifecycle: acquisition through the signed login-token
//! call, verification challenges, persistence and jittered background refresh.

pub mod client;

pub use client::{MtopClient, MtopResponse};

use crate::clock::{Clock, Jitter};
use crate::config::TokenConfig;
use crate::events::{EventSender, SessionEvent};
use crate::protocol::sign::{self, MtopRequest};
use crate::protocol::IM_APP_KEY;
use crate::store::{CredentialStore, StoredToken};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const API_LOGIN_TOKEN: &str = "mtop.taobao.idlemessage.pc.login.token";

/// `ret` code meaning an interactive verification must be passed first.
const RET_USER_VALIDATE: &str = "FAIL_SYS_USER_VALIDATE";
/// `ret` codes meaning the `_m_h5_tk` cookie is stale or missing. The
/// misspelling is the gateway's.
const RET_TOKEN_STALE: &[&str] = &["FAIL_SYS_TOKEN_EXOIRED", "FAIL_SYS_TOKEN_EMPTY"];

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(String),
    #[error("token request rejected: {0}")]
    Rejected(String),
    #[error("no cookie stored for account")]
    MissingCookie,
    #[error("malformed token response: {0}")]
    Malformed(String),
    #[error("credential store error: {0}")]
    Store(String),
}

/// Credential held for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub credential: String,
    pub expires_at_ms: i64,
    /// Challenge url while a verification is outstanding.
    pub verification_url: Option<String>,
}

impl TokenState {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        !self.credential.is_empty() && now_ms < self.expires_at_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Issued(TokenState),
    /// The gateway wants an interactive check at `url` and no solver produced
    /// a credential.
    VerificationRequired { url: String },
}

/// Optional collaborator that clears verification challenges.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Returns a credential when the challenge was solved, `None` otherwise.
    async fn solve(
        &self,
        account_id: &str,
        cookie: &str,
        device_id: &str,
        url: &str,
    ) -> anyhow::Result<Option<String>>;
}

pub struct TokenManager {
    client: MtopClient,
    config: TokenConfig,
    store: Arc<dyn CredentialStore>,
    solver: Option<Arc<dyn CaptchaSolver>>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    cache: RwLock<HashMap<String, TokenState>>,
}

impl TokenManager {
    pub fn new(
        client: MtopClient,
        config: TokenConfig,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
    ) -> Self {
        Self {
            client,
            config,
            store,
            solver: None,
            clock,
            jitter,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    fn validity(&self) -> Duration {
        Duration::from_secs(self.config.validity_hours.saturating_mul(3600))
    }

    /// Cached credential, if still inside its validity window.
    pub fn cached(&self, account_id: &str) -> Option<TokenState> {
        let now = self.clock.now_millis();
        self.cache
            .read()
            .get(account_id)
            .filter(|state| state.is_valid_at(now))
            .cloned()
    }

    /// Challenge url of an unresolved verification, if any.
    pub fn verification_pending(&self, account_id: &str) -> Option<String> {
        self.cache
            .read()
            .get(account_id)
            .and_then(|state| state.verification_url.clone())
    }

    /// Mark the account's credential as rejected (e.g. after a 401). The next
    /// [`current`](Self::current) skips the persisted copy and re-acquires.
    pub fn invalidate(&self, account_id: &str) {
        let previous = self.cache.write().insert(
            account_id.to_string(),
            TokenState {
                credential: String::new(),
                expires_at_ms: 0,
                verification_url: None,
            },
        );
        if previous.is_some_and(|state| !state.credential.is_empty()) {
            tracing::info!("Token[{account_id}]: cached credential invalidated");
        }
    }

    /// Persist a credential that is known to work and start its validity window.
    pub async fn remember(&self, account_id: &str, credential: &str) -> Result<TokenState, TokenError> {
        let validity_ms = i64::try_from(self.validity().as_millis()).unwrap_or(i64::MAX);
        let state = TokenState {
            credential: credential.to_string(),
            expires_at_ms: self.clock.now_millis().saturating_add(validity_ms),
            verification_url: None,
        };
        self.store
            .save_token(
                account_id,
                &StoredToken {
                    credential: state.credential.clone(),
                    expires_at_ms: state.expires_at_ms,
                },
            )
            .await
            .map_err(|e| TokenError::Store(format!("{e:#}")))?;
        self.cache
            .write()
            .insert(account_id.to_string(), state.clone());
        Ok(state)
    }

    /// Credential to connect with: cache, then persisted token, then a fresh
    /// acquisition.
    pub async fn current(&self, account_id: &str, device_id: &str) -> Result<TokenOutcome, TokenError> {
        if let Some(state) = self.cached(account_id) {
            return Ok(TokenOutcome::Issued(state));
        }
        if self.cache.read().contains_key(account_id) {
            return self.acquire(account_id, device_id).await;
        }
        let stored = self
            .store
            .load_token(account_id)
            .await
            .map_err(|e| TokenError::Store(format!("{e:#}")))?;
        if let Some(stored) = stored {
            let state = TokenState {
                credential: stored.credential,
                expires_at_ms: stored.expires_at_ms,
                verification_url: None,
            };
            if state.is_valid_at(self.clock.now_millis()) {
                tracing::debug!("Token[{account_id}]: using persisted credential");
                self.cache
                    .write()
                    .insert(account_id.to_string(), state.clone());
                return Ok(TokenOutcome::Issued(state));
            }
        }
        self.acquire(account_id, device_id).await
    }

    /// Request a new credential from the gateway.
    ///
    /// Fresh `_m_h5_tk` cookies returned by the call are merged into the
    /// stored cookie; a stale-token answer is retried once with them.
    pub async fn acquire(&self, account_id: &str, device_id: &str) -> Result<TokenOutcome, TokenError> {
        let mut cookie = self
            .store
            .get_cookie(account_id)
            .await
            .map_err(|e| TokenError::Store(format!("{e:#}")))?
            .ok_or(TokenError::MissingCookie)?;

        let request = MtopRequest::new(
            API_LOGIN_TOKEN,
            &json!({"appKey": IM_APP_KEY, "deviceId": device_id}),
        )
        .with_param("spm_cnt", "a21ybx.im.0.0");

        for attempt in 0..2 {
            let response = self
                .client
                .call(&request, &cookie, self.clock.now_millis())
                .await
                .map_err(|e| TokenError::Http(format!("{e:#}")))?;

            let mut cookie_refreshed = false;
            if let Some(merged) =
                sign::merge_set_cookies(&cookie, response.set_cookies.iter().map(String::as_str))
            {
                self.store
                    .update_cookie(account_id, &merged)
                    .await
                    .map_err(|e| TokenError::Store(format!("{e:#}")))?;
                tracing::debug!("Token[{account_id}]: cookie refreshed from response");
                cookie = merged;
                cookie_refreshed = true;
            }

            if response.succeeded() {
                let credential = response
                    .body
                    .pointer("/data/accessToken")
                    .and_then(|v| v.as_str())
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| TokenError::Malformed("missing data.accessToken".into()))?;
                let state = self.remember(account_id, credential).await?;
                tracing::info!("Token[{account_id}]: credential issued");
                return Ok(TokenOutcome::Issued(state));
            }

            if sign::ret_contains(&response.body, RET_USER_VALIDATE) {
                let url = response
                    .body
                    .pointer("/data/url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                return self.on_verification(account_id, &cookie, device_id, url).await;
            }

            let stale = RET_TOKEN_STALE
                .iter()
                .any(|code| sign::ret_contains(&response.body, code));
            if stale && attempt == 0 && cookie_refreshed {
                tracing::info!("Token[{account_id}]: signing token was stale; retrying once");
                continue;
            }

            return Err(TokenError::Rejected(response.ret_summary()));
        }

        Err(TokenError::Rejected("signing token stayed stale after refresh".into()))
    }

    async fn on_verification(
        &self,
        account_id: &str,
        cookie: &str,
        device_id: &str,
        url: String,
    ) -> Result<TokenOutcome, TokenError> {
        tracing::warn!("Token[{account_id}]: verification required at {url}");
        if let Some(solver) = &self.solver {
            match solver.solve(account_id, cookie, device_id, &url).await {
                Ok(Some(credential)) if !credential.is_empty() => {
                    tracing::info!("Token[{account_id}]: verification solved");
                    let state = self.remember(account_id, &credential).await?;
                    return Ok(TokenOutcome::Issued(state));
                }
                Ok(_) => tracing::warn!("Token[{account_id}]: solver gave up"),
                Err(e) => tracing::warn!("Token[{account_id}]: solver failed: {e:#}"),
            }
        }
        self.cache.write().insert(
            account_id.to_string(),
            TokenState {
                credential: String::new(),
                expires_at_ms: 0,
                verification_url: Some(url.clone()),
            },
        );
        Ok(TokenOutcome::VerificationRequired { url })
    }

    /// Base interval plus a random offset in `[0, refresh_jitter_secs]`.
    pub fn next_refresh_delay(&self) -> Duration {
        let jitter = self.jitter.between(0, self.config.refresh_jitter_secs);
        Duration::from_secs(self.config.refresh_interval_secs.saturating_add(jitter))
    }

    /// One refresh cycle. Emits the matching event and reports whether a new
    /// credential was issued.
    pub async fn refresh(&self, account_id: &str, device_id: &str, events: &EventSender) -> bool {
        match self.acquire(account_id, device_id).await {
            Ok(TokenOutcome::Issued(_)) => {
                events.emit(SessionEvent::CredentialRefreshed {
                    account_id: account_id.to_string(),
                });
                true
            }
            Ok(TokenOutcome::VerificationRequired { url }) => {
                events.emit(SessionEvent::VerificationRequired {
                    account_id: account_id.to_string(),
                    url,
                });
                false
            }
            Err(e) => {
                tracing::warn!("Token[{account_id}]: background refresh failed: {e}");
                false
            }
        }
    }

    /// Refresh on a jittered schedule until `shutdown` fires.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        account_id: String,
        device_id: String,
        events: EventSender,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = manager.next_refresh_delay();
                tracing::debug!("Token[{account_id}]: next refresh in {}s", delay.as_secs());
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = manager.clock.sleep(delay) => {}
                }
                manager.refresh(&account_id, &device_id, &events).await;
            }
        })
    }
}
