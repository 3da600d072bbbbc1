//! Collaborator seams for persistence.
//!
//! The session and automation layers only see these traits. [`SqliteStore`]
//! implements all of them for the bundled binary.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::codec::DecryptedMessage;
use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Goods id used for account-wide fallback rules.
pub const WILDCARD_GOODS_ID: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Success,
    Failed,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One fulfil-on-payment attempt, keyed by the source message's pnm id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub account_id: String,
    pub xy_goods_id: String,
    pub pnm_id: String,
    pub buyer_user_id: String,
    pub buyer_name: String,
    pub content: Option<String>,
    pub state: DeliveryState,
    pub order_id: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same (account, pnm id) already exists.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AutoDeliveryConfig {
    pub enabled: bool,
    pub content: String,
    /// Confirm shipment after a successful delivery message.
    #[serde(default)]
    pub auto_confirm_shipment: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Contains,
    Exact,
    Regex,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Exact => "exact",
            Self::Regex => "regex",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "contains" | "1" => Some(Self::Contains),
            "exact" | "2" => Some(Self::Exact),
            "regex" | "3" => Some(Self::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AutoReplyRule {
    pub keyword: String,
    #[serde(default)]
    pub match_type: MatchType,
    pub reply: String,
}

/// Outcome of one keyword reply, kept for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub account_id: String,
    pub xy_goods_id: Option<String>,
    pub buyer_user_id: String,
    pub message: String,
    pub matched_keyword: String,
    pub reply: String,
    pub success: bool,
}

/// Persisted access credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub credential: String,
    pub expires_at_ms: i64,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_cookie(&self, account_id: &str) -> Result<Option<String>>;

    /// Signing token derived from the stored cookie.
    async fn get_short_token(&self, account_id: &str) -> Result<Option<String>> {
        Ok(self
            .get_cookie(account_id)
            .await?
            .and_then(|cookie| crate::protocol::sign::short_token(&cookie)))
    }

    async fn update_cookie(&self, account_id: &str, cookie: &str) -> Result<()>;

    async fn load_token(&self, account_id: &str) -> Result<Option<StoredToken>>;

    async fn save_token(&self, account_id: &str, token: &StoredToken) -> Result<()>;
}

#[async_trait]
pub trait GoodsConfigStore: Send + Sync {
    async fn auto_delivery_config(
        &self,
        account_id: &str,
        goods_id: &str,
    ) -> Result<Option<AutoDeliveryConfig>>;

    /// Rules in stored order.
    async fn auto_reply_config(&self, account_id: &str, goods_id: &str) -> Result<Vec<AutoReplyRule>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a decoded message. Returns `false` when (account, pnm id) was already stored.
    async fn append(&self, account_id: &str, message: &DecryptedMessage) -> Result<bool>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert_pending(&self, record: &DeliveryRecord) -> Result<InsertOutcome>;

    /// Move a pending record to its terminal state.
    async fn finish(
        &self,
        account_id: &str,
        pnm_id: &str,
        state: DeliveryState,
        content: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    async fn get(&self, account_id: &str, pnm_id: &str) -> Result<Option<DeliveryRecord>>;
}

#[async_trait]
pub trait ReplyLog: Send + Sync {
    async fn record_reply(&self, record: &ReplyRecord) -> Result<()>;
}
