//! Fulfil-on-payment and keyword auto-reply.
//!
//! The pipeline sees one [`DecryptedMessage`] at a time, decides which
//! workflow (if any) it triggers and runs it to completion. Deliveries are
//! idempotent per pnm id; replies are not.

pub mod delivery;
pub mod reply;
pub mod shipment;
pub mod timing;

pub use reply::{match_rule, PatternCache};
pub use shipment::{MtopShipmentConfirmer, ShipmentConfirmer};
pub use timing::HumanTiming;

use crate::codec::message::{CONTENT_TYPE_SYSTEM_CARD, CONTENT_TYPE_TEXT};
use crate::codec::DecryptedMessage;
use crate::store::{DeliveryStore, GoodsConfigStore, ReplyLog};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// System card text announcing a paid order awaiting shipment.
pub const PAID_MARKER: &str = "[已付款，待发货]";

/// Outbound path used by the automations.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// `false` when nothing was written.
    async fn send_text(
        &self,
        account_id: &str,
        conversation_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Delivery,
    Reply,
    None,
}

/// Which workflow `message` starts for the account identified by `local_user_id`.
pub fn classify(message: &DecryptedMessage, local_user_id: &str) -> Trigger {
    if message.content_type == CONTENT_TYPE_SYSTEM_CARD && message.msg_content.contains(PAID_MARKER) {
        return Trigger::Delivery;
    }
    if message.content_type == CONTENT_TYPE_TEXT && !message.is_from(local_user_id) {
        return Trigger::Reply;
    }
    Trigger::None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Delivered { shipment_confirmed: Option<bool> },
    DeliveryFailed(String),
    /// A delivery record for this pnm id already existed.
    AlreadyHandled,
    Replied { success: bool },
    NoMatch,
    Ignored,
    /// Automation is suspended for the account.
    Paused,
}

pub struct Pipeline {
    goods: Arc<dyn GoodsConfigStore>,
    deliveries: Arc<dyn DeliveryStore>,
    replies: Arc<dyn ReplyLog>,
    sender: Arc<dyn MessageSender>,
    shipment: Option<Arc<dyn ShipmentConfirmer>>,
    timing: HumanTiming,
    patterns: PatternCache,
    paused: RwLock<HashSet<String>>,
}

impl Pipeline {
    pub fn new(
        goods: Arc<dyn GoodsConfigStore>,
        deliveries: Arc<dyn DeliveryStore>,
        replies: Arc<dyn ReplyLog>,
        sender: Arc<dyn MessageSender>,
        timing: HumanTiming,
    ) -> Self {
        Self {
            goods,
            deliveries,
            replies,
            sender,
            shipment: None,
            timing,
            patterns: PatternCache::default(),
            paused: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_shipment(mut self, confirmer: Arc<dyn ShipmentConfirmer>) -> Self {
        self.shipment = Some(confirmer);
        self
    }

    /// Suspend automation for an account (e.g. while a verification is pending).
    pub fn pause(&self, account_id: &str) {
        if self.paused.write().insert(account_id.to_string()) {
            tracing::warn!("Automation[{account_id}]: paused");
        }
    }

    pub fn resume(&self, account_id: &str) {
        if self.paused.write().remove(account_id) {
            tracing::info!("Automation[{account_id}]: resumed");
        }
    }

    pub fn is_paused(&self, account_id: &str) -> bool {
        self.paused.read().contains(account_id)
    }

    /// Run whichever workflow `message` triggers.
    pub async fn process(
        &self,
        account_id: &str,
        local_user_id: &str,
        message: DecryptedMessage,
    ) -> PipelineOutcome {
        let trigger = classify(&message, local_user_id);
        if trigger == Trigger::None {
            return PipelineOutcome::Ignored;
        }
        if self.is_paused(account_id) {
            tracing::info!(
                "Automation[{account_id}]: paused, skipping {}",
                message.pnm_id
            );
            return PipelineOutcome::Paused;
        }
        match trigger {
            Trigger::Delivery => self.deliver(account_id, local_user_id, &message).await,
            Trigger::Reply => self.reply(account_id, &message).await,
            Trigger::None => PipelineOutcome::Ignored,
        }
    }
}
