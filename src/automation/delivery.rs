use super::{Pipeline, PipelineOutcome};
use crate::codec::DecryptedMessage;
use crate::store::{DeliveryRecord, DeliveryState, InsertOutcome, WILDCARD_GOODS_ID};

/// Substitute `{buyer_name}`, `{order_id}` and `{goods_id}` in delivery content.
pub fn render_template(template: &str, message: &DecryptedMessage) -> String {
    template
        .replace("{buyer_name}", &message.sender_name)
        .replace("{order_id}", message.order_id.as_deref().unwrap_or_default())
        .replace("{goods_id}", message.xy_goods_id.as_deref().unwrap_or_default())
}

/// Counterpart of the conversation relative to the local account.
fn buyer_id(message: &DecryptedMessage, local_user_id: &str) -> String {
    if message.is_from(local_user_id) {
        message.receiver_user_id.clone().unwrap_or_default()
    } else {
        message.sender_user_id.clone()
    }
}

impl Pipeline {
    pub(crate) async fn deliver(
        &self,
        account_id: &str,
        local_user_id: &str,
        message: &DecryptedMessage,
    ) -> PipelineOutcome {
        let goods_id = message.xy_goods_id.clone().unwrap_or_default();
        let buyer = buyer_id(message, local_user_id);
        let record = DeliveryRecord {
            account_id: account_id.to_string(),
            xy_goods_id: goods_id.clone(),
            pnm_id: message.pnm_id.clone(),
            buyer_user_id: buyer.clone(),
            buyer_name: message.sender_name.clone(),
            content: None,
            state: DeliveryState::Pending,
            order_id: message.order_id.clone(),
            failure_reason: None,
        };

        match self.deliveries.insert_pending(&record).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::Duplicate) => {
                tracing::info!(
                    "Delivery[{account_id}]: {} already handled",
                    message.pnm_id
                );
                return PipelineOutcome::AlreadyHandled;
            }
            Err(e) => {
                // Without a record there is no dedup guarantee, so never send.
                tracing::error!("Delivery[{account_id}]: record insert failed: {e:#}");
                return PipelineOutcome::DeliveryFailed(format!("record insert failed: {e}"));
            }
        }

        let lookup_id = if goods_id.is_empty() {
            WILDCARD_GOODS_ID
        } else {
            goods_id.as_str()
        };
        let config = match self.goods.auto_delivery_config(account_id, lookup_id).await {
            Ok(Some(config)) if !config.enabled => {
                return self.fail(account_id, message, "auto delivery disabled").await
            }
            Ok(Some(config)) if config.content.trim().is_empty() => {
                return self.fail(account_id, message, "no delivery content configured").await
            }
            Ok(Some(config)) => config,
            Ok(None) => return self.fail(account_id, message, "no delivery config for goods").await,
            Err(e) => {
                let reason = format!("config lookup failed: {e}");
                return self.fail(account_id, message, &reason).await;
            }
        };

        let text = render_template(&config.content, message);
        self.timing.before_send(&text).await;
        let sent = self
            .sender
            .send_text(account_id, &message.conversation_id(), &buyer, &text)
            .await;

        let state = if sent {
            DeliveryState::Success
        } else {
            DeliveryState::Failed
        };
        let reason = (!sent).then_some("send failed");
        if let Err(e) = self
            .deliveries
            .finish(account_id, &message.pnm_id, state, Some(&text), reason)
            .await
        {
            tracing::error!("Delivery[{account_id}]: state update failed: {e:#}");
        }
        if !sent {
            tracing::warn!("Delivery[{account_id}]: send failed for {}", message.pnm_id);
            return PipelineOutcome::DeliveryFailed("send failed".into());
        }
        tracing::info!(
            "Delivery[{account_id}]: delivered goods {goods_id} to {buyer} ({})",
            message.pnm_id
        );

        let shipment_confirmed = if config.auto_confirm_shipment {
            self.confirm_shipment(account_id, message).await
        } else {
            None
        };
        PipelineOutcome::Delivered { shipment_confirmed }
    }

    async fn confirm_shipment(&self, account_id: &str, message: &DecryptedMessage) -> Option<bool> {
        let Some(confirmer) = &self.shipment else {
            tracing::warn!("Delivery[{account_id}]: auto-confirm requested but no confirmer configured");
            return None;
        };
        let Some(order_id) = message.order_id.as_deref().filter(|id| !id.is_empty()) else {
            tracing::warn!(
                "Delivery[{account_id}]: auto-confirm requested but {} has no order id",
                message.pnm_id
            );
            return Some(false);
        };
        self.timing.before_shipment().await;
        match confirmer.confirm(account_id, order_id).await {
            Ok(confirmed) => Some(confirmed),
            Err(e) => {
                tracing::warn!("Delivery[{account_id}]: shipment confirmation failed: {e:#}");
                Some(false)
            }
        }
    }

    async fn fail(&self, account_id: &str, message: &DecryptedMessage, reason: &str) -> PipelineOutcome {
        tracing::warn!("Delivery[{account_id}]: {} failed: {reason}", message.pnm_id);
        if let Err(e) = self
            .deliveries
            .finish(account_id, &message.pnm_id, DeliveryState::Failed, None, Some(reason))
            .await
        {
            tracing::error!("Delivery[{account_id}]: state update failed: {e:#}");
        }
        PipelineOutcome::DeliveryFailed(reason.to_string())
    }
}
