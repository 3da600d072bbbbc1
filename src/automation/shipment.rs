//! Shipment confirmation after a successful virtual-goods delivery.

use crate::clock::Clock;
use crate::protocol::sign::MtopRequest;
use crate::store::CredentialStore;
use crate::token::MtopClient;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub const API_CONFIRM_SHIPMENT: &str = "mtop.taobao.idle.logistic.consign.dummy";

#[async_trait]
pub trait ShipmentConfirmer: Send + Sync {
    async fn confirm(&self, account_id: &str, order_id: &str) -> Result<bool>;
}

/// Marks an order as shipped without a tracking number.
pub struct MtopShipmentConfirmer {
    client: MtopClient,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl MtopShipmentConfirmer {
    pub fn new(client: MtopClient, credentials: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            credentials,
            clock,
        }
    }
}

#[async_trait]
impl ShipmentConfirmer for MtopShipmentConfirmer {
    async fn confirm(&self, account_id: &str, order_id: &str) -> Result<bool> {
        let Some(cookie) = self.credentials.get_cookie(account_id).await? else {
            anyhow::bail!("no cookie stored for {account_id}");
        };
        let request = MtopRequest::new(
            API_CONFIRM_SHIPMENT,
            &json!({"orderId": order_id, "tradeText": "", "picList": [], "newUnconsign": true}),
        );
        let response = self
            .client
            .call(&request, &cookie, self.clock.now_millis())
            .await?;
        if response.succeeded() {
            tracing::info!("Shipment[{account_id}]: order {order_id} confirmed");
            Ok(true)
        } else {
            tracing::warn!(
                "Shipment[{account_id}]: order {order_id} not confirmed: {}",
                response.ret_summary()
            );
            Ok(false)
        }
    }
}
