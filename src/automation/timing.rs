//! Human-like pauses before automated sends.

use crate::clock::{Clock, Jitter};
use crate::config::TimingConfig;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HumanTiming {
    config: TimingConfig,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl HumanTiming {
    pub fn new(config: TimingConfig, clock: Arc<dyn Clock>, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            config,
            clock,
            jitter,
        }
    }

    fn capped(&self, millis: u64) -> Duration {
        Duration::from_millis(millis.min(self.config.stage_cap_ms))
    }

    pub fn read_delay(&self) -> Duration {
        self.capped(
            self.jitter
                .between(self.config.read_min_ms, self.config.read_max_ms),
        )
    }

    pub fn think_delay(&self) -> Duration {
        self.capped(
            self.jitter
                .between(self.config.think_min_ms, self.config.think_max_ms),
        )
    }

    /// Scales with the number of characters (not bytes) in `text`.
    pub fn typing_delay(&self, text: &str) -> Duration {
        let chars = u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
        let base = chars.saturating_mul(self.config.typing_ms_per_char);
        let wobble = self.jitter.between(0, base / 5);
        self.capped(base.saturating_add(wobble))
    }

    pub fn shipment_delay(&self) -> Duration {
        Duration::from_secs(
            self.jitter
                .between(self.config.shipment_min_secs, self.config.shipment_max_secs),
        )
    }

    /// Read, think, then type `reply`.
    pub async fn before_send(&self, reply: &str) {
        if !self.config.enabled {
            return;
        }
        self.clock.sleep(self.read_delay()).await;
        self.clock.sleep(self.think_delay()).await;
        self.clock.sleep(self.typing_delay(reply)).await;
    }

    pub async fn before_shipment(&self) {
        if !self.config.enabled {
            return;
        }
        self.clock.sleep(self.shipment_delay()).await;
    }
}
