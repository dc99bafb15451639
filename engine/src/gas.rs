//! Gas price quoting and escalation.

use tracing::warn;

use crate::client::ChainClient;
use crate::consts::{FALLBACK_GAS_PRICE, GAS_ESCALATION_PERCENT, GAS_PRICE_PREMIUM_PERCENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPricer {
    /// Multiplier over the node's price, in percent
    pub premium_percent: u128,
    /// Multiplier per underpriced retry, in percent
    pub escalation_percent: u128,
    /// Used when the node's price is unavailable
    pub fallback: u128,
}

impl Default for GasPricer {
    fn default() -> Self {
        Self {
            premium_percent: GAS_PRICE_PREMIUM_PERCENT,
            escalation_percent: GAS_ESCALATION_PERCENT,
            fallback: FALLBACK_GAS_PRICE,
        }
    }
}

impl GasPricer {
    pub fn with_fallback(mut self, fallback: u128) -> Self {
        self.fallback = fallback;
        self
    }

    /// Price to offer given the node's reported base price (truncated)
    pub fn quote(&self, base: Option<u128>) -> u128 {
        match base {
            Some(base) => base.saturating_mul(self.premium_percent) / 100,
            None => self.fallback,
        }
    }

    /// Price for the next attempt after an underpriced rejection.
    ///
    /// Monotonic and uncapped; callers apply their own ceiling.
    pub fn escalate(&self, price: u128, attempt: u32) -> u128 {
        let next = price.saturating_mul(self.escalation_percent) / 100;
        // Truncation must not stall tiny prices
        let next = next.max(price.saturating_add(1));
        tracing::debug!("[Gas] Escalating attempt {}: {} -> {}", attempt, price, next);
        next
    }

    /// Quote against the node's current price, falling back on failure
    pub async fn market_price(&self, client: &dyn ChainClient) -> u128 {
        match client.get_gas_price().await {
            Ok(base) => self.quote(Some(base)),
            Err(e) => {
                warn!("[Gas] Failed to get gas price, using fallback {}: {}", self.fallback, e);
                self.quote(None)
            }
        }
    }
}
