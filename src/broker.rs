// =============================================================================
// Broker Capability Interface
// =============================================================================
//
// Order placement lives outside the market-data core; downstream components
// talk to a broker through this capability trait. Each concrete broker is a
// tagged variant implementing the trait — no inheritance hierarchy, and no
// broker-specific types leak into the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::types::SubscriptionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub side: OrderSide,
    pub quantity: u64,
    /// None places a market order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Per-user tagging for downstream risk events.
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub average_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerBalance {
    pub available: Decimal,
    pub utilised: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub connected: bool,
    pub detail: String,
}

/// Everything the platform needs from a broker. Market data arrives through
/// the feed client; this trait covers the order/account side.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), CoreError>;
    async fn disconnect(&self) -> Result<(), CoreError>;
    async fn subscribe(&self, key: &SubscriptionKey) -> Result<(), CoreError>;
    async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), CoreError>;
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, CoreError>;
    async fn modify_order(&self, order_id: &str, update: OrderUpdate) -> Result<OrderAck, CoreError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), CoreError>;
    async fn positions(&self) -> Result<Vec<PositionInfo>, CoreError>;
    async fn balance(&self) -> Result<BrokerBalance, CoreError>;
    async fn health(&self) -> Result<BrokerHealth, CoreError>;
}
