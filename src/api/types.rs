use serde::{Deserialize, Serialize};

/// One page of a marker-paginated listing. `next` is absent on the last page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "priceType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Market,
    Limit {
        #[serde(rename = "limitPrice")]
        limit_price: f64,
    },
    #[serde(rename = "STOP")]
    StopMarket {
        #[serde(rename = "stopPrice")]
        stop_price: f64,
    },
    StopLimit {
        #[serde(rename = "limitPrice")]
        limit_price: f64,
        #[serde(rename = "stopPrice")]
        stop_price: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderTerm {
    GoodUntilCancel,
    GoodForDay,
}

/// Broker-neutral order as handed to the orders module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub account_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u32,
    #[serde(flatten)]
    pub price_type: PriceType,
    pub order_term: OrderTerm,
    pub all_or_none: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub account_id: String,
    pub order_num: i64,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub account_id: String,
    pub order_num: i64,
    #[serde(default)]
    pub cancel_time: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Executed,
    Cancelled,
    IndividualFills,
    CancelRequested,
    Expired,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// Whether the broker can still change this order.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Executed
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub order_id: i64,
    pub symbol: String,
    pub order_status: OrderStatus,
    #[serde(default)]
    pub order_action: Option<String>,
    #[serde(default)]
    pub ordered_quantity: f64,
    #[serde(default)]
    pub filled_quantity: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub order_placed_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub symbol: String,
    pub qty: f64,
    #[serde(default)]
    pub cost_basis: f64,
    #[serde(default)]
    pub market_value: f64,
    #[serde(default)]
    pub long_or_short: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub account_id: String,
    #[serde(default)]
    pub account_desc: String,
    #[serde(default)]
    pub net_account_value: f64,
    #[serde(default)]
    pub margin_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    pub symbol: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub security_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    #[serde(default)]
    pub consumer_key: String,
    pub request_limit: u32,
    pub requests_remaining: u32,
    #[serde(default)]
    pub reset_time: Option<i64>,
}
