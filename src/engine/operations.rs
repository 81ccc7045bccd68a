use async_trait::async_trait;

use super::request::{Operation, RequestKind};
use crate::api::{
    AccountInfo, ApiResult, BrokerApi, CancelAck, OrderAck, OrderInfo, OrderRequest,
    PositionInfo, ProductInfo, RateLimitStatus,
};

/// Lower bound of the adaptive order-list page size.
pub const MIN_ORDER_COUNT: u32 = 5;
/// Upper bound of the adaptive order-list page size.
pub const MAX_ORDER_COUNT: u32 = 100;
/// Extra rows requested on top of what the last cycle saw.
pub const ORDER_COUNT_HEADROOM: u32 = 5;

pub struct AccountsOp;

#[async_trait]
impl Operation for AccountsOp {
    type Output = Vec<AccountInfo>;

    fn kind(&self) -> RequestKind {
        RequestKind::Accounts
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        api.get_accounts().await
    }
}

/// All positions of one portfolio, one broker page per part.
pub struct PositionsOp {
    portfolio: String,
    marker: Option<String>,
}

impl PositionsOp {
    pub fn new(portfolio: impl Into<String>) -> Self {
        Self {
            portfolio: portfolio.into(),
            marker: None,
        }
    }

    pub fn portfolio(&self) -> &str {
        &self.portfolio
    }
}

#[async_trait]
impl Operation for PositionsOp {
    type Output = Vec<PositionInfo>;

    fn kind(&self) -> RequestKind {
        RequestKind::Positions
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        let page = api
            .get_positions(&self.portfolio, self.marker.take())
            .await?;
        self.marker = page.next;
        Ok(page.items)
    }

    fn reports_done(&self) -> bool {
        self.marker.is_none()
    }
}

/// What one order-list poll learned, reported with its final part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderListSummary {
    /// Oldest order id still open at the broker, 0 when none is.
    pub oldest_incomplete: i64,
    /// Orders seen at or after `oldest_incomplete`.
    pub orders_since_oldest: u32,
}

impl OrderListSummary {
    /// Page size for the next poll of the same portfolio.
    pub fn next_count(&self) -> u32 {
        (self.orders_since_oldest + ORDER_COUNT_HEADROOM).clamp(MIN_ORDER_COUNT, MAX_ORDER_COUNT)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderListPart {
    pub portfolio: String,
    pub orders: Vec<OrderInfo>,
    /// Present only on the last part.
    pub summary: Option<OrderListSummary>,
}

/// Newest-first order listing of one portfolio.
///
/// Stops paging as soon as it reaches the oldest order that was still
/// incomplete on the previous poll: everything older is known final.
pub struct OrderListOp {
    portfolio: String,
    count: u32,
    oldest_incomplete: i64,
    marker: Option<String>,
    finished: bool,
    seen: Vec<(i64, bool)>,
}

impl OrderListOp {
    pub fn new(portfolio: impl Into<String>, count: u32, oldest_incomplete: i64) -> Self {
        Self {
            portfolio: portfolio.into(),
            count: count.max(1),
            oldest_incomplete,
            marker: None,
            finished: false,
            seen: Vec::new(),
        }
    }

    pub fn portfolio(&self) -> &str {
        &self.portfolio
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    fn summarize(&self) -> OrderListSummary {
        let oldest_incomplete = self
            .seen
            .iter()
            .filter(|(_, incomplete)| *incomplete)
            .map(|(id, _)| *id)
            .min()
            .unwrap_or(0);
        let orders_since_oldest = if oldest_incomplete > 0 {
            self.seen
                .iter()
                .filter(|(id, _)| *id >= oldest_incomplete)
                .count() as u32
        } else {
            0
        };
        OrderListSummary {
            oldest_incomplete,
            orders_since_oldest,
        }
    }
}

#[async_trait]
impl Operation for OrderListOp {
    type Output = OrderListPart;

    fn kind(&self) -> RequestKind {
        RequestKind::OrderList
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        let page = api
            .get_order_list(&self.portfolio, self.count, self.marker.take())
            .await?;

        self.seen.extend(
            page.items
                .iter()
                .map(|o| (o.order_id, !o.order_status.is_final())),
        );
        let reached_oldest = self.oldest_incomplete > 0
            && page
                .items
                .iter()
                .any(|o| o.order_id <= self.oldest_incomplete);

        self.finished = page.next.is_none() || reached_oldest;
        self.marker = if self.finished { None } else { page.next };

        Ok(OrderListPart {
            portfolio: self.portfolio.clone(),
            orders: page.items,
            summary: self.finished.then(|| self.summarize()),
        })
    }

    fn reports_done(&self) -> bool {
        self.finished
    }
}

pub struct PlaceOrderOp {
    order: OrderRequest,
}

impl PlaceOrderOp {
    pub fn new(order: OrderRequest) -> Self {
        Self { order }
    }

    pub fn order(&self) -> &OrderRequest {
        &self.order
    }
}

#[async_trait]
impl Operation for PlaceOrderOp {
    type Output = OrderAck;

    fn kind(&self) -> RequestKind {
        RequestKind::PlaceOrder
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        api.send_order(&self.order).await
    }
}

/// Replaces a live order with `order`.
pub struct ChangeOrderOp {
    order_id: i64,
    order: OrderRequest,
}

impl ChangeOrderOp {
    pub fn new(order_id: i64, order: OrderRequest) -> Self {
        Self { order_id, order }
    }
}

#[async_trait]
impl Operation for ChangeOrderOp {
    type Output = OrderAck;

    fn kind(&self) -> RequestKind {
        RequestKind::ChangeOrder
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        api.change_order(self.order_id, &self.order).await
    }
}

pub struct CancelOrderOp {
    order_id: i64,
    portfolio: String,
}

impl CancelOrderOp {
    pub fn new(order_id: i64, portfolio: impl Into<String>) -> Self {
        Self {
            order_id,
            portfolio: portfolio.into(),
        }
    }
}

#[async_trait]
impl Operation for CancelOrderOp {
    type Output = CancelAck;

    fn kind(&self) -> RequestKind {
        RequestKind::CancelOrder
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        api.cancel_order(self.order_id, &self.portfolio).await
    }
}

pub struct ProductLookupOp {
    company: String,
}

impl ProductLookupOp {
    pub fn new(company: impl Into<String>) -> Self {
        Self {
            company: company.into(),
        }
    }
}

#[async_trait]
impl Operation for ProductLookupOp {
    type Output = Vec<ProductInfo>;

    fn kind(&self) -> RequestKind {
        RequestKind::ProductLookup
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        api.product_lookup(&self.company).await
    }
}

/// Remaining broker quota of one module. Not billed, so not throttled.
pub struct RateLimitStatusOp {
    module: String,
}

impl RateLimitStatusOp {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }
}

#[async_trait]
impl Operation for RateLimitStatusOp {
    type Output = RateLimitStatus;

    fn kind(&self) -> RequestKind {
        RequestKind::RateLimitStatus
    }

    fn is_rate_limited(&self) -> bool {
        false
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output> {
        api.get_rate_limit_status(&self.module).await
    }
}
