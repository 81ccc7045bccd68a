use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::Instant;

use super::broker::BrokerApi;
use super::error::{ApiError, ApiResult};
use super::types::*;
use crate::connection::{AccessCredential, Authorizer};

/// Verifier code the simulated authorization step hands out.
pub const SIMULATED_VERIFIER: &str = "sim-verifier";

/// Approves every handshake with [`SIMULATED_VERIFIER`].
pub struct SimulatedAuthorizer;

#[async_trait]
impl Authorizer for SimulatedAuthorizer {
    async fn authorize(&self, url: &str) -> Option<String> {
        tracing::info!("Simulated authorization of {}", url);
        Some(SIMULATED_VERIFIER.to_string())
    }
}

/// In-memory broker for dry-run mode and tests.
///
/// Orders are listed newest first and paginated by an index marker, the way
/// the real order list behaves. Failures can be injected per call.
pub struct SimulatedBroker {
    consumer_key: String,
    state: Mutex<SimState>,
    next_order_id: AtomicI64,
}

#[derive(Default)]
struct SimState {
    credential: Option<AccessCredential>,
    token_generation: u64,
    token_expired: bool,
    renew_fails: bool,
    accounts: Vec<AccountInfo>,
    positions: HashMap<String, Vec<PositionInfo>>,
    orders: HashMap<String, Vec<OrderInfo>>,
    positions_page_size: usize,
    injected: VecDeque<ApiError>,
    calls: Vec<SimCall>,
}

/// One recorded wire call.
#[derive(Debug, Clone)]
pub struct SimCall {
    pub operation: &'static str,
    pub target: String,
    pub at: Instant,
}

impl SimulatedBroker {
    pub fn new(consumer_key: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            state: Mutex::new(SimState {
                positions_page_size: 25,
                ..SimState::default()
            }),
            next_order_id: AtomicI64::new(1000),
        }
    }

    pub fn add_account(&self, account_id: &str, description: &str) {
        let mut state = self.state.lock();
        state.accounts.push(AccountInfo {
            account_id: account_id.to_string(),
            account_desc: description.to_string(),
            net_account_value: 0.0,
            margin_level: None,
        });
    }

    pub fn add_position(&self, account_id: &str, symbol: &str, qty: f64) {
        self.state
            .lock()
            .positions
            .entry(account_id.to_string())
            .or_default()
            .push(PositionInfo {
                symbol: symbol.to_string(),
                qty,
                cost_basis: 0.0,
                market_value: 0.0,
                long_or_short: None,
            });
    }

    /// Seeds an existing order. Ids should grow with placement time.
    pub fn add_order(&self, account_id: &str, order_id: i64, status: OrderStatus) {
        let mut state = self.state.lock();
        let orders = state.orders.entry(account_id.to_string()).or_default();
        orders.push(OrderInfo {
            order_id,
            symbol: "SIM".to_string(),
            order_status: status,
            order_action: None,
            ordered_quantity: 1.0,
            filled_quantity: 0.0,
            limit_price: None,
            order_placed_time: None,
        });
        orders.sort_by(|a, b| b.order_id.cmp(&a.order_id));
        self.next_order_id.fetch_max(order_id + 1, Ordering::SeqCst);
    }

    pub fn set_order_status(&self, account_id: &str, order_id: i64, status: OrderStatus) {
        if let Some(order) = self
            .state
            .lock()
            .orders
            .get_mut(account_id)
            .and_then(|orders| orders.iter_mut().find(|o| o.order_id == order_id))
        {
            order.order_status = status;
        }
    }

    pub fn set_positions_page_size(&self, size: usize) {
        self.state.lock().positions_page_size = size.max(1);
    }

    /// Every protected call fails with `Unauthorized` until a new credential is installed.
    pub fn expire_token(&self) {
        self.state.lock().token_expired = true;
    }

    pub fn fail_renewals(&self, fail: bool) {
        self.state.lock().renew_fails = fail;
    }

    /// The next protected call returns `error` instead of its result.
    pub fn inject_error(&self, error: ApiError) {
        self.state.lock().injected.push_back(error);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn record(&self, state: &mut SimState, operation: &'static str, target: &str) {
        state.calls.push(SimCall {
            operation,
            target: target.to_string(),
            at: Instant::now(),
        });
    }

    /// Shared gate of every protected call.
    fn enter(
        &self,
        operation: &'static str,
        target: &str,
    ) -> ApiResult<parking_lot::MutexGuard<'_, SimState>> {
        let mut state = self.state.lock();
        self.record(&mut state, operation, target);

        if state.credential.is_none() {
            return Err(ApiError::Unauthorized("no access token installed".to_string()));
        }
        if state.token_expired {
            return Err(ApiError::Unauthorized(format!(
                "{} rejected the access token",
                operation
            )));
        }
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }
        Ok(state)
    }

    fn issue_token(&self, state: &mut SimState, prefix: &str) -> AccessCredential {
        state.token_generation += 1;
        AccessCredential::new(
            self.consumer_key.clone(),
            format!("{}-token-{}", prefix, state.token_generation),
            format!("{}-secret-{}", prefix, state.token_generation),
        )
    }
}

fn paginate<T: Clone>(items: &[T], page_size: usize, marker: Option<String>) -> ApiResult<Page<T>> {
    let start = match marker {
        Some(m) => m
            .parse::<usize>()
            .map_err(|_| ApiError::InvalidRequest(format!("unknown marker {}", m)))?,
        None => 0,
    };
    let end = (start + page_size).min(items.len());
    let page = items.get(start..end).unwrap_or_default().to_vec();
    Ok(Page {
        items: page,
        next: (end < items.len()).then(|| end.to_string()),
    })
}

#[async_trait]
impl BrokerApi for SimulatedBroker {
    async fn set_credential(&self, credential: Option<AccessCredential>) {
        let mut state = self.state.lock();
        if credential.is_some() {
            state.token_expired = false;
        }
        state.credential = credential;
    }

    async fn get_request_token(&self) -> ApiResult<AccessCredential> {
        let mut state = self.state.lock();
        self.record(&mut state, "GetRequestToken", "");
        Ok(self.issue_token(&mut state, "request"))
    }

    async fn get_access_token(
        &self,
        request_token: &AccessCredential,
        verifier: &str,
    ) -> ApiResult<AccessCredential> {
        let mut state = self.state.lock();
        self.record(&mut state, "GetAccessToken", request_token.token());
        if verifier != SIMULATED_VERIFIER {
            return Err(ApiError::AuthorizationFailed(format!(
                "verifier {} was not issued",
                verifier
            )));
        }
        Ok(self.issue_token(&mut state, "access"))
    }

    async fn renew_access_token(
        &self,
        access_token: &AccessCredential,
    ) -> ApiResult<AccessCredential> {
        let mut state = self.state.lock();
        self.record(&mut state, "RenewAccessToken", access_token.token());
        if state.renew_fails {
            return Err(ApiError::RenewFailed("HTTP 401".to_string()));
        }
        Ok(self.issue_token(&mut state, "access"))
    }

    fn authorize_url(&self, request_token: &AccessCredential) -> String {
        format!(
            "sim://authorize?key={}&token={}",
            self.consumer_key,
            request_token.token()
        )
    }

    async fn send_order(&self, order: &OrderRequest) -> ApiResult<OrderAck> {
        let mut state = self.enter("SendOrder", &order.account_id)?;
        let order_num = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let orders = state.orders.entry(order.account_id.clone()).or_default();
        orders.insert(
            0,
            OrderInfo {
                order_id: order_num,
                symbol: order.symbol.clone(),
                order_status: OrderStatus::Open,
                order_action: Some(format!("{:?}", order.side).to_uppercase()),
                ordered_quantity: order.quantity as f64,
                filled_quantity: 0.0,
                limit_price: match order.price_type {
                    PriceType::Limit { limit_price } | PriceType::StopLimit { limit_price, .. } => {
                        Some(limit_price)
                    }
                    _ => None,
                },
                order_placed_time: Some(chrono::Utc::now().timestamp_millis()),
            },
        );
        Ok(OrderAck {
            account_id: order.account_id.clone(),
            order_num,
            client_order_id: order.client_order_id.clone(),
            message: None,
        })
    }

    async fn change_order(&self, order_id: i64, order: &OrderRequest) -> ApiResult<OrderAck> {
        let mut state = self.enter("SendOrderChange", &order.account_id)?;
        let orders = state.orders.entry(order.account_id.clone()).or_default();
        let existing = orders
            .iter_mut()
            .find(|o| o.order_id == order_id && !o.order_status.is_final())
            .ok_or_else(|| ApiError::InvalidRequest(format!("order {} is not open", order_id)))?;
        existing.order_status = OrderStatus::Cancelled;

        let order_num = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        orders.insert(
            0,
            OrderInfo {
                order_id: order_num,
                symbol: order.symbol.clone(),
                order_status: OrderStatus::Open,
                order_action: None,
                ordered_quantity: order.quantity as f64,
                filled_quantity: 0.0,
                limit_price: None,
                order_placed_time: Some(chrono::Utc::now().timestamp_millis()),
            },
        );
        Ok(OrderAck {
            account_id: order.account_id.clone(),
            order_num,
            client_order_id: order.client_order_id.clone(),
            message: Some(format!("replaces {}", order_id)),
        })
    }

    async fn cancel_order(&self, order_id: i64, portfolio: &str) -> ApiResult<CancelAck> {
        let mut state = self.enter("CancelOrder", portfolio)?;
        let order = state
            .orders
            .get_mut(portfolio)
            .and_then(|orders| orders.iter_mut().find(|o| o.order_id == order_id))
            .ok_or_else(|| ApiError::InvalidRequest(format!("order {} not found", order_id)))?;
        order.order_status = OrderStatus::Cancelled;
        Ok(CancelAck {
            account_id: portfolio.to_string(),
            order_num: order_id,
            cancel_time: Some(chrono::Utc::now().timestamp_millis()),
            message: None,
        })
    }

    async fn get_order_list(
        &self,
        portfolio: &str,
        count: u32,
        marker: Option<String>,
    ) -> ApiResult<Page<OrderInfo>> {
        let state = self.enter("GetOrderList", portfolio)?;
        let orders = state.orders.get(portfolio).cloned().unwrap_or_default();
        paginate(&orders, count.max(1) as usize, marker)
    }

    async fn get_positions(
        &self,
        portfolio: &str,
        marker: Option<String>,
    ) -> ApiResult<Page<PositionInfo>> {
        let state = self.enter("AccountPositions", portfolio)?;
        let positions = state.positions.get(portfolio).cloned().unwrap_or_default();
        paginate(&positions, state.positions_page_size, marker)
    }

    async fn get_accounts(&self) -> ApiResult<Vec<AccountInfo>> {
        let state = self.enter("GetAccounts", "")?;
        Ok(state.accounts.clone())
    }

    async fn product_lookup(&self, company: &str) -> ApiResult<Vec<ProductInfo>> {
        let _state = self.enter("ProductLookup", company)?;
        Ok(vec![ProductInfo {
            symbol: company.to_uppercase(),
            company_name: company.to_string(),
            exchange: "SIM".to_string(),
            security_type: "EQ".to_string(),
        }])
    }

    async fn get_rate_limit_status(&self, module: &str) -> ApiResult<RateLimitStatus> {
        let _state = self.enter("GetRateLimitStatus", module)?;
        Ok(RateLimitStatus {
            consumer_key: self.consumer_key.clone(),
            request_limit: 2,
            requests_remaining: 2,
            reset_time: None,
        })
    }
}
