use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::info;

use super::events::{ClientEvent, EventBus};
use super::pollers::{AccountsPoller, OrdersPoller};
use super::portfolios::PortfolioBook;
use crate::api::{BrokerApi, OrderRequest};
use crate::connection::{AccessCredential, Authorizer, Connection, ConnectionState, SessionListener};
use crate::core::config::SchedulerConfig;
use crate::core::metrics::SchedulerMetrics;
use crate::engine::operations::{
    CancelOrderOp, ChangeOrderOp, PlaceOrderOp, ProductLookupOp, RateLimitStatusOp,
};
use crate::engine::{
    DispatchError, Dispatcher, Module, ModuleConfig, ModuleContext, ModuleState, ModuleWaker,
    NoAutoRequests, Operation, Request, RequestId, RequestKind, Response, SchedulerError,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("no module serves {0} requests")]
    Unroutable(&'static str),
}

/// Request categories, one scheduler module each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Accounts,
    Market,
    Orders,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 3] = [ModuleKind::Accounts, ModuleKind::Market, ModuleKind::Orders];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Accounts => "accounts",
            ModuleKind::Market => "market",
            ModuleKind::Orders => "orders",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    /// Module that owns a built-in request kind.
    pub fn for_request(kind: RequestKind) -> Option<Self> {
        match kind {
            RequestKind::Accounts | RequestKind::Positions => Some(ModuleKind::Accounts),
            RequestKind::ProductLookup => Some(ModuleKind::Market),
            RequestKind::OrderList
            | RequestKind::PlaceOrder
            | RequestKind::ChangeOrder
            | RequestKind::CancelOrder => Some(ModuleKind::Orders),
            RequestKind::RateLimitStatus | RequestKind::Custom(_) => None,
        }
    }
}

struct ModuleSet {
    accounts: Module,
    market: Module,
    orders: Module,
}

impl ModuleSet {
    fn get(&self, kind: ModuleKind) -> &Module {
        match kind {
            ModuleKind::Accounts => &self.accounts,
            ModuleKind::Market => &self.market,
            ModuleKind::Orders => &self.orders,
        }
    }
}

#[async_trait]
impl SessionListener for ModuleSet {
    async fn on_connected(&self) {
        for kind in ModuleKind::ALL {
            self.get(kind).start().await;
        }
    }

    async fn on_disconnecting(&self) {
        for kind in ModuleKind::ALL {
            self.get(kind).stop().await;
        }
    }
}

/// Brokerage connector: one connection, one scheduler module per category.
///
/// Results of user calls and of background polling arrive as [`ClientEvent`]s.
/// Must be created inside a tokio runtime.
pub struct Client {
    connection: Arc<Connection>,
    modules: Arc<ModuleSet>,
    book: Arc<PortfolioBook>,
    events: EventBus,
    metrics: SchedulerMetrics,
}

impl Client {
    pub fn new(
        api: Arc<dyn BrokerApi>,
        config: &SchedulerConfig,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let dispatcher = Dispatcher::new();
        let events = EventBus::new(EVENT_CAPACITY);
        let metrics = SchedulerMetrics::new()?;
        let book = Arc::new(PortfolioBook::new(config.order_page_size));

        let connection =
            Connection::new(api.clone(), dispatcher.clone(), events.clone(), authorizer);
        let context = ModuleContext {
            api,
            dispatcher,
            metrics: metrics.clone(),
            reconnect: connection.reconnect_trigger(),
        };
        let idle = config.idle_wakeup();

        let orders = Module::new(
            ModuleConfig::new(ModuleKind::Orders.as_str(), config.orders_rps, idle),
            context.clone(),
            Box::new(OrdersPoller::new(book.clone(), events.clone())),
        )?;
        let accounts = Module::new(
            ModuleConfig::new(ModuleKind::Accounts.as_str(), config.accounts_rps, idle),
            context.clone(),
            Box::new(AccountsPoller::new(
                book.clone(),
                events.clone(),
                Some(orders.waker()),
            )),
        )?;
        let market = Module::new(
            ModuleConfig::new(ModuleKind::Market.as_str(), config.market_rps, idle),
            context,
            Box::new(NoAutoRequests),
        )?;

        let modules = Arc::new(ModuleSet {
            accounts,
            market,
            orders,
        });
        connection.add_session_listener(modules.clone());

        info!(
            "Client ready (accounts {}/s, market {}/s, orders {}/s)",
            config.accounts_rps, config.market_rps, config.orders_rps
        );

        Ok(Self {
            connection,
            modules,
            book,
            events,
            metrics,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn module_state(&self, kind: ModuleKind) -> ModuleState {
        self.modules.get(kind).state()
    }

    pub fn subscribe_module_state(&self, kind: ModuleKind) -> watch::Receiver<ModuleState> {
        self.modules.get(kind).subscribe_state()
    }

    pub async fn connect(&self) -> Result<ConnectionState, DispatchError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), DispatchError> {
        self.connection.disconnect().await
    }

    pub async fn submit_verifier(
        &self,
        verifier: impl Into<String>,
    ) -> Result<ConnectionState, DispatchError> {
        self.connection.submit_verifier(verifier.into()).await
    }

    pub async fn access_credential(&self) -> Option<AccessCredential> {
        self.connection.access_credential().await
    }

    /// Portfolios discovered so far, in discovery order.
    pub fn portfolios(&self) -> Vec<String> {
        self.book.ids()
    }

    /// Moves `portfolio` to the front of the order poll.
    pub fn register_activity(&self, portfolio: &str) {
        register_activity(&self.book, &self.modules.orders.waker(), portfolio);
    }

    /// Enqueues `operation` on the module that owns its kind.
    pub fn execute_user_request<O, F>(
        &self,
        operation: O,
        on_response: F,
    ) -> Result<RequestId, ClientError>
    where
        O: Operation,
        F: Fn(Response<O::Output>) + Send + Sync + 'static,
    {
        let kind = operation.kind();
        let module = ModuleKind::for_request(kind).ok_or(ClientError::Unroutable(kind.as_str()))?;
        Ok(self.execute_on(module, operation, on_response))
    }

    /// Enqueues `operation` on an explicit module.
    pub fn execute_on<O, F>(&self, module: ModuleKind, operation: O, on_response: F) -> RequestId
    where
        O: Operation,
        F: Fn(Response<O::Output>) + Send + Sync + 'static,
    {
        self.modules
            .get(module)
            .enqueue(Request::with_handler(operation, on_response).boxed())
    }

    pub fn register_order(
        &self,
        transaction_id: impl Into<String>,
        order: OrderRequest,
    ) -> RequestId {
        let transaction_id = transaction_id.into();
        let portfolio = order.account_id.clone();
        let events = self.events.clone();
        let book = self.book.clone();
        let orders = self.modules.orders.waker();

        self.execute_on(ModuleKind::Orders, PlaceOrderOp::new(order), move |response| {
            if response.result.is_ok() {
                register_activity(&book, &orders, &portfolio);
            }
            let (ack, error) = split(response);
            events.publish(ClientEvent::OrderRegisterResult {
                transaction_id: transaction_id.clone(),
                ack,
                error,
            });
        })
    }

    pub fn change_order(
        &self,
        transaction_id: impl Into<String>,
        order_id: i64,
        order: OrderRequest,
    ) -> RequestId {
        let transaction_id = transaction_id.into();
        let portfolio = order.account_id.clone();
        let events = self.events.clone();
        let book = self.book.clone();
        let orders = self.modules.orders.waker();

        self.execute_on(
            ModuleKind::Orders,
            ChangeOrderOp::new(order_id, order),
            move |response| {
                if response.result.is_ok() {
                    register_activity(&book, &orders, &portfolio);
                }
                let (ack, error) = split(response);
                events.publish(ClientEvent::OrderChangeResult {
                    transaction_id: transaction_id.clone(),
                    ack,
                    error,
                });
            },
        )
    }

    pub fn cancel_order(
        &self,
        transaction_id: impl Into<String>,
        order_id: i64,
        portfolio: impl Into<String>,
    ) -> RequestId {
        let transaction_id = transaction_id.into();
        let portfolio = portfolio.into();
        let events = self.events.clone();
        let book = self.book.clone();
        let orders = self.modules.orders.waker();
        let op = CancelOrderOp::new(order_id, portfolio.clone());

        self.execute_on(ModuleKind::Orders, op, move |response| {
            if response.result.is_ok() {
                register_activity(&book, &orders, &portfolio);
            }
            let (ack, error) = split(response);
            events.publish(ClientEvent::OrderCancelResult {
                transaction_id: transaction_id.clone(),
                ack,
                error,
            });
        })
    }

    pub fn lookup_products(&self, company: impl Into<String>) -> RequestId {
        let criteria = company.into();
        let events = self.events.clone();
        let op = ProductLookupOp::new(criteria.clone());

        self.execute_on(ModuleKind::Market, op, move |response| {
            let (products, error) = split(response);
            events.publish(ClientEvent::ProductLookupResult {
                criteria: criteria.clone(),
                products: products.unwrap_or_default(),
                error,
            });
        })
    }

    /// Asks the broker how much of `module`'s quota is left. Not throttled.
    pub fn request_rate_limit_status(&self, module: ModuleKind) -> RequestId {
        let events = self.events.clone();
        let name = module.as_str().to_string();
        let op = RateLimitStatusOp::new(name.clone());

        self.execute_on(module, op, move |response| {
            let (status, error) = split(response);
            events.publish(ClientEvent::RateLimitStatus {
                module: name.clone(),
                status,
                error,
            });
        })
    }
}

fn register_activity(book: &PortfolioBook, orders: &ModuleWaker, portfolio: &str) {
    book.register_activity(portfolio);
    orders.wake();
}

fn split<T>(response: Response<T>) -> (Option<T>, Option<crate::api::ApiError>) {
    match response.result {
        Ok(value) => (Some(value), None),
        Err(error) => (None, Some(error)),
    }
}
