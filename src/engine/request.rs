use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::api::{ApiError, ApiResult, BrokerApi, ErrorClass};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Accounts,
    Positions,
    OrderList,
    PlaceOrder,
    ChangeOrder,
    CancelOrder,
    ProductLookup,
    RateLimitStatus,
    Custom(&'static str),
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Accounts => "accounts",
            RequestKind::Positions => "positions",
            RequestKind::OrderList => "order_list",
            RequestKind::PlaceOrder => "place_order",
            RequestKind::ChangeOrder => "change_order",
            RequestKind::CancelOrder => "cancel_order",
            RequestKind::ProductLookup => "product_lookup",
            RequestKind::RateLimitStatus => "rate_limit_status",
            RequestKind::Custom(name) => *name,
        }
    }
}

/// One broker operation, possibly spanning several wire calls.
///
/// `call` performs exactly one wire call. Multi-part operations carry their
/// continuation marker themselves: each page's marker is stored from the
/// returned value and passed into the next call. `reports_done` is consulted
/// after every successful part.
#[async_trait]
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> RequestKind;

    /// Administrative calls that the broker does not bill may opt out.
    fn is_rate_limited(&self) -> bool {
        true
    }

    async fn call(&mut self, api: &dyn BrokerApi) -> ApiResult<Self::Output>;

    fn reports_done(&self) -> bool {
        true
    }
}

/// Result of one executed part, delivered to the request's handler.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub request_id: RequestId,
    pub kind: RequestKind,
    /// 1-based index of the part that produced this response.
    pub part: usize,
    /// True on the response that completed the request.
    pub is_last: bool,
    pub result: ApiResult<T>,
}

impl<T> Response<T> {
    pub fn has_error(&self) -> bool {
        self.result.is_err()
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.result.as_ref().err()
    }
}

pub type ResponseHandler<T> = Arc<dyn Fn(Response<T>) + Send + Sync>;

/// Deferred handler invocation, posted to the response lane by the module.
pub type Delivery = Box<dyn FnOnce() + Send>;

/// Tagged outcome of one part, inspected by the module loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Success,
    TransientError,
    AuthError,
}

pub struct PartOutcome {
    pub status: PartStatus,
    pub delivery: Delivery,
}

/// Type-erased request as queued on a module.
#[async_trait]
pub trait Executable: Send {
    fn id(&self) -> RequestId;
    fn kind(&self) -> RequestKind;
    fn is_rate_limited(&self) -> bool;
    fn is_done(&self) -> bool;
    fn parts_executed(&self) -> usize;
    async fn execute_next_part(&mut self, api: &dyn BrokerApi) -> PartOutcome;

    /// Completes the request without a wire call, handing `error` to its handler.
    fn reject(self: Box<Self>, error: ApiError) -> Delivery;
}

/// An [`Operation`] bound to its caller's handler.
pub struct Request<O: Operation> {
    id: RequestId,
    operation: O,
    rate_limited: bool,
    done: bool,
    parts: usize,
    handler: ResponseHandler<O::Output>,
}

impl<O: Operation> Request<O> {
    pub fn new(operation: O, handler: ResponseHandler<O::Output>) -> Self {
        let rate_limited = operation.is_rate_limited();
        Self {
            id: RequestId::next(),
            operation,
            rate_limited,
            done: false,
            parts: 0,
            handler,
        }
    }

    pub fn with_handler<F>(operation: O, handler: F) -> Self
    where
        F: Fn(Response<O::Output>) + Send + Sync + 'static,
    {
        Self::new(operation, Arc::new(handler))
    }

    pub fn boxed(self) -> Box<dyn Executable> {
        Box::new(self)
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }
}

#[async_trait]
impl<O: Operation> Executable for Request<O> {
    fn id(&self) -> RequestId {
        self.id
    }

    fn kind(&self) -> RequestKind {
        self.operation.kind()
    }

    fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn parts_executed(&self) -> usize {
        self.parts
    }

    async fn execute_next_part(&mut self, api: &dyn BrokerApi) -> PartOutcome {
        let result = if self.done {
            Err(ApiError::InvalidRequest(format!(
                "request {} already completed",
                self.id
            )))
        } else {
            self.parts += 1;
            self.operation.call(api).await
        };

        let status = match &result {
            Ok(_) => PartStatus::Success,
            Err(e) if e.class() == ErrorClass::Authorization => PartStatus::AuthError,
            Err(_) => PartStatus::TransientError,
        };

        // Monotonic: once done, stays done.
        self.done = self.done || result.is_err() || self.operation.reports_done();

        let response = Response {
            request_id: self.id,
            kind: self.operation.kind(),
            part: self.parts,
            is_last: self.done,
            result,
        };
        let handler = self.handler.clone();

        PartOutcome {
            status,
            delivery: Box::new(move || handler(response)),
        }
    }

    fn reject(self: Box<Self>, error: ApiError) -> Delivery {
        let response = Response {
            request_id: self.id,
            kind: self.operation.kind(),
            part: self.parts,
            is_last: true,
            result: Err(error),
        };
        let handler = self.handler;
        Box::new(move || handler(response))
    }
}
