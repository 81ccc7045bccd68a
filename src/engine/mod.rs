pub mod dispatcher;
pub mod module;
pub mod operations;
pub mod rate_window;
pub mod request;

use thiserror::Error;

pub use dispatcher::{DispatchContext, DispatchError, Dispatcher};
pub use module::{
    AutoRequestSource, Module, ModuleConfig, ModuleContext, ModuleState, ModuleWaker,
    NoAutoRequests, ReconnectTrigger,
};
pub use rate_window::RateWindow;
pub use request::{
    Executable, Operation, PartStatus, Request, RequestId, RequestKind, Response, ResponseHandler,
};

/// Construction-time misconfiguration. Never raised from inside a running loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("rate budget must be at least 1 request per second, got {0}")]
    InvalidBudget(u32),
    #[error("page size must be at least 1, got {0}")]
    InvalidPageSize(u32),
    #[error("idle wake-up interval must be non-zero")]
    InvalidIdleWakeup,
}
