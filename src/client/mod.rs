pub mod events;
pub mod facade;
pub mod pollers;
pub mod portfolios;

pub use events::{ClientEvent, EventBus};
pub use facade::{Client, ClientError, ModuleKind};
pub use portfolios::{PortfolioBook, PortfolioCursor};
