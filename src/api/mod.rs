pub mod broker;
pub mod error;
pub mod etrade;
pub mod signer;
pub mod simulated;
pub mod types;

pub use broker::BrokerApi;
#[cfg(test)]
pub use broker::MockBrokerApi;
pub use error::{ApiError, ApiResult, ErrorClass};
pub use etrade::EtradeClient;
pub use signer::{OAuth1Signer, RequestSigner};
pub use simulated::{SimulatedAuthorizer, SimulatedBroker, SIMULATED_VERIFIER};
pub use types::*;
