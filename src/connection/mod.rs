pub mod credential;
pub mod session;

pub use credential::{AccessCredential, CredentialError};
pub use session::{Authorizer, Connection, ConnectionState, SessionListener};
