//! Polling connector for the E*TRADE brokerage REST API.
//!
//! Requests are scheduled per category (accounts, market, orders) by a
//! single-loop [`engine::Module`] that shares a requests-per-second budget
//! between user calls and background polling. Authorization loss stops the
//! affected module and triggers one reconnect through [`connection::Connection`].

pub mod api;
pub mod client;
pub mod connection;
pub mod core;
pub mod engine;

pub use client::{Client, ClientError, ClientEvent, ModuleKind};
pub use connection::{AccessCredential, Authorizer, ConnectionState};
