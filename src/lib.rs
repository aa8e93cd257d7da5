#![allow(clippy::result_large_err)]

pub mod app;
pub mod channel;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod transport;
