#![allow(clippy::result_large_err)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handler;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;
