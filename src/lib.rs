//! carelink-proxy: republishes the latest CareLink reading over local HTTP.
//!
//! A background [`poller::Poller`] keeps the shared [`store::SnapshotStore`]
//! fresh; the axum router from [`handlers::router`] serves it.

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod handlers;
pub mod poller;
pub mod state;
pub mod store;
pub mod transform;
