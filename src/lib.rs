#![forbid(unsafe_code)]

//! Streaming client for the `DnsCheck` multi-provider DNS verification
//! service.
//!
//! A check ("run") travels over a single persistent WebSocket connection;
//! the server streams one result per DNS provider plus a consensus over
//! everything seen so far. The crate's core is the connection-session
//! lifecycle: [`session::Session`] owns one channel at a time,
//! [`controller::RunController`] guarantees that only the most recently
//! requested run can affect observable state, and
//! [`consensus::ConsensusAggregator`] recomputes the agreed answer set as
//! results arrive.

pub mod catalog;
pub mod config;
pub mod consensus;
pub mod controller;
pub mod errors;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
