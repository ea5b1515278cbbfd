//! Instagram bio collector.
//! Pulls pending usernames from MongoDB, fetches each profile through an OpenVPN
//! tunnel that is rotated after a request budget, and posts the result to an API.

pub mod api;
pub mod config;
mod error;
pub mod logging;
mod macros;
mod parse;
pub mod process;
pub mod request;
pub mod store;
pub mod vpn;

pub use error::{Error, Result};

/// Requests allowed through one VPN server before switching.
pub const REQUEST_LIMIT: u32 = 120;
/// Budget charged when Instagram answers with its rate-limit message.
pub const RATE_LIMIT_PENALTY: u32 = 30;
/// Usernames pulled from the store per round.
pub const BATCH_SIZE: usize = 100;
/// Random pause between two profile fetches, in seconds.
pub const MIN_REQUEST_DELAY_SECS: f64 = 2.0;
pub const MAX_REQUEST_DELAY_SECS: f64 = 5.0;
/// Pause between dropping one tunnel and bringing up the next.
pub const RECONNECT_PAUSE_SECS: u64 = 5;

pub const LOG_DIR: &str = "logs";
pub const LOG_NAME: &str = "bio_collector";
