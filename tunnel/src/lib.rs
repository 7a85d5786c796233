//! Many TCP streams over few WebSocket tunnels.
//!
//! The [`Local`] peer accepts SOCKS5 / HTTP-proxy connections and multiplexes
//! them over a pool of tunnels; the [`Server`] peer terminates the tunnels,
//! dials the real destinations and proxies bytes back. Tunnels are rotated
//! onto fresh WebSockets before their time-to-live expires without disturbing
//! the streams they carry.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
mod local;
mod pool;
pub mod proto;
mod server;
mod streams;
mod tunnel;

use std::time::Duration;

pub use config::{LocalConfig, Proto, ServerConfig};
pub use local::Local;
pub use server::Server;

/// Largest DATA payload carried in a single frame.
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Rotate each tunnel's WebSocket after this long unless configured otherwise.
///
/// Must stay below the hosting runtime's upgrade timeout minus a safety
/// margin; function-compute runtimes kill upgrades after roughly a minute.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(56);

pub(crate) const MAILBOX_DEPTH: usize = 32;
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// How long rotation may spend draining the old socket.
pub(crate) const FLUSH_TIMEOUT: Duration = Duration::from_millis(50);
pub(crate) const INACTIVE_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(60);
