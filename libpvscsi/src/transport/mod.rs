//! Unix socket transport for CSI messages.
//!
//! [`CsiClient`] and [`CsiServer`] exchange one JSON-encoded [`CsiMessage`]
//! request and one response per connection.  Each side signals the end of
//! its message by shutting down its write half.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound on a single encoded message.
pub(crate) const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;
