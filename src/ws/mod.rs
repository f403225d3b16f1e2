//! Websocket client.
//!
//! [`Socket`] is the public surface; [`engine`] does the sans-io
//! framing and [`adapter`] keeps transport interest in sync with it.

mod adapter;
mod engine;
mod socket;

pub use engine::Incoming;
pub use socket::{Socket, SocketOptions, State};
