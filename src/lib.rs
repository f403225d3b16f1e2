//! Lightweight callback-driven event reactor with a websocket client.
//!
//! ## Features
//! - Single-threaded dispatch loop over `epoll`/`kqueue`.
//! - Timers, signals and priorities in one queue.
//! - Buffered sockets with watermarks, timeouts and optional TLS.
//! - Nonblocking DNS, a TCP listener and an HTTP/1.1 client layer.
//! - A websocket client driven entirely by callbacks.
//!
//! ## High-level API
//!
//! - [`queue`]
//! - [`bufev`]
//! - [`ws`]
//!
//! ```ignore
//! {
//!     let queue = QueueConfig::new().build()?;
//!     let dns = Dns::new(&queue)?;
//!
//!     let socket = ws::Socket::new(SocketOptions::default());
//!     socket.on_message(|_, payload| println!("{:?}", payload));
//!     socket.open(&queue, &dns, "ws://example.com/chat")?;
//!
//!     queue.dispatch()?;
//! }
//! ```
//!
//! ## Low-level API
//!
//! - [`event`]
//! - [`frame`]
//! - [`handshake`]
//!
//! ```ignore
//! {
//!     // a periodic timer
//!     let tick = Event::new_timer(&queue, EventFlags::PERSIST, TimerHandler::new(|| {
//!         println!("tick");
//!     }));
//!     tick.add_timeout(Duration::from_secs(1))?;
//!
//!     // decode a frame head
//!     let (head, offset) = FrameHead::decode(&buf)?;
//! }
//! ```

pub mod bufev;
pub mod callback;
pub mod dns;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod listener;
pub mod queue;
pub mod uri;
pub mod ws;

pub use bufev::{BufferEvent, BufferEventRef, TlsConnector};
pub use callback::{AcceptorHandler, GenericHandler, TimerHandler};
pub use dns::{Dns, Family};
pub use error::{Error, Result};
pub use event::{Event, EventFlags, InlineEvent};
pub use http::HttpConnection;
pub use listener::Listener;
pub use queue::{EventQueue, LoopFlags, QueueConfig, Waker};
pub use ws::{Socket, SocketOptions};
