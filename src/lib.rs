//! Async client/server library for the FreeSWITCH event socket protocol.
//!
//! Supports both directions of the protocol:
//!
//! - **Inbound**: dial a running switch, authenticate, then issue commands
//!   and subscribe to events ([`Connection::connect`]).
//! - **Outbound**: accept connections the switch makes for individual calls
//!   and drive each call from the handler ([`listen_and_serve`],
//!   [`Connection::accept`]).
//!
//! Each session yields two handles: a cloneable [`Connection`] for sending
//! commands (each `send` blocks until its reply arrives) and a single
//! [`EventStream`] delivering asynchronous events in arrival order. A
//! background task owns the socket's read half and routes every frame to one
//! of the two.
//!
//! # Inbound example
//!
//! ```rust,no_run
//! use eventsocket::Connection;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), eventsocket::Error> {
//!     let (conn, mut events) = Connection::connect("127.0.0.1:8021", "ClueCon").await?;
//!     conn.send("event plain CHANNEL_CREATE CHANNEL_HANGUP").await?;
//!     while let Some(event) = events.recv().await {
//!         let event = event?;
//!         println!("{} on {}", event.get("Event-Name"), event.get("Unique-Id"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Outbound example
//!
//! ```rust,no_run
//! use eventsocket::{listen_and_serve, Connection, EventStream};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), eventsocket::Error> {
//!     listen_and_serve("0.0.0.0:9090", |conn: Connection, _events: EventStream| async move {
//!         if conn.send("connect").await.is_ok() {
//!             let _ = conn.execute("answer", "", true).await;
//!             let _ = conn.execute("playback", "ivr/welcome.wav", true).await;
//!         }
//!     })
//!     .await
//! }
//! ```
//!
//! Commands have no built-in deadline; wrap calls in
//! [`tokio::time::timeout`] where one is needed.

#[macro_use]
mod macros;

pub(crate) mod buffer;
pub mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub(crate) mod protocol;

pub use command::Msg;
pub use connection::{
    listen_and_serve, ConnectOptions, Connection, ConnectionStatus, DisconnectReason, EventStream,
};
pub use constants::DEFAULT_ESL_PORT;
pub use error::{Error, Result};
pub use event::Event;
pub use headers::EventHeader;
