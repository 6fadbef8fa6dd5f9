// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! # nrepl-duplex
//!
//! A multiplexing nREPL client. Many concurrent, multi-reply operations
//! share one connection: replies are matched to the [`ReactionBundle`]
//! registered under their message id and routed per [`Session`].
//!
//! The layers, bottom up:
//!
//! - [`codec`] and [`Deframer`] turn a fragmented byte stream into messages.
//! - [`DuplexTransport`] runs the socket and dispatch threads.
//! - [`SessionContainer`], [`Session`] and [`CallbackRegistry`] route
//!   replies to handlers and track session lifecycles.
//! - [`NReplClient`] wraps all of it in an async request/response API.
//!
//! ## Example
//!
//! ```no_run
//! use nrepl_duplex::NReplClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = NReplClient::connect("localhost:7888").await?;
//!     let session = client.clone_session().await?;
//!     let result = client.eval(&session, "(+ 1 2)").await?;
//!     println!("Result: {:?}", result.value);
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
mod client;
mod container;
mod deframer;
mod error;
mod ids;
mod message;
pub mod ops;
mod registry;
mod session;
mod transport;

pub use client::{ClientConfig, NReplClient};
pub use container::{NewSessionCallback, SessionContainer};
pub use deframer::{DEFAULT_MAX_BUFFERED_BYTES, Deframer, FrameListener};
pub use error::{NReplError, Result};
pub use ids::{CounterIds, IdSource, UuidIds};
pub use message::{DescribeResult, EvalResult, Message, Value, status};
pub use ops::LoadFile;
pub use registry::{CallbackRegistry, FieldHandler, ReactionBundle, StatusHandler};
pub use session::{CloseHandler, InterruptStatus, Session, SessionState};
pub use transport::{
    Connection, DuplexTransport, MessageListener, MessageSink, MessageSource, TcpConnection,
    TransportConfig,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if a handler panicked while holding it
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
