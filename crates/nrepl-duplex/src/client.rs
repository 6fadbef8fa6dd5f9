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

//! Request/response nREPL client on top of the duplex transport

use crate::container::SessionContainer;
use crate::error::{NReplError, Result};
use crate::ids::UuidIds;
use crate::lock;
use crate::message::{DescribeResult, EvalResult};
use crate::ops::LoadFile;
use crate::registry::ReactionBundle;
use crate::session::{InterruptStatus, Session, SessionState};
use crate::transport::{Connection, DuplexTransport, TcpConnection, TransportConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;

/// Settings for [`NReplClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// How long an operation may wait for its final reply
    pub operation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

/// Main nREPL client
///
/// Every method waits for the operation's final (`done`) reply. Calls can
/// be made concurrently from several tasks; they share one connection.
pub struct NReplClient {
    transport: Arc<DuplexTransport>,
    container: SessionContainer,
    config: ClientConfig,
}

impl NReplClient {
    /// Connect to an nREPL server
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?.into_std()?;
        // The I/O thread relies on blocking reads with a timeout
        stream.set_nonblocking(false)?;
        Self::from_connection(TcpConnection::from_stream(stream)?, config)
    }

    /// Run the client over an already established connection
    pub fn from_connection(connection: impl Connection, config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(DuplexTransport::new(connection, config.transport.clone()));
        let container = SessionContainer::new(transport.clone(), Arc::new(UuidIds));
        container.listen_to(&*transport);
        transport.start()?;

        Ok(Self {
            transport,
            container,
            config,
        })
    }

    /// The sessions living on this connection
    pub fn container(&self) -> &SessionContainer {
        &self.container
    }

    /// Clone a new session from the server
    pub async fn clone_session(&self) -> Result<Session> {
        let (tx, rx) = oneshot::channel();
        self.container.create_new_session(move |session| {
            let _ = tx.send(session);
        })?;

        let session = self.await_reply(rx, "clone_session", self.config.operation_timeout).await?;
        debug!(session = %session.id(), "session cloned");
        Ok(session)
    }

    /// Evaluate code in a session
    pub async fn eval(&self, session: &Session, code: impl Into<String>) -> Result<EvalResult> {
        self.eval_with_timeout(session, code, self.config.operation_timeout)
            .await
    }

    pub async fn eval_with_timeout(
        &self,
        session: &Session,
        code: impl Into<String>,
        timeout: Duration,
    ) -> Result<EvalResult> {
        let (bundle, rx) = collecting_bundle();
        session.eval(code, bundle)?;
        self.await_reply(rx, "eval", timeout).await
    }

    /// Load a file in a session
    pub async fn load_file(&self, session: &Session, file: LoadFile) -> Result<EvalResult> {
        let (bundle, rx) = collecting_bundle();
        session.load_file(file, bundle)?;
        self.await_reply(rx, "load_file", self.config.operation_timeout)
            .await
    }

    /// Interrupt an ongoing evaluation
    ///
    /// A reply that ends without an interrupt status counts as
    /// [`InterruptStatus::Interrupted`].
    pub async fn interrupt(
        &self,
        session: &Session,
        interrupt_id: Option<&str>,
    ) -> Result<InterruptStatus> {
        let reported = Arc::new(Mutex::new(None::<InterruptStatus>));
        let record = Arc::clone(&reported);
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);

        let bundle = ReactionBundle::new().on_done(move |_, _| {
            if let Some(tx) = tx.take() {
                let status = lock(&reported).unwrap_or(InterruptStatus::Interrupted);
                let _ = tx.send(status);
            }
        });
        session.interrupt(
            interrupt_id,
            move |_, status| {
                lock(&record).get_or_insert(status);
            },
            bundle,
        )?;

        self.await_reply(rx, "interrupt", self.config.operation_timeout)
            .await
    }

    /// Describe the server's capabilities
    pub async fn describe(&self, session: &Session) -> Result<DescribeResult> {
        let (tx, rx) = oneshot::channel();
        session.describe(move |_, result| {
            let _ = tx.send(result);
        })?;

        self.await_reply(rx, "describe", self.config.operation_timeout)
            .await
    }

    /// Send stdin to an evaluation waiting for input
    pub async fn stdin(&self, session: &Session, contents: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let bundle = ReactionBundle::new().on_done(move |_, _| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        });
        session.feed_stdin(contents, bundle)?;

        self.await_reply(rx, "stdin", self.config.operation_timeout)
            .await
    }

    /// Close a session and wait until it has drained
    pub async fn close_session(&self, session: &Session) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        session.close_then(move |_| {
            let _ = tx.send(());
        })?;

        self.await_reply(rx, "close_session", self.config.operation_timeout)
            .await?;
        debug!(session = %session.id(), "session closed");
        Ok(())
    }

    /// Close every open session and stop the transport
    ///
    /// Close requests are written before the connection is shut down, but
    /// their replies are not awaited.
    pub async fn shutdown(self) -> Result<()> {
        for id in self.container.session_ids() {
            let Some(session) = self.container.session(&id) else {
                continue;
            };
            if session.state() == SessionState::Open {
                if let Err(e) = session.close() {
                    debug!(session = %id, error = %e, "close on shutdown failed");
                }
            }
        }

        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || transport.stop())
            .await
            .map_err(|e| NReplError::OperationFailed(format!("transport shutdown failed: {}", e)))
    }

    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<T>,
        operation: &str,
        timeout: Duration,
    ) -> Result<T> {
        match time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(NReplError::OperationFailed(format!(
                "{} was abandoned before a reply arrived",
                operation
            ))),
            Err(_) if self.transport.is_stopped() => Err(NReplError::TransportStopped),
            Err(_) => Err(NReplError::Timeout {
                operation: operation.to_string(),
                duration: timeout,
            }),
        }
    }
}

impl Drop for NReplClient {
    fn drop(&mut self) {
        self.transport.request_stop();
    }
}

/// A bundle that folds eval replies into one [`EvalResult`]
fn collecting_bundle() -> (ReactionBundle, oneshot::Receiver<EvalResult>) {
    let result = Arc::new(Mutex::new(EvalResult::new()));
    let (value, out, err, ns) = (
        Arc::clone(&result),
        Arc::clone(&result),
        Arc::clone(&result),
        Arc::clone(&result),
    );
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    let bundle = ReactionBundle::new()
        .on_value(move |_, _, v| lock(&value).value = Some(v.to_string()))
        .on_out(move |_, _, v| lock(&out).output.push(v.to_string()))
        .on_err(move |_, _, v| lock(&err).error.push(v.to_string()))
        .on_field("ns", move |_, _, v| lock(&ns).ns = Some(v.to_string()))
        .on_done(move |_, _| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(std::mem::take(&mut *lock(&result)));
            }
        });

    (bundle, rx)
}
