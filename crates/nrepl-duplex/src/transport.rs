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

//! Duplex message transport over a blocking byte connection
//!
//! Two background threads per transport:
//!
//! - `nrepl-io` owns the [`Connection`]. It writes queued frames and reads
//!   whatever the peer has sent into batches for the inbound queue.
//! - `nrepl-dispatch` drains the inbound queue through a [`Deframer`] and
//!   hands every complete message to the registered listeners.
//!
//! Callers never block on the socket: [`DuplexTransport::send`] only
//! encodes and enqueues.

use crate::codec;
use crate::deframer::{DEFAULT_MAX_BUFFERED_BYTES, Deframer};
use crate::error::{NReplError, Result};
use crate::lock;
use crate::message::Message;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{
    Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError, channel,
    sync_channel,
};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// A raw, blocking byte connection
pub trait Connection: Send + 'static {
    /// Write some of `bytes`, returning how many were written
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Read into `buf`, waiting at most `timeout`
    ///
    /// A timeout surfaces as `WouldBlock` or `TimedOut`; `Ok(0)` is EOF.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}

/// [`Connection`] over a TCP socket
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    read_timeout: Option<Duration>,
}

impl TcpConnection {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_timeout: None,
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.stream.write(bytes)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // A zero read timeout is rejected by the socket layer
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout != Some(timeout) {
            self.stream.set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }
        self.stream.read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }
}

/// Anything that accepts outbound messages
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Message) -> Result<()>;
}

/// Called on the dispatch thread for every inbound message
pub type MessageListener = Box<dyn FnMut(&Message) -> Result<()> + Send>;

/// Anything that produces inbound messages
pub trait MessageSource {
    fn add_listener(&self, listener: MessageListener);
}

/// Tuning for [`DuplexTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Longest a worker waits before re-checking for work or stop
    pub poll_interval: Duration,
    /// Read timeout for follow-up reads once a batch has started
    pub drain_timeout: Duration,
    pub read_buffer_size: usize,
    /// A batch is handed over once it reaches this size
    pub max_batch_size: usize,
    /// Batches the I/O thread may queue ahead of the dispatch thread
    pub inbound_queue_capacity: usize,
    /// Bytes buffered without a complete message before the stream is
    /// declared corrupt
    pub max_buffered_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(1),
            read_buffer_size: 4096,
            max_batch_size: 1024 * 1024,
            inbound_queue_capacity: 64,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Stop,
}

/// State handed to the workers by `start`
struct Startup {
    connection: Box<dyn Connection>,
    outbound_rx: Receiver<Outbound>,
}

struct Workers {
    io: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

type Listeners = Arc<Mutex<Vec<MessageListener>>>;

/// Multiplexes messages over one [`Connection`]
///
/// Messages sent before [`DuplexTransport::start`] are queued and written
/// once the I/O thread runs. Listeners see messages in wire order, one at a
/// time, on the dispatch thread.
pub struct DuplexTransport {
    config: TransportConfig,
    outbound_tx: Sender<Outbound>,
    startup: Mutex<Option<Startup>>,
    workers: Mutex<Option<Workers>>,
    listeners: Listeners,
    stopped: Arc<AtomicBool>,
    stop_requested: AtomicBool,
}

impl DuplexTransport {
    pub fn new(connection: impl Connection, config: TransportConfig) -> Self {
        let (outbound_tx, outbound_rx) = channel();
        Self {
            config,
            outbound_tx,
            startup: Mutex::new(Some(Startup {
                connection: Box::new(connection),
                outbound_rx,
            })),
            workers: Mutex::new(None),
            listeners: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Spawn the I/O and dispatch threads
    pub fn start(&self) -> Result<()> {
        let Some(Startup {
            connection,
            outbound_rx,
        }) = lock(&self.startup).take()
        else {
            return Err(NReplError::OperationFailed(
                "transport already started".to_string(),
            ));
        };

        let (inbound_tx, inbound_rx) = sync_channel(self.config.inbound_queue_capacity.max(1));

        let io = {
            let config = self.config.clone();
            let stopped = Arc::clone(&self.stopped);
            thread::Builder::new()
                .name("nrepl-io".to_string())
                .spawn(move || io_loop(connection, outbound_rx, inbound_tx, config, stopped))?
        };

        let dispatch = {
            let config = self.config.clone();
            let listeners = Arc::clone(&self.listeners);
            thread::Builder::new()
                .name("nrepl-dispatch".to_string())
                .spawn(move || dispatch_loop(inbound_rx, listeners, config))?
        };

        *lock(&self.workers) = Some(Workers { io, dispatch });
        debug!("transport started");
        Ok(())
    }

    /// Encode `message` and queue it for writing
    ///
    /// Never blocks. Fails once the transport has stopped.
    pub fn send(&self, message: &Message) -> Result<()> {
        if self.is_stopped() || self.stop_requested.load(Ordering::Acquire) {
            return Err(NReplError::TransportStopped);
        }

        let frame = codec::encode_message(message)?;
        self.outbound_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| NReplError::TransportStopped)
    }

    pub fn add_listener(&self, listener: impl FnMut(&Message) -> Result<()> + Send + 'static) {
        lock(&self.listeners).push(Box::new(listener));
    }

    /// Flush queued sends, close the connection and join both threads
    ///
    /// Must not be called from a listener.
    pub fn stop(&self) {
        self.request_stop();

        let workers = lock(&self.workers).take();
        match workers {
            Some(Workers { io, dispatch }) => {
                if io.join().is_err() {
                    error!("nrepl-io thread panicked");
                }
                if dispatch.join().is_err() {
                    error!("nrepl-dispatch thread panicked");
                }
            }
            None => {
                let startup = lock(&self.startup).take();
                if let Some(mut startup) = startup {
                    if let Err(e) = startup.connection.close() {
                        debug!(error = %e, "closing unstarted connection failed");
                    }
                }
            }
        }

        self.stopped.store(true, Ordering::Release);
    }

    /// Ask the workers to stop without waiting for them
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            let _ = self.outbound_tx.send(Outbound::Stop);
        }
    }

    /// Whether the I/O thread has exited or `stop` has completed
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl MessageSink for DuplexTransport {
    fn send(&self, message: Message) -> Result<()> {
        DuplexTransport::send(self, &message)
    }
}

impl MessageSource for DuplexTransport {
    fn add_listener(&self, listener: MessageListener) {
        lock(&self.listeners).push(listener);
    }
}

/// Why the I/O thread exited
enum Exit {
    Stop,
    Eof,
    DispatchGone,
    Failed(io::Error),
}

enum Batch {
    Idle,
    Bytes(Vec<u8>),
    Eof(Vec<u8>),
}

fn io_loop(
    mut connection: Box<dyn Connection>,
    outbound: Receiver<Outbound>,
    inbound: SyncSender<Vec<u8>>,
    config: TransportConfig,
    stopped: Arc<AtomicBool>,
) {
    debug!("nrepl-io started");
    let mut read_buf = vec![0u8; config.read_buffer_size.max(1)];
    let mut held: Option<Vec<u8>> = None;

    let exit = loop {
        match drain_outbound(connection.as_mut(), &outbound) {
            Ok(true) => break Exit::Stop,
            Ok(false) => {}
            Err(e) => break Exit::Failed(e),
        }

        let batch = match held.take() {
            Some(batch) => batch,
            None => match read_batch(connection.as_mut(), &mut read_buf, &config) {
                Ok(Batch::Idle) => continue,
                Ok(Batch::Bytes(batch)) => batch,
                Ok(Batch::Eof(batch)) => {
                    held = (!batch.is_empty()).then_some(batch);
                    break Exit::Eof;
                }
                Err(e) => break Exit::Failed(e),
            },
        };

        match inbound.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                debug!(bytes = batch.len(), "inbound queue full, holding batch");
                held = Some(batch);
                thread::sleep(config.poll_interval);
            }
            Err(TrySendError::Disconnected(_)) => break Exit::DispatchGone,
        }
    };

    match &exit {
        Exit::Stop => debug!("nrepl-io stopping"),
        Exit::Eof => debug!("connection closed by peer"),
        Exit::DispatchGone => warn!("dispatch thread is gone, stopping"),
        Exit::Failed(e) => error!(error = %e, "connection failed"),
    }

    if let Err(e) = connection.close() {
        debug!(error = %e, "closing connection failed");
    }
    stopped.store(true, Ordering::Release);

    // Anything already read still reaches the listeners
    if let Some(batch) = held {
        let _ = inbound.send(batch);
    }
    debug!("nrepl-io exited");
}

/// Write every queued frame; returns `true` when a stop item was reached
fn drain_outbound(connection: &mut dyn Connection, outbound: &Receiver<Outbound>) -> io::Result<bool> {
    loop {
        match outbound.try_recv() {
            Ok(Outbound::Frame(frame)) => {
                write_frame(connection, &frame)?;
                debug!(bytes = frame.len(), "frame written");
            }
            Ok(Outbound::Stop) | Err(TryRecvError::Disconnected) => return Ok(true),
            Err(TryRecvError::Empty) => return Ok(false),
        }
    }
}

fn write_frame(connection: &mut dyn Connection, frame: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < frame.len() {
        match connection.send(&frame[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection accepted no bytes",
                ));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Read everything currently available, up to `max_batch_size`
///
/// The first read waits up to the poll interval; follow-up reads only wait
/// `drain_timeout`.
fn read_batch(
    connection: &mut dyn Connection,
    buf: &mut [u8],
    config: &TransportConfig,
) -> io::Result<Batch> {
    let mut batch = Vec::new();
    let mut timeout = config.poll_interval;

    loop {
        match connection.recv(buf, timeout) {
            Ok(0) => return Ok(Batch::Eof(batch)),
            Ok(n) => {
                batch.extend_from_slice(&buf[..n]);
                if batch.len() >= config.max_batch_size {
                    break;
                }
                timeout = config.drain_timeout;
            }
            Err(e) if is_timeout(&e) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    if batch.is_empty() {
        Ok(Batch::Idle)
    } else {
        Ok(Batch::Bytes(batch))
    }
}

/// Deframe inbound batches and hand each message to the listeners
///
/// Runs until the I/O worker exits and drops its sender. The poll interval
/// only bounds each wait; stopping is never checked here.
fn dispatch_loop(inbound: Receiver<Vec<u8>>, listeners: Listeners, config: TransportConfig) {
    debug!("nrepl-dispatch started");
    let mut deframer = Deframer::with_max_buffered(config.max_buffered_bytes);
    {
        let listeners = Arc::clone(&listeners);
        deframer.add_listener(move |value| {
            let message = Message::try_from(value.clone())?;
            deliver(&listeners, &message)
        });
    }

    loop {
        let mut bytes = match inbound.recv_timeout(config.poll_interval) {
            Ok(batch) => batch,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        while let Ok(more) = inbound.try_recv() {
            bytes.extend_from_slice(&more);
        }

        let mut result = deframer.push(&bytes);
        while let Err(e) = result {
            error!(error = %e, "failed to dispatch inbound message");
            result = deframer.drain();
        }
    }

    // Listeners may hold the transport alive through their captures
    lock(&listeners).clear();
    debug!("nrepl-dispatch exited");
}

/// Hand `message` to every listener without holding the list lock
fn deliver(listeners: &Listeners, message: &Message) -> Result<()> {
    let mut active = std::mem::take(&mut *lock(listeners));
    let result = active.iter_mut().try_for_each(|listener| listener(message));

    let mut current = lock(listeners);
    let added = std::mem::replace(&mut *current, active);
    current.extend(added);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.inbound_queue_capacity, 64);
        assert_eq!(config.max_buffered_bytes, 128 * 1024 * 1024);
    }

    #[test]
    fn test_timeout_kinds() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_deliver_keeps_listeners_added_during_delivery() {
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&listeners);
        listeners.lock().unwrap().push(Box::new(move |_| {
            inner.lock().unwrap().push(Box::new(|_| Ok(())));
            Ok(())
        }));

        deliver(&listeners, &Message::new()).unwrap();

        assert_eq!(listeners.lock().unwrap().len(), 2);
    }
}
