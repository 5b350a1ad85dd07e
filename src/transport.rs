//! Persistent TCP connection to the management server.
//!
//! A [`Transport`] owns one socket and a dedicated I/O thread running a
//! single-threaded tokio runtime. Callers enqueue byte payloads from any
//! thread; the I/O thread writes them one at a time in FIFO order and
//! delivers received bytes to a callback. Any socket error closes the socket
//! and reconnects: errors are never surfaced to callers.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::protocol::timeouts;

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    /// First delay after a failed connect attempt; doubles up to `reconnect_max`.
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// `None` keeps the queue unbounded.
    pub max_queue: Option<usize>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            reconnect_initial: Duration::from_millis(timeouts::RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(timeouts::RECONNECT_MAX_MS),
            max_queue: None,
        }
    }
}

pub type Callback = Box<dyn Fn() + Send + Sync>;
pub type ReceiveCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Hooks invoked by the transport. Connected and receive callbacks run on
/// the I/O thread; the closed callback runs on whichever thread calls
/// [`Transport::close`].
#[derive(Default)]
pub struct TransportCallbacks {
    pub on_connected: Option<Callback>,
    pub on_receive: Option<ReceiveCallback>,
    pub on_closed: Option<Callback>,
}

struct Outbound {
    queue: VecDeque<Bytes>,
    in_flight: bool,
    state: ConnectionState,
    connect_started: bool,
    /// Set by [`Transport::reconnect`], cleared when a connection opens.
    reset_requested: bool,
}

struct Shared {
    endpoint: SocketAddr,
    options: TransportOptions,
    callbacks: TransportCallbacks,
    outbound: Mutex<Outbound>,
    writable: Notify,
    /// Ends the current connection; the maintain loop opens a new one.
    reset: Notify,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

pub struct Transport {
    shared: Arc<Shared>,
    runtime: tokio::runtime::Handle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let endpoint = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?
        .collect();
    // The management servers are IPv4-only
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::Resolve {
            endpoint,
            reason: "no addresses".into(),
        })
}

impl Transport {
    /// Resolve the endpoint and start the I/O thread. Does not connect.
    pub fn new(
        host: &str,
        port: u16,
        options: TransportOptions,
        callbacks: TransportCallbacks,
    ) -> Result<Self, TransportError> {
        let endpoint = resolve(host, port)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown, mut stop) = watch::channel(false);

        let shared = Arc::new(Shared {
            endpoint,
            options,
            callbacks,
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                in_flight: false,
                state: ConnectionState::Disconnected,
                connect_started: false,
                reset_requested: false,
            }),
            writable: Notify::new(),
            reset: Notify::new(),
            shutdown,
            closed: AtomicBool::new(false),
        });

        let worker = thread::Builder::new()
            .name("otagent-io".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while !*stop.borrow() {
                        if stop.changed().await.is_err() {
                            break;
                        }
                    }
                });
                // Dropping the runtime cancels the connection task, which
                // closes the socket.
                drop(runtime);
            })?;

        debug!(%endpoint, "transport ready");
        Ok(Self {
            shared,
            runtime: handle,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.shared.endpoint
    }

    /// Start connecting. Once started, the connection is maintained until
    /// [`close`](Self::close); later calls are ignored.
    pub fn connect(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            warn!("connect called on a closed transport");
            return;
        }
        {
            let mut out = self.shared.outbound.lock();
            if out.connect_started {
                warn!("connect called while already connecting; ignored");
                return;
            }
            out.connect_started = true;
        }
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(maintain_connection(shared));
    }

    /// Enqueue a payload. Never blocks; the write happens on the I/O thread.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        {
            let mut out = self.shared.outbound.lock();
            if let Some(cap) = self.shared.options.max_queue {
                if out.queue.len() >= cap {
                    return Err(TransportError::QueueFull(cap));
                }
            }
            out.queue.push_back(payload.into());
        }
        self.shared.writable.notify_one();
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.outbound.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Payloads waiting to be written, including one in flight.
    pub fn queued(&self) -> usize {
        self.shared.outbound.lock().queue.len()
    }

    /// Drop the current connection and open a new one at once. Queued
    /// payloads, including a partly written one, go out on the new
    /// connection. Does nothing while not connected.
    pub fn reconnect(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut out = self.shared.outbound.lock();
            if out.state != ConnectionState::Connected {
                return;
            }
            out.reset_requested = true;
        }
        info!(endpoint = %self.shared.endpoint, "reconnect requested");
        self.shared.reset.notify_one();
    }

    /// Cancel pending I/O, close the socket, stop the I/O thread and fire
    /// the closed callback. Only the first call has any effect.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.set_state(ConnectionState::Closing);
        let _ = self.shared.shutdown.send(true);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                // Called from a callback: the runtime winds down once the
                // callback returns.
                debug!("close called on the I/O thread; not joining");
            } else if worker.join().is_err() {
                warn!("transport I/O thread panicked");
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        info!(endpoint = %self.shared.endpoint, "transport closed");
        if let Some(cb) = &self.shared.callbacks.on_closed {
            cb();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.outbound.lock().state = state;
    }

    /// Peek the front item and mark it in flight.
    fn begin_write(&self) -> Option<Bytes> {
        let mut out = self.outbound.lock();
        if out.in_flight {
            return None;
        }
        let item = out.queue.front().cloned()?;
        out.in_flight = true;
        Some(item)
    }

    /// The front item went out in full.
    fn finish_write(&self) {
        let mut out = self.outbound.lock();
        out.queue.pop_front();
        out.in_flight = false;
    }

    /// The write failed or was cancelled; the item stays at the front.
    fn abort_write(&self) {
        self.outbound.lock().in_flight = false;
    }

    async fn drive(&self, stream: TcpStream) -> io::Error {
        let (reader, writer) = stream.into_split();
        let err = tokio::select! {
            e = self.receive_loop(reader) => e,
            e = self.send_loop(writer) => e,
            _ = self.reset_requested() => io::Error::new(io::ErrorKind::ConnectionReset, "reconnect requested"),
        };
        self.abort_write();
        err
    }

    /// Resolves once a reconnect is pending. A permit left over from an
    /// earlier connection wakes it without ending this one.
    async fn reset_requested(&self) {
        loop {
            if self.outbound.lock().reset_requested {
                return;
            }
            self.reset.notified().await;
        }
    }

    async fn receive_loop(&self, mut reader: OwnedReadHalf) -> io::Error {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    return io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")
                }
                Ok(n) => {
                    if let Some(cb) = &self.callbacks.on_receive {
                        cb(&buf[..n]);
                    }
                }
                Err(e) => return e,
            }
        }
    }

    async fn send_loop(&self, mut writer: OwnedWriteHalf) -> io::Error {
        loop {
            let item = match self.begin_write() {
                Some(item) => item,
                None => {
                    self.writable.notified().await;
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&item).await {
                self.abort_write();
                return e;
            }
            self.finish_write();
        }
    }
}

async fn open_stream(endpoint: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
    let socket = if endpoint.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    let stream = match timeout(connect_timeout, socket.connect(endpoint)).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timeout ({} ms)", connect_timeout.as_millis()),
            ))
        }
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Connect, serve the connection until it fails, reconnect. Runs until the
/// runtime is dropped by [`Transport::close`].
async fn maintain_connection(shared: Arc<Shared>) {
    let initial = shared.options.reconnect_initial;
    let max = shared.options.reconnect_max;
    let mut delay = initial;
    loop {
        shared.set_state(ConnectionState::Connecting);
        match open_stream(shared.endpoint, shared.options.connect_timeout).await {
            Ok(stream) => {
                delay = initial;
                {
                    let mut out = shared.outbound.lock();
                    out.state = ConnectionState::Connected;
                    out.reset_requested = false;
                }
                info!(endpoint = %shared.endpoint, "connected");
                if let Some(cb) = &shared.callbacks.on_connected {
                    cb();
                }
                let err = shared.drive(stream).await;
                shared.set_state(ConnectionState::Disconnected);
                warn!(error = %err, queued = shared.outbound.lock().queue.len(), "connection lost; reconnecting");
            }
            Err(err) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(
                    endpoint = %shared.endpoint,
                    error = %err,
                    retry_ms = delay.as_millis() as u64,
                    "connect failed"
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_millis(timeouts::next_backoff_ms(
                    delay.as_millis() as u64,
                    max.as_millis() as u64,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn local_transport(callbacks: TransportCallbacks, options: TransportOptions) -> Transport {
        Transport::new("127.0.0.1", 9, options, callbacks).unwrap()
    }

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1", 10896).unwrap();
        assert_eq!(addr, "127.0.0.1:10896".parse().unwrap());
    }

    #[test]
    fn test_close_is_idempotent() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let callbacks = TransportCallbacks {
            on_closed: Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let transport = local_transport(callbacks, TransportOptions::default());
        transport.close();
        transport.close();
        drop(transport);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconnect_without_connection_is_noop() {
        let transport = local_transport(TransportCallbacks::default(), TransportOptions::default());
        transport.reconnect();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        transport.close();
        transport.reconnect();
    }

    #[test]
    fn test_send_after_close_fails() {
        let transport = local_transport(TransportCallbacks::default(), TransportOptions::default());
        transport.close();
        assert!(matches!(transport.send(vec![1u8]), Err(TransportError::Closed)));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let options = TransportOptions {
            max_queue: Some(2),
            ..Default::default()
        };
        let transport = local_transport(TransportCallbacks::default(), options);
        transport.send(vec![1u8]).unwrap();
        transport.send(vec![2u8]).unwrap();
        assert!(matches!(transport.send(vec![3u8]), Err(TransportError::QueueFull(2))));
        assert_eq!(transport.queued(), 2);
    }

    #[test]
    fn test_unbounded_by_default() {
        let transport = local_transport(TransportCallbacks::default(), TransportOptions::default());
        for i in 0..1000u32 {
            transport.send(i.to_le_bytes().to_vec()).unwrap();
        }
        assert_eq!(transport.queued(), 1000);
    }
}
