//! TCP protocol server feeding the raw channel.
//!
//! Every accepted switch gets an id from the [`ConnectionPool`], a reader task
//! that turns each read into a `kyco/core.raw.data` event and a writer task
//! draining the bytes outbound listeners queue through the pool.

use crate::config::ServerConfig;
use crate::error::ControllerError;
use kyco_event_system::{
    core_events, ChannelError, ConnectionError, ConnectionHandle, ConnectionId, ConnectionPool, Event, EventError,
    Producer,
};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// How long a closing connection may spend flushing queued outbound bytes.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Payload of connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub peer: String,
}

pub struct ProtocolServer {
    config: ServerConfig,
    raw: Producer,
    connections: Arc<ConnectionPool>,
    shutdown_sender: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ProtocolServer {
    pub fn new(config: ServerConfig, raw: Producer, connections: Arc<ConnectionPool>, parent: &Span) -> Self {
        let (shutdown_sender, _) = watch::channel(false);

        Self {
            config,
            raw,
            connections,
            shutdown_sender,
            local_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
            span: info_span!(parent: parent, "protocol_server"),
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address, which differs from the configured one when port 0 was asked.
    pub async fn start(&self) -> Result<SocketAddr, ControllerError> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() || self.local_addr.get().is_some() {
            return Err(ControllerError::Network("protocol server already started".to_string()));
        }

        let listener = bind_listener(self.config.bind_address)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ControllerError::Network(format!("Failed to read local address: {e}")))?;
        let _ = self.local_addr.set(local_addr);

        info!(parent: &self.span, "Listening for switches on {}", local_addr);

        let acceptor = Acceptor {
            listener,
            config: self.config.clone(),
            raw: self.raw.clone(),
            connections: self.connections.clone(),
            shutdown_sender: self.shutdown_sender.clone(),
        };
        let shutdown = self.shutdown_sender.subscribe();
        *accept_task = Some(tokio::spawn(acceptor.run(shutdown).instrument(self.span.clone())));

        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Queues bytes for the connection's writer.
    pub fn send(&self, id: ConnectionId, data: Vec<u8>) -> Result<(), ConnectionError> {
        self.connections.send(id, data)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stops accepting, closes every connection and waits for the accept loop.
    ///
    /// The shutdown flag stays set, so a connection accepted concurrently
    /// with this call still observes it when it subscribes.
    pub async fn stop(&self) {
        self.shutdown_sender.send_replace(true);

        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(parent: &self.span, "Accept loop ended abnormally: {}", e);
            }
        }

        let closed = self.connections.close_all();
        info!(parent: &self.span, remaining_closed = closed, "Protocol server stopped");
    }
}

fn bind_listener(address: SocketAddr) -> Result<TcpListener, ControllerError> {
    let bind_error = |source: std::io::Error| ControllerError::Bind { address, source };

    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&address.into()).map_err(bind_error)?;
    socket.listen(1024).map_err(bind_error)?;

    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true).map_err(bind_error)?;

    TcpListener::from_std(std_listener)
        .map_err(|e| ControllerError::Network(format!("Tokio listener creation failed: {e}")))
}

struct Acceptor {
    listener: TcpListener,
    config: ServerConfig,
    raw: Producer,
    connections: Arc<ConnectionPool>,
    shutdown_sender: watch::Sender<bool>,
}

impl Acceptor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut connection_tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    debug!("Shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.connections.len() >= self.config.max_connections {
                            warn!(peer = %peer, "Connection limit of {} reached, rejecting", self.config.max_connections);
                            drop(stream);
                            continue;
                        }

                        let connection = SwitchConnection {
                            id: self.connections.next_id(),
                            peer,
                            raw: self.raw.clone(),
                            connections: self.connections.clone(),
                            read_buffer_size: self.config.read_buffer_size.max(1),
                        };
                        let span = info_span!("connection", id = connection.id, peer = %peer);
                        connection_tasks.spawn(connection.run(stream, self.shutdown_sender.subscribe()).instrument(span));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(finished) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        while let Some(finished) = connection_tasks.join_next().await {
            if let Err(e) = finished {
                error!("Connection task failed: {}", e);
            }
        }
    }
}

struct SwitchConnection {
    id: ConnectionId,
    peer: SocketAddr,
    raw: Producer,
    connections: Arc<ConnectionPool>,
    read_buffer_size: usize,
}

impl SwitchConnection {
    async fn run(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let (sender, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
        self.connections.insert(ConnectionHandle::new(self.id, self.peer, sender));
        self.emit_lifecycle(core_events::CONNECTION_NEW).await;
        info!("Switch connected");

        let (mut reader, mut writer) = stream.into_split();
        let mut writer_task = tokio::spawn(async move {
            while let Some(data) = outbound.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }.in_current_span());

        let mut buffer = vec![0u8; self.read_buffer_size];
        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let event = Event::bytes(core_events::RAW_DATA, buffer[..n].to_vec()).with_connection(self.id);
                        if let Err(e) = put_raw(&self.raw, event).await {
                            warn!("Dropped {} bytes of raw data: {}", n, e);
                        }
                    }
                    Err(e) => {
                        debug!("Read failed: {}", e);
                        break;
                    }
                }
            }
        }

        // Dropping the pool entry closes the writer once queued bytes are flushed.
        self.connections.remove(self.id);
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
            writer_task.abort();
        }

        self.emit_lifecycle(core_events::CONNECTION_LOST).await;
        info!("Switch disconnected");
    }

    async fn emit_lifecycle(&self, event_type: &str) {
        let info = ConnectionInfo {
            peer: self.peer.to_string(),
        };
        let result = match Event::from_serializable(event_type, &info) {
            Ok(event) => put_raw(&self.raw, event.with_connection(self.id)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to emit {}: {}", event_type, e);
        }
    }
}

/// Resolves once the shutdown flag is set, including when it was set before
/// this receiver was created.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Enqueues onto the raw channel without stalling a runtime worker.
///
/// The fast path never blocks. When a bounded raw channel is full, the
/// blocking put (bounded by the channel's put timeout) runs on the blocking
/// pool; awaiting it keeps per-connection order intact.
async fn put_raw(raw: &Producer, event: Event) -> Result<(), EventError> {
    if !raw.is_bounded() {
        return raw.put(event).map_err(Into::into);
    }

    match raw.try_put(event.clone()) {
        Ok(()) => Ok(()),
        Err(ChannelError::Full(_)) => {
            let raw = raw.clone();
            tokio::task::spawn_blocking(move || raw.put(event))
                .await
                .map_err(|e| EventError::ListenerExecution(format!("raw enqueue task failed: {e}")))?
                .map_err(Into::into)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kyco_event_system::{ChannelKind, ChannelSet, Envelope};

    fn next_raw(channels: &ChannelSet) -> Event {
        match channels.channel(ChannelKind::Raw).get() {
            Envelope::Event(event) => event,
            Envelope::Stop => panic!("unexpected stop"),
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".parse().expect("addr"),
            max_connections: 8,
            read_buffer_size: 1024,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connection_lifecycle_events() {
        let channels = Arc::new(ChannelSet::unbounded());
        let pool = Arc::new(ConnectionPool::new());
        let server = ProtocolServer::new(test_config(), channels.producer(ChannelKind::Raw), pool.clone(), &Span::none());
        let addr = server.start().await.expect("server starts");

        let mut client = TcpStream::connect(addr).await.expect("connect");
        client.write_all(b"hello").await.expect("write");

        let worker = channels.clone();
        let (new, data) = tokio::task::spawn_blocking(move || (next_raw(&worker), next_raw(&worker)))
            .await
            .expect("blocking reader");

        assert_eq!(new.event_type(), core_events::CONNECTION_NEW);
        let id = new.connection().expect("connection id");
        assert_eq!(data.event_type(), core_events::RAW_DATA);
        assert_eq!(data.connection(), Some(id));
        assert_eq!(data.as_bytes(), Some(&b"hello"[..]));

        server.send(id, b"world".to_vec()).expect("send to switch");
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.expect("read reply");
        assert_eq!(&reply, b"world");

        drop(client);
        let worker = channels.clone();
        let lost = tokio::task::spawn_blocking(move || next_raw(&worker)).await.expect("blocking reader");
        assert_eq!(lost.event_type(), core_events::CONNECTION_LOST);
        assert_eq!(lost.connection(), Some(id));

        server.stop().await;
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_closes_open_connections() {
        let channels = Arc::new(ChannelSet::unbounded());
        let pool = Arc::new(ConnectionPool::new());
        let server = ProtocolServer::new(test_config(), channels.producer(ChannelKind::Raw), pool.clone(), &Span::none());
        let addr = server.start().await.expect("server starts");

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let worker = channels.clone();
        tokio::task::spawn_blocking(move || next_raw(&worker)).await.expect("connection event");

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop completes");

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("peer closed");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(pool.is_empty());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let channels = ChannelSet::unbounded();
        let server = ProtocolServer::new(
            test_config(),
            channels.producer(ChannelKind::Raw),
            Arc::new(ConnectionPool::new()),
            &Span::none(),
        );

        server.start().await.expect("first start");
        assert!(server.start().await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_visible_to_late_subscribers() {
        let (sender, _) = watch::channel(false);
        sender.send_replace(true);

        let mut late = sender.subscribe();
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut late))
            .await
            .expect("flag set before subscribing is observed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_completes_while_switches_keep_connecting() {
        let channels = Arc::new(ChannelSet::unbounded());
        let pool = Arc::new(ConnectionPool::new());
        let server = ProtocolServer::new(test_config(), channels.producer(ChannelKind::Raw), pool.clone(), &Span::none());
        let addr = server.start().await.expect("server starts");

        // Clients never hang up on their own; only the server can end them.
        let connector = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..200 {
                match TcpStream::connect(addr).await {
                    Ok(stream) => held.push(stream),
                    Err(_) => break,
                }
                tokio::task::yield_now().await;
            }
            held
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop is not held up by connections accepted during shutdown");
        assert!(pool.is_empty());

        let held = connector.await.expect("connector task");
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_raw_waits_off_runtime_for_room() {
        let config = kyco_event_system::ChannelConfig {
            capacity: Some(1),
            put_timeout: Duration::from_secs(5),
        };
        let channels = Arc::new(ChannelSet::new(&config));
        let raw = channels.producer(ChannelKind::Raw);
        put_raw(&raw, Event::signal("first")).await.expect("room for one");

        let consumer = channels.clone();
        let drained = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(50));
            next_raw(&consumer)
        });

        put_raw(&raw, Event::signal("second"))
            .await
            .expect("queued once the consumer made room");
        assert_eq!(drained.await.expect("consumer").event_type(), "first");
        assert_eq!(next_raw(&channels).event_type(), "second");
    }

    #[tokio::test]
    async fn test_put_raw_reports_full_after_timeout() {
        let config = kyco_event_system::ChannelConfig {
            capacity: Some(1),
            put_timeout: Duration::from_millis(20),
        };
        let channels = ChannelSet::new(&config);
        let raw = channels.producer(ChannelKind::Raw);
        put_raw(&raw, Event::signal("first")).await.expect("room for one");

        let result = put_raw(&raw, Event::signal("second")).await;
        assert!(matches!(
            result,
            Err(EventError::Channel(ChannelError::Full(ChannelKind::Raw)))
        ));
    }
}
