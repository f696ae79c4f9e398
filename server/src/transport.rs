//! WebSocket transport: accept loop, per-connection tasks and fan-out

use crate::connection_manager::{CloseSignal, ConnectionManager};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub type ConnectionId = u32;

/// Outbound side of the transport as seen by command handlers.
///
/// Delivery failures are logged and swallowed; a dead connection never
/// turns into an error for the caller.
pub trait Outbox: Send + Sync {
    /// Queues `text` for one connection. Returns false if it is gone.
    fn send(&self, connection: ConnectionId, text: String) -> bool;

    /// Queues `text` for every live connection and returns how many
    /// accepted it.
    fn broadcast(&self, text: String) -> usize;

    fn connection_count(&self) -> usize;

    /// Closes and forgets every connection. Returns how many were open.
    fn close_all(&self) -> usize;
}

/// Receives inbound traffic from the transport.
///
/// Frames from one connection are delivered one at a time: the future
/// returned by `on_message` is awaited before the next frame of that
/// connection is read.
pub trait MessageHandler: Send + Sync + 'static {
    /// First message for a new connection. It is queued before the
    /// connection becomes reachable, so no broadcast can overtake it.
    fn greeting(&self) -> Option<String> {
        None
    }

    fn on_connect(&self, _connection: ConnectionId) {}

    fn on_message(&self, connection: ConnectionId, text: String) -> BoxFuture<'static, ()>;

    fn on_disconnect(&self, _connection: ConnectionId) {}
}

/// Shared handle onto the live connection set.
#[derive(Clone)]
pub struct ConnectionHub {
    connections: Arc<RwLock<ConnectionManager>>,
}

impl ConnectionHub {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(ConnectionManager::new(max_connections))),
        }
    }

    /// Closes connections that have been silent for longer than `timeout`.
    ///
    /// Each reaped connection's reader is told to send an "Idle timeout"
    /// close frame and stop, whether or not the peer ever answers it.
    pub fn close_idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let idle = self.write().check_idle(timeout);
        idle.into_iter()
            .map(|(id, closer)| {
                signal_close(id, closer, CloseCode::Normal, "Idle timeout");
                id
            })
            .collect()
    }

    fn register(
        &self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<(ConnectionId, oneshot::Receiver<CloseFrame<'static>>)> {
        self.write().add_connection(addr, sender)
    }

    fn unregister(&self, connection: ConnectionId) -> bool {
        self.write().remove_connection(connection)
    }

    fn touch(&self, connection: ConnectionId) {
        self.write().touch(connection);
    }

    fn read(&self) -> RwLockReadGuard<'_, ConnectionManager> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConnectionManager> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Outbox for ConnectionHub {
    fn send(&self, connection: ConnectionId, text: String) -> bool {
        let Some(sender) = self.read().sender(connection) else {
            debug!("Dropping message for closed connection {}", connection);
            return false;
        };
        if sender.send(Message::Text(text)).is_err() {
            debug!("Connection {} closed before delivery", connection);
            return false;
        }
        true
    }

    fn broadcast(&self, text: String) -> usize {
        let senders = self.read().senders();
        senders
            .into_iter()
            .filter(|(id, sender)| {
                let delivered = sender.send(Message::Text(text.clone())).is_ok();
                if !delivered {
                    debug!("Broadcast skipped closed connection {}", id);
                }
                delivered
            })
            .count()
    }

    fn connection_count(&self) -> usize {
        self.read().len()
    }

    fn close_all(&self) -> usize {
        let drained = self.write().drain();
        let count = drained.len();
        for (id, closer) in drained {
            signal_close(id, closer, CloseCode::Away, "Server shutting down");
        }
        count
    }
}

fn signal_close(id: ConnectionId, closer: CloseSignal, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if closer.send(frame).is_err() {
        debug!("Connection {} already closed", id);
    }
}

/// Accepts WebSocket connections and feeds their frames to a handler.
pub struct NetworkServer {
    listener: TcpListener,
    hub: ConnectionHub,
    idle_timeout: Option<Duration>,
}

impl NetworkServer {
    pub async fn bind(addr: &str, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on ws://{}", listener.local_addr()?);

        Ok(Self {
            listener,
            hub: ConnectionHub::new(max_connections),
            idle_timeout: None,
        })
    }

    /// Connections silent for longer than `timeout` get closed.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> ConnectionHub {
        self.hub.clone()
    }

    /// Accepts connections until `shutdown` flips to true (or its sender is
    /// dropped).
    pub async fn run(self, handler: Arc<dyn MessageHandler>, mut shutdown: watch::Receiver<bool>) {
        if let Some(timeout) = self.idle_timeout {
            self.spawn_idle_checker(timeout, shutdown.clone());
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            self.hub.clone(),
                            Arc::clone(&handler),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if shutdown_requested(&shutdown) {
                        break;
                    }
                }
            }
        }

        info!("Stopped accepting connections");
    }

    fn spawn_idle_checker(&self, timeout: Duration, mut shutdown: watch::Receiver<bool>) {
        let hub = self.hub.clone();

        tokio::spawn(async move {
            let mut ticks = interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        for id in hub.close_idle(timeout) {
                            info!("Closed idle connection {}", id);
                        }
                    }
                    _ = shutdown.changed() => {
                        if shutdown_requested(&shutdown) {
                            break;
                        }
                    }
                }
            }
        });
    }
}

/// True once shutdown was signalled or the signalling side went away.
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: ConnectionHub,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(greeting) = handler.greeting() {
        let _ = tx.send(Message::Text(greeting));
    }
    let outbound = tx.clone();

    let Some((id, mut closed)) = hub.register(addr, tx) else {
        warn!("Rejecting {}: server full", addr);
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: "Server full".into(),
        };
        let _ = ws_sender.send(Message::Close(Some(frame))).await;
        return;
    };

    // Writer: drains the queue in FIFO order until every sender is gone or
    // a close frame went out.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_sender.send(message).await {
                debug!("Write to connection {} failed: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    handler.on_connect(id);

    loop {
        if shutdown_requested(&shutdown) {
            let frame = CloseFrame {
                code: CloseCode::Away,
                reason: "Server shutting down".into(),
            };
            let _ = outbound.send(Message::Close(Some(frame)));
            break;
        }

        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            closing = &mut closed => {
                if let Ok(frame) = closing {
                    let _ = outbound.send(Message::Close(Some(frame)));
                }
                break;
            }
            _ = shutdown.changed() => continue,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                hub.touch(id);
                handler.on_message(id, text).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                hub.touch(id);
                match String::from_utf8(bytes) {
                    Ok(text) => handler.on_message(id, text).await,
                    Err(_) => {
                        warn!("Connection {} sent a non-UTF-8 binary frame", id);
                        let reply = shared::Response::error(
                            serde_json::Value::String(shared::generate_message_id()),
                            "Binary frames must contain UTF-8 JSON",
                        );
                        if let Ok(text) = reply.to_json() {
                            hub.send(id, text);
                        }
                    }
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => hub.touch(id),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                warn!("Connection {} read error: {}", id, e);
                break;
            }
        }
    }

    hub.unregister(id);
    handler.on_disconnect(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::connect_async;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    const GREETING: &str = "hello";

    /// Greets every connection, then echoes each frame back after sleeping
    /// for the number of milliseconds the frame contains.
    struct DelayedEcho {
        hub: ConnectionHub,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl MessageHandler for DelayedEcho {
        fn greeting(&self) -> Option<String> {
            Some(GREETING.to_string())
        }

        fn on_connect(&self, _connection: ConnectionId) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, connection: ConnectionId, text: String) -> BoxFuture<'static, ()> {
            let hub = self.hub.clone();
            Box::pin(async move {
                let delay = text.trim().parse::<u64>().unwrap_or(0);
                sleep(Duration::from_millis(delay)).await;
                hub.send(connection, text);
            })
        }

        fn on_disconnect(&self, _connection: ConnectionId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        addr: SocketAddr,
        hub: ConnectionHub,
        handler: Arc<DelayedEcho>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start_server(max_connections: usize) -> Harness {
        start_server_with_idle(max_connections, None).await
    }

    async fn start_server_with_idle(max_connections: usize, idle: Option<Duration>) -> Harness {
        let server = NetworkServer::bind("127.0.0.1:0", max_connections)
            .await
            .unwrap()
            .with_idle_timeout(idle);
        let addr = server.local_addr().unwrap();
        let hub = server.hub();
        let handler = Arc::new(DelayedEcho {
            hub: hub.clone(),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(handler.clone(), shutdown_rx));

        Harness {
            addr,
            hub,
            handler,
            shutdown,
            task,
        }
    }

    async fn connect_raw(addr: SocketAddr) -> Client {
        let (socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        socket
    }

    /// Connects and consumes the greeting.
    async fn connect(addr: SocketAddr) -> Client {
        let mut socket = connect_raw(addr).await;
        assert_eq!(next_text(&mut socket).await, GREETING);
        socket
    }

    async fn wait_for_count(hub: &ConnectionHub, expected: usize) {
        for _ in 0..200 {
            if hub.connection_count() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} connections, have {}",
            expected,
            hub.connection_count()
        );
    }

    async fn wait_for_disconnects(handler: &DelayedEcho, expected: usize) {
        for _ in 0..300 {
            if handler.disconnects.load(Ordering::SeqCst) == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} disconnects, saw {}",
            expected,
            handler.disconnects.load(Ordering::SeqCst)
        );
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            if let Message::Text(text) = next_message(client).await {
                return text;
            }
        }
    }

    async fn next_message(client: &mut Client) -> Message {
        timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error")
    }

    /// Tests that replies leave in request order even when earlier requests
    /// take longer to handle
    #[tokio::test]
    async fn test_frames_from_one_connection_stay_ordered() {
        let harness = start_server(4).await;
        let mut client = connect(harness.addr).await;

        for frame in ["150", "0", "60", "5"] {
            client.send(Message::Text(frame.into())).await.unwrap();
        }

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(next_text(&mut client).await);
        }
        assert_eq!(replies, vec!["150", "0", "60", "5"]);
    }

    /// Tests broadcast fan-out before and after one client leaves
    #[tokio::test]
    async fn test_broadcast_reaches_every_live_connection() {
        let harness = start_server(8).await;
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(harness.addr).await);
        }
        wait_for_count(&harness.hub, 3).await;

        assert_eq!(harness.hub.broadcast("status".into()), 3);
        for client in clients.iter_mut() {
            assert_eq!(next_text(client).await, "status");
        }

        let mut closed = clients.pop().unwrap();
        closed.close(None).await.unwrap();
        wait_for_count(&harness.hub, 2).await;

        assert_eq!(harness.hub.broadcast("again".into()), 2);
        for client in clients.iter_mut() {
            assert_eq!(next_text(client).await, "again");
        }
        assert_eq!(harness.handler.disconnects.load(Ordering::SeqCst), 1);
    }

    /// Tests that the greeting is always the first frame a client sees,
    /// even while broadcasts are flowing
    #[tokio::test]
    async fn test_greeting_precedes_broadcasts() {
        let harness = start_server(16).await;
        let hub = harness.hub.clone();
        let noise = tokio::spawn(async move {
            loop {
                hub.broadcast("noise".into());
                tokio::task::yield_now().await;
            }
        });

        for _ in 0..10 {
            let mut client = connect_raw(harness.addr).await;
            assert_eq!(next_text(&mut client).await, GREETING);
        }
        noise.abort();
    }

    /// Tests that sending to a departed connection is a silent no-op
    #[tokio::test]
    async fn test_send_to_closed_connection_is_silent() {
        let harness = start_server(2).await;
        let mut client = connect(harness.addr).await;
        wait_for_count(&harness.hub, 1).await;

        client.close(None).await.unwrap();
        wait_for_count(&harness.hub, 0).await;

        assert!(!harness.hub.send(1, "late".into()));
        assert_eq!(harness.hub.broadcast("nobody".into()), 0);
    }

    /// Tests that a connection over the limit gets "Server full" and no
    /// greeting
    #[tokio::test]
    async fn test_connections_over_capacity_are_refused() {
        let harness = start_server(1).await;
        let _first = connect(harness.addr).await;
        wait_for_count(&harness.hub, 1).await;

        let mut second = connect_raw(harness.addr).await;
        match next_message(&mut second).await {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Again);
                assert_eq!(frame.reason, "Server full");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(harness.hub.connection_count(), 1);
        assert_eq!(harness.handler.connects.load(Ordering::SeqCst), 1);
    }

    /// Tests that close_all sends a going-away frame and ends the reader
    #[tokio::test]
    async fn test_close_all_disconnects_clients() {
        let harness = start_server(4).await;
        let mut client = connect(harness.addr).await;
        wait_for_count(&harness.hub, 1).await;

        assert_eq!(harness.hub.close_all(), 1);
        let message = next_message(&mut client).await;
        assert!(matches!(message, Message::Close(Some(frame)) if frame.code == CloseCode::Away));
        assert_eq!(harness.hub.connection_count(), 0);
        wait_for_disconnects(&harness.handler, 1).await;
    }

    /// Tests that an idle client receives an "Idle timeout" close frame
    #[tokio::test]
    async fn test_idle_connections_are_closed() {
        let harness = start_server_with_idle(4, Some(Duration::from_millis(300))).await;

        let mut client = connect(harness.addr).await;
        wait_for_count(&harness.hub, 1).await;

        let message = next_message(&mut client).await;
        assert!(matches!(message, Message::Close(Some(frame)) if frame.reason == "Idle timeout"));
        assert_eq!(harness.hub.connection_count(), 0);
    }

    /// Tests that a peer which never reads or answers the close handshake
    /// is still disconnected once it goes idle
    #[tokio::test]
    async fn test_silent_peer_is_released_after_idle_timeout() {
        let harness = start_server_with_idle(4, Some(Duration::from_millis(300))).await;

        let _silent = connect_raw(harness.addr).await;
        wait_for_count(&harness.hub, 1).await;

        wait_for_disconnects(&harness.handler, 1).await;
        assert_eq!(harness.hub.connection_count(), 0);
        assert_eq!(harness.handler.connects.load(Ordering::SeqCst), 1);
    }

    /// Tests that flipping the shutdown flag stops the accept loop and
    /// sends live connections a going-away frame
    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let harness = start_server(4).await;
        let mut client = connect(harness.addr).await;
        wait_for_count(&harness.hub, 1).await;

        harness.shutdown.send(true).unwrap();
        timeout(Duration::from_secs(5), harness.task)
            .await
            .unwrap()
            .unwrap();

        let message = next_message(&mut client).await;
        assert!(matches!(message, Message::Close(Some(frame)) if frame.code == CloseCode::Away));
        wait_for_disconnects(&harness.handler, 1).await;
        assert!(connect_async(format!("ws://{}", harness.addr)).await.is_err());
    }
}
