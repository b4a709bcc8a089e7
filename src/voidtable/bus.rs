//! Local IPC message bus.
//!
//! The bus binds a unix-domain socket, accepts one connection per agent, and
//! routes newline-delimited JSON [`Message`]s between them. The first frame a
//! client sends registers it under that frame's `sender` id.
//!
//! Routing rules:
//! - `recipient: Some(id)` — delivered to that client only; a warning is
//!   logged when the recipient is unknown and the frame is dropped.
//! - `recipient: None` — broadcast to every client except the sender, but the
//!   sender is only excluded when it is itself a registered client (the
//!   coordinator sends broadcasts without ever registering).
//! - Local handlers installed with [`MessageBus::add_handler`] observe every
//!   routed message regardless of its recipient. This is how the orchestrator
//!   tracks declarations, resolutions, and narration without being a socket
//!   client.
//!
//! Failure semantics: malformed frames are logged and skipped; a broken
//! client connection deregisters that client and closes its socket; the bus
//! keeps running. There is no retry of failed sends.

use crate::voidtable::message::Message;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors surfaced by bus start/shutdown. Per-client I/O errors never
/// propagate — they are local to the affected connection.
#[derive(Debug)]
pub enum BusError {
    /// The listener could not be bound (bad path, permissions).
    Bind(std::io::Error),
    /// A frame could not be serialized before sending.
    Encode(serde_json::Error),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Bind(e) => write!(f, "failed to bind bus socket: {}", e),
            BusError::Encode(e) => write!(f, "failed to encode message: {}", e),
        }
    }
}

impl Error for BusError {}

/// Callback observing every routed message. Handlers run synchronously on the
/// routing path, so they should only buffer and signal.
pub type BusHandler = Box<dyn Fn(&Message) + Send + Sync>;

struct BusInner {
    clients: Mutex<HashMap<String, OwnedWriteHalf>>,
    handlers: Mutex<HashMap<String, Arc<BusHandler>>>,
    running: std::sync::atomic::AtomicBool,
}

/// The message bus. Cheap to clone; all clones share one routing table.
#[derive(Clone)]
pub struct MessageBus {
    socket_path: PathBuf,
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus for the given socket path, or a fresh temp path when
    /// `socket_path` is `None`.
    pub fn new(socket_path: Option<PathBuf>) -> Self {
        let socket_path = socket_path.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("voidtable_{}.sock", &Uuid::new_v4().simple().to_string()[..8]))
        });
        Self {
            socket_path,
            inner: Arc::new(BusInner {
                clients: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                running: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// The path clients connect to.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Bind the listener (removing any stale socket file first) and start the
    /// accept loop as a background task.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(BusError::Bind)?;
        self.inner
            .running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        info!("message bus started on {}", self.socket_path.display());

        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                if !bus.is_running() {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let bus = bus.clone();
                        tokio::spawn(async move {
                            bus.handle_client(stream).await;
                        });
                    }
                    Err(e) => {
                        if bus.is_running() {
                            error!("bus accept error: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner
            .running
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Per-client connection loop: buffer bytes, split newline frames, parse,
    /// register the client from the first frame's sender, and route.
    async fn handle_client(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut client_id: Option<String> = None;
        let mut write_slot = Some(write_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // connection closed
                Ok(_) => {
                    let frame = line.trim_end();
                    if frame.is_empty() {
                        continue;
                    }
                    let message = match Message::from_wire(frame) {
                        Ok(m) => m,
                        Err(e) => {
                            error!("invalid frame received: {:.100?} - {}", frame, e);
                            continue;
                        }
                    };

                    if client_id.is_none() {
                        let id = message.sender.clone();
                        if let Some(writer) = write_slot.take() {
                            self.inner.clients.lock().await.insert(id.clone(), writer);
                        }
                        info!("client {} connected", id);
                        client_id = Some(id);
                    }

                    self.route(&message).await;
                }
                Err(e) => {
                    error!("client connection error: {}", e);
                    break;
                }
            }
        }

        if let Some(id) = client_id {
            if self.inner.clients.lock().await.remove(&id).is_some() {
                info!("client {} disconnected", id);
            }
        }
    }

    /// Route a message to its recipients and invoke every local handler.
    pub async fn route(&self, message: &Message) {
        match &message.recipient {
            Some(recipient) => {
                let mut clients = self.inner.clients.lock().await;
                if let Some(writer) = clients.get_mut(recipient) {
                    Self::send_frame(writer, message).await;
                } else {
                    warn!(
                        "recipient {} not connected (known: {:?})",
                        recipient,
                        clients.keys().collect::<Vec<_>>()
                    );
                }
            }
            None => {
                let mut clients = self.inner.clients.lock().await;
                let sender_is_client = clients.contains_key(&message.sender);
                for (client_id, writer) in clients.iter_mut() {
                    if sender_is_client && client_id == &message.sender {
                        continue;
                    }
                    Self::send_frame(writer, message).await;
                }
            }
        }

        let handlers: Vec<Arc<BusHandler>> = {
            let guard = self.inner.handlers.lock().await;
            guard.values().cloned().collect()
        };
        for handler in handlers {
            handler(message);
        }
    }

    async fn send_frame(writer: &mut OwnedWriteHalf, message: &Message) {
        match message.to_wire() {
            Ok(line) => {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("error sending message: {}", e);
                }
            }
            Err(e) => error!("error encoding message: {}", e),
        }
    }

    /// Install a named local handler observing all routed messages.
    pub async fn add_handler(&self, handler_id: &str, handler: BusHandler) {
        self.inner
            .handlers
            .lock()
            .await
            .insert(handler_id.to_string(), Arc::new(handler));
    }

    /// Remove a previously installed handler.
    pub async fn remove_handler(&self, handler_id: &str) {
        self.inner.handlers.lock().await.remove(handler_id);
    }

    /// Number of currently registered clients.
    pub async fn client_count(&self) -> usize {
        self.inner.clients.lock().await.len()
    }

    /// Close every client socket, stop accepting, and unlink the socket file.
    pub async fn shutdown(&self) {
        self.inner
            .running
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let mut clients = self.inner.clients.lock().await;
        for (id, writer) in clients.iter_mut() {
            debug!("closing client {}", id);
            let _ = writer.shutdown().await;
        }
        clients.clear();
        drop(clients);

        // Connecting to our own socket wakes the accept loop so it observes
        // the cleared running flag.
        let _ = UnixStream::connect(&self.socket_path).await;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        info!("message bus shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voidtable::message::MessageType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_local_handlers_observe_routed_messages() {
        let bus = MessageBus::new(None);
        bus.start().await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.add_handler(
            "counter",
            Box::new(move |m| {
                if m.message_type == MessageType::Ping {
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .await;

        let ping = Message::new(MessageType::Ping, "coordinator", None, json!({}));
        bus.route(&ping).await;
        bus.route(&ping).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        bus.remove_handler("counter").await;
        bus.route(&ping).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_registration_and_direct_delivery() {
        let bus = MessageBus::new(None);
        bus.start().await.unwrap();

        // Connect a raw client and register it by sending a first frame.
        let stream = UnixStream::connect(bus.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let register = Message::new(
            MessageType::AgentRegister,
            "player_01",
            None,
            json!({"agent_type": "player"}),
        );
        write_half
            .write_all(register.to_wire().unwrap().as_bytes())
            .await
            .unwrap();

        // Give the accept/handle tasks a moment to register the client.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bus.client_count().await, 1);

        // Direct message should arrive at the client.
        let direct = Message::new(
            MessageType::TurnRequest,
            "coordinator",
            Some("player_01".into()),
            json!({"phase": "declaration"}),
        );
        bus.route(&direct).await;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let received = Message::from_wire(line.trim_end()).unwrap();
        assert_eq!(received.message_type, MessageType::TurnRequest);
        assert_eq!(received.payload_str("phase"), Some("declaration"));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_excludes_registered_sender() {
        let bus = MessageBus::new(None);
        bus.start().await.unwrap();

        // Two clients.
        let mut halves = Vec::new();
        let mut write_halves = Vec::new();
        for id in ["player_01", "player_02"] {
            let stream = UnixStream::connect(bus.socket_path()).await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let register = Message::new(MessageType::AgentRegister, id, None, json!({}));
            write_half
                .write_all(register.to_wire().unwrap().as_bytes())
                .await
                .unwrap();
            halves.push((id, BufReader::new(read_half)));
            write_halves.push(write_half);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bus.client_count().await, 2);

        // Broadcast from player_01: only player_02 should receive it.
        let broadcast = Message::new(
            MessageType::ActionDeclared,
            "player_01",
            None,
            json!({"intent": "hold position"}),
        );
        bus.route(&broadcast).await;

        let (_, reader_02) = halves
            .iter_mut()
            .find(|(id, _)| *id == "player_02")
            .unwrap();
        let mut line = String::new();
        reader_02.read_line(&mut line).await.unwrap();
        let received = Message::from_wire(line.trim_end()).unwrap();
        assert_eq!(received.sender, "player_01");

        bus.shutdown().await;
    }
}
