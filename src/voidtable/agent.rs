//! Agent runtime: the base lifecycle shared by every participant.
//!
//! Each agent owns its own client connection to the bus ([`BusLink`]) and a
//! message loop driven by [`run_agent`]. Concrete agents (Director, players,
//! the human takeover interface) implement [`AgentRuntime`] and receive
//! messages through `handle_message`; two defaults are supplied by the
//! runner:
//!
//! - `Ping` is answered with `Pong` without reaching the agent.
//! - `Shutdown` invokes `on_shutdown` and stops the loop.
//!
//! Any message type the agent does not care about is silently dropped — it
//! may be destined for a coordinator-side handler in the same process.

use crate::voidtable::message::{Message, MessageType};
use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::{json, Value};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

/// Role tag carried in registration payloads and combat bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Dm,
    Player,
    Enemy,
    Coordinator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Dm => "dm",
            AgentRole::Player => "player",
            AgentRole::Enemy => "enemy",
            AgentRole::Coordinator => "coordinator",
        }
    }
}

/// An agent's client connection to the bus.
///
/// Cloneable; the write half is shared behind a mutex so an agent can send
/// from within its handler while the runner owns the read loop.
#[derive(Clone)]
pub struct BusLink {
    agent_id: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl BusLink {
    /// Connect to the bus socket and immediately send the registration frame
    /// so the bus learns this client's id.
    pub async fn connect(
        agent_id: &str,
        role: AgentRole,
        socket_path: &Path,
    ) -> Result<(Self, OwnedReadHalf), Box<dyn Error + Send + Sync>> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        let link = Self {
            agent_id: agent_id.to_string(),
            writer: Arc::new(Mutex::new(write_half)),
        };

        link.send(
            MessageType::AgentRegister,
            None,
            json!({"agent_type": role.as_str()}),
        )
        .await?;
        info!("agent {} connected to message bus", agent_id);
        Ok((link, read_half))
    }

    /// The id this link registered under.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Send a typed message. `recipient: None` broadcasts.
    pub async fn send(
        &self,
        message_type: MessageType,
        recipient: Option<String>,
        payload: Value,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let message = Message::new(message_type, self.agent_id.clone(), recipient, payload);
        self.send_message(&message).await
    }

    /// Send an already constructed message.
    pub async fn send_message(
        &self,
        message: &Message,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let line = message.to_wire()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Lifecycle surface implemented by every agent.
#[async_trait]
pub trait AgentRuntime: Send {
    /// Stable identifier (`dm_01`, `player_01`, `enemy_<hex>`).
    fn agent_id(&self) -> &str;

    /// Called once after the link is established, before the message loop.
    async fn on_start(&mut self, link: &BusLink) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called when a Shutdown frame arrives or the loop ends.
    async fn on_shutdown(&mut self);

    /// Dispatch for every non-default message.
    async fn handle_message(
        &mut self,
        message: Message,
        link: &BusLink,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Connect the agent to the bus and drive its message loop until shutdown.
///
/// Returns a join handle for the loop task plus the link, so the caller can
/// keep sending to the agent and await its termination.
pub async fn run_agent<A>(
    mut agent: A,
    role: AgentRole,
    socket_path: &Path,
) -> Result<(BusLink, tokio::task::JoinHandle<()>), Box<dyn Error + Send + Sync>>
where
    A: AgentRuntime + 'static,
{
    let (link, read_half) = BusLink::connect(agent.agent_id(), role, socket_path).await?;
    agent.on_start(&link).await?;

    let loop_link = link.clone();
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let frame = line.trim_end();
                    if frame.is_empty() {
                        continue;
                    }
                    let message = match Message::from_wire(frame) {
                        Ok(m) => m,
                        Err(e) => {
                            error!(
                                "agent {} received invalid frame: {}",
                                loop_link.agent_id(),
                                e
                            );
                            continue;
                        }
                    };

                    match message.message_type {
                        MessageType::Ping => {
                            let _ = loop_link
                                .send(
                                    MessageType::Pong,
                                    Some(message.sender.clone()),
                                    json!({"timestamp": chrono::Utc::now().to_rfc3339()}),
                                )
                                .await;
                        }
                        MessageType::Shutdown => {
                            info!("agent {} shutting down", loop_link.agent_id());
                            agent.on_shutdown().await;
                            break;
                        }
                        _ => {
                            if let Err(e) = agent.handle_message(message, &loop_link).await {
                                error!("agent {} handler error: {}", loop_link.agent_id(), e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("agent {} message loop error: {}", loop_link.agent_id(), e);
                    break;
                }
            }
        }
        debug!("agent {} message loop ended", loop_link.agent_id());
    });

    Ok((link, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voidtable::bus::MessageBus;

    struct EchoAgent {
        id: String,
        received: Arc<Mutex<Vec<MessageType>>>,
    }

    #[async_trait]
    impl AgentRuntime for EchoAgent {
        fn agent_id(&self) -> &str {
            &self.id
        }

        async fn on_start(
            &mut self,
            link: &BusLink,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            link.send(MessageType::AgentReady, None, json!({"agent_type": "player"}))
                .await
        }

        async fn on_shutdown(&mut self) {}

        async fn handle_message(
            &mut self,
            message: Message,
            _link: &BusLink,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.received.lock().await.push(message.message_type);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_agent_answers_ping_and_stops_on_shutdown() {
        let bus = MessageBus::new(None);
        bus.start().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let agent = EchoAgent {
            id: "player_01".into(),
            received: received.clone(),
        };
        let (_link, handle) = run_agent(agent, AgentRole::Player, bus.socket_path())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Ping is answered by the runner, not the agent handler.
        let ping = Message::new(MessageType::Ping, "coordinator", Some("player_01".into()), json!({}));
        bus.route(&ping).await;

        // A turn request reaches the handler.
        let turn = Message::new(
            MessageType::TurnRequest,
            "coordinator",
            Some("player_01".into()),
            json!({"phase": "declaration"}),
        );
        bus.route(&turn).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*received.lock().await, vec![MessageType::TurnRequest]);

        // Shutdown terminates the loop.
        let shutdown = Message::new(MessageType::Shutdown, "coordinator", None, json!({}));
        bus.route(&shutdown).await;
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("agent loop should stop on shutdown")
            .unwrap();

        bus.shutdown().await;
    }
}
