use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_types::now_ms;
use relay_wire::{AgentMessage, ControllerToAgentMessage};

use crate::AppState;

/// Time a fresh `/ws/agent` connection gets to send `agent_hello` before it
/// is dropped (spec.md §6.3).
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Adapts a connection's outbound mpsc sender to `relay_core::AgentLink`,
/// the seam the dispatcher pushes `ControllerToAgentMessage`s through.
struct WsAgentLink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl relay_core::AgentLink for WsAgentLink {
    async fn send(&self, message: ControllerToAgentMessage) -> Result<(), relay_core::AgentLinkError> {
        let payload = serde_json::to_string(&message).unwrap_or_default();
        self.tx
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| relay_core::AgentLinkError::Closed)
    }
}

/// Serves one `/ws/agent` connection end to end: waits for `agent_hello`,
/// registers the agent and its link, then relays `AgentMessage`s to the
/// dispatcher/registry until the socket closes or a reconnect supersedes it
/// (spec.md §8).
pub async fn handle(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, next_hello(&mut stream)).await {
        Ok(Some(hello)) => hello,
        Ok(None) => return,
        Err(_) => {
            tracing::warn!("agent connection closed: no agent_hello within timeout");
            return;
        }
    };

    let agent_id = hello.id.clone();
    let token = CancellationToken::new();
    let generation = state.supersede_agent_connection(&agent_id, token.clone()).await;

    state.orchestrator.registry.register(hello, now_ms()).await;

    let (tx, mut rx) = mpsc::channel::<Message>(256);
    state
        .orchestrator
        .dispatcher
        .register_link(agent_id.clone(), std::sync::Arc::new(WsAgentLink { tx: tx.clone() }))
        .await;

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(agent_id, "agent connection superseded by a newer one");
                break;
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AgentMessage>(&text) {
                            Ok(AgentMessage::Heartbeat { telemetry }) => {
                                let _ = state.orchestrator.registry.heartbeat(&agent_id, telemetry, now_ms()).await;
                            }
                            Ok(other) => state.orchestrator.dispatcher.on_agent_message(other).await,
                            Err(err) => tracing::warn!(agent_id, error = %err, "discarding malformed agent message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    writer.abort();
    state.orchestrator.dispatcher.remove_link(&agent_id).await;
    let _ = state.orchestrator.registry.disconnect(&agent_id).await;
    state.release_agent_connection(&agent_id, generation).await;
}

async fn next_hello(stream: &mut futures::stream::SplitStream<WebSocket>) -> Option<relay_types::AgentHello> {
    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(Message::Text(text)) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(AgentMessage::AgentHello { id, hostname, display_name, roles, tags, capabilities }) => {
                    return Some(relay_types::AgentHello { id, hostname, display_name, roles, tags, capabilities });
                }
                _ => continue,
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}
