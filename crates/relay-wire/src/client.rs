use serde::{Deserialize, Serialize};

/// Messages a UI observer sends over `/ws/client`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToServerMessage {
    Ping,
}

/// The controller's direct reply to `ping`. Broadcast `ControllerEvent`s
/// are the rest of the `/ws/client` server-to-client vocabulary and are
/// serialized independently (they already carry their own `type` tag).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControlMessage {
    Pong,
}
