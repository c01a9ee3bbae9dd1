use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::event::OutputStream;

/// Messages an agent sends over `/ws/agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    AgentHello {
        id: String,
        hostname: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        roles: Vec<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        capabilities: HashMap<String, Value>,
    },
    Heartbeat {
        telemetry: relay_types::Telemetry,
    },
    TaskOutput {
        task_id: String,
        command_index: usize,
        stream: OutputStream,
        content: String,
    },
    CommandResult {
        task_id: String,
        command_index: usize,
        exit_code: i32,
        #[serde(default)]
        stderr: Option<String>,
        duration_ms: u64,
    },
    Ack {
        msg_id: String,
    },
}

/// Messages the controller sends to an agent over `/ws/agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerToAgentMessage {
    CommandExecute {
        task_id: String,
        command_index: usize,
        dir: String,
        run: String,
        timeout_seconds: u32,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    CommandCancel {
        task_id: String,
        command_index: usize,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_hello_round_trips_with_snake_case_tag() {
        let raw = r#"{"type":"agent_hello","id":"a1","hostname":"box1","roles":["worker"],"tags":[],"capabilities":{}}"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();
        match msg {
            AgentMessage::AgentHello { id, hostname, .. } => {
                assert_eq!(id, "a1");
                assert_eq!(hostname, "box1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_deserialize_into_known_variant() {
        let raw = r#"{"type":"not_a_real_message"}"#;
        let result: Result<AgentMessage, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn command_execute_serializes_with_snake_case_tag() {
        let msg = ControllerToAgentMessage::CommandExecute {
            task_id: "t1".into(),
            command_index: 0,
            dir: ".".into(),
            run: "ls".into(),
            timeout_seconds: 300,
            env: HashMap::new(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "command_execute");
    }
}
