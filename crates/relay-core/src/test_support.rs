//! Test doubles shared between this crate's own `tests/` integration
//! scenarios and `relay-server`'s router tests. Gated behind the
//! `test-support` feature so none of it ships in a release build.

use std::sync::Mutex;

use async_trait::async_trait;

use relay_wire::ControllerToAgentMessage;

use crate::dispatcher::{AgentLink, AgentLinkError};

/// Stands in for a real `/ws/agent` socket: records every message sent to
/// it instead of writing to a transport. `failing_after(n)` makes the
/// `n`th send onward fail, for simulating a mid-run disconnect.
pub struct FakeAgentLink {
    pub sent: Mutex<Vec<ControllerToAgentMessage>>,
    fail_after: Option<usize>,
}

impl FakeAgentLink {
    pub fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()), fail_after: None }
    }

    pub fn failing_after(n: usize) -> Self {
        Self { sent: Mutex::new(Vec::new()), fail_after: Some(n) }
    }
}

impl Default for FakeAgentLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentLink for FakeAgentLink {
    async fn send(&self, message: ControllerToAgentMessage) -> Result<(), AgentLinkError> {
        let mut sent = self.sent.lock().unwrap();
        if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
            return Err(AgentLinkError::Closed);
        }
        sent.push(message);
        Ok(())
    }
}
