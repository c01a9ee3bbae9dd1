pub mod config;
pub mod dispatcher;
pub mod event_bus;
pub mod maintenance;
pub mod orchestrator;
pub mod registry;
pub mod task_store;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use config::Config;
pub use dispatcher::{AgentLink, AgentLinkError, DispatchError, Dispatcher};
pub use event_bus::EventBus;
pub use maintenance::{run_heartbeat_reaper, run_retention_sweep, run_snapshot_sweep};
pub use orchestrator::Orchestrator;
pub use registry::{AgentNotFound, AgentRegistry, DispatchSelectionError};
pub use task_store::{TaskStore, TaskStoreError};
