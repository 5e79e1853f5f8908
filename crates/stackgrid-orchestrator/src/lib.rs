//! stackgrid-orchestrator: deployment lifecycle for stackgrid services.
//!
//! # Components
//!
//! - **`orchestrator`**: per-node operations (deploy, start, stop, scale,
//!   restart, observe, teardown) over the lifecycle transition table
//! - **`rollout`**: tier-by-tier deployment of a registered graph
//! - **`backend`**: the execution backend seam and an in-memory dry run
//! - **`events`**: transition event sinks
//! - **`lease`**: per-node leases and cancel flags

pub mod backend;
pub mod error;
pub mod events;
pub mod lease;
pub mod orchestrator;
pub mod rollout;

pub use backend::{BackendError, ContainerState, DeployRequest, DryRunBackend, ExecutionBackend, StopSignal};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{ChannelSink, EventSink, LogSink, TransitionEvent};
pub use orchestrator::{Orchestrator, validate_node};
pub use rollout::{RolloutReport, deploy_graph};
