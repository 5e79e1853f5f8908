pub mod config;
pub mod ids;
pub mod lifecycle;
pub mod types;

pub use config::StackConfig;
pub use lifecycle::{Fault, InPlaceOp, LifecycleEvent, ServiceStatus, TransitionError};
pub use types::*;
