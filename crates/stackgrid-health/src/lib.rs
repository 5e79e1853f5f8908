//! stackgrid-health: health checking and readiness for stackgrid services.
//!
//! Probes live services, debounces the results into health levels, and
//! answers readiness queries for the orchestrator's dependency wait.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── check(node) → Prober → HealthTracker → HealthLevel
//!   ├── Per-node background task (start_monitor / stop_monitor)
//!   ├── broadcast of HealthSignal on level changes
//!   └── ReadinessSource for the orchestrator
//! ```
//!
//! Exponential backoff (base interval doubling up to 60s) keeps failing
//! services from being hammered. Recovery from `unhealthy` passes through
//! `degraded` until enough consecutive successes are seen.

pub mod checker;
pub mod error;
pub mod monitor;
pub mod prober;
pub mod readiness;

pub use checker::{HealthTracker, ProbeResult};
pub use error::{HealthError, HealthResult};
pub use monitor::{HealthMonitor, HealthSignal};
pub use prober::{HttpProber, Prober};
pub use readiness::{BoxFuture, LivenessReadiness, ReadinessSource};
