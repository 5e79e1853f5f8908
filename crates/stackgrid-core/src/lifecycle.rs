//! Service lifecycle state machine.
//!
//! `ServiceStatus` is the closed set of states a service node can be in.
//! Every change goes through [`ServiceStatus::on`], which is the complete
//! `(state, event) -> state` transition table; anything not listed there is
//! rejected with a [`TransitionError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Detecting,
    Detected,
    Deployable,
    Building,
    BuildFailed,
    ImagePulling,
    Deploying,
    DeploymentFailed,
    Starting,
    StartFailed,
    Running,
    Healthy,
    Unhealthy,
    Degraded,
    Stopping,
    Stopped,
    Crashed,
    Killed,
    Updating,
    Scaling,
    Restarting,
    Migrating,
    Terminating,
    Terminated,
    Error,
    Timeout,
    ResourceLimitExceeded,
    ConfigurationError,
}

/// Terminal-for-this-attempt fault categories reachable from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    Error,
    Timeout,
    ResourceLimitExceeded,
    ConfigurationError,
}

/// In-place operations on a running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InPlaceOp {
    Update,
    Scale,
    Restart,
    Migrate,
}

/// Inputs to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Detected,
    Validated,
    /// Re-enter `deployable` after a failed or ended attempt.
    Redeploy,
    BuildStarted,
    BuildSucceeded,
    BuildFailed,
    ImagePulled,
    DeployFailed,
    Deployed,
    StartFailed,
    Started,
    /// `start` on a stopped service, skipping the build.
    Resume,
    /// `stop` reached an in-flight deploy at a phase boundary.
    Cancelled,
    HealthPassed,
    HealthDegraded,
    HealthFailed,
    StopRequested,
    StopCompleted,
    Killed,
    Crashed,
    InPlaceStarted(InPlaceOp),
    InPlaceSucceeded,
    InPlaceFailed,
    Terminate,
    TerminationCompleted,
    Fault(Fault),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {event:?} from {from}")]
pub struct TransitionError {
    pub from: ServiceStatus,
    pub event: LifecycleEvent,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 28] = [
        ServiceStatus::Detecting,
        ServiceStatus::Detected,
        ServiceStatus::Deployable,
        ServiceStatus::Building,
        ServiceStatus::BuildFailed,
        ServiceStatus::ImagePulling,
        ServiceStatus::Deploying,
        ServiceStatus::DeploymentFailed,
        ServiceStatus::Starting,
        ServiceStatus::StartFailed,
        ServiceStatus::Running,
        ServiceStatus::Healthy,
        ServiceStatus::Unhealthy,
        ServiceStatus::Degraded,
        ServiceStatus::Stopping,
        ServiceStatus::Stopped,
        ServiceStatus::Crashed,
        ServiceStatus::Killed,
        ServiceStatus::Updating,
        ServiceStatus::Scaling,
        ServiceStatus::Restarting,
        ServiceStatus::Migrating,
        ServiceStatus::Terminating,
        ServiceStatus::Terminated,
        ServiceStatus::Error,
        ServiceStatus::Timeout,
        ServiceStatus::ResourceLimitExceeded,
        ServiceStatus::ConfigurationError,
    ];

    /// Apply `event`, returning the next status or the rejected pair.
    pub fn on(self, event: LifecycleEvent) -> Result<ServiceStatus, TransitionError> {
        use LifecycleEvent as E;
        use ServiceStatus as S;

        let next = match (self, event) {
            (S::Detecting, E::Detected) => S::Detected,
            (S::Detected, E::Validated) => S::Deployable,
            (s, E::Redeploy) if s.accepts_redeploy() => S::Deployable,

            (S::Deployable | S::Stopped | S::Error, E::BuildStarted) => S::Building,
            (S::Building, E::BuildSucceeded) => S::ImagePulling,
            (S::Building, E::BuildFailed) => S::BuildFailed,
            (S::ImagePulling, E::ImagePulled) => S::Deploying,
            (S::ImagePulling | S::Deploying, E::DeployFailed) => S::DeploymentFailed,
            (S::Deploying, E::Deployed) => S::Starting,
            (S::Starting, E::StartFailed) => S::StartFailed,
            (S::Starting, E::Started) => S::Running,
            (S::Stopped, E::Resume) => S::Starting,
            (S::Building | S::ImagePulling | S::Deploying | S::Starting, E::Cancelled) => S::Stopped,

            (S::Running | S::Unhealthy | S::Degraded, E::HealthPassed) => S::Healthy,
            (S::Running | S::Healthy | S::Degraded, E::HealthFailed) => S::Unhealthy,
            (S::Unhealthy, E::HealthDegraded) => S::Degraded,

            (s, E::StopRequested) if s.is_serving() => S::Stopping,
            (S::Stopping, E::StopCompleted) => S::Stopped,
            (s, E::Killed) if s.is_serving() || s.is_in_place() || matches!(s, S::Stopping | S::Starting) => {
                S::Killed
            }
            (s, E::Crashed) if s.is_serving() || s.is_in_place() || s == S::Starting => S::Crashed,

            (S::Running | S::Healthy | S::Degraded, E::InPlaceStarted(op)) => op.status(),
            (S::Unhealthy, E::InPlaceStarted(InPlaceOp::Restart)) => S::Restarting,
            (s, E::InPlaceSucceeded) if s.is_in_place() => S::Running,
            (s, E::InPlaceFailed) if s.is_in_place() => S::Error,

            (s, E::Terminate) if !matches!(s, S::Terminating | S::Terminated) => S::Terminating,
            (S::Terminating, E::TerminationCompleted) => S::Terminated,

            (s, E::Fault(fault)) if !matches!(s, S::Terminated) && !s.is_fault() => fault.status(),

            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// Running and serving (or trying to): the states health checks apply to.
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Running
                | ServiceStatus::Healthy
                | ServiceStatus::Unhealthy
                | ServiceStatus::Degraded
        )
    }

    /// Alias used by readiness: alive from the backend's point of view.
    pub fn is_live(&self) -> bool {
        self.is_serving()
    }

    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Updating
                | ServiceStatus::Scaling
                | ServiceStatus::Restarting
                | ServiceStatus::Migrating
        )
    }

    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Error
                | ServiceStatus::Timeout
                | ServiceStatus::ResourceLimitExceeded
                | ServiceStatus::ConfigurationError
        )
    }

    /// Deploy phase failures.
    pub fn is_phase_failure(&self) -> bool {
        matches!(
            self,
            ServiceStatus::BuildFailed | ServiceStatus::DeploymentFailed | ServiceStatus::StartFailed
        )
    }

    /// States a fresh deploy may restart from by going back to `deployable`.
    pub fn accepts_redeploy(&self) -> bool {
        self.is_phase_failure()
            || self.is_fault()
            || matches!(self, ServiceStatus::Crashed | ServiceStatus::Killed)
    }

    /// States from which `deploy` proceeds directly.
    pub fn accepts_deploy(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Deployable | ServiceStatus::Stopped | ServiceStatus::Error
        )
    }

    /// A deploy or in-place operation is underway.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Building
                | ServiceStatus::ImagePulling
                | ServiceStatus::Deploying
                | ServiceStatus::Starting
                | ServiceStatus::Stopping
                | ServiceStatus::Terminating
        ) || self.is_in_place()
    }

    pub fn is_final(&self) -> bool {
        *self == ServiceStatus::Terminated
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Detecting => "detecting",
            ServiceStatus::Detected => "detected",
            ServiceStatus::Deployable => "deployable",
            ServiceStatus::Building => "building",
            ServiceStatus::BuildFailed => "build_failed",
            ServiceStatus::ImagePulling => "image_pulling",
            ServiceStatus::Deploying => "deploying",
            ServiceStatus::DeploymentFailed => "deployment_failed",
            ServiceStatus::Starting => "starting",
            ServiceStatus::StartFailed => "start_failed",
            ServiceStatus::Running => "running",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Crashed => "crashed",
            ServiceStatus::Killed => "killed",
            ServiceStatus::Updating => "updating",
            ServiceStatus::Scaling => "scaling",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::Migrating => "migrating",
            ServiceStatus::Terminating => "terminating",
            ServiceStatus::Terminated => "terminated",
            ServiceStatus::Error => "error",
            ServiceStatus::Timeout => "timeout",
            ServiceStatus::ResourceLimitExceeded => "resource_limit_exceeded",
            ServiceStatus::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Fault {
    pub fn status(&self) -> ServiceStatus {
        match self {
            Fault::Error => ServiceStatus::Error,
            Fault::Timeout => ServiceStatus::Timeout,
            Fault::ResourceLimitExceeded => ServiceStatus::ResourceLimitExceeded,
            Fault::ConfigurationError => ServiceStatus::ConfigurationError,
        }
    }
}

impl InPlaceOp {
    pub fn status(&self) -> ServiceStatus {
        match self {
            InPlaceOp::Update => ServiceStatus::Updating,
            InPlaceOp::Scale => ServiceStatus::Scaling,
            InPlaceOp::Restart => ServiceStatus::Restarting,
            InPlaceOp::Migrate => ServiceStatus::Migrating,
        }
    }
}
