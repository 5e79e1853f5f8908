//! stackgrid service graph.
//!
//! Builds a versioned, acyclic service graph from scanner candidates and
//! analyzes it for startup order, tiers, and rollout strategy.

pub mod analyzer;
pub mod builder;
pub mod detection;
pub mod error;
pub mod graph;

pub use builder::{EdgeDeclaration, GraphBuilder};
pub use detection::{detect_in_tree, detect_topology};
pub use error::{DetectionError, GraphError, GraphResult};
pub use graph::ServiceGraph;
