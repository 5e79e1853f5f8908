//! redb table definitions for the stackgrid state store.
//!
//! Every table maps a `&str` key to a JSON-serialized value. Keys start with
//! `{workspace}/` so one workspace can be listed or dropped by prefix scan.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Service nodes keyed by `{workspace}/{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Dependency edges keyed by `{workspace}/{edge_id}`.
pub const EDGES: JsonTable = TableDefinition::new("edges");

/// Detection runs keyed by `{workspace}/{run_id}`.
pub const RUNS: JsonTable = TableDefinition::new("runs");

/// Graph snapshots keyed by `{workspace}/{version:020}`.
pub const GRAPHS: JsonTable = TableDefinition::new("graphs");

pub(crate) const ALL_TABLES: [JsonTable; 4] = [NODES, EDGES, RUNS, GRAPHS];
