//! Fault scenarios for deterministic simulation.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: repeated polls of a stable fleet, no faults
    SteadyState,

    /// SIM-002: duplicated deliveries and whole-batch redelivery
    Redelivery,

    /// SIM-003: newer reports published before older ones
    OutOfOrder,

    /// SIM-004: vehicles ageing out of the occupancy window
    WindowExpiry,

    /// SIM-005: retention sweep after an hour of silence
    RetentionSweep,

    /// SIM-006: minCount threshold at the boundary
    MinCount,

    /// SIM-007: store down for a whole batch, then recovered via redelivery
    StoreOutage,

    /// SIM-008: invalid records mixed into every poll
    MalformedFlood,

    /// SIM-009: retry budget used up exactly, then exceeded
    CommitExhaustion,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::Redelivery,
            ScenarioId::OutOfOrder,
            ScenarioId::WindowExpiry,
            ScenarioId::RetentionSweep,
            ScenarioId::MinCount,
            ScenarioId::StoreOutage,
            ScenarioId::MalformedFlood,
            ScenarioId::CommitExhaustion,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::Redelivery => "redelivery",
            ScenarioId::OutOfOrder => "out_of_order",
            ScenarioId::WindowExpiry => "window_expiry",
            ScenarioId::RetentionSweep => "retention_sweep",
            ScenarioId::MinCount => "min_count",
            ScenarioId::StoreOutage => "store_outage",
            ScenarioId::MalformedFlood => "malformed_flood",
            ScenarioId::CommitExhaustion => "commit_exhaustion",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "Fleet polled repeatedly; store and counts match ground truth",
            ScenarioId::Redelivery => "30% duplicates plus the same batch redelivered twice; counts unchanged",
            ScenarioId::OutOfOrder => "Older snapshot arrives after newer one, reversed; newest position wins",
            ScenarioId::WindowExpiry => "Vehicle counted once in its cell, then absent after the window",
            ScenarioId::RetentionSweep => "Rows past retention deleted, in-horizon queries unaffected",
            ScenarioId::MinCount => "Cell with 4 vehicles excluded at minCount=5, cell with 5 included",
            ScenarioId::StoreOutage => "Batch fails unacked, queries serve last commit, redelivery recovers",
            ScenarioId::MalformedFlood => "Invalid records dropped and counted, valid ones committed",
            ScenarioId::CommitExhaustion => "Commit succeeds on the last attempt, then fails one attempt later",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_state" | "steadystate" | "sim-001" => Ok(ScenarioId::SteadyState),
            "redelivery" | "sim-002" => Ok(ScenarioId::Redelivery),
            "out_of_order" | "outoforder" | "sim-003" => Ok(ScenarioId::OutOfOrder),
            "window_expiry" | "windowexpiry" | "sim-004" => Ok(ScenarioId::WindowExpiry),
            "retention_sweep" | "retentionsweep" | "sim-005" => Ok(ScenarioId::RetentionSweep),
            "min_count" | "mincount" | "sim-006" => Ok(ScenarioId::MinCount),
            "store_outage" | "storeoutage" | "sim-007" => Ok(ScenarioId::StoreOutage),
            "malformed_flood" | "malformedflood" | "sim-008" => Ok(ScenarioId::MalformedFlood),
            "commit_exhaustion" | "commitexhaustion" | "sim-009" => Ok(ScenarioId::CommitExhaustion),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
