//! Fault scenarios for deterministic session testing.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// CS-001: Clean store, full game of bots
    SteadyPlay,

    /// CS-002: Coordinator crashes mid-game
    CoordinatorCrash,

    /// CS-003: Coordinators crash one after another
    CascadeFailover,

    /// CS-004: Followers lose a fifth of their reads
    LossyStore,

    /// CS-005: Followers see the store 250ms late
    HighLatency,

    /// CS-006: Inbound frozen with nobody holding the ball
    StalledInbound,

    /// CS-007: One follower cut off from the store, then healed
    Isolation,

    /// CS-008: A peer joins mid-game, then inherits the session
    LateJoinFailover,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyPlay,
            ScenarioId::CoordinatorCrash,
            ScenarioId::CascadeFailover,
            ScenarioId::LossyStore,
            ScenarioId::HighLatency,
            ScenarioId::StalledInbound,
            ScenarioId::Isolation,
            ScenarioId::LateJoinFailover,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyPlay => "steady_play",
            ScenarioId::CoordinatorCrash => "coordinator_crash",
            ScenarioId::CascadeFailover => "cascade_failover",
            ScenarioId::LossyStore => "lossy_store",
            ScenarioId::HighLatency => "high_latency",
            ScenarioId::StalledInbound => "stalled_inbound",
            ScenarioId::Isolation => "isolation",
            ScenarioId::LateJoinFailover => "late_join_failover",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyPlay => "No faults; followers must track the coordinator's score",
            ScenarioId::CoordinatorCrash => "Coordinator dies mid-game; next peer in order takes over",
            ScenarioId::CascadeFailover => "Two coordinators die in a row; epochs keep climbing",
            ScenarioId::LossyStore => "20% read loss on followers; quality degrades, state converges",
            ScenarioId::HighLatency => "250ms read latency on followers; prediction keeps them close",
            ScenarioId::StalledInbound => "Inbound stuck with no carrier; watchdog must recover",
            ScenarioId::Isolation => "One follower isolated for 3s, then healed",
            ScenarioId::LateJoinFailover => "p2 joins a quarter in and takes over when the coordinator dies",
        }
    }

    /// Scenarios that crash peers need at least this many.
    pub fn min_peers(&self) -> usize {
        match self {
            ScenarioId::CascadeFailover | ScenarioId::LateJoinFailover => 3,
            ScenarioId::CoordinatorCrash | ScenarioId::Isolation => 2,
            _ => 1,
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
            "steady_play" | "steadyplay" | "cs-001" => Ok(ScenarioId::SteadyPlay),
            "coordinator_crash" | "coordinatorcrash" | "cs-002" => Ok(ScenarioId::CoordinatorCrash),
            "cascade_failover" | "cascadefailover" | "cs-003" => Ok(ScenarioId::CascadeFailover),
            "lossy_store" | "lossystore" | "cs-004" => Ok(ScenarioId::LossyStore),
            "high_latency" | "highlatency" | "cs-005" => Ok(ScenarioId::HighLatency),
            "stalled_inbound" | "stalledinbound" | "cs-006" => Ok(ScenarioId::StalledInbound),
            "isolation" | "cs-007" => Ok(ScenarioId::Isolation),
            "late_join_failover" | "latejoinfailover" | "cs-008" => Ok(ScenarioId::LateJoinFailover),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("CS-006".parse::<ScenarioId>(), Ok(ScenarioId::StalledInbound));
        assert_eq!("cs-008".parse::<ScenarioId>(), Ok(ScenarioId::LateJoinFailover));
        assert!("chaos".parse::<ScenarioId>().is_err());
    }
}
