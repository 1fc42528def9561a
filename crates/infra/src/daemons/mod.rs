//! Concrete daemons: one preset per downstream queue.
//!
//! Each daemon is the same scheduler composed with a Postgres store on its
//! own table, a stored-procedure delegate, and its tuning.

pub mod procedure;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use procedure::StoredProcedureDelegate;

/// The downstream queues fed by flight-tracking ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Expand filed route strings into waypoint geometry
    RouteParse,
    /// Assign controlling boundaries (FIR/ARTCC) to tracked positions
    Boundary,
    /// Compute ETAs for remaining waypoints
    WaypointEta,
    /// Deliver outbound notifications
    Delivery,
}

/// Default tuning of one queue. Every field can be overridden in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePreset {
    pub table: &'static str,
    pub procedure: &'static str,
    pub batch_size: usize,
    pub max_iterations: u32,
    pub backlog_threshold: u64,
    pub backlog_multiplier: u32,
    pub lease_timeout: Duration,
    /// Empty for untiered queues
    pub tier_cadences: Vec<u32>,
    pub interval: Duration,
    pub startup_stagger: Duration,
    pub max_retries: u32,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [
        QueueKind::RouteParse,
        QueueKind::Boundary,
        QueueKind::WaypointEta,
        QueueKind::Delivery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::RouteParse => "route-parse",
            QueueKind::Boundary => "boundary",
            QueueKind::WaypointEta => "waypoint-eta",
            QueueKind::Delivery => "delivery",
        }
    }

    pub fn preset(&self) -> QueuePreset {
        match self {
            QueueKind::RouteParse => QueuePreset {
                table: "route_parse_queue",
                procedure: "parse_route_batch",
                batch_size: 50,
                max_iterations: 10,
                backlog_threshold: 100,
                backlog_multiplier: 2,
                lease_timeout: Duration::from_secs(10 * 60),
                tier_cadences: Vec::new(),
                interval: Duration::from_secs(30),
                startup_stagger: Duration::ZERO,
                max_retries: 5,
            },
            QueueKind::Boundary => QueuePreset {
                table: "boundary_queue",
                procedure: "detect_boundaries_batch",
                batch_size: 100,
                max_iterations: 20,
                backlog_threshold: 500,
                backlog_multiplier: 5,
                lease_timeout: Duration::from_secs(15 * 60),
                tier_cadences: Vec::new(),
                interval: Duration::from_secs(60),
                startup_stagger: Duration::from_secs(15),
                max_retries: 5,
            },
            QueueKind::WaypointEta => QueuePreset {
                table: "waypoint_eta_queue",
                procedure: "compute_waypoint_etas_batch",
                batch_size: 200,
                max_iterations: 15,
                backlog_threshold: 200,
                backlog_multiplier: 2,
                lease_timeout: Duration::from_secs(5 * 60),
                tier_cadences: vec![1, 2, 5, 10, 20],
                interval: Duration::from_secs(30),
                startup_stagger: Duration::from_secs(30),
                max_retries: 3,
            },
            QueueKind::Delivery => QueuePreset {
                table: "delivery_queue",
                procedure: "deliver_outbound_batch",
                batch_size: 25,
                max_iterations: 10,
                backlog_threshold: 100,
                backlog_multiplier: 10,
                lease_timeout: Duration::from_secs(30 * 60),
                tier_cadences: Vec::new(),
                interval: Duration::from_secs(15),
                startup_stagger: Duration::from_secs(45),
                max_retries: 8,
            },
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        QueueKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<_> = QueueKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown queue {s:?} (expected one of: {})", known.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::validate_identifier;

    #[test]
    fn queue_kind_parses_both_spellings() {
        assert_eq!("waypoint-eta".parse::<QueueKind>().unwrap(), QueueKind::WaypointEta);
        assert_eq!("ROUTE_PARSE".parse::<QueueKind>().unwrap(), QueueKind::RouteParse);
        assert!("weather".parse::<QueueKind>().is_err());
    }

    #[test]
    fn presets_use_valid_identifiers_and_sane_tuning() {
        for kind in QueueKind::ALL {
            let preset = kind.preset();
            assert!(validate_identifier(preset.table).is_ok());
            assert!(validate_identifier(preset.procedure).is_ok());
            assert!(preset.batch_size > 0);
            assert!((2..=10).contains(&preset.backlog_multiplier));
            assert!(preset.lease_timeout >= Duration::from_secs(5 * 60));
            assert!(preset.lease_timeout <= Duration::from_secs(30 * 60));
        }
    }
}
