//! Bootstrap marker detection over Tor's log output

use crate::models::ProcessStatus;

pub const BOOTSTRAPPED_MARKER: &str = "bootstrapped 100%";

/// Lines that mean the process will never finish bootstrapping
pub const FAILURE_MARKERS: &[&str] = &[
    "could not bind",
    "address already in use",
    "dying",
    "closing partially-constructed",
];

/// Result of scanning one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub status: ProcessStatus,
    /// Some when the startup signal must be released: Ok on bootstrap, Err with the line on failure
    pub release: Option<Result<(), String>>,
}

impl ScanOutcome {
    fn unchanged(status: ProcessStatus) -> Self {
        Self {
            status,
            release: None,
        }
    }
}

/// Map (current status, line) to the next status
///
/// Only a `Starting` process reacts to markers, so the first terminal marker
/// decides the outcome and later ones are ignored.
pub fn scan_line(status: ProcessStatus, line: &str) -> ScanOutcome {
    if status != ProcessStatus::Starting {
        return ScanOutcome::unchanged(status);
    }

    let lowered = line.to_lowercase();

    if lowered.contains(BOOTSTRAPPED_MARKER) {
        return ScanOutcome {
            status: ProcessStatus::Connected,
            release: Some(Ok(())),
        };
    }

    if FAILURE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return ScanOutcome {
            status: ProcessStatus::FailedToConnect,
            release: Some(Err(line.trim().to_string())),
        };
    }

    ScanOutcome::unchanged(status)
}
