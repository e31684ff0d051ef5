//! Status conflict detection and resolution policy.

use crate::models::{ConflictResolution, TaskStatus};

/// Resolution chosen for a local/server status mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictOutcome {
    pub resolution: ConflictResolution,
    pub final_status: TaskStatus,
}

/// Whether an update result is a genuine conflict.
///
/// A conflict needs a previously recorded server status that already
/// disagreed with the local one and a fresh server status that still does.
pub fn is_conflict(local: TaskStatus, recorded: Option<TaskStatus>, observed: TaskStatus) -> bool {
    recorded.is_some_and(|recorded| recorded != local) && observed != local
}

/// Pick a resolution for `local` vs `server`. `None` when they agree.
pub fn resolve_conflict(local: TaskStatus, server: TaskStatus) -> Option<ConflictOutcome> {
    if local == server {
        return None;
    }

    let outcome = match (local, server) {
        (TaskStatus::Done, TaskStatus::Cancelled) => ConflictOutcome {
            resolution: ConflictResolution::ClientWins,
            final_status: TaskStatus::Done,
        },
        (TaskStatus::Cancelled, TaskStatus::Done) => ConflictOutcome {
            resolution: ConflictResolution::ServerWins,
            final_status: TaskStatus::Done,
        },
        _ => ConflictOutcome {
            resolution: ConflictResolution::Manual,
            final_status: local,
        },
    };
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::{Cancelled, Done, InProgress, Pending};

    #[test]
    fn policy_table() {
        let cases = [
            (Done, Cancelled, ConflictResolution::ClientWins, Done),
            (Cancelled, Done, ConflictResolution::ServerWins, Done),
            (Pending, Done, ConflictResolution::Manual, Pending),
            (InProgress, Cancelled, ConflictResolution::Manual, InProgress),
            (Done, Pending, ConflictResolution::Manual, Done),
        ];

        for (local, server, resolution, final_status) in cases {
            assert_eq!(
                resolve_conflict(local, server),
                Some(ConflictOutcome {
                    resolution,
                    final_status
                }),
                "{local} vs {server}"
            );
        }
    }

    #[test]
    fn equal_statuses_do_not_conflict() {
        for status in [Pending, InProgress, Done, Cancelled] {
            assert_eq!(resolve_conflict(status, status), None);
        }
    }

    #[test]
    fn conflict_requires_recorded_disagreement() {
        assert!(!is_conflict(Done, None, Cancelled));
        assert!(!is_conflict(Done, Some(Done), Cancelled));
        assert!(!is_conflict(Done, Some(Cancelled), Done));
        assert!(is_conflict(Done, Some(Cancelled), Cancelled));
        assert!(is_conflict(Done, Some(Pending), Cancelled));
    }
}
