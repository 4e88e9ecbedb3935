use thiserror::Error;

use crate::prog_point::ProgPoint;

#[derive(Debug, Error)]
pub enum RrError {
    #[error("record/replay log i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The live execution went past a recorded program point without
    /// consuming its entry. Replay cannot continue.
    #[error("replay disagreement: current {current}, recorded {recorded}")]
    Divergence {
        current: ProgPoint,
        recorded: ProgPoint,
    },

    #[error("a recording is already in progress")]
    RecordInProgress,

    #[error("a replay is already in progress")]
    ReplayInProgress,

    #[error("no record/replay session is active")]
    NotActive,

    #[error("unexpected {found} entry at {point} (expected {expected})")]
    UnexpectedEntry {
        expected: &'static str,
        found: &'static str,
        point: ProgPoint,
    },

    #[error("malformed log entry: {0}")]
    Malformed(&'static str),
}
