//! Errors raised by the orchestration engine.

use crate::{
    hms::HmsEvent,
    job::JobId,
    printer::{PrinterStatus, Serial},
};

/// Result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A color string was not `#RRGGBB` or `#RRGGBBAA`.
    #[error("invalid color format: {0:?}")]
    InvalidColorFormat(String),

    /// No idle printer can satisfy the job. The job stays pending.
    #[error("no feasible printer for job {0}")]
    NoFeasibleMatch(JobId),

    /// A conditional write lost a race with another writer.
    #[error("record changed concurrently: {0}")]
    ConcurrentAssignmentConflict(String),

    /// The command transport refused or failed a request.
    #[error("transport failure for printer {serial}: {reason}")]
    TransportFailure {
        /// The printer the request was for.
        serial: Serial,
        /// What the transport reported.
        reason: String,
    },

    /// Automated clearing is not safe for this part.
    #[error("automated clearing refused on {serial}: {reason}")]
    UnsafeAutomationPrecondition {
        /// The printer.
        serial: Serial,
        /// Why the guard refused.
        reason: String,
    },

    /// Clearing faulted or timed out on every attempt.
    #[error("clearing failed on {serial} after {attempts} attempts: {fault}")]
    WatchdogFault {
        /// The printer.
        serial: Serial,
        /// How many attempts were made.
        attempts: u32,
        /// The last fault observed.
        fault: String,
    },

    /// The device reported a critical fault.
    #[error("critical hardware fault on {serial}: {}", .event.description)]
    CriticalHardwareFault {
        /// The printer.
        serial: Serial,
        /// The classified fault.
        event: HmsEvent,
    },

    /// The requested operation is not allowed from the printer's state.
    #[error("cannot {operation} printer {serial} while it is {from}")]
    InvalidStateTransition {
        /// The printer.
        serial: Serial,
        /// The state the printer was in.
        from: PrinterStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// No printer with this serial is known.
    #[error("printer not found: {0}")]
    PrinterNotFound(Serial),

    /// No job with this id is known.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A reported or submitted inventory entry was rejected.
    #[error("invalid inventory: {0}")]
    InvalidInventory(String),

    /// A value was out of range or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The durable store failed.
    #[error("store error: {0}")]
    Store(String),

    /// JSON could not be encoded or decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the error only means another writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrentAssignmentConflict(_))
    }
}
