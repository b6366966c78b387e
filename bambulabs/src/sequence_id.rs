//! Sequence ids correlate a request with the printer's reply.

use std::sync::atomic::{AtomicU32, Ordering};

use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

static NEXT_SEQUENCE_ID: AtomicU32 = AtomicU32::new(0);

/// The sequence id of a request or report.
///
/// Printers echo whatever they were sent, and the firmware is not consistent
/// about quoting it, so both encodings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, FromStr)]
#[serde(untagged)]
#[display("{0}")]
pub enum SequenceId {
    /// A string sequence id.
    String(String),
    /// An integer sequence id.
    Integer(u32),
}

impl SequenceId {
    /// Allocate the next sequence id for an outgoing request.
    pub fn new() -> Self {
        if cfg!(test) {
            Self::Integer(1)
        } else {
            Self::Integer(NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed))
        }
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}
