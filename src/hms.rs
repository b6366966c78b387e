//! Classification of device health (HMS) fault codes.
//!
//! A code looks like `0300-0100-0001-0001`. The first group names the
//! hardware module. A short table of exact codes gives better descriptions
//! for the faults that matter most to automation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::printer::{Fault, Serial};

/// How bad a fault is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention, printing can continue.
    Warning,
    /// The printer must stop.
    Critical,
}

/// The hardware module a fault belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum Module {
    /// Automatic material system.
    Ams,
    /// Motion controller.
    Motion,
    /// Homing.
    Homing,
    /// Chamber.
    Chamber,
    /// Nozzle and hotend.
    Nozzle,
    /// Heated bed.
    Bed,
    /// Not in the tables.
    Unknown,
}

impl Module {
    /// Faults of this module mean the machine could not move as commanded.
    pub fn is_mechanical(self) -> bool {
        matches!(self, Module::Motion | Module::Homing)
    }
}

/// A classified fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HmsEvent {
    /// The normalized code.
    pub code: String,
    /// The module.
    pub module: Module,
    /// The severity.
    pub severity: Severity,
    /// A human readable description.
    pub description: String,
    /// When it was classified.
    pub timestamp: DateTime<Utc>,
}

impl From<&HmsEvent> for Fault {
    fn from(event: &HmsEvent) -> Self {
        Fault {
            code: event.code.clone(),
            description: event.description.clone(),
            at: event.timestamp,
        }
    }
}

const PREFIXES: &[(&str, Module, Severity, &str)] = &[
    ("0700", Module::Ams, Severity::Warning, "AMS Filament Issue"),
    ("0300", Module::Motion, Severity::Critical, "Motion Controller Error (Stall/Collision)"),
    ("0500", Module::Homing, Severity::Critical, "Axis Homing Failure"),
    ("0C00", Module::Chamber, Severity::Warning, "Chamber Temperature Issue"),
    ("0200", Module::Nozzle, Severity::Warning, "Nozzle/Hotend Issue"),
    ("0400", Module::Bed, Severity::Warning, "Heated Bed Issue"),
];

const EXACT: &[(&str, Module, Severity, &str)] = &[
    ("0700-2000-0002-0002", Module::Ams, Severity::Critical, "AMS Slot 1 Empty / Feed Failure"),
    ("0700-2000-0002-0003", Module::Ams, Severity::Critical, "AMS Slot 2 Empty / Feed Failure"),
    ("0700-2000-0002-0004", Module::Ams, Severity::Critical, "AMS Slot 3 Empty / Feed Failure"),
    ("0700-2000-0002-0005", Module::Ams, Severity::Critical, "AMS Slot 4 Empty / Feed Failure"),
    ("0700-4500-0001-0001", Module::Ams, Severity::Critical, "AMS Cutter Stuck / Step Loss"),
    ("0700-4500-0001-0002", Module::Ams, Severity::Critical, "AMS Cutter Motor Stall"),
    ("0700-0100-0001-0001", Module::Ams, Severity::Warning, "AMS Filament Runout Detected"),
    ("0700-0200-0001-0001", Module::Ams, Severity::Warning, "AMS Filament Tangle Detected"),
    ("0300-0100-0001-0001", Module::Motion, Severity::Critical, "X-Axis Motor Stall"),
    ("0300-0100-0001-0002", Module::Motion, Severity::Critical, "Y-Axis Motor Stall"),
    ("0300-0100-0001-0003", Module::Motion, Severity::Critical, "Z-Axis Motor Stall"),
    ("0300-0200-0001-0001", Module::Motion, Severity::Critical, "Gantry Collision Detected"),
    ("0300-0300-0001-0001", Module::Motion, Severity::Critical, "Motor Step Loss Detected"),
    ("0500-0100-0001-0001", Module::Homing, Severity::Critical, "X-Axis Homing Timeout"),
    ("0500-0100-0001-0002", Module::Homing, Severity::Critical, "Y-Axis Homing Timeout"),
    ("0500-0100-0001-0003", Module::Homing, Severity::Critical, "Z-Axis Homing Timeout"),
];

/// Classify one code. Unknown codes still produce a warning.
pub fn classify(code: &str) -> HmsEvent {
    let code = code.trim().to_uppercase();
    let event = |module, severity, description: String| HmsEvent {
        code: code.clone(),
        module,
        severity,
        description,
        timestamp: Utc::now(),
    };

    if let Some((_, module, severity, description)) = EXACT.iter().find(|(exact, ..)| *exact == code) {
        return event(*module, *severity, description.to_string());
    }

    let prefix = code.get(..4).unwrap_or(code.as_str());
    if let Some((_, module, severity, description)) = PREFIXES.iter().find(|(p, ..)| *p == prefix) {
        return event(*module, *severity, format!("{description} ({code})"));
    }

    tracing::warn!(code = %code, "unknown HMS code");
    event(
        Module::Unknown,
        Severity::Warning,
        format!("Unknown Hardware Error ({code})"),
    )
}

/// Classify every code, skipping blanks.
pub fn classify_all<'a>(codes: impl IntoIterator<Item = &'a str>) -> Vec<HmsEvent> {
    codes
        .into_iter()
        .filter(|code| !code.trim().is_empty())
        .map(classify)
        .collect()
}

/// The most severe event, the first one on ties.
pub fn most_severe(events: &[HmsEvent]) -> Option<&HmsEvent> {
    events.iter().reduce(|best, e| if e.severity > best.severity { e } else { best })
}

/// Whether any event is critical.
pub fn has_critical(events: &[HmsEvent]) -> bool {
    events.iter().any(|e| e.severity == Severity::Critical)
}

/// Remembers which codes are already active on each printer, so a fault that
/// stays in every report only triggers once.
#[derive(Debug, Default)]
pub struct FaultTracker {
    active: DashMap<Serial, HashSet<String>>,
}

impl FaultTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `code` for `serial`. True if it was not already active.
    pub fn observe(&self, serial: &Serial, code: &str) -> bool {
        self.active.entry(serial.clone()).or_default().insert(code.to_string())
    }

    /// Forget every code for `serial`.
    pub fn clear(&self, serial: &Serial) {
        self.active.remove(serial);
    }

    /// Forget one code for `serial`, so it triggers again if it comes back.
    pub fn forget(&self, serial: &Serial, code: &str) {
        if let Some(mut codes) = self.active.get_mut(serial) {
            codes.remove(code);
        }
    }
}
