//! Printers and their lifecycle state.

use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{clearing::ClearingStrategy, inventory::Slot, job::JobId};

/// A printer's serial number, which is also its identity.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[serde(transparent)]
#[display("{0}")]
pub struct Serial(pub String);

impl From<&str> for Serial {
    fn from(value: &str) -> Self {
        Serial(value.to_string())
    }
}

/// Where a printer is in its production cycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum PrinterStatus {
    /// Ready for a job.
    Idle,
    /// A job is bound and its file is being sent.
    Uploading,
    /// Printing.
    Printing,
    /// Printing, paused on the device.
    Paused,
    /// Finished, waiting for an operator to clear the plate.
    AwaitingClearance,
    /// Finished, waiting for the bed to cool before clearing.
    Cooldown,
    /// Running the automated clearing sequence.
    ClearingBed,
    /// Stopped on a fault until an operator acknowledges it.
    Error,
    /// Not reachable.
    Offline,
}

impl PrinterStatus {
    /// States in which the printer is bound to a job.
    pub fn holds_job(self) -> bool {
        matches!(
            self,
            PrinterStatus::Uploading | PrinterStatus::Printing | PrinterStatus::Cooldown | PrinterStatus::ClearingBed
        )
    }
}

/// The printer models the fleet knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
pub enum PrinterModel {
    /// A1.
    #[serde(rename = "A1")]
    #[display("A1")]
    A1,
    /// A1 mini.
    #[serde(rename = "A1_MINI")]
    #[display("A1_MINI")]
    A1Mini,
    /// P1P.
    #[serde(rename = "P1P")]
    #[display("P1P")]
    P1P,
    /// P1S.
    #[serde(rename = "P1S")]
    #[display("P1S")]
    P1S,
    /// X1.
    #[serde(rename = "X1")]
    #[display("X1")]
    X1,
    /// X1 Carbon.
    #[serde(rename = "X1C")]
    #[display("X1C")]
    X1Carbon,
    /// X1E.
    #[serde(rename = "X1E")]
    #[display("X1E")]
    X1E,
}

impl PrinterModel {
    /// Work out the model from the serial number prefix.
    pub fn from_serial(serial: &Serial) -> Option<Self> {
        let prefix = serial.0.get(..3)?;
        match prefix {
            "039" => Some(PrinterModel::A1),
            "030" => Some(PrinterModel::A1Mini),
            "01S" => Some(PrinterModel::P1P),
            "01P" => Some(PrinterModel::P1S),
            "00W" => Some(PrinterModel::X1),
            "00M" => Some(PrinterModel::X1Carbon),
            "03W" => Some(PrinterModel::X1E),
            _ => None,
        }
    }

    /// Whether the printer can run job after job without an operator.
    ///
    /// Only the bed-slinger A1 family can push a finished part off the plate.
    pub fn supports_continuous(self) -> bool {
        matches!(self, PrinterModel::A1 | PrinterModel::A1Mini)
    }
}

/// Per-printer automation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AutomationConfig {
    /// Clear the plate automatically after a print.
    pub auto_eject: bool,
    /// How to clear the plate.
    pub strategy: ClearingStrategy,
    /// Bed temperature at or below which the part can be released.
    pub thermal_release_temp: f64,
    /// Jobs run since the last full calibration.
    pub jobs_since_calibration: u32,
    /// Jobs between full calibrations.
    pub calibration_interval: u32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            auto_eject: false,
            strategy: ClearingStrategy::Manual,
            thermal_release_temp: 28.0,
            jobs_since_calibration: 0,
            calibration_interval: 5,
        }
    }
}

impl AutomationConfig {
    /// Whether the next job should run the full calibration preamble.
    pub fn calibration_due(&self) -> bool {
        self.jobs_since_calibration == 0 || self.jobs_since_calibration >= self.calibration_interval
    }

    /// Count a completed job, wrapping to zero when the interval is reached.
    pub fn record_job(&mut self) {
        self.jobs_since_calibration += 1;
        if self.jobs_since_calibration >= self.calibration_interval {
            self.jobs_since_calibration = 0;
        }
    }
}

/// A partial update of [`AutomationConfig`]. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AutomationUpdate {
    /// New auto-eject flag.
    pub auto_eject: Option<bool>,
    /// New clearing strategy.
    pub strategy: Option<ClearingStrategy>,
    /// New release temperature.
    pub thermal_release_temp: Option<f64>,
    /// New calibration interval.
    pub calibration_interval: Option<u32>,
}

/// A fault recorded on a printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Fault {
    /// The device code, `XXXX-XXXX-XXXX-XXXX`, or `TIMEOUT` for a watchdog timeout.
    pub code: String,
    /// What happened.
    pub description: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

/// A printer in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Printer {
    /// The serial number.
    pub serial: Serial,
    /// A display name.
    pub name: String,
    /// Network address.
    pub address: String,
    /// LAN access code.
    pub access_code: String,
    /// The model.
    pub model: PrinterModel,
    /// Lifecycle state.
    pub status: PrinterStatus,
    /// Loaded filament, ordered by slot index.
    pub inventory: Vec<Slot>,
    /// Automation settings.
    pub automation: AutomationConfig,
    /// Whether the build plate is empty.
    pub plate_cleared: bool,
    /// The job the printer is bound to.
    pub current_job_id: Option<JobId>,
    /// The fault that put the printer into `ERROR`.
    pub fault: Option<Fault>,
}

impl Printer {
    /// A new idle printer with an empty plate.
    pub fn new(serial: Serial, name: String, address: String, access_code: String, model: PrinterModel) -> Self {
        Self {
            serial,
            name,
            address,
            access_code,
            model,
            status: PrinterStatus::Idle,
            inventory: Vec::new(),
            automation: AutomationConfig::default(),
            plate_cleared: true,
            current_job_id: None,
            fault: None,
        }
    }

    /// Whether the dispatcher may bind a job to this printer.
    pub fn is_available(&self) -> bool {
        self.status == PrinterStatus::Idle && self.plate_cleared
    }

    /// `current_job_id` is set exactly when the status holds a job.
    pub fn is_consistent(&self) -> bool {
        self.current_job_id.is_some() == self.status.holds_job()
    }
}
