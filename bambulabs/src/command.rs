//! The requests that can be published to a printer's request topic.

use serde::{Deserialize, Serialize};

use crate::sequence_id::SequenceId;

/// A request to the printer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// A print command.
    Print(Print),
    /// A pushing command.
    Pushing(Pushing),
}

impl Command {
    /// Get the sequence ID.
    pub fn sequence_id(&self) -> &SequenceId {
        match self {
            Command::Print(print) => print.sequence_id(),
            Command::Pushing(pushing) => pushing.sequence_id(),
        }
    }

    /// Ask the printer to publish a full report rather than a delta.
    pub fn push_all() -> Self {
        Command::Pushing(Pushing::Pushall(Pushall {
            sequence_id: SequenceId::new(),
        }))
    }

    /// Return a command to stop the current print or motion sequence.
    pub fn stop() -> Self {
        Command::Print(Print::Stop(Stop {
            sequence_id: SequenceId::new(),
        }))
    }

    /// Run a plain G-code file previously uploaded to the SD card.
    pub fn gcode_file(filename: &str) -> Self {
        Command::Print(Print::GcodeFile(GcodeFile {
            sequence_id: SequenceId::new(),
            param: format!("/sdcard/{filename}"),
        }))
    }

    /// Print plate 1 of a project archive previously uploaded to the SD card.
    ///
    /// `ams_mapping[i]` is the global tray index feeding filament `i` of the
    /// project.
    pub fn print_project(job_name: &str, filename: &str, ams_mapping: Vec<u32>, bed_leveling: bool) -> Self {
        Command::Print(Print::ProjectFile(ProjectFile {
            sequence_id: SequenceId::new(),
            param: "Metadata/plate_1.gcode".to_string(),
            url: format!("file:///sdcard/{filename}"),
            subtask_name: job_name.to_string(),
            use_ams: !ams_mapping.is_empty(),
            ams_mapping,
            timelapse: false,
            bed_leveling,
            flow_cali: false,
            vibration_cali: false,
            layer_inspect: false,
            bed_type: "auto".to_string(),
            project_id: "0".to_string(),
            profile_id: "0".to_string(),
            task_id: "0".to_string(),
            subtask_id: "0".to_string(),
            md5: String::new(),
        }))
    }
}

/// A print command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum Print {
    /// Stop the current print.
    Stop(Stop),
    /// Run an uploaded G-code file.
    GcodeFile(GcodeFile),
    /// Print an uploaded project archive.
    ProjectFile(ProjectFile),
}

impl Print {
    /// Get the sequence ID.
    pub fn sequence_id(&self) -> &SequenceId {
        match self {
            Print::Stop(Stop { sequence_id }) => sequence_id,
            Print::GcodeFile(GcodeFile { sequence_id, .. }) => sequence_id,
            Print::ProjectFile(ProjectFile { sequence_id, .. }) => sequence_id,
        }
    }
}

/// A pushing command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum Pushing {
    /// Get all device information.
    Pushall(Pushall),
}

impl Pushing {
    /// Get the sequence ID.
    pub fn sequence_id(&self) -> &SequenceId {
        match self {
            Pushing::Pushall(Pushall { sequence_id }) => sequence_id,
        }
    }
}

/// The payload for stopping the current print.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stop {
    /// The sequence ID.
    pub sequence_id: SequenceId,
}

/// The payload for getting all device information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pushall {
    /// The sequence ID.
    pub sequence_id: SequenceId,
}

/// The payload for running an uploaded G-code file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcodeFile {
    /// The sequence ID.
    pub sequence_id: SequenceId,
    /// Absolute path of the file on the SD card.
    pub param: String,
}

/// The payload for printing an uploaded project archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectFile {
    /// The sequence ID.
    pub sequence_id: SequenceId,
    /// The plate G-code inside the archive.
    pub param: String,
    /// Where the archive lives.
    pub url: String,
    /// Name shown on the printer's screen.
    pub subtask_name: String,
    /// Feed from the AMS.
    pub use_ams: bool,
    /// Filament index to tray index mapping.
    pub ams_mapping: Vec<u32>,
    /// Record a timelapse.
    pub timelapse: bool,
    /// Run bed leveling before printing.
    pub bed_leveling: bool,
    /// Run flow calibration before printing.
    pub flow_cali: bool,
    /// Run vibration calibration before printing.
    pub vibration_cali: bool,
    /// Inspect the first layer.
    pub layer_inspect: bool,
    /// The bed type.
    pub bed_type: String,
    /// The project id.
    pub project_id: String,
    /// The profile id.
    pub profile_id: String,
    /// The task id.
    pub task_id: String,
    /// The subtask id.
    pub subtask_id: String,
    /// Checksum of the archive, empty to skip verification.
    pub md5: String,
}
