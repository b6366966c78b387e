//! A message from the printer.

use std::collections::BTreeMap;

use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{hms::HmsEntry, sequence_id::SequenceId};

/// A message from/to the printer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// A print message.
    Print(Print),
    /// An unknown Json message.
    Json(Value),
    /// The message could not be parsed. The `Option<String>` contains the raw message.
    /// If the event was not a publish, the `Option` will be `None`.
    Unknown(Option<String>),
}

impl Message {
    /// Returns the sequence id of the message.
    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            Message::Print(print) => print.sequence_id(),
            Message::Json(_) | Message::Unknown(_) => None,
        }
    }
}

impl From<Print> for Message {
    fn from(print: Print) -> Self {
        Message::Print(print)
    }
}

/// A reason for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, FromStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum Reason {
    /// Success.
    #[serde(alias = "success")]
    Success,
    /// Fail.
    #[serde(alias = "fail")]
    Fail,
    /// Some unknown string.
    #[display("{0}")]
    #[serde(untagged)]
    Unknown(String),
}

/// The result of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, FromStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum Result {
    /// Success.
    #[serde(alias = "success")]
    Success,
    /// Fail.
    #[serde(alias = "fail")]
    Fail,
}

/// A print message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum Print {
    /// The status of the printer.
    PushStatus(PushStatus),
    /// Reply to a gcode line.
    GcodeLine(Ack),
    /// Reply to a gcode file.
    GcodeFile(Ack),
    /// Reply to a project file.
    ProjectFile(Ack),
    /// Reply to a pause.
    Pause(Ack),
    /// Reply to a resume.
    Resume(Ack),
    /// Reply to a stop.
    Stop(Ack),
}

impl Print {
    /// Returns the sequence id of the message.
    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            Print::PushStatus(push_status) => push_status.sequence_id.clone(),
            Print::GcodeLine(ack)
            | Print::GcodeFile(ack)
            | Print::ProjectFile(ack)
            | Print::Pause(ack)
            | Print::Resume(ack)
            | Print::Stop(ack) => Some(ack.sequence_id.clone()),
        }
    }
}

/// The printer's reply to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The sequence id of the request.
    pub sequence_id: SequenceId,
    /// The reason for the message.
    pub reason: Option<Reason>,
    /// The result of the command.
    pub result: Option<Result>,
    /// The param.
    pub param: Option<String>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

/// The state of the job as reported by the printer firmware.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, FromStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum GcodeState {
    /// Nothing is running.
    Idle,
    /// Preparing to print (heating, leveling).
    Prepare,
    /// Printing.
    Running,
    /// Paused by the user or by the firmware.
    Pause,
    /// The last job finished.
    Finish,
    /// The last job failed.
    Failed,
    /// Slicing on the printer.
    Slicing,
    /// Booting.
    Init,
    /// Offline.
    Offline,
    /// A state this crate does not know about.
    #[display("{0}")]
    #[serde(untagged)]
    Unknown(String),
}

/// A push status message.
///
/// Printers send a full report after a `pushall` request and deltas
/// afterwards, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushStatus {
    /// The sequence id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<SequenceId>,
    /// The nozzle temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nozzle_temper: Option<f64>,
    /// The target nozzle temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nozzle_target_temper: Option<f64>,
    /// The bed temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_temper: Option<f64>,
    /// The target bed temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_target_temper: Option<f64>,
    /// The chamber temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chamber_temper: Option<f64>,
    /// The percentage of the print completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mc_percent: Option<i64>,
    /// The remaining time of the print, in minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mc_remaining_time: Option<i64>,
    /// The print stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mc_print_stage: Option<String>,
    /// The generic print error, 0 when there is none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_error: Option<i64>,
    /// The gcode state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcode_state: Option<GcodeState>,
    /// The subtask name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_name: Option<String>,
    /// The gcode file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcode_file: Option<String>,
    /// The current layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_num: Option<i64>,
    /// The total layer count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_layer_num: Option<i64>,
    /// The active health management faults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hms: Option<Vec<HmsEntry>>,
    /// The ams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ams: Option<PrintAms>,
    /// The external spool holder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vt_tray: Option<PrintTray>,
    /// The wifi signal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_signal: Option<String>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl PushStatus {
    /// The fields this report actually carried, as a JSON object.
    pub fn into_delta(self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        strip_nulls(&mut value);
        Ok(value)
    }
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// The print ams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintAms {
    /// The ams units.
    pub ams: Option<Vec<PrintAmsData>>,
    /// The ams exist bits.
    pub ams_exist_bits: Option<String>,
    /// The tray exist bits.
    pub tray_exist_bits: Option<String>,
    /// The tray now.
    pub tray_now: Option<String>,
    /// The version.
    pub version: Option<i64>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

/// One ams unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintAmsData {
    /// The id.
    pub id: String,
    /// The humidity.
    pub humidity: Option<String>,
    /// The temperature.
    pub temp: Option<String>,
    /// The trays.
    #[serde(default)]
    pub tray: Vec<PrintTray>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

/// The print tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintTray {
    /// The id.
    pub id: String,
    /// The tag uid.
    pub tag_uid: Option<String>,
    /// The tray info index.
    pub tray_info_idx: Option<String>,
    /// The material, `PLA`, `PETG` and so on. Absent when the tray is empty.
    pub tray_type: Option<String>,
    /// The tray sub brands.
    pub tray_sub_brands: Option<String>,
    /// The color as `RRGGBBAA`.
    pub tray_color: Option<String>,
    /// The remaining filament in percent, -1 when unknown.
    pub remain: Option<i64>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_deserialize_message_json() {
        let message = r#"{ "hello": "world" }"#;

        let result = serde_json::from_str::<Message>(message);

        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_message_print() {
        let message = format!(
            r#"{{ "print": {{ "bed_temper": 17.40625, "wifi_signal": "-59dBm", "command": "push_status", "msg": 1, "sequence_id": {} }}}}"#,
            2
        );

        let result = serde_json::from_str::<Message>(&message);

        assert!(result.is_ok());
        assert!(matches!(result.unwrap(), Message::Print(Print::PushStatus(_))));
    }

    #[test]
    fn test_deserialize_delta_without_sequence_id() {
        let message = r#"{ "print": { "command": "push_status", "gcode_state": "RUNNING", "mc_percent": 42 } }"#;

        let Message::Print(Print::PushStatus(status)) = serde_json::from_str::<Message>(message).unwrap() else {
            panic!("expected a push status");
        };

        assert_eq!(status.sequence_id, None);
        assert_eq!(status.gcode_state, Some(GcodeState::Running));
        assert_eq!(status.mc_percent, Some(42));
    }

    #[test]
    fn test_unknown_gcode_state_is_kept() {
        let state: GcodeState = serde_json::from_str(r#""SOMETHING_NEW""#).unwrap();
        assert_eq!(state, GcodeState::Unknown("SOMETHING_NEW".to_string()));
    }

    #[test]
    fn test_deserialize_ams() {
        let message = r#"{ "print": { "command": "push_status", "ams": { "ams": [ { "id": "0", "humidity": "4", "temp": "0.0", "tray": [
            { "id": "0", "tray_type": "PLA", "tray_color": "FFFFFFFF", "remain": 100 },
            { "id": "1" }
        ] } ], "tray_now": "255" } } }"#;

        let Message::Print(Print::PushStatus(status)) = serde_json::from_str::<Message>(message).unwrap() else {
            panic!("expected a push status");
        };
        let ams = status.ams.unwrap().ams.unwrap();

        assert_eq!(ams[0].tray.len(), 2);
        assert_eq!(ams[0].tray[0].tray_type.as_deref(), Some("PLA"));
        assert_eq!(ams[0].tray[1].tray_type, None);
    }

    #[test]
    fn test_into_delta_drops_absent_fields() {
        let message = r#"{ "print": { "command": "push_status", "bed_temper": 41.5, "print_error": 0 } }"#;

        let Message::Print(Print::PushStatus(status)) = serde_json::from_str::<Message>(message).unwrap() else {
            panic!("expected a push status");
        };

        assert_eq!(
            status.into_delta().unwrap(),
            serde_json::json!({ "bed_temper": 41.5, "print_error": 0 })
        );
    }

    #[test]
    fn test_deserialize_ack() {
        let message = r#"{ "print": { "command": "gcode_file", "sequence_id": "7", "param": "/sdcard/clear.gcode", "reason": "success", "result": "success" } }"#;

        let message = serde_json::from_str::<Message>(message).unwrap();

        assert_eq!(message.sequence_id(), Some(SequenceId::String("7".to_string())));
        assert!(matches!(message, Message::Print(Print::GcodeFile(_))));
    }
}
