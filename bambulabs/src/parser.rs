//! The message parser.

use crate::message::Message;

pub(crate) fn parse_message(message: &rumqttc::Event) -> Message {
    match message {
        rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish)) => parse_payload(&publish.payload),
        _ => Message::Unknown(None),
    }
}

pub(crate) fn parse_payload(payload: &[u8]) -> Message {
    let Ok(payload) = std::str::from_utf8(payload) else {
        return Message::Unknown(Some(String::from_utf8_lossy(payload).into_owned()));
    };

    match serde_json::from_str::<Message>(payload)
        .map_err(|err| format_serde_error::SerdeError::new(payload.to_string(), err))
    {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!("Could not parse message as a known type: {}", err);
            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(value) => Message::Json(value),
                Err(_) => Message::Unknown(Some(payload.to_string())),
            }
        }
    }
}
