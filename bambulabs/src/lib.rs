//! Client for the Bambu Lab LAN protocol: the per-printer MQTT report and
//! request channels, the typed report payloads, and file upload.

#![deny(missing_docs)]

pub mod client;
pub mod command;
pub mod hms;
pub mod message;
mod no_auth;
pub mod parser;
pub mod sequence_id;
