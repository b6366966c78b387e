#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate runs a farm of 3D printers: it matches queued jobs to printers
//! whose loaded filament fits, follows each printer through its print and
//! plate clearing cycle, and keeps a live view of every printer's telemetry.

pub mod bambu;
pub mod cache;
pub mod clearing;
pub mod color;
pub mod config;
pub mod dispatch;
pub mod error;
mod file;
pub mod fleet;
pub mod hms;
pub mod inventory;
pub mod job;
pub mod lifecycle;
pub mod metrics;
pub mod printer;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use file::TemporaryFile;
pub use fleet::{Collaborators, Fleet, PrinterState};
