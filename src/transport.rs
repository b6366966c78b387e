//! Contracts for the collaborators that move files and commands to printers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::{
    color::Rgb,
    inventory::SlotMapping,
    job::{Job, JobId},
    printer::{Printer, Serial},
};

/// A print file ready to be sent to one printer.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Local path of the file.
    pub path: PathBuf,
    /// Name the file gets on the printer.
    pub name: String,
    /// Whether the file should run the full calibration preamble.
    pub calibration: bool,
}

/// One filament the prepared file must draw from a specific slot.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSlot {
    /// The slot.
    pub index: u32,
    /// Material loaded there.
    pub material: String,
    /// Color loaded there.
    pub color: Rgb,
}

/// What the file preparer is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareRequest {
    /// The job.
    pub job: Job,
    /// The printer it is bound to.
    pub printer: Serial,
    /// The slot feeding each requirement, in requirement order.
    pub slots: Vec<TargetSlot>,
    /// Whether the printer is due for a full calibration.
    pub calibration_due: bool,
}

/// Turns a bound job into something a printer can run.
///
/// Called only after the job is bound to a printer.
#[async_trait]
pub trait FilePreparer: Send + Sync {
    /// Produce the artifact for `request`.
    async fn prepare(&self, request: &PrepareRequest) -> Result<Artifact>;
}

/// Sends work to printers.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Send `artifact` to `printer` and start it with the given slot mapping.
    async fn start_job(&self, printer: &Printer, artifact: &Artifact, mapping: &SlotMapping) -> Result<()>;

    /// Run a motion script on `printer`.
    async fn send_maintenance_sequence(&self, printer: &Printer, script: &str) -> Result<()>;

    /// Stop whatever motion is in flight on `printer`.
    async fn abort(&self, printer: &Printer) -> Result<()>;
}

/// A [`FilePreparer`] for jobs whose submitter already sliced the file.
///
/// The job's metadata must carry the path under `file`.
#[derive(Debug, Clone, Default)]
pub struct SlicedFilePreparer;

#[async_trait]
impl FilePreparer for SlicedFilePreparer {
    async fn prepare(&self, request: &PrepareRequest) -> Result<Artifact> {
        let path = request
            .job
            .metadata
            .extra
            .get("file")
            .and_then(|file| file.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("job {} has no `file` in its metadata", request.job.id))?;

        tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        Ok(Artifact {
            name: artifact_name(request.job.id, &path),
            path,
            calibration: request.calibration_due,
        })
    }
}

fn artifact_name(job: JobId, path: &std::path::Path) -> String {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("3mf");
    format!("job-{job}.{extension}")
}
