//! The printer state machine.
//!
//! Every change to a printer's lifecycle fields goes through a function in
//! this module. Each one reads the printer and the job it concerns, checks
//! the source state, and commits both records in one conditional write. A
//! write that loses a race is re-read and re-applied a few times before the
//! conflict is returned to the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    clearing::ClearingPlan,
    config::ClearingConfig,
    error::{Error, Result},
    hms::{FaultTracker, HmsEvent},
    inventory::{changed_indices, Slot},
    job::{Job, JobId, JobStatus},
    printer::{AutomationConfig, AutomationUpdate, Fault, Printer, PrinterStatus, Serial},
    store::{Store, Versioned, Write},
};

const COMMIT_ATTEMPTS: u32 = 3;

/// Highest release temperature accepted, in °C.
const MAX_RELEASE_TEMP: f64 = 120.0;

/// Which job a transition works on.
#[derive(Debug, Clone, Copy)]
enum JobRef {
    /// No job.
    None,
    /// The printer's `current_job_id`.
    Current,
    /// The current job, or else the most relevant job assigned to the
    /// printer: an unfinished one first, then the most recently updated.
    Latest,
    /// A specific job.
    Id(JobId),
}

/// Applies lifecycle transitions to the store.
pub struct Lifecycle {
    store: Arc<dyn Store>,
    faults: Arc<FaultTracker>,
    guards: ClearingConfig,
}

impl Lifecycle {
    /// A state machine over `store`.
    pub fn new(store: Arc<dyn Store>, faults: Arc<FaultTracker>, guards: ClearingConfig) -> Self {
        Self { store, faults, guards }
    }

    /// Bind `job` to `printer`: `PENDING → UPLOADING` and `IDLE → UPLOADING`.
    ///
    /// This is a single attempt. A conflict means another writer moved one
    /// of the records since it was read, and the caller should skip the pair.
    pub async fn bind(&self, printer: &Versioned<Printer>, job: &Versioned<Job>) -> Result<()> {
        if !printer.record.is_available() {
            return Err(invalid(&printer.record, "bind"));
        }
        if job.record.status != JobStatus::Pending {
            return Err(Error::InvalidArgument(format!(
                "job {} is {}, not PENDING",
                job.record.id, job.record.status
            )));
        }

        let now = Utc::now();
        let mut bound_job = job.record.clone();
        bound_job.status = JobStatus::Uploading;
        bound_job.assigned_printer = Some(printer.record.serial.clone());
        bound_job.updated_at = now;

        let mut bound_printer = printer.record.clone();
        bound_printer.status = PrinterStatus::Uploading;
        bound_printer.current_job_id = Some(job.record.id);
        bound_printer.plate_cleared = false;

        self.store
            .commit(vec![Write::job(job, bound_job), Write::printer(printer, bound_printer)])
            .await
    }

    /// The transport started the job: `UPLOADING → PRINTING`.
    pub async fn confirm_started(&self, serial: &Serial, job_id: JobId) -> Result<()> {
        self.transition(serial, JobRef::Id(job_id), |printer, job, now| {
            expect(printer, &[PrinterStatus::Uploading], "confirm start of")?;
            if printer.current_job_id != Some(job_id) {
                return Err(invalid(printer, "confirm start of"));
            }
            let job = require(printer, job)?;
            job.status = JobStatus::Printing;
            job.updated_at = now;
            printer.status = PrinterStatus::Printing;
            Ok(())
        })
        .await
    }

    /// Undo a binding whose job could not be started.
    ///
    /// The job fails with `reason`. The printer goes back to `IDLE` with a
    /// clear plate if it is still bound to the job.
    pub async fn revert_binding(&self, serial: &Serial, job_id: JobId, reason: &str) -> Result<()> {
        self.transition(serial, JobRef::Id(job_id), |printer, job, now| {
            let job = require(printer, job)?;
            if job.status != JobStatus::Uploading {
                return Err(Error::InvalidArgument(format!("job {} is {}, not UPLOADING", job.id, job.status)));
            }
            job.fail(reason, now);
            if printer.status == PrinterStatus::Uploading && printer.current_job_id == Some(job_id) {
                printer.status = PrinterStatus::Idle;
                printer.current_job_id = None;
                printer.plate_cleared = true;
            }
            Ok(())
        })
        .await
    }

    /// The device finished printing.
    ///
    /// Goes to `COOLDOWN` when auto-eject is on and the clearing strategy is
    /// safe for the part, otherwise to `AWAITING_CLEARANCE`. Returns the new
    /// status.
    pub async fn print_finished(&self, serial: &Serial) -> Result<PrinterStatus> {
        let guards = &self.guards;
        self.transition(serial, JobRef::Current, |printer, job, now| {
            expect(printer, &[PrinterStatus::Printing], "finish")?;
            let job = require(printer, job)?;
            job.finish(now);

            let automation = &printer.automation;
            let verdict = if automation.auto_eject {
                automation.strategy.check_safe(job.metadata.part_height_mm, guards)
            } else {
                Err("auto-eject disabled".to_string())
            };

            match verdict {
                Ok(()) => printer.status = PrinterStatus::Cooldown,
                Err(reason) => {
                    if printer.automation.auto_eject {
                        let refused = Error::UnsafeAutomationPrecondition {
                            serial: printer.serial.clone(),
                            reason,
                        };
                        tracing::warn!(job = %job.id, "{}", refused);
                    }
                    printer.status = PrinterStatus::AwaitingClearance;
                    printer.current_job_id = None;
                }
            }
            Ok(printer.status)
        })
        .await
    }

    /// The device reported the print failed.
    pub async fn print_failed(&self, serial: &Serial, reason: &str) -> Result<()> {
        self.transition(serial, JobRef::Latest, |printer, job, now| {
            expect(printer, &[PrinterStatus::Printing, PrinterStatus::Paused], "fail print on")?;
            if let Some(job) = job.filter(|job| !job.status.is_terminal()) {
                job.fail(reason, now);
            }
            printer.status = PrinterStatus::AwaitingClearance;
            printer.current_job_id = None;
            Ok(())
        })
        .await
    }

    /// The device paused: `PRINTING → PAUSED`. The job stays `PRINTING`.
    pub async fn paused(&self, serial: &Serial) -> Result<()> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            expect(printer, &[PrinterStatus::Printing], "pause")?;
            printer.status = PrinterStatus::Paused;
            printer.current_job_id = None;
            Ok(())
        })
        .await
    }

    /// The device resumed: `PAUSED → PRINTING`.
    pub async fn resumed(&self, serial: &Serial) -> Result<()> {
        self.transition(serial, JobRef::Latest, |printer, job, _| {
            expect(printer, &[PrinterStatus::Paused], "resume")?;
            let job = require(printer, job)?;
            if job.status != JobStatus::Printing {
                return Err(invalid(printer, "resume"));
            }
            printer.status = PrinterStatus::Printing;
            printer.current_job_id = Some(job.id);
            Ok(())
        })
        .await
    }

    /// A bed temperature sample.
    ///
    /// In `COOLDOWN`, a sample at or below the release temperature moves the
    /// printer to `CLEARING_BED` and returns the plan to run. Only the call
    /// that commits the move gets the plan.
    pub async fn bed_temperature(&self, serial: &Serial, temperature: f64) -> Result<Option<ClearingPlan>> {
        let guards = &self.guards;
        self.transition(serial, JobRef::Current, |printer, job, _| {
            if printer.status != PrinterStatus::Cooldown || temperature > printer.automation.thermal_release_temp {
                return Ok(None);
            }
            let job = require(printer, job)?;

            // Settings may have changed since the print finished.
            let strategy = printer.automation.strategy;
            if let Err(reason) = strategy.check_safe(job.metadata.part_height_mm, guards) {
                tracing::warn!(job = %job.id, reason = %reason, "clearing no longer safe, waiting for an operator");
                printer.status = PrinterStatus::AwaitingClearance;
                printer.current_job_id = None;
                return Ok(None);
            }

            printer.status = PrinterStatus::ClearingBed;
            Ok(Some(ClearingPlan {
                strategy,
                part_height_mm: job.metadata.part_height_mm.unwrap_or_default(),
            }))
        })
        .await
    }

    /// Clearing finished: `CLEARING_BED → IDLE` with a clear plate.
    pub async fn clearing_succeeded(&self, serial: &Serial) -> Result<()> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            expect(printer, &[PrinterStatus::ClearingBed], "complete clearing on")?;
            release(printer);
            Ok(())
        })
        .await?;
        self.faults.clear(serial);
        Ok(())
    }

    /// Clearing gave up: `CLEARING_BED → ERROR`.
    pub async fn clearing_failed(&self, serial: &Serial, fault: Fault) -> Result<()> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            expect(printer, &[PrinterStatus::ClearingBed], "fail clearing on")?;
            printer.status = PrinterStatus::Error;
            printer.current_job_id = None;
            printer.fault = Some(fault.clone());
            Ok(())
        })
        .await
    }

    /// A critical fault. Busy printers stop in `ERROR` and a running print
    /// fails. Returns whether the printer moved.
    pub async fn critical_fault(&self, serial: &Serial, event: &HmsEvent) -> Result<bool> {
        self.transition(serial, JobRef::Current, |printer, job, now| {
            if !matches!(
                printer.status,
                PrinterStatus::Printing | PrinterStatus::Cooldown | PrinterStatus::ClearingBed
            ) {
                return Ok(false);
            }
            if let Some(job) = job.filter(|job| job.status == JobStatus::Printing) {
                job.fail(event.description.clone(), now);
            }
            printer.status = PrinterStatus::Error;
            printer.current_job_id = None;
            printer.fault = Some(event.into());
            Ok(true)
        })
        .await
    }

    /// An operator removed the part: `AWAITING_CLEARANCE → IDLE`.
    pub async fn confirm_manual_clearance(&self, serial: &Serial) -> Result<()> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            expect(printer, &[PrinterStatus::AwaitingClearance], "confirm clearance of")?;
            release(printer);
            Ok(())
        })
        .await?;
        self.faults.clear(serial);
        Ok(())
    }

    /// An operator dealt with the problem: `ERROR | PAUSED → IDLE`.
    ///
    /// A paused job is failed. Returns the state the printer left.
    pub async fn acknowledge_error(&self, serial: &Serial) -> Result<PrinterStatus> {
        let from = self
            .transition(serial, JobRef::Latest, |printer, job, now| {
                expect(printer, &[PrinterStatus::Error, PrinterStatus::Paused], "acknowledge error on")?;
                let from = printer.status;
                if from == PrinterStatus::Paused {
                    if let Some(job) = job.filter(|job| !job.status.is_terminal()) {
                        job.fail("aborted by operator", now);
                    }
                }
                printer.status = PrinterStatus::Idle;
                printer.current_job_id = None;
                printer.plate_cleared = true;
                printer.fault = None;
                Ok(from)
            })
            .await?;
        self.faults.clear(serial);
        Ok(from)
    }

    /// Run the automated clearing now, from `AWAITING_CLEARANCE` or
    /// `COOLDOWN`. The safety guard still applies.
    pub async fn force_clear(&self, serial: &Serial) -> Result<ClearingPlan> {
        let guards = &self.guards;
        self.transition(serial, JobRef::Latest, |printer, job, _| {
            expect(
                printer,
                &[PrinterStatus::AwaitingClearance, PrinterStatus::Cooldown],
                "force clear",
            )?;
            let height = job.as_ref().and_then(|job| job.metadata.part_height_mm);
            let strategy = printer.automation.strategy;
            strategy
                .check_safe(height, guards)
                .map_err(|reason| Error::UnsafeAutomationPrecondition {
                    serial: printer.serial.clone(),
                    reason,
                })?;
            let job = require(printer, job)?;

            printer.status = PrinterStatus::ClearingBed;
            printer.current_job_id = Some(job.id);
            Ok(ClearingPlan {
                strategy,
                part_height_mm: height.unwrap_or_default(),
            })
        })
        .await
    }

    /// Change automation settings. Allowed in every state.
    pub async fn update_automation_config(
        &self,
        serial: &Serial,
        update: &AutomationUpdate,
    ) -> Result<AutomationConfig> {
        if let Some(temp) = update.thermal_release_temp {
            if !temp.is_finite() || !(0.0..=MAX_RELEASE_TEMP).contains(&temp) {
                return Err(Error::InvalidArgument(format!(
                    "thermal release temperature {temp} outside 0..={MAX_RELEASE_TEMP}"
                )));
            }
        }
        if update.calibration_interval == Some(0) {
            return Err(Error::InvalidArgument("calibration interval must be at least 1".to_string()));
        }

        self.transition(serial, JobRef::None, |printer, _, _| {
            let automation = &mut printer.automation;
            if let Some(auto_eject) = update.auto_eject {
                automation.auto_eject = auto_eject;
            }
            if let Some(strategy) = update.strategy {
                automation.strategy = strategy;
            }
            if let Some(temp) = update.thermal_release_temp {
                automation.thermal_release_temp = temp;
            }
            if let Some(interval) = update.calibration_interval {
                automation.calibration_interval = interval;
            }
            Ok(automation.clone())
        })
        .await
    }

    /// Replace the printer's inventory. Returns the slot indices that changed.
    pub async fn apply_inventory(&self, serial: &Serial, slots: &[Slot]) -> Result<Vec<u32>> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            let changed = changed_indices(&printer.inventory, slots);
            if !changed.is_empty() {
                printer.inventory = slots.to_vec();
            }
            Ok(changed)
        })
        .await
    }

    /// The connection dropped. Only an idle printer goes `OFFLINE`.
    pub async fn mark_offline(&self, serial: &Serial) -> Result<bool> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            if printer.status != PrinterStatus::Idle {
                return Ok(false);
            }
            printer.status = PrinterStatus::Offline;
            Ok(true)
        })
        .await
    }

    /// The connection came back: `OFFLINE → IDLE`.
    pub async fn mark_online(&self, serial: &Serial) -> Result<bool> {
        self.transition(serial, JobRef::None, |printer, _, _| {
            if printer.status != PrinterStatus::Offline {
                return Ok(false);
            }
            printer.status = PrinterStatus::Idle;
            Ok(true)
        })
        .await
    }

    async fn load(&self, serial: &Serial, job: JobRef) -> Result<(Versioned<Printer>, Option<Versioned<Job>>)> {
        let printer = self.store.printer(serial).await?;
        let job = match (job, printer.record.current_job_id) {
            (JobRef::None, _) => None,
            (JobRef::Id(id), _) | (JobRef::Current | JobRef::Latest, Some(id)) => Some(self.store.job(id).await?),
            (JobRef::Current, None) => None,
            (JobRef::Latest, None) => self
                .store
                .jobs()
                .await?
                .into_iter()
                .filter(|job| job.record.assigned_printer.as_ref() == Some(serial))
                .max_by_key(|job| (!job.record.status.is_terminal(), job.record.updated_at, job.record.id)),
        };
        Ok((printer, job))
    }

    async fn transition<T, F>(&self, serial: &Serial, job_ref: JobRef, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut Printer, Option<&mut Job>, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (printer, job) = self.load(serial, job_ref).await?;

            let mut next_printer = printer.record.clone();
            let mut next_job = job.as_ref().map(|job| job.record.clone());
            let value = apply(&mut next_printer, next_job.as_mut(), Utc::now())?;

            if !next_printer.is_consistent() {
                return Err(Error::Store(format!(
                    "printer {serial} would be {} with job {:?}",
                    next_printer.status, next_printer.current_job_id
                )));
            }

            let from = printer.record.status;
            let to = next_printer.status;
            let mut writes = Vec::with_capacity(2);
            if next_printer != printer.record {
                writes.push(Write::printer(&printer, next_printer));
            }
            if let (Some(current), Some(next)) = (&job, next_job) {
                if next != current.record {
                    writes.push(Write::job(current, next));
                }
            }
            if writes.is_empty() {
                return Ok(value);
            }

            match self.store.commit(writes).await {
                Ok(()) => {
                    if from != to {
                        tracing::info!(serial = %serial, %from, %to, "printer transition");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_conflict() && attempt < COMMIT_ATTEMPTS => {
                    tracing::debug!(serial = %serial, attempt, "retrying transition: {}", err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Back to `IDLE` with a clear plate, counting the job towards calibration.
fn release(printer: &mut Printer) {
    printer.status = PrinterStatus::Idle;
    printer.current_job_id = None;
    printer.plate_cleared = true;
    printer.automation.record_job();
}

fn invalid(printer: &Printer, operation: &'static str) -> Error {
    Error::InvalidStateTransition {
        serial: printer.serial.clone(),
        from: printer.status,
        operation,
    }
}

fn expect(printer: &Printer, allowed: &[PrinterStatus], operation: &'static str) -> Result<()> {
    if allowed.contains(&printer.status) {
        Ok(())
    } else {
        Err(invalid(printer, operation))
    }
}

fn require<'a>(printer: &Printer, job: Option<&'a mut Job>) -> Result<&'a mut Job> {
    job.ok_or_else(|| Error::Store(format!("printer {} has no job in {}", printer.serial, printer.status)))
}
