//! The job dispatcher.
//!
//! A cycle binds pending jobs to idle printers whose loaded filament covers
//! every requirement, then hands each binding to the transport. Bindings
//! are conditional writes, so two cycles racing for the same printer or job
//! cannot both win. The loser skips the pair and the next cycle tries again.

use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeDelta, Utc};
use dashmap::DashSet;

use crate::{
    config::DispatcherConfig,
    error::{Error, Result},
    inventory::{satisfy, SlotMapping},
    job::{Job, JobId, JobStatus},
    lifecycle::Lifecycle,
    metrics::Metrics,
    printer::{Printer, Serial},
    store::{Store, Versioned},
    transport::{CommandTransport, FilePreparer, PrepareRequest, TargetSlot},
};

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchSummary {
    /// Jobs bound this cycle, with their printer.
    pub bound: Vec<(JobId, Serial)>,
    /// Bound jobs whose handoff failed.
    pub failed: Vec<JobId>,
    /// Uploads given up on as stale.
    pub expired: Vec<JobId>,
    /// Bindings lost to another writer.
    pub conflicts: u32,
}

/// Binds pending jobs to printers.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    lifecycle: Arc<Lifecycle>,
    transport: Arc<dyn CommandTransport>,
    preparer: Arc<dyn FilePreparer>,
    metrics: Arc<Metrics>,
    config: DispatcherConfig,
    /// Jobs bound by this dispatcher whose handoff has not returned yet.
    in_flight: DashSet<JobId>,
}

impl Dispatcher {
    /// A dispatcher over `store`.
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: Arc<Lifecycle>,
        transport: Arc<dyn CommandTransport>,
        preparer: Arc<dyn FilePreparer>,
        metrics: Arc<Metrics>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            transport,
            preparer,
            metrics,
            config,
            in_flight: DashSet::new(),
        }
    }

    /// Run one cycle.
    ///
    /// Faults of a single job or printer are logged and recorded on the
    /// records. Only a failing store ends the cycle early.
    pub async fn dispatch_cycle(&self) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        self.expire_stale_uploads(&mut summary).await?;

        let mut pool: Vec<Versioned<Printer>> = self
            .store
            .printers()
            .await?
            .into_iter()
            .filter(|printer| printer.record.is_available())
            .collect();

        let mut jobs: Vec<Versioned<Job>> = self
            .store
            .jobs()
            .await?
            .into_iter()
            .filter(|job| job.record.status == JobStatus::Pending)
            .collect();
        jobs.sort_by(|a, b| {
            b.record
                .priority
                .cmp(&a.record.priority)
                .then(a.record.created_at.cmp(&b.record.created_at))
                .then(a.record.id.cmp(&b.record.id))
        });

        for job in jobs {
            if pool.is_empty() {
                break;
            }
            let Some((position, mapping)) = self.select(&pool, &job.record) else {
                tracing::debug!("{}", Error::NoFeasibleMatch(job.record.id));
                continue;
            };
            let printer = pool.remove(position);
            self.bind_and_start(printer, job, mapping, &mut summary).await;
        }

        if !summary.bound.is_empty() || !summary.expired.is_empty() {
            tracing::info!(
                bound = summary.bound.len(),
                failed = summary.failed.len(),
                expired = summary.expired.len(),
                conflicts = summary.conflicts,
                "dispatch cycle finished"
            );
        }
        Ok(summary)
    }

    /// The first printer in the pool that can run `job`, and the slots to use.
    fn select(&self, pool: &[Versioned<Printer>], job: &Job) -> Option<(usize, SlotMapping)> {
        pool.iter().enumerate().find_map(|(position, printer)| {
            let printer = &printer.record;
            if job.metadata.continuous && !printer.model.supports_continuous() {
                return None;
            }
            satisfy(&printer.inventory, &job.requirements, self.config.color_threshold)
                .map(|mapping| (position, mapping))
        })
    }

    async fn bind_and_start(
        &self,
        printer: Versioned<Printer>,
        job: Versioned<Job>,
        mapping: SlotMapping,
        summary: &mut DispatchSummary,
    ) {
        let serial = printer.record.serial.clone();
        let job_id = job.record.id;

        match self.lifecycle.bind(&printer, &job).await {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                tracing::debug!(job = %job_id, serial = %serial, "binding skipped: {}", err);
                self.metrics.conflict();
                summary.conflicts += 1;
                return;
            }
            Err(err) => {
                tracing::warn!(job = %job_id, serial = %serial, "binding failed: {}", err);
                return;
            }
        }
        tracing::info!(job = %job_id, serial = %serial, slots = ?mapping.0, "job bound");
        self.metrics.binding();
        summary.bound.push((job_id, serial.clone()));
        self.in_flight.insert(job_id);

        let request = PrepareRequest {
            printer: serial.clone(),
            slots: (0..job.record.requirements.len())
                .filter_map(|requirement| mapping.slot_for(requirement))
                .filter_map(|index| printer.record.inventory.iter().find(|slot| slot.index == index))
                .map(|slot| TargetSlot {
                    index: slot.index,
                    material: slot.material.clone(),
                    color: slot.color,
                })
                .collect(),
            calibration_due: printer.record.automation.calibration_due(),
            job: job.record,
        };

        let handoff = async {
            let artifact = self.preparer.prepare(&request).await.context("preparing file")?;
            self.transport
                .start_job(&printer.record, &artifact, &mapping)
                .await
                .context("starting job")
        }
        .await;
        self.in_flight.remove(&job_id);

        match handoff {
            Ok(()) => {
                if let Err(err) = self.lifecycle.confirm_started(&serial, job_id).await {
                    // The records no longer say this job runs here, so it must not keep printing.
                    tracing::warn!(job = %job_id, serial = %serial, "job started but not confirmed, aborting: {}", err);
                    if let Err(err) = self.transport.abort(&printer.record).await {
                        tracing::error!(job = %job_id, serial = %serial, "failed to abort unconfirmed job: {:#}", err);
                    }
                }
            }
            Err(err) => {
                let failure = Error::TransportFailure {
                    serial: serial.clone(),
                    reason: format!("{err:#}"),
                };
                tracing::warn!(job = %job_id, "{}", failure);
                self.metrics.transport_failure();
                summary.failed.push(job_id);
                if let Err(err) = self
                    .lifecycle
                    .revert_binding(&serial, job_id, &failure.to_string())
                    .await
                {
                    tracing::error!(job = %job_id, serial = %serial, "failed to revert binding: {}", err);
                }
            }
        }
    }

    /// Fail jobs stuck in `UPLOADING` and release their printers.
    ///
    /// Uploads this dispatcher is still waiting on are left alone.
    async fn expire_stale_uploads(&self, summary: &mut DispatchSummary) -> Result<()> {
        let limit = TimeDelta::from_std(self.config.stale_upload())
            .map_err(|err| Error::InvalidArgument(format!("stale upload limit: {err}")))?;
        let cutoff = Utc::now() - limit;

        for job in self.store.jobs().await? {
            let job = job.record;
            if job.status != JobStatus::Uploading || job.updated_at >= cutoff || self.in_flight.contains(&job.id) {
                continue;
            }
            let Some(serial) = job.assigned_printer else {
                tracing::error!(job = %job.id, "uploading job has no printer");
                continue;
            };
            match self.lifecycle.revert_binding(&serial, job.id, "stale upload").await {
                Ok(()) => {
                    tracing::warn!(job = %job.id, serial = %serial, "stale upload failed");
                    summary.expired.push(job.id);
                }
                Err(err) => tracing::warn!(job = %job.id, "failed to expire upload: {}", err),
            }
        }
        Ok(())
    }
}
