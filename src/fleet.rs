//! The running engine.
//!
//! A [`Fleet`] wires the store, cache and device collaborators to the state
//! machine, runs one listener per printer and the periodic dispatcher, and
//! exposes the operator operations.

use std::sync::Arc;

use async_trait::async_trait;
use bambulabs::message::GcodeState;
use chrono::Utc;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinSet,
};
use tracing::Instrument;

use crate::{
    cache::SnapshotCache,
    clearing::ClearingPlan,
    config::Config,
    dispatch::{DispatchSummary, Dispatcher},
    error::{Error, Result},
    hms::{FaultTracker, HmsEvent, Severity},
    job::{Job, JobFilter, NewJob},
    lifecycle::Lifecycle,
    metrics::Metrics,
    printer::{AutomationConfig, AutomationUpdate, Fault, Printer, PrinterStatus, Serial},
    shutdown::{self, Shutdown, Trigger},
    store::Store,
    telemetry::{read_snapshot, Connector, Listener, TelemetryEvent, TelemetrySink, TelemetrySnapshot},
    transport::{CommandTransport, FilePreparer},
    watchdog::{ClearingOutcome, ClearingSignal, ClearingWatchdog},
};

/// The services the engine runs against.
pub struct Collaborators {
    /// Durable records.
    pub store: Arc<dyn Store>,
    /// Hot snapshots.
    pub cache: Arc<dyn SnapshotCache>,
    /// Opens report streams.
    pub connector: Arc<dyn Connector>,
    /// Sends work to printers.
    pub transport: Arc<dyn CommandTransport>,
    /// Produces print files.
    pub preparer: Arc<dyn FilePreparer>,
}

/// A printer as the operator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PrinterState {
    /// The durable record.
    pub printer: Printer,
    /// The latest telemetry, if the printer reported recently.
    pub snapshot: Option<TelemetrySnapshot>,
}

/// The print farm engine.
pub struct Fleet {
    engine: Arc<Engine>,
    trigger: Trigger,
}

pub(crate) struct Engine {
    store: Arc<dyn Store>,
    cache: Arc<dyn SnapshotCache>,
    connector: Arc<dyn Connector>,
    transport: Arc<dyn CommandTransport>,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<Dispatcher>,
    watchdog: Arc<ClearingWatchdog>,
    faults: Arc<FaultTracker>,
    metrics: Arc<Metrics>,
    config: Config,
    supervisions: Arc<DashMap<Serial, mpsc::Sender<ClearingSignal>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    shutdown: Shutdown,
}

impl Fleet {
    /// Build the engine. Nothing runs until [`Fleet::start`].
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            cache,
            connector,
            transport,
            preparer,
        } = collaborators;
        let faults = Arc::new(FaultTracker::new());
        let metrics = Arc::new(Metrics::new());
        let lifecycle = Arc::new(Lifecycle::new(store.clone(), faults.clone(), config.clearing.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            lifecycle.clone(),
            transport.clone(),
            preparer,
            metrics.clone(),
            config.dispatcher.clone(),
        ));
        let watchdog = Arc::new(ClearingWatchdog::new(
            transport.clone(),
            faults.clone(),
            metrics.clone(),
            config.watchdog.clone(),
        ));
        let (trigger, shutdown) = shutdown::channel();

        Fleet {
            engine: Arc::new(Engine {
                store,
                cache,
                connector,
                transport,
                lifecycle,
                dispatcher,
                watchdog,
                faults,
                metrics,
                config,
                supervisions: Arc::new(DashMap::new()),
                tasks: Arc::new(Mutex::new(JoinSet::new())),
                shutdown,
            }),
            trigger,
        }
    }

    /// Add a printer to the store.
    pub async fn register_printer(&self, printer: Printer) -> Result<()> {
        tracing::info!(serial = %printer.serial, model = %printer.model, "registering printer");
        self.engine.store.insert_printer(printer).await?;
        Ok(())
    }

    /// Start a listener for every stored printer and the periodic dispatcher.
    pub async fn start(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.config.dispatcher.interval().is_zero() {
            return Err(Error::InvalidArgument("dispatch interval must not be zero".to_string()));
        }
        let printers = engine.store.printers().await?;
        let mut tasks = engine.tasks.lock().await;

        for printer in printers {
            let span = tracing::info_span!("listener", serial = %printer.record.serial);
            let listener = Listener::new(
                printer.record,
                engine.connector.clone(),
                engine.clone(),
                engine.cache.clone(),
                engine.faults.clone(),
                engine.config.telemetry.clone(),
            );
            tasks.spawn(listener.run(engine.shutdown.clone()).instrument(span));
        }

        let dispatcher = engine.dispatcher.clone();
        let period = engine.config.dispatcher.interval();
        let mut shutdown = engine.shutdown.clone();
        tasks.spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.requested() => return,
                        _ = interval.tick() => {}
                    }
                    if let Err(err) = dispatcher.dispatch_cycle().await {
                        tracing::error!("dispatch cycle failed: {}", err);
                    }
                }
            }
            .instrument(tracing::info_span!("dispatcher")),
        );

        tracing::info!(tasks = tasks.len(), "fleet started");
        Ok(())
    }

    /// Stop every task and wait for them. A clearing in progress is left
    /// as it is.
    pub async fn shutdown(&self) {
        self.trigger.fire();
        loop {
            let mut tasks = std::mem::take(&mut *self.engine.tasks.lock().await);
            if tasks.is_empty() {
                break;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    tracing::error!("task ended abnormally: {}", err);
                }
            }
        }
        tracing::info!("fleet stopped");
    }

    /// Submit a job. It waits in `PENDING` for the dispatcher.
    pub async fn enqueue_job(&self, job: NewJob) -> Result<Job> {
        if job.requirements.is_empty() {
            return Err(Error::InvalidArgument("a job needs at least one requirement".to_string()));
        }
        if let Some(blank) = job.requirements.iter().position(|r| r.material.trim().is_empty()) {
            return Err(Error::InvalidArgument(format!("requirement {blank} has no material")));
        }
        let job = self.engine.store.create_job(job).await?.record;
        tracing::info!(job = %job.id, priority = job.priority, requirements = job.requirements.len(), "job enqueued");
        Ok(job)
    }

    /// Jobs passing `filter`, oldest first.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .engine
            .store
            .jobs()
            .await?
            .into_iter()
            .map(|job| job.record)
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    /// Every printer, by serial.
    pub async fn list_printers(&self) -> Result<Vec<Printer>> {
        Ok(self
            .engine
            .store
            .printers()
            .await?
            .into_iter()
            .map(|printer| printer.record)
            .collect())
    }

    /// A printer's record and latest telemetry.
    pub async fn printer_state(&self, serial: &Serial) -> Result<PrinterState> {
        let printer = self.engine.store.printer(serial).await?.record;
        let snapshot = match read_snapshot(self.engine.cache.as_ref(), serial).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(serial = %serial, "snapshot unavailable: {}", err);
                None
            }
        };
        Ok(PrinterState { printer, snapshot })
    }

    /// The operator removed the part.
    pub async fn confirm_manual_clearance(&self, serial: &Serial) -> Result<()> {
        self.engine.lifecycle.confirm_manual_clearance(serial).await
    }

    /// The operator dealt with a fault or a paused print. A paused print is
    /// stopped on the device.
    pub async fn acknowledge_error(&self, serial: &Serial) -> Result<()> {
        let from = self.engine.lifecycle.acknowledge_error(serial).await?;
        if from == PrinterStatus::Paused {
            let printer = self.engine.store.printer(serial).await?.record;
            if let Err(err) = self.engine.transport.abort(&printer).await {
                tracing::warn!(serial = %serial, "failed to stop paused print: {:#}", err);
            }
        }
        Ok(())
    }

    /// Run the automated clearing now.
    pub async fn force_clear(&self, serial: &Serial) -> Result<ClearingPlan> {
        let plan = self.engine.lifecycle.force_clear(serial).await?;
        self.engine.start_clearing(serial, plan).await?;
        Ok(plan)
    }

    /// Change a printer's automation settings.
    pub async fn update_automation_config(
        &self,
        serial: &Serial,
        update: &AutomationUpdate,
    ) -> Result<AutomationConfig> {
        self.engine.lifecycle.update_automation_config(serial, update).await
    }

    /// Run one dispatch cycle now.
    pub async fn dispatch_cycle(&self) -> Result<DispatchSummary> {
        self.engine.dispatcher.dispatch_cycle().await
    }

    /// The fleet's metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.engine.metrics
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> Arc<dyn TelemetrySink> {
        self.engine.clone()
    }
}

impl Engine {
    async fn route(&self, serial: &Serial, event: TelemetryEvent) -> Result<()> {
        match event {
            TelemetryEvent::Connected => {
                self.lifecycle.mark_online(serial).await?;
            }
            TelemetryEvent::Disconnected => {
                self.lifecycle.mark_offline(serial).await?;
            }
            TelemetryEvent::StateChanged { from, to } => self.state_changed(serial, from, to).await?,
            TelemetryEvent::BedTemperature(temperature) => {
                if let Some(plan) = self.lifecycle.bed_temperature(serial, temperature).await? {
                    self.start_clearing(serial, plan).await?;
                }
            }
            TelemetryEvent::InventoryChanged(slots) => {
                let changed = self.lifecycle.apply_inventory(serial, &slots).await?;
                if !changed.is_empty() {
                    tracing::info!(serial = %serial, slots = ?changed, "inventory changed");
                }
            }
            TelemetryEvent::Fault(event) => self.fault(serial, event).await?,
            TelemetryEvent::PrintError(description) => {
                let fault = Fault {
                    code: "PRINT_ERROR".to_string(),
                    description,
                    at: Utc::now(),
                };
                if !self.signal(serial, ClearingSignal::Fault(fault.clone())) {
                    tracing::warn!(serial = %serial, "print error: {}", fault.description);
                }
            }
        }
        Ok(())
    }

    async fn state_changed(&self, serial: &Serial, from: Option<GcodeState>, to: GcodeState) -> Result<()> {
        let status = self.store.printer(serial).await?.record.status;
        match (status, &to) {
            (PrinterStatus::ClearingBed, GcodeState::Finish | GcodeState::Idle) if from.is_some() => {
                self.signal(serial, ClearingSignal::Completed);
            }
            (PrinterStatus::ClearingBed, GcodeState::Failed) => {
                let fault = Fault {
                    code: "FAILED".to_string(),
                    description: "clearing motion failed on the device".to_string(),
                    at: Utc::now(),
                };
                self.signal(serial, ClearingSignal::Fault(fault));
            }
            (PrinterStatus::Printing, GcodeState::Finish) => {
                let next = self.lifecycle.print_finished(serial).await?;
                tracing::info!(serial = %serial, next = %next, "print finished");
            }
            (PrinterStatus::Printing | PrinterStatus::Paused, GcodeState::Failed) => {
                self.lifecycle.print_failed(serial, "print failed on the device").await?;
            }
            (PrinterStatus::Printing, GcodeState::Pause) => self.lifecycle.paused(serial).await?,
            (PrinterStatus::Paused, GcodeState::Running) => self.lifecycle.resumed(serial).await?,
            _ => tracing::debug!(serial = %serial, %status, ?from, %to, "device state"),
        }
        Ok(())
    }

    async fn fault(&self, serial: &Serial, event: HmsEvent) -> Result<()> {
        let status = self.store.printer(serial).await?.record.status;
        let critical = event.severity == Severity::Critical;

        if status == PrinterStatus::ClearingBed {
            let signal = if event.module.is_mechanical() {
                Some(ClearingSignal::Fault((&event).into()))
            } else if critical {
                Some(ClearingSignal::Critical((&event).into()))
            } else {
                None
            };
            if let Some(signal) = signal {
                if self.signal(serial, signal) {
                    return Ok(());
                }
            }
        }

        if critical {
            let err = Error::CriticalHardwareFault {
                serial: serial.clone(),
                event: event.clone(),
            };
            tracing::error!(code = %event.code, "{}", err);
            self.lifecycle.critical_fault(serial, &event).await?;
        } else {
            tracing::warn!(serial = %serial, code = %event.code, severity = %event.severity, "{}", event.description);
        }
        Ok(())
    }

    /// Pass a signal to the printer's running supervision, if there is one.
    ///
    /// Never waits: this runs on the listener, which must keep reading. A
    /// signal that finds the supervision's queue full is dropped.
    fn signal(&self, serial: &Serial, signal: ClearingSignal) -> bool {
        let Some(sender) = self.supervisions.get(serial).map(|s| s.clone()) else {
            return false;
        };
        match sender.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                tracing::warn!(serial = %serial, ?signal, "clearing supervision busy, signal dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    async fn start_clearing(&self, serial: &Serial, plan: ClearingPlan) -> Result<()> {
        let printer = self.store.printer(serial).await?.record;
        let (sender, mut signals) = mpsc::channel(16);
        self.supervisions.insert(serial.clone(), sender);

        let lifecycle = self.lifecycle.clone();
        let watchdog = self.watchdog.clone();
        let metrics = self.metrics.clone();
        let supervisions = self.supervisions.clone();
        let shutdown = self.shutdown.clone();
        let span = tracing::info_span!("clearing", serial = %serial);

        self.tasks.lock().await.spawn(
            async move {
                let serial = printer.serial.clone();
                let outcome = watchdog.supervise(&printer, plan, &mut signals, shutdown).await;
                supervisions.remove(&serial);

                let recorded = match outcome {
                    ClearingOutcome::Cleared { attempts } => {
                        tracing::info!(attempts, "plate cleared");
                        lifecycle.clearing_succeeded(&serial).await
                    }
                    ClearingOutcome::Failed { attempts, fault } => {
                        tracing::error!(attempts, code = %fault.code, "clearing failed");
                        metrics.watchdog_fault();
                        lifecycle.clearing_failed(&serial, fault).await
                    }
                    ClearingOutcome::Cancelled => {
                        tracing::warn!("clearing interrupted, printer left for inspection");
                        Ok(())
                    }
                };
                if let Err(err) = recorded {
                    tracing::error!("failed to record clearing outcome: {}", err);
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for Engine {
    async fn handle(&self, serial: &Serial, event: TelemetryEvent) {
        if let Err(err) = self.route(serial, event).await {
            tracing::warn!(serial = %serial, "telemetry event not applied: {}", err);
        }
    }

    async fn snapshot(&self, serial: &Serial, snapshot: &TelemetrySnapshot) {
        self.metrics.observe(serial, snapshot);
    }
}
