//! End to end runs of the engine against in-memory services and scripted
//! printers.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bambulabs::message::{GcodeState, PushStatus};
use pretty_assertions::assert_eq;
use testresult::TestResult;
use tokio::sync::{mpsc, Mutex};

use crate::{
    cache::MemoryCache,
    clearing::ClearingStrategy,
    config::Config,
    dispatch::tests::{new_job, slot, NamedPreparer},
    error::Error,
    fleet::{Collaborators, Fleet},
    hms,
    inventory::Slot,
    job::{JobFilter, JobStatus, NewJob},
    printer::{AutomationConfig, AutomationUpdate, Printer, PrinterModel, PrinterStatus, Serial},
    store::{MemoryStore, Store},
    telemetry::{Connector, ReportStream, TelemetryEvent, TelemetrySink},
    watchdog::tests::RecordingTransport,
};

const A1: &str = "03919A3B1800123";
const X1C: &str = "00M09A350100123";

/// Hands out one stream fed by the test. Later connects never complete.
struct ChannelConnector(Mutex<Option<mpsc::Receiver<PushStatus>>>);

struct ChannelStream(mpsc::Receiver<PushStatus>);

#[async_trait]
impl ReportStream for ChannelStream {
    async fn next_report(&mut self) -> anyhow::Result<PushStatus> {
        self.0.recv().await.ok_or_else(|| anyhow::anyhow!("printer went away"))
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _printer: &Printer) -> anyhow::Result<Box<dyn ReportStream>> {
        let reports = self.0.lock().await.take();
        match reports {
            Some(reports) => Ok(Box::new(ChannelStream(reports))),
            None => std::future::pending().await,
        }
    }
}

struct Farm {
    fleet: Fleet,
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
    reports: mpsc::Sender<PushStatus>,
}

impl Farm {
    fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let (reports, receiver) = mpsc::channel(16);
        let fleet = Fleet::new(
            config,
            Collaborators {
                store: store.clone(),
                cache: Arc::new(MemoryCache::new()),
                connector: Arc::new(ChannelConnector(Mutex::new(Some(receiver)))),
                transport: transport.clone(),
                preparer: Arc::new(NamedPreparer),
            },
        );
        Farm {
            fleet,
            store,
            transport,
            reports,
        }
    }

    async fn printer(
        &self,
        serial: &str,
        model: PrinterModel,
        inventory: Vec<Slot>,
        automation: AutomationConfig,
    ) -> Serial {
        let mut printer = Printer::new(
            serial.into(),
            serial.to_lowercase(),
            "10.0.0.5".to_string(),
            "12345678".to_string(),
            model,
        );
        printer.inventory = inventory;
        printer.automation = automation;
        self.fleet.register_printer(printer).await.unwrap();
        serial.into()
    }

    async fn status(&self, serial: &Serial) -> PrinterStatus {
        self.store.printer(serial).await.unwrap().record.status
    }

    async fn event(&self, serial: &Serial, event: TelemetryEvent) {
        self.fleet.sink().handle(serial, event).await;
    }

    async fn report(&self, json: &str) {
        let report: PushStatus = serde_json::from_str(json).unwrap();
        self.reports.send(report).await.unwrap();
    }

    async fn wait_for_status(&self, serial: &Serial, status: PrinterStatus) -> Printer {
        for _ in 0..200 {
            let printer = self.store.printer(serial).await.unwrap().record;
            if printer.status == status {
                return printer;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{serial} never reached {status}, is {}", self.status(serial).await);
    }

    async fn wait_for_calls(&self, call: &str, count: usize) {
        for _ in 0..200 {
            if self.transport.count(call).await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {count} {call} calls, got {:?}", self.transport.calls.lock().await);
    }
}

fn auto_eject(strategy: ClearingStrategy) -> AutomationConfig {
    AutomationConfig {
        auto_eject: true,
        strategy,
        ..Default::default()
    }
}

fn tall_job(requirements: &[(&str, &str)], height: f64) -> NewJob {
    let mut job = new_job(requirements, 0);
    job.metadata.part_height_mm = Some(height);
    job
}

fn finished() -> TelemetryEvent {
    TelemetryEvent::StateChanged {
        from: Some(GcodeState::Running),
        to: GcodeState::Finish,
    }
}

fn two_pla_slots() -> Vec<Slot> {
    vec![slot(0, "PLA", "#FFFFFF", 1.0), slot(1, "PLA", "#FF0000", 0.5)]
}

#[tokio::test]
async fn test_exact_color_binds_first_slot() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    let job = farm.fleet.enqueue_job(new_job(&[("PLA", "#FFFFFF")], 0)).await?;

    let summary = farm.fleet.dispatch_cycle().await?;

    assert_eq!(summary.bound, vec![(job.id, serial.clone())]);
    assert_eq!(
        *farm.transport.calls.lock().await,
        vec![format!("start {A1} job-1.3mf [0]")]
    );
    assert_eq!(farm.status(&serial).await, PrinterStatus::Printing);
    Ok(())
}

#[tokio::test]
async fn test_near_color_binds_substitute_slot() -> TestResult {
    let mut config = Config::default();
    config.dispatcher.color_threshold = 10.0;
    let farm = Farm::new(config);
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    farm.fleet.enqueue_job(new_job(&[("PLA", "#FF3333")], 0)).await?;

    farm.fleet.dispatch_cycle().await?;

    assert_eq!(
        *farm.transport.calls.lock().await,
        vec![format!("start {A1} job-1.3mf [1]")]
    );
    assert_eq!(farm.status(&serial).await, PrinterStatus::Printing);
    Ok(())
}

#[tokio::test]
async fn test_missing_material_leaves_job_pending() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    let job = farm.fleet.enqueue_job(new_job(&[("PETG", "#000000")], 0)).await?;

    let summary = farm.fleet.dispatch_cycle().await?;

    assert!(summary.bound.is_empty());
    assert_eq!(farm.fleet.list_jobs(JobFilter::default()).await?, vec![job]);
    assert_eq!(farm.status(&serial).await, PrinterStatus::Idle);
    assert_eq!(farm.transport.count("start").await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_finished_print_cools_then_clears_once() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(
            A1,
            PrinterModel::A1,
            two_pla_slots(),
            auto_eject(ClearingStrategy::A1GantrySweep),
        )
        .await;
    let job = farm.fleet.enqueue_job(tall_job(&[("PLA", "#FFFFFF")], 60.0)).await?;

    farm.fleet.start().await?;
    farm.wait_for_status(&serial, PrinterStatus::Printing).await;

    farm.report(r#"{"gcode_state": "RUNNING", "bed_temper": 60.0, "mc_percent": 98}"#).await;
    farm.report(r#"{"gcode_state": "FINISH", "bed_temper": 55.0, "mc_percent": 100}"#).await;
    farm.wait_for_status(&serial, PrinterStatus::Cooldown).await;

    farm.report(r#"{"bed_temper": 30.0}"#).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::Cooldown);
    assert_eq!(farm.transport.count("maintenance").await, 0);

    farm.report(r#"{"bed_temper": 27.5}"#).await;
    let clearing = farm.wait_for_status(&serial, PrinterStatus::ClearingBed).await;
    assert_eq!(clearing.current_job_id, Some(job.id));
    farm.wait_for_calls("maintenance", 1).await;

    let state = farm.fleet.printer_state(&serial).await?;
    assert_eq!(state.snapshot.and_then(|s| s.bed_temp), Some(27.5));

    farm.report(r#"{"gcode_state": "RUNNING"}"#).await;
    farm.report(r#"{"gcode_state": "FINISH"}"#).await;
    let idle = farm.wait_for_status(&serial, PrinterStatus::Idle).await;

    assert!(idle.plate_cleared);
    assert_eq!(idle.current_job_id, None);
    assert_eq!(idle.automation.jobs_since_calibration, 1);
    assert_eq!(farm.transport.count("maintenance").await, 1);
    assert_eq!(farm.store.job(job.id).await?.record.status, JobStatus::Finished);

    farm.fleet.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_repeated_stall_ends_in_error_until_acknowledged() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(
            X1C,
            PrinterModel::X1Carbon,
            two_pla_slots(),
            auto_eject(ClearingStrategy::X1MechanicalSweep),
        )
        .await;
    farm.fleet.enqueue_job(tall_job(&[("PLA", "#FFFFFF")], 40.0)).await?;
    farm.fleet.dispatch_cycle().await?;

    farm.event(&serial, finished()).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::Cooldown);
    farm.event(&serial, TelemetryEvent::BedTemperature(25.0)).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::ClearingBed);
    farm.wait_for_calls("maintenance", 1).await;

    let stall = "0300-0100-0001-0001";
    farm.event(&serial, TelemetryEvent::Fault(hms::classify(stall))).await;
    farm.wait_for_calls("maintenance", 2).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::ClearingBed);

    farm.event(&serial, TelemetryEvent::Fault(hms::classify(stall))).await;
    let failed = farm.wait_for_status(&serial, PrinterStatus::Error).await;

    assert_eq!(failed.fault.map(|f| f.code).as_deref(), Some(stall));
    assert_eq!(failed.current_job_id, None);
    assert_eq!(
        *farm.transport.calls.lock().await,
        vec![
            format!("start {X1C} job-1.3mf [0]"),
            format!("maintenance {X1C} plain"),
            format!("abort {X1C}"),
            format!("maintenance {X1C} boosted"),
            format!("abort {X1C}"),
        ]
    );
    assert!(farm
        .fleet
        .metrics()
        .encode()?
        .contains("print_farm_watchdog_faults_total 1"));

    farm.fleet.acknowledge_error(&serial).await?;
    let idle = farm.store.printer(&serial).await?.record;
    assert_eq!(idle.status, PrinterStatus::Idle);
    assert!(idle.plate_cleared);
    assert_eq!(idle.fault, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lasting_print_error_fails_retry_without_timeout() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(
            X1C,
            PrinterModel::X1Carbon,
            two_pla_slots(),
            auto_eject(ClearingStrategy::X1MechanicalSweep),
        )
        .await;
    farm.fleet.enqueue_job(tall_job(&[("PLA", "#FFFFFF")], 40.0)).await?;

    farm.fleet.start().await?;
    farm.wait_for_status(&serial, PrinterStatus::Printing).await;
    farm.report(r#"{"gcode_state": "RUNNING", "bed_temper": 60.0}"#).await;
    farm.report(r#"{"gcode_state": "FINISH", "bed_temper": 55.0}"#).await;
    farm.wait_for_status(&serial, PrinterStatus::Cooldown).await;
    farm.report(r#"{"bed_temper": 25.0}"#).await;
    farm.wait_for_calls("maintenance", 1).await;

    farm.report(r#"{"print_error": 50348044}"#).await;
    farm.wait_for_calls("maintenance", 2).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::ClearingBed);

    let retried = tokio::time::Instant::now();
    farm.report(r#"{"print_error": 50348044}"#).await;
    let failed = farm.wait_for_status(&serial, PrinterStatus::Error).await;

    assert!(retried.elapsed() < Config::default().watchdog.timeout());
    let fault = failed.fault.ok_or("no fault recorded")?;
    assert_eq!(fault.code, "PRINT_ERROR");
    assert_eq!(fault.description, "0300-400C");

    farm.fleet.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_signal_flood_during_retry_pause_does_not_block_telemetry() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(
            X1C,
            PrinterModel::X1Carbon,
            two_pla_slots(),
            auto_eject(ClearingStrategy::X1MechanicalSweep),
        )
        .await;
    farm.fleet.enqueue_job(tall_job(&[("PLA", "#FFFFFF")], 40.0)).await?;
    farm.fleet.dispatch_cycle().await?;
    farm.event(&serial, finished()).await;
    farm.event(&serial, TelemetryEvent::BedTemperature(25.0)).await;
    farm.wait_for_calls("maintenance", 1).await;

    let stall = hms::classify("0300-0100-0001-0001");
    farm.event(&serial, TelemetryEvent::Fault(stall.clone())).await;
    farm.wait_for_calls("abort", 1).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        for _ in 0..40 {
            farm.event(&serial, TelemetryEvent::Fault(stall.clone())).await;
        }
    })
    .await?;

    farm.wait_for_calls("maintenance", 2).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::ClearingBed);

    farm.event(&serial, finished()).await;
    let idle = farm.wait_for_status(&serial, PrinterStatus::Idle).await;
    assert!(idle.plate_cleared);
    Ok(())
}

#[tokio::test]
async fn test_manual_clearance_only_when_awaited() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;

    let err = farm.fleet.confirm_manual_clearance(&serial).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidStateTransition {
            from: PrinterStatus::Idle,
            ..
        }
    ));
    assert_eq!(farm.status(&serial).await, PrinterStatus::Idle);

    farm.fleet.enqueue_job(new_job(&[("PLA", "#FFFFFF")], 0)).await?;
    farm.fleet.dispatch_cycle().await?;
    farm.event(&serial, finished()).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::AwaitingClearance);

    // Not available until the plate is confirmed clear.
    farm.fleet.enqueue_job(new_job(&[("PLA", "#FFFFFF")], 0)).await?;
    assert!(farm.fleet.dispatch_cycle().await?.bound.is_empty());

    farm.fleet.confirm_manual_clearance(&serial).await?;
    assert_eq!(farm.status(&serial).await, PrinterStatus::Idle);
    assert_eq!(farm.fleet.dispatch_cycle().await?.bound.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_short_part_falls_back_to_manual() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(
            A1,
            PrinterModel::A1,
            two_pla_slots(),
            auto_eject(ClearingStrategy::A1GantrySweep),
        )
        .await;
    farm.fleet.enqueue_job(tall_job(&[("PLA", "#FFFFFF")], 20.0)).await?;
    farm.fleet.dispatch_cycle().await?;

    farm.event(&serial, finished()).await;

    assert_eq!(farm.status(&serial).await, PrinterStatus::AwaitingClearance);
    let err = farm.fleet.force_clear(&serial).await.unwrap_err();
    assert!(matches!(err, Error::UnsafeAutomationPrecondition { .. }), "{err}");
    assert_eq!(farm.transport.count("maintenance").await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_force_clear_after_enabling_automation() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    farm.fleet.enqueue_job(tall_job(&[("PLA", "#FFFFFF")], 70.0)).await?;
    farm.fleet.dispatch_cycle().await?;
    farm.event(&serial, finished()).await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::AwaitingClearance);

    let automation = farm
        .fleet
        .update_automation_config(
            &serial,
            &AutomationUpdate {
                auto_eject: Some(true),
                strategy: Some(ClearingStrategy::A1ToolheadPush),
                ..Default::default()
            },
        )
        .await?;
    assert!(automation.auto_eject);

    let plan = farm.fleet.force_clear(&serial).await?;
    assert_eq!(plan.strategy, ClearingStrategy::A1ToolheadPush);
    assert_eq!(farm.status(&serial).await, PrinterStatus::ClearingBed);
    farm.wait_for_calls("maintenance", 1).await;

    farm.event(&serial, finished()).await;
    let idle = farm.wait_for_status(&serial, PrinterStatus::Idle).await;
    assert!(idle.plate_cleared);
    Ok(())
}

#[tokio::test]
async fn test_acknowledging_pause_aborts_the_job() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    let job = farm.fleet.enqueue_job(new_job(&[("PLA", "#FFFFFF")], 0)).await?;
    farm.fleet.dispatch_cycle().await?;

    farm.event(
        &serial,
        TelemetryEvent::StateChanged {
            from: Some(GcodeState::Running),
            to: GcodeState::Pause,
        },
    )
    .await;
    assert_eq!(farm.status(&serial).await, PrinterStatus::Paused);

    farm.fleet.acknowledge_error(&serial).await?;

    assert_eq!(farm.status(&serial).await, PrinterStatus::Idle);
    let job = farm.store.job(job.id).await?.record;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_reason.as_deref(), Some("aborted by operator"));
    assert_eq!(farm.transport.count("abort").await, 1);
    Ok(())
}

#[tokio::test]
async fn test_critical_fault_while_printing() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    let job = farm.fleet.enqueue_job(new_job(&[("PLA", "#FFFFFF")], 0)).await?;
    farm.fleet.dispatch_cycle().await?;

    farm.event(&serial, TelemetryEvent::Fault(hms::classify("0300-0200-0001-0001")))
        .await;

    let printer = farm.store.printer(&serial).await?.record;
    assert_eq!(printer.status, PrinterStatus::Error);
    assert_eq!(printer.current_job_id, None);
    assert_eq!(farm.store.job(job.id).await?.record.status, JobStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_warning_fault_changes_nothing() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    farm.fleet.enqueue_job(new_job(&[("PLA", "#FFFFFF")], 0)).await?;
    farm.fleet.dispatch_cycle().await?;

    farm.event(&serial, TelemetryEvent::Fault(hms::classify("0700-0100-0001-0001")))
        .await;

    assert_eq!(farm.status(&serial).await, PrinterStatus::Printing);
    Ok(())
}

#[tokio::test]
async fn test_offline_only_when_idle() -> TestResult {
    let farm = Farm::new(Config::default());
    let idle = farm
        .printer(A1, PrinterModel::A1, two_pla_slots(), AutomationConfig::default())
        .await;
    let busy = farm
        .printer(X1C, PrinterModel::X1Carbon, two_pla_slots(), AutomationConfig::default())
        .await;
    farm.fleet.enqueue_job(new_job(&[("PLA", "#FF0000")], 0)).await?;
    farm.fleet.enqueue_job(new_job(&[("PLA", "#FF0000")], 0)).await?;
    farm.fleet.dispatch_cycle().await?;
    farm.event(&idle, finished()).await;
    farm.fleet.confirm_manual_clearance(&idle).await?;

    farm.event(&idle, TelemetryEvent::Disconnected).await;
    farm.event(&busy, TelemetryEvent::Disconnected).await;
    assert_eq!(farm.status(&idle).await, PrinterStatus::Offline);
    assert_eq!(farm.status(&busy).await, PrinterStatus::Printing);

    // An offline printer is never dispatched to.
    assert!(farm.fleet.dispatch_cycle().await?.bound.is_empty());

    farm.event(&idle, TelemetryEvent::Connected).await;
    assert_eq!(farm.status(&idle).await, PrinterStatus::Idle);
    assert_eq!(farm.fleet.dispatch_cycle().await?.bound.len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_inventory_reports_update_the_printer() -> TestResult {
    let farm = Farm::new(Config::default());
    let serial = farm
        .printer(A1, PrinterModel::A1, Vec::new(), AutomationConfig::default())
        .await;
    let job = farm.fleet.enqueue_job(new_job(&[("PETG", "#000000")], 0)).await?;
    assert!(farm.fleet.dispatch_cycle().await?.bound.is_empty());

    farm.event(
        &serial,
        TelemetryEvent::InventoryChanged(vec![slot(2, "PETG", "#000000", 0.8)]),
    )
    .await;

    assert_eq!(farm.fleet.dispatch_cycle().await?.bound, vec![(job.id, serial)]);
    Ok(())
}

#[tokio::test]
async fn test_enqueue_validates_requirements() -> TestResult {
    let farm = Farm::new(Config::default());

    let err = farm.fleet.enqueue_job(new_job(&[], 0)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
    let err = farm.fleet.enqueue_job(new_job(&[(" ", "#000000")], 0)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");

    let bad_color = serde_json::from_value::<NewJob>(serde_json::json!({
        "requirements": [{"material": "PLA", "color": "white"}]
    }));
    assert!(bad_color.unwrap_err().to_string().contains("invalid color format"));

    assert!(farm.fleet.list_jobs(JobFilter::default()).await?.is_empty());
    Ok(())
}
