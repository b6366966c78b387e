//! Supervision of one automated bed clearing.
//!
//! The watchdog sends the clearing motion and waits, bounded, for the
//! printer to report completion or a fault. The first fault aborts the
//! motion, pauses, and retries with boosted stepper current. The second
//! fault gives up.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::{
    clearing::ClearingPlan,
    config::WatchdogConfig,
    error::Error,
    hms::FaultTracker,
    metrics::Metrics,
    printer::{Fault, Printer},
    shutdown::Shutdown,
    transport::CommandTransport,
};

/// Attempts made before giving up.
pub const MAX_ATTEMPTS: u32 = 2;

/// What the telemetry path tells a running supervision.
#[derive(Debug, Clone, PartialEq)]
pub enum ClearingSignal {
    /// The motion finished.
    Completed,
    /// A mechanical fault. Worth one retry.
    Fault(Fault),
    /// A fault no retry will fix.
    Critical(Fault),
}

/// How a supervision ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ClearingOutcome {
    /// The plate is clear.
    Cleared {
        /// Attempts it took.
        attempts: u32,
    },
    /// Every attempt faulted.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// The last fault.
        fault: Fault,
    },
    /// Shutdown interrupted the wait. The outcome is unknown.
    Cancelled,
}

/// Runs clearing supervisions.
pub struct ClearingWatchdog {
    transport: Arc<dyn CommandTransport>,
    faults: Arc<FaultTracker>,
    metrics: Arc<Metrics>,
    config: WatchdogConfig,
}

impl ClearingWatchdog {
    /// A watchdog sending motion through `transport`.
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        faults: Arc<FaultTracker>,
        metrics: Arc<Metrics>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            transport,
            faults,
            metrics,
            config,
        }
    }

    /// Clear `printer`'s plate following `plan`.
    pub async fn supervise(
        &self,
        printer: &Printer,
        plan: ClearingPlan,
        signals: &mut mpsc::Receiver<ClearingSignal>,
        mut shutdown: Shutdown,
    ) -> ClearingOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let boost = (attempt > 1).then_some(self.config.retry_current_boost);
            tracing::info!(attempt, strategy = %plan.strategy, "starting clearing");

            let fault = match self
                .transport
                .send_maintenance_sequence(printer, &plan.script(boost))
                .await
            {
                Err(err) => fault("TRANSPORT", format!("clearing motion not sent: {err:#}")),
                Ok(()) => {
                    let waited = tokio::select! {
                        _ = shutdown.requested() => return ClearingOutcome::Cancelled,
                        waited = tokio::time::timeout(self.config.timeout(), signals.recv()) => waited,
                    };
                    match waited {
                        Ok(Some(ClearingSignal::Completed)) => {
                            tracing::info!(attempt, "clearing completed");
                            return ClearingOutcome::Cleared { attempts: attempt };
                        }
                        Ok(Some(ClearingSignal::Fault(fault))) => fault,
                        Ok(Some(ClearingSignal::Critical(fault))) => {
                            self.abort(printer).await;
                            return ClearingOutcome::Failed {
                                attempts: attempt,
                                fault,
                            };
                        }
                        Ok(None) => return ClearingOutcome::Cancelled,
                        Err(_) => fault(
                            "TIMEOUT",
                            format!("no completion within {:?}", self.config.timeout()),
                        ),
                    }
                }
            };

            let err = Error::WatchdogFault {
                serial: printer.serial.clone(),
                attempts: attempt,
                fault: format!("{} {}", fault.code, fault.description),
            };
            tracing::warn!("{}", err);
            self.abort(printer).await;

            if attempt >= MAX_ATTEMPTS {
                return ClearingOutcome::Failed {
                    attempts: attempt,
                    fault,
                };
            }

            self.metrics.watchdog_retry();
            tokio::select! {
                _ = shutdown.requested() => return ClearingOutcome::Cancelled,
                _ = tokio::time::sleep(self.config.retry_pause()) => {}
            }

            // Signals raised by the aborted attempt belong to it.
            while signals.try_recv().is_ok() {}
            self.faults.clear(&printer.serial);
        }
    }

    async fn abort(&self, printer: &Printer) {
        if let Err(err) = self.transport.abort(printer).await {
            tracing::warn!("failed to abort clearing motion: {:#}", err);
        }
    }
}

fn fault(code: &str, description: String) -> Fault {
    Fault {
        code: code.to_string(),
        description,
        at: Utc::now(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        clearing::ClearingStrategy,
        inventory::SlotMapping,
        printer::PrinterModel,
        shutdown,
        transport::Artifact,
    };

    /// Records every call. Fails the calls listed in `refuse`.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) calls: Mutex<Vec<String>>,
        pub(crate) refuse: Vec<&'static str>,
    }

    impl RecordingTransport {
        pub(crate) fn refusing(refuse: Vec<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                refuse,
            }
        }

        async fn record(&self, call: &'static str, detail: String) -> anyhow::Result<()> {
            self.calls.lock().await.push(format!("{call} {detail}"));
            if self.refuse.contains(&call) {
                anyhow::bail!("{call} refused");
            }
            Ok(())
        }

        pub(crate) async fn count(&self, call: &str) -> usize {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|c| c.split(' ').next() == Some(call))
                .count()
        }
    }

    #[async_trait]
    impl CommandTransport for RecordingTransport {
        async fn start_job(&self, printer: &Printer, artifact: &Artifact, mapping: &SlotMapping) -> anyhow::Result<()> {
            self.record("start", format!("{} {} {:?}", printer.serial, artifact.name, mapping.0))
                .await
        }

        async fn send_maintenance_sequence(&self, printer: &Printer, script: &str) -> anyhow::Result<()> {
            let boosted = if script.contains("M17 X") { "boosted" } else { "plain" };
            self.record("maintenance", format!("{} {boosted}", printer.serial)).await
        }

        async fn abort(&self, printer: &Printer) -> anyhow::Result<()> {
            self.record("abort", printer.serial.to_string()).await
        }
    }

    fn printer() -> Printer {
        Printer::new(
            "00M09A350100123".into(),
            "x1-01".to_string(),
            "10.0.0.6".to_string(),
            "12345678".to_string(),
            PrinterModel::X1Carbon,
        )
    }

    fn plan() -> ClearingPlan {
        ClearingPlan {
            strategy: ClearingStrategy::X1MechanicalSweep,
            part_height_mm: 40.0,
        }
    }

    fn stall() -> Fault {
        fault("0300-0100-0001-0001", "X-Axis Motor Stall".to_string())
    }

    fn watchdog(transport: Arc<RecordingTransport>, metrics: Arc<Metrics>) -> ClearingWatchdog {
        ClearingWatchdog::new(
            transport,
            Arc::new(FaultTracker::new()),
            metrics,
            WatchdogConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_first_time() {
        let transport = Arc::new(RecordingTransport::default());
        let watchdog = watchdog(transport.clone(), Arc::new(Metrics::new()));
        let (tx, mut rx) = mpsc::channel(8);
        let (_trigger, shutdown) = shutdown::channel();

        tx.send(ClearingSignal::Completed).await.unwrap();
        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;

        assert_eq!(outcome, ClearingOutcome::Cleared { attempts: 1 });
        assert_eq!(
            *transport.calls.lock().await,
            vec!["maintenance 00M09A350100123 plain".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_stall_then_give_up() {
        let transport = Arc::new(RecordingTransport::default());
        let metrics = Arc::new(Metrics::new());
        let watchdog = watchdog(transport.clone(), metrics.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let (_trigger, shutdown) = shutdown::channel();

        let feeder = tokio::spawn(async move {
            tx.send(ClearingSignal::Fault(stall())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(15)).await;
            tx.send(ClearingSignal::Fault(stall())).await.unwrap();
        });

        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;
        feeder.await.unwrap();

        let ClearingOutcome::Failed { attempts, fault } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(attempts, 2);
        assert_eq!(fault.code, "0300-0100-0001-0001");
        assert_eq!(
            *transport.calls.lock().await,
            vec![
                "maintenance 00M09A350100123 plain".to_string(),
                "abort 00M09A350100123".to_string(),
                "maintenance 00M09A350100123 boosted".to_string(),
                "abort 00M09A350100123".to_string(),
            ]
        );
        assert!(metrics.encode().unwrap().contains("print_farm_watchdog_retries_total 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds() {
        let transport = Arc::new(RecordingTransport::default());
        let watchdog = watchdog(transport.clone(), Arc::new(Metrics::new()));
        let (tx, mut rx) = mpsc::channel(8);
        let (_trigger, shutdown) = shutdown::channel();

        let feeder = tokio::spawn(async move {
            tx.send(ClearingSignal::Fault(stall())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(15)).await;
            tx.send(ClearingSignal::Completed).await.unwrap();
        });

        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;
        feeder.await.unwrap();
        assert_eq!(outcome, ClearingOutcome::Cleared { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_a_fault() {
        let transport = Arc::new(RecordingTransport::default());
        let watchdog = watchdog(transport.clone(), Arc::new(Metrics::new()));
        let (_tx, mut rx) = mpsc::channel(8);
        let (_trigger, shutdown) = shutdown::channel();

        let start = tokio::time::Instant::now();
        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;

        let ClearingOutcome::Failed { attempts, fault } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(attempts, 2);
        assert_eq!(fault.code, "TIMEOUT");
        assert_eq!(start.elapsed(), Duration::from_secs(120 + 10 + 120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_fault_skips_retry() {
        let transport = Arc::new(RecordingTransport::default());
        let watchdog = watchdog(transport.clone(), Arc::new(Metrics::new()));
        let (tx, mut rx) = mpsc::channel(8);
        let (_trigger, shutdown) = shutdown::channel();

        tx.send(ClearingSignal::Critical(fault("0C00-0100-0001-0001", "chamber".to_string())))
            .await
            .unwrap();
        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;

        assert!(matches!(outcome, ClearingOutcome::Failed { attempts: 1, .. }));
        assert_eq!(transport.count("maintenance").await, 1);
        assert_eq!(transport.count("abort").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_wait() {
        let transport = Arc::new(RecordingTransport::default());
        let watchdog = watchdog(transport.clone(), Arc::new(Metrics::new()));
        let (_tx, mut rx) = mpsc::channel(8);
        let (trigger, shutdown) = shutdown::channel();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.fire();
        });
        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;
        stopper.await.unwrap();

        assert_eq!(outcome, ClearingOutcome::Cancelled);
        assert_eq!(transport.count("abort").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_motion_counts_as_fault() {
        let transport = Arc::new(RecordingTransport::refusing(vec!["maintenance"]));
        let watchdog = watchdog(transport.clone(), Arc::new(Metrics::new()));
        let (_tx, mut rx) = mpsc::channel(8);
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = watchdog.supervise(&printer(), plan(), &mut rx, shutdown).await;

        let ClearingOutcome::Failed { fault, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(fault.code, "TRANSPORT");
        assert_eq!(transport.count("maintenance").await, 2);
    }
}
