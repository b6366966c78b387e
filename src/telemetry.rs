//! Telemetry ingestion.
//!
//! One [`Listener`] per printer keeps a subscription to the printer's report
//! channel alive, reconnecting with exponential backoff for as long as the
//! process runs. Each report is merged into the printer's running view and
//! split two ways:
//!
//! - a hot [`TelemetrySnapshot`], written to the [`SnapshotCache`] with a
//!   short lifetime so a dead connection shows up as stale on its own;
//! - discrete [`TelemetryEvent`]s, handed to a [`TelemetrySink`] in arrival
//!   order, which drive the lifecycle.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bambulabs::{
    hms::format_print_error,
    message::{GcodeState, PushStatus},
};
use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cache::SnapshotCache,
    config::TelemetryConfig,
    error::Result,
    hms::{self, FaultTracker, HmsEvent},
    inventory::{slots_from_report, Slot},
    printer::{Printer, Serial},
    shutdown::Shutdown,
};

/// A snapshot older than this is stale.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// The cache key holding a printer's snapshot.
pub fn snapshot_key(serial: &Serial) -> String {
    format!("printer:{serial}:status")
}

/// Display state for one printer. Never used for lifecycle decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TelemetrySnapshot {
    /// The printer.
    pub serial: Serial,
    /// The device's own job state.
    pub status: Option<String>,
    /// Nozzle temperature.
    pub nozzle_temp: Option<f64>,
    /// Bed temperature.
    pub bed_temp: Option<f64>,
    /// Progress of the running print.
    pub progress_percent: Option<i64>,
    /// Minutes left.
    pub remaining_minutes: Option<i64>,
    /// The file being printed.
    pub active_file: Option<String>,
    /// Loaded filament.
    pub inventory: Vec<Slot>,
    /// When the snapshot was built.
    pub updated_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// A snapshot with nothing known yet.
    pub fn empty(serial: Serial, updated_at: DateTime<Utc>) -> Self {
        Self {
            serial,
            status: None,
            nozzle_temp: None,
            bed_temp: None,
            progress_percent: None,
            remaining_minutes: None,
            active_file: None,
            inventory: Vec::new(),
            updated_at,
        }
    }

    /// Whether the snapshot is too old to trust.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let limit = TimeDelta::from_std(STALE_AFTER).unwrap_or(TimeDelta::MAX);
        now - self.updated_at > limit
    }
}

/// Something that happened on a printer.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// The report channel is up.
    Connected,
    /// The report channel went down, or could not be opened.
    Disconnected,
    /// The device's job state changed.
    StateChanged {
        /// The previous state, `None` on the first report of a connection.
        from: Option<GcodeState>,
        /// The new state.
        to: GcodeState,
    },
    /// A bed temperature sample.
    BedTemperature(f64),
    /// The loaded filament changed.
    InventoryChanged(Vec<Slot>),
    /// A fault code not already active on the printer.
    Fault(HmsEvent),
    /// A new nonzero generic print error, formatted.
    PrintError(String),
}

/// The result of decoding one report.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The merged view, for the hot path.
    pub snapshot: TelemetrySnapshot,
    /// The events the report carried, in order.
    pub events: Vec<TelemetryEvent>,
}

/// Turns a printer's stream of partial reports into snapshots and events.
///
/// One decoder lives for one connection. Fault and print error
/// de-duplication is shared through the [`FaultTracker`] so it survives
/// reconnects and is reset along with the printer's faults.
pub struct ReportDecoder {
    serial: Serial,
    faults: Arc<FaultTracker>,
    merged: Value,
    state: Option<GcodeState>,
    inventory: Option<Vec<Slot>>,
    print_error: Option<String>,
}

impl ReportDecoder {
    /// A decoder for `serial`.
    pub fn new(serial: Serial, faults: Arc<FaultTracker>) -> Self {
        Self {
            serial,
            faults,
            merged: Value::Object(Default::default()),
            state: None,
            inventory: None,
            print_error: None,
        }
    }

    /// Merge `report` and work out what it changed.
    pub fn decode(&mut self, report: PushStatus, now: DateTime<Utc>) -> Result<Decoded> {
        let delta = report.into_delta()?;
        let carries = |key: &str| delta.get(key).is_some();
        let (state, bed, inventory, faults, print_error) = (
            carries("gcode_state"),
            carries("bed_temper"),
            carries("ams") || carries("vt_tray"),
            carries("hms"),
            carries("print_error"),
        );

        merge(&mut self.merged, delta);
        let status: PushStatus = serde_json::from_value(self.merged.clone())?;

        let mut events = Vec::new();

        if let Some(to) = status.gcode_state.as_ref().filter(|_| state) {
            if self.state.as_ref() != Some(to) {
                events.push(TelemetryEvent::StateChanged {
                    from: self.state.replace(to.clone()),
                    to: to.clone(),
                });
            }
        }

        if let Some(temp) = status.bed_temper.filter(|_| bed) {
            events.push(TelemetryEvent::BedTemperature(temp));
        }

        if inventory {
            let slots = slots_from_report(status.ams.as_ref(), status.vt_tray.as_ref());
            if self.inventory.as_ref() != Some(&slots) {
                events.push(TelemetryEvent::InventoryChanged(slots.clone()));
                self.inventory = Some(slots);
            }
        }

        if faults {
            for entry in status.hms.iter().flatten() {
                let code = entry.code_string();
                if self.faults.observe(&self.serial, &code) {
                    events.push(TelemetryEvent::Fault(hms::classify(&code)));
                }
            }
        }

        if print_error {
            let code = status.print_error.filter(|error| *error != 0).map(format_print_error);
            if code != self.print_error {
                if let Some(previous) = self.print_error.take() {
                    self.faults.forget(&self.serial, &previous);
                }
            }
            if let Some(code) = &code {
                if self.faults.observe(&self.serial, code) {
                    events.push(TelemetryEvent::PrintError(code.clone()));
                }
            }
            self.print_error = code;
        }

        let snapshot = TelemetrySnapshot {
            serial: self.serial.clone(),
            status: status.gcode_state.as_ref().map(ToString::to_string),
            nozzle_temp: status.nozzle_temper,
            bed_temp: status.bed_temper,
            progress_percent: status.mc_percent,
            remaining_minutes: status.mc_remaining_time,
            active_file: status.gcode_file.clone().or(status.subtask_name.clone()),
            inventory: self.inventory.clone().unwrap_or_default(),
            updated_at: now,
        };

        Ok(Decoded { snapshot, events })
    }
}

/// Merge a partial report into the running view. Objects merge key by key,
/// everything else is replaced.
fn merge(into: &mut Value, delta: Value) {
    match (into, delta) {
        (Value::Object(into), Value::Object(delta)) => {
            for (key, value) in delta {
                merge(into.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, delta) => *slot = delta,
    }
}

/// A live subscription to one printer's reports.
#[async_trait]
pub trait ReportStream: Send {
    /// The next status report. An error means the connection is gone.
    async fn next_report(&mut self) -> anyhow::Result<PushStatus>;
}

/// Opens report subscriptions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `printer` and subscribe to its reports.
    async fn connect(&self, printer: &Printer) -> anyhow::Result<Box<dyn ReportStream>>;
}

/// Receives what the listeners observe.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Handle one event. Events from one printer arrive in order.
    async fn handle(&self, serial: &Serial, event: TelemetryEvent);

    /// A fresh snapshot was built.
    async fn snapshot(&self, _serial: &Serial, _snapshot: &TelemetrySnapshot) {}
}

/// Read a printer's snapshot back from the cache.
pub async fn read_snapshot(cache: &dyn SnapshotCache, serial: &Serial) -> Result<Option<TelemetrySnapshot>> {
    match cache.get(&snapshot_key(serial)).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// The supervised subscription of one printer.
pub struct Listener {
    printer: Printer,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn TelemetrySink>,
    cache: Arc<dyn SnapshotCache>,
    faults: Arc<FaultTracker>,
    config: TelemetryConfig,
}

impl Listener {
    /// A listener for `printer`.
    pub fn new(
        printer: Printer,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn TelemetrySink>,
        cache: Arc<dyn SnapshotCache>,
        faults: Arc<FaultTracker>,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            printer,
            connector,
            sink,
            cache,
            faults,
            config,
        }
    }

    /// Keep the subscription alive until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        let serial = self.printer.serial.clone();
        let mut backoff = self.config.initial_backoff();
        let mut online = None;

        loop {
            let connected = tokio::select! {
                _ = shutdown.requested() => return,
                connected = self.connector.connect(&self.printer) => connected,
            };

            match connected {
                Ok(stream) => {
                    tracing::info!("connected");
                    online = Some(true);
                    backoff = self.config.initial_backoff();
                    self.sink.handle(&serial, TelemetryEvent::Connected).await;

                    let err = tokio::select! {
                        _ = shutdown.requested() => return,
                        err = self.pump(stream) => err,
                    };
                    tracing::warn!(retry_in = ?backoff, "connection lost: {:#}", err);
                }
                Err(err) => tracing::warn!(retry_in = ?backoff, "connecting failed: {:#}", err),
            }

            if online != Some(false) {
                online = Some(false);
                self.sink.handle(&serial, TelemetryEvent::Disconnected).await;
            }

            tokio::select! {
                _ = shutdown.requested() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff());
        }
    }

    /// Process reports until the stream fails.
    async fn pump(&self, mut stream: Box<dyn ReportStream>) -> anyhow::Error {
        let serial = &self.printer.serial;
        let mut decoder = ReportDecoder::new(serial.clone(), self.faults.clone());

        loop {
            let report = match stream.next_report().await {
                Ok(report) => report,
                Err(err) => return err,
            };

            let decoded = match decoder.decode(report, Utc::now()) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::warn!("dropping report: {}", err);
                    continue;
                }
            };

            self.publish(&decoded.snapshot).await;
            for event in decoded.events {
                tracing::trace!(?event, "telemetry event");
                self.sink.handle(serial, event).await;
            }
        }
    }

    async fn publish(&self, snapshot: &TelemetrySnapshot) {
        let stored = match serde_json::to_value(snapshot) {
            Ok(value) => {
                self.cache
                    .set(&snapshot_key(&snapshot.serial), value, self.config.snapshot_ttl())
                    .await
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = stored {
            tracing::warn!("failed to store snapshot: {}", err);
        }
        self.sink.snapshot(&snapshot.serial, snapshot).await;
    }
}
