//! Prometheus metrics for the fleet.

use std::sync::atomic::AtomicU64;

use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Registry, Unit},
};

use crate::{printer::Serial, telemetry::TelemetrySnapshot};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PrinterLabels {
    serial: String,
}

type FloatGauge = Gauge<f64, AtomicU64>;

/// Gauges and counters describing the fleet.
pub struct Metrics {
    registry: Registry,
    bed_temperature: Family<PrinterLabels, FloatGauge>,
    nozzle_temperature: Family<PrinterLabels, FloatGauge>,
    progress: Family<PrinterLabels, Gauge>,
    bindings: Counter,
    conflicts: Counter,
    transport_failures: Counter,
    watchdog_retries: Counter,
    watchdog_faults: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// A fresh registry with every metric registered.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("print_farm");

        let bed_temperature = Family::<PrinterLabels, FloatGauge>::default();
        registry.register_with_unit(
            "bed_temperature",
            "Last reported bed temperature",
            Unit::Celsius,
            bed_temperature.clone(),
        );
        let nozzle_temperature = Family::<PrinterLabels, FloatGauge>::default();
        registry.register_with_unit(
            "nozzle_temperature",
            "Last reported nozzle temperature",
            Unit::Celsius,
            nozzle_temperature.clone(),
        );
        let progress = Family::<PrinterLabels, Gauge>::default();
        registry.register("progress_percent", "Progress of the running print", progress.clone());

        let counter = |registry: &mut Registry, name: &str, help: &str| {
            let counter = Counter::default();
            registry.register(name, help, counter.clone());
            counter
        };
        let bindings = counter(&mut registry, "dispatch_bindings", "Jobs bound to a printer");
        let conflicts = counter(&mut registry, "dispatch_conflicts", "Bindings lost to a concurrent writer");
        let transport_failures = counter(&mut registry, "transport_failures", "Jobs failed at handoff");
        let watchdog_retries = counter(&mut registry, "watchdog_retries", "Clearing attempts retried");
        let watchdog_faults = counter(&mut registry, "watchdog_faults", "Clearings given up on");

        Self {
            registry,
            bed_temperature,
            nozzle_temperature,
            progress,
            bindings,
            conflicts,
            transport_failures,
            watchdog_retries,
            watchdog_faults,
        }
    }

    /// Update the per-printer gauges from a snapshot.
    pub fn observe(&self, serial: &Serial, snapshot: &TelemetrySnapshot) {
        let labels = PrinterLabels {
            serial: serial.to_string(),
        };
        if let Some(temp) = snapshot.bed_temp {
            self.bed_temperature.get_or_create(&labels).set(temp);
        }
        if let Some(temp) = snapshot.nozzle_temp {
            self.nozzle_temperature.get_or_create(&labels).set(temp);
        }
        if let Some(percent) = snapshot.progress_percent {
            self.progress.get_or_create(&labels).set(percent);
        }
    }

    /// A job was bound.
    pub fn binding(&self) {
        self.bindings.inc();
    }

    /// A binding lost a race.
    pub fn conflict(&self) {
        self.conflicts.inc();
    }

    /// A handoff to the transport failed.
    pub fn transport_failure(&self) {
        self.transport_failures.inc();
    }

    /// A clearing attempt is being retried.
    pub fn watchdog_retry(&self) {
        self.watchdog_retries.inc();
    }

    /// A clearing was given up on.
    pub fn watchdog_fault(&self) {
        self.watchdog_faults.inc();
    }

    /// Render the text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use testresult::TestResult;

    use super::*;

    #[test]
    fn test_encode() -> TestResult {
        let metrics = Metrics::new();
        metrics.binding();
        metrics.binding();
        metrics.watchdog_fault();
        metrics.observe(
            &"03919A3B1800123".into(),
            &TelemetrySnapshot {
                bed_temp: Some(60.5),
                progress_percent: Some(42),
                ..TelemetrySnapshot::empty("03919A3B1800123".into(), Utc::now())
            },
        );

        let text = metrics.encode()?;

        assert!(text.contains("print_farm_dispatch_bindings_total 2"), "{text}");
        assert!(text.contains("print_farm_watchdog_faults_total 1"), "{text}");
        assert!(text.contains("print_farm_dispatch_conflicts_total 0"), "{text}");
        assert!(text.contains(r#"print_farm_bed_temperature_celsius{serial="03919A3B1800123"} 60.5"#), "{text}");
        assert!(text.contains(r#"print_farm_progress_percent{serial="03919A3B1800123"} 42"#), "{text}");
        Ok(())
    }
}
