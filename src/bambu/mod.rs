//! Bambu Lab printers, reached over their LAN MQTT and FTPS interfaces.
//!
//! The listener owns each printer's MQTT connection. The publishing half is
//! shared through a [`Publishers`] map so the transport can send commands
//! over the same connection.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bambulabs::{
    client::{upload_file, Client, Publisher},
    command::Command,
    message::{Message, Print, PushStatus},
};
use dashmap::DashMap;

use crate::{
    file::TemporaryFile,
    inventory::SlotMapping,
    printer::{Printer, Serial},
    telemetry::{Connector, ReportStream},
    transport::{Artifact, CommandTransport},
};

/// How long a new connection has to produce its first report.
const FIRST_REPORT_TIMEOUT: Duration = Duration::from_secs(15);

/// Request channels of the connected printers.
pub type Publishers = Arc<DashMap<Serial, Publisher>>;

/// Opens MQTT report streams.
#[derive(Clone, Default)]
pub struct BambuConnector {
    publishers: Publishers,
}

impl BambuConnector {
    /// A connector registering request channels in `publishers`.
    pub fn new(publishers: Publishers) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl Connector for BambuConnector {
    async fn connect(&self, printer: &Printer) -> Result<Box<dyn ReportStream>> {
        let mut client = Client::new(
            printer.address.clone(),
            printer.access_code.clone(),
            printer.serial.0.clone(),
        )?;
        client.subscribe().await?;

        // The client only connects while polled, so a printer that is down
        // shows up here rather than on the first read.
        let first = tokio::time::timeout(FIRST_REPORT_TIMEOUT, next_status(&mut client))
            .await
            .with_context(|| format!("no report from {} within {:?}", printer.serial, FIRST_REPORT_TIMEOUT))??;

        self.publishers.insert(printer.serial.clone(), client.publisher());
        Ok(Box::new(BambuReports {
            client,
            first: Some(first),
        }))
    }
}

struct BambuReports {
    client: Client,
    first: Option<PushStatus>,
}

#[async_trait]
impl ReportStream for BambuReports {
    async fn next_report(&mut self) -> Result<PushStatus> {
        if let Some(first) = self.first.take() {
            return Ok(first);
        }
        next_status(&mut self.client).await
    }
}

async fn next_status(client: &mut Client) -> Result<PushStatus> {
    loop {
        match client.next_message().await? {
            Message::Print(Print::PushStatus(status)) => return Ok(status),
            Message::Print(reply) => {
                tracing::debug!(serial = %client.serial, ?reply, "command reply");
            }
            Message::Json(value) => tracing::trace!(serial = %client.serial, %value, "unhandled report"),
            Message::Unknown(raw) => tracing::warn!(serial = %client.serial, ?raw, "unparseable report"),
        }
    }
}

/// Sends files and commands to Bambu printers.
#[derive(Clone, Default)]
pub struct BambuTransport {
    publishers: Publishers,
}

impl BambuTransport {
    /// A transport publishing over the connections in `publishers`.
    pub fn new(publishers: Publishers) -> Self {
        Self { publishers }
    }

    fn publisher(&self, serial: &Serial) -> Result<Publisher> {
        self.publishers
            .get(serial)
            .map(|publisher| publisher.clone())
            .ok_or_else(|| anyhow::anyhow!("printer {serial} is not connected"))
    }
}

#[async_trait]
impl CommandTransport for BambuTransport {
    async fn start_job(&self, printer: &Printer, artifact: &Artifact, mapping: &SlotMapping) -> Result<()> {
        let publisher = self.publisher(&printer.serial)?;

        upload_file(&printer.address, &printer.access_code, &artifact.path, &artifact.name)
            .await
            .with_context(|| format!("uploading {}", artifact.name))?;

        publisher
            .publish(Command::print_project(
                &artifact.name,
                &artifact.name,
                mapping.0.clone(),
                artifact.calibration,
            ))
            .await
    }

    async fn send_maintenance_sequence(&self, printer: &Printer, script: &str) -> Result<()> {
        let publisher = self.publisher(&printer.serial)?;

        let name = format!("clear-{}.gcode", uuid::Uuid::new_v4());
        let file = TemporaryFile::create(&name, script.as_bytes()).await?;
        upload_file(&printer.address, &printer.access_code, file.path(), &name)
            .await
            .with_context(|| format!("uploading {name}"))?;

        publisher.publish(Command::gcode_file(&name)).await
    }

    async fn abort(&self, printer: &Printer) -> Result<()> {
        self.publisher(&printer.serial)?.publish(Command::stop()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::PrinterModel;

    #[tokio::test]
    async fn test_commands_need_a_connection() {
        let transport = BambuTransport::default();
        let printer = Printer::new(
            "03919A3B1800123".into(),
            "a1-01".to_string(),
            "10.0.0.5".to_string(),
            "12345678".to_string(),
            PrinterModel::A1,
        );

        let err = transport.abort(&printer).await.unwrap_err();
        assert_eq!(err.to_string(), "printer 03919A3B1800123 is not connected");
        assert!(transport.send_maintenance_sequence(&printer, "G28\n").await.is_err());
    }
}
