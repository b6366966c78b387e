//! The Bambu MQTT client.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::{command::Command, message::Message, parser::parse_message};

const MQTT_PORT: u16 = 8883;
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A connection to one printer's report channel.
///
/// The client owns the MQTT event loop, so it must be polled through
/// [`Client::next_message`] for the connection to make progress. Requests are
/// sent through a [`Publisher`], which can be cloned and handed to other tasks.
pub struct Client {
    /// The serial number.
    pub serial: String,

    topic_device_report: String,

    publisher: Publisher,
    event_loop: rumqttc::EventLoop,
}

/// Sends requests to one printer.
#[derive(Clone)]
pub struct Publisher {
    topic_device_request: String,
    client: rumqttc::AsyncClient,
}

impl Client {
    /// Creates a new Bambu printer MQTT client. No connection is made until
    /// the client is polled.
    pub fn new<S: Into<String>>(ip: S, access_code: S, serial: S) -> Result<Self> {
        let ip = ip.into();
        let access_code = access_code.into();
        let serial = serial.into();

        let opts = Self::get_config(&ip, &access_code)?;
        let (client, event_loop) = rumqttc::AsyncClient::new(opts, 25);

        Ok(Self {
            topic_device_report: format!("device/{}/report", &serial),
            publisher: Publisher {
                topic_device_request: format!("device/{}/request", &serial),
                client,
            },
            serial,
            event_loop,
        })
    }

    fn get_config(ip: &str, access_code: &str) -> Result<rumqttc::MqttOptions> {
        let client_id = format!("print-farm-{}", nanoid::nanoid!(8));

        let ssl_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(crate::no_auth::NoAuth::new()))
            .with_no_client_auth();

        let mut opts = rumqttc::MqttOptions::new(client_id, ip, MQTT_PORT);
        opts.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        opts.set_keep_alive(Duration::from_secs(5));
        opts.set_credentials("bblp", access_code);
        opts.set_transport(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Rustls(Arc::new(
            ssl_config,
        ))));

        Ok(opts)
    }

    /// A handle for sending requests over this connection.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Subscribe to the report topic and ask for a full report.
    ///
    /// Both requests are queued and go out once the client is polled.
    pub async fn subscribe(&mut self) -> Result<()> {
        self.publisher
            .client
            .subscribe(&self.topic_device_report, rumqttc::mqttbytes::QoS::AtMostOnce)
            .await
            .with_context(|| format!("subscribing to {}", self.topic_device_report))?;

        self.publisher.publish(Command::push_all()).await
    }

    /// Wait for the next message from the printer.
    ///
    /// Protocol traffic that is not a publish (acks, pings) is consumed
    /// silently.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection fails. The caller is expected to
    /// drop the client and reconnect.
    pub async fn next_message(&mut self) -> Result<Message> {
        loop {
            let event = self
                .event_loop
                .poll()
                .await
                .with_context(|| format!("polling printer {}", self.serial))?;

            match parse_message(&event) {
                Message::Unknown(None) => continue,
                message => return Ok(message),
            }
        }
    }
}

impl Publisher {
    /// Publishes a command to the printer's request topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be queued.
    pub async fn publish(&self, command: Command) -> Result<()> {
        let payload = serde_json::to_string(&command)?;

        tracing::debug!(topic = %self.topic_device_request, "publishing {}", payload);

        self.client
            .publish(
                &self.topic_device_request,
                rumqttc::mqttbytes::QoS::AtMostOnce,
                false,
                payload,
            )
            .await?;

        Ok(())
    }
}

/// Upload a file to the root of the printer's SD card over FTPS, stored
/// there as `remote_name`.
pub async fn upload_file(ip: &str, access_code: &str, path: &Path, remote_name: &str) -> Result<()> {
    let host_url = url::Url::parse(&format!("mqtts://{}:{}", ip, MQTT_PORT))?;
    let host = host_url
        .host_str()
        .ok_or(anyhow::anyhow!("not a valid hostname"))?
        .to_string();
    let args: Vec<String> = vec![
        "--silent".to_string(),
        "--upload-file".to_string(),
        path.to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid file path"))?
            .to_string(),
        "--ftp-pasv".to_string(),
        "--insecure".to_string(),
        format!("ftps://{}/{}", host, remote_name),
        "--user".to_string(),
        format!("bblp:{}", access_code),
    ];
    let output = tokio::process::Command::new("curl")
        .args(&args)
        .output()
        .await
        .context("Failed to upload file")?;

    // Make sure the command was successful.
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "Failed to upload file: {:?}\nstdout:\n{}stderr:{}",
            output.status,
            stdout,
            stderr
        );
    }

    Ok(())
}
