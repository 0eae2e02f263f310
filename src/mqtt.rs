use anyhow::{bail, Context, Result};
use canbms_lib::frame::Frame;
use canbms_lib::listener::Listener;
use canbms_lib::protocol::Profile;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(default = "MqttConfig::default_capacity")]
    capacity: usize,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "canbms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("canbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_capacity() -> usize {
        64
    }

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    pub fn qos(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("Invalid MQTT QoS {other}"),
        })
    }

    /// Creates the client and drives its event loop on a background thread.
    pub fn create_client(&self) -> Result<Client> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }

        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            self.host,
            self.port,
            self.client_id
        );
        let (client, mut connection) = Client::new(options, self.capacity);
        std::thread::Builder::new()
            .name("mqtt-connection".into())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to MQTT broker.")
                        }
                        Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
                        Ok(event) => log::trace!("MQTT event {event:?}"),
                        Err(e) => {
                            log::error!("MQTT connection failed: {e}");
                            break;
                        }
                    }
                }
            })
            .with_context(|| "Cannot start MQTT connection thread")?;
        Ok(client)
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
    qos: QoS,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        let client = config.create_client()?;
        Ok(Self {
            client,
            config,
            qos,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Queues the message for the connection thread. Never waits: a full
    /// request queue is reported as an error.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );
        self.client
            .try_publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.client
            .try_disconnect()
            .with_context(|| "Failed to disconnect from MQTT broker")?;
        Ok(())
    }
}

/// JSON document published for one received frame.
pub fn frame_message(profile: &Profile, frame: &Frame) -> serde_json::Value {
    let mut message = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "id": format!("0x{:03X}", frame.id()),
        "data": frame.data(),
    });
    match profile.inspect(frame) {
        Ok((decoded, report)) => {
            message["readings"] = json!(decoded.readings);
            message["faults"] = report
                .iter()
                .map(|(group, fault)| {
                    json!({
                        "group": group,
                        "code": fault.code,
                        "kind": fault.kind.to_string(),
                    })
                })
                .collect();
        }
        Err(e) => message["error"] = json!(e.to_string()),
    }
    message
}

/// Publishes every received frame below `<topic>/<id>`.
pub struct MqttListener {
    publisher: MqttPublisher,
    profile: Arc<Profile>,
}

impl MqttListener {
    pub fn new(publisher: MqttPublisher, profile: Arc<Profile>) -> Self {
        Self { publisher, profile }
    }
}

impl Listener for MqttListener {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn handle(&mut self, frame: &Frame) -> Result<(), canbms_lib::Error> {
        let topic = format!("{}/{:03x}", self.publisher.topic(), frame.id());
        let payload = frame_message(&self.profile, frame).to_string();
        self.publisher
            .publish(&topic, &payload)
            .map_err(|e| std::io::Error::other(format!("{e:#}")))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), canbms_lib::Error> {
        self.publisher
            .disconnect()
            .map_err(|e| std::io::Error::other(format!("{e:#}")))?;
        Ok(())
    }
}
