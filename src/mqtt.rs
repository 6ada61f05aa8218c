use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::{debug, error, info};
use rand::Rng as _;
use rand::distr::Alphanumeric;
use rumqttc::{MqttOptions, QoS, Transport};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{self, ConfigError, Device};
use crate::messages::Outcome;
use crate::metrics::Telemetry;
use crate::notifier::{Notifier, NotifyError};
use crate::tls::{self, TlsError};

const APP_NAME: &str = "presence-monitor";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MIN_REQUEST_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up tls: {0}")]
    Tls(#[from] TlsError),
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    default_topic: String,
}

impl MqttClient {
    /// `devices` sizes the request queue so a full tick of announcements fits
    /// even before the broker connection is up.
    pub fn new(
        config: &config::MqttConfig,
        devices: usize,
    ) -> Result<(Self, rumqttc::EventLoop), MqttError> {
        let (host, port) = config.broker_addr()?;
        let client_id = client_id(config);
        debug!("Connecting to MQTT broker {}:{} as {}", host, port, client_id);

        let mut mqttoptions = MqttOptions::new(client_id, host, port);

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        if config.uses_tls() {
            let tls_config = tls::client_config(config)?;
            mqttoptions.set_transport(Transport::tls_with_config(tls_config.into()));
        }

        let (client, eventloop) =
            rumqttc::AsyncClient::new(mqttoptions, request_capacity(devices));

        Ok((
            MqttClient {
                client,
                default_topic: config.default_topic.trim_end_matches('/').to_string(),
            },
            eventloop,
        ))
    }

    /// Drives the connection until a disconnect is sent or `cancel` fires.
    /// rumqttc reconnects on the next poll after an error, so failures are
    /// only logged and counted.
    pub async fn event_loop(
        eventloop: &mut rumqttc::EventLoop,
        telemetry: Arc<dyn Telemetry>,
        cancel: CancellationToken,
    ) {
        let mut connection_lost = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stopping MQTT event loop");
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        if connection_lost {
                            info!("Reconnected to MQTT broker");
                            telemetry.inc_reconnection();
                            connection_lost = false;
                        } else {
                            debug!("Connection acknowledged");
                        }
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(ack))) => {
                        debug!("Publish {} acknowledged", ack.pkid);
                    }
                    Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        debug!("Disconnected from MQTT broker");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !connection_lost {
                            error!("Error polling MQTT event loop: {:?}", e);
                            telemetry.inc_connection_lost();
                            connection_lost = true;
                        } else {
                            debug!("MQTT broker still unreachable: {:?}", e);
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        }
    }

    /// The device's own topic, otherwise one derived from its name.
    pub fn topic_for(&self, device: &Device) -> String {
        match device.topic.as_deref() {
            Some(topic) if !topic.is_empty() => topic.to_string(),
            _ => format!("{}/{}", self.default_topic, sanitize_name(&device.name)),
        }
    }

    pub fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.try_disconnect()
    }
}

impl Notifier for MqttClient {
    fn notify<'a>(&'a self, device: &'a Device, outcome: Outcome) -> BoxFuture<'a, Result<(), NotifyError>> {
        let topic = self.topic_for(device);
        info!("Announcing {} as {} on {}", device.name, outcome, topic);

        // Never wait for room in the request queue while the broker is away
        let result = self
            .client
            .try_publish(topic.clone(), QoS::AtLeastOnce, true, outcome.as_str())
            .map_err(|source| NotifyError::Publish {
                topic,
                source: Box::new(source),
            });

        async move { result }.boxed()
    }
}

/// Room for two ticks of announcements, one per device each.
fn request_capacity(devices: usize) -> usize {
    MIN_REQUEST_CAPACITY.max(devices.saturating_mul(2))
}

fn client_id(config: &config::MqttConfig) -> String {
    let client_id = match config.client_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => default_client_id(),
    };

    if config.random_client_id_suffix {
        format!("{}-{}", client_id, random_suffix())
    } else {
        client_id
    }
}

/// `presence-monitor-<hostname>`, or just the app name when the host has none.
fn default_client_id() -> String {
    match hostname() {
        Some(host) => format!("{APP_NAME}-{host}"),
        None => APP_NAME.to_string(),
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the pointer and length describe `buf`, which outlives the call
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let host = String::from_utf8_lossy(&buf[..len]).trim().to_string();
    (!host.is_empty()).then_some(host)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|host| !host.is_empty())
}

fn random_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_config() -> config::MqttConfig {
        config::MqttConfig {
            broker: "mqtt://localhost:1883".to_string(),
            default_topic: "presence/".to_string(),
            client_id: Some("stalker".to_string()),
            random_client_id_suffix: false,
            username: None,
            password: None,
            keep_alive_seconds: None,
            tls_ca_cert: None,
            tls_client_cert: None,
            tls_client_key: None,
            tls_insecure: false,
        }
    }

    fn nas() -> Device {
        Device {
            name: "nas".to_string(),
            target: "tcp://nas:445".to_string(),
            topic: None,
        }
    }

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
    }

    #[test]
    fn test_client_id_suffix() {
        let mut config = mqtt_config();
        assert_eq!(client_id(&config), "stalker");

        config.random_client_id_suffix = true;
        let id = client_id(&config);
        assert!(id.starts_with("stalker-"));
        assert_eq!(id.len(), "stalker-".len() + 6);

        config.client_id = None;
        config.random_client_id_suffix = false;
        let id = client_id(&config);
        assert_eq!(id, default_client_id());
        assert!(id.starts_with(APP_NAME));
        if let Some(host) = hostname() {
            assert_eq!(id, format!("{APP_NAME}-{host}"));
        }

        // An empty id falls back the same way
        config.client_id = Some(String::new());
        assert_eq!(client_id(&config), id);
    }

    #[test]
    fn test_request_capacity() {
        assert_eq!(request_capacity(0), 10);
        assert_eq!(request_capacity(5), 10);
        assert_eq!(request_capacity(12), 24);
    }

    #[tokio::test]
    async fn test_topic_for() {
        let (client, _eventloop) = MqttClient::new(&mqtt_config(), 1).unwrap();

        let mut device = Device {
            name: "Living Room TV".to_string(),
            target: "icmp://tv.lan".to_string(),
            topic: None,
        };
        assert_eq!(client.topic_for(&device), "presence/living_room_tv");

        device.topic = Some("home/tv/presence".to_string());
        assert_eq!(client.topic_for(&device), "home/tv/presence");
    }

    #[tokio::test]
    async fn test_notify_queues_without_broker() {
        let (client, _eventloop) = MqttClient::new(&mqtt_config(), 1).unwrap();
        let device = nas();

        // The request queue holds ten messages until the event loop drains it
        for _ in 0..10 {
            client.notify(&device, Outcome::On).await.unwrap();
        }
        let err = client.notify(&device, Outcome::Off).await.unwrap_err();
        assert!(err.to_string().contains("presence/nas"));
    }

    #[tokio::test]
    async fn test_queue_grows_with_devices() {
        let (client, _eventloop) = MqttClient::new(&mqtt_config(), 30).unwrap();
        let device = nas();

        for _ in 0..60 {
            client.notify(&device, Outcome::On).await.unwrap();
        }
        assert!(client.notify(&device, Outcome::Off).await.is_err());
    }

    #[tokio::test]
    async fn test_tls_transport() {
        let mut config = mqtt_config();
        config.broker = "mqtts://localhost:8883".to_string();
        config.tls_insecure = true;
        MqttClient::new(&config, 1).unwrap();

        config.tls_insecure = false;
        config.tls_ca_cert = Some("/nonexistent/ca.pem".into());
        match MqttClient::new(&config, 1) {
            Err(MqttError::Tls(TlsError::Read { path, .. })) => {
                assert_eq!(path, std::path::Path::new("/nonexistent/ca.pem"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
