use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;
use thiserror::Error;

pub const TCP_PREFIX: &str = "tcp://";
pub const ICMP_PREFIX: &str = "icmp://";

const ENV_PREFIX: &str = "PRESENCE_MONITOR_";

const PLAIN_SCHEMES: [&str; 2] = ["mqtt", "tcp"];
const TLS_SCHEMES: [&str; 3] = ["mqtts", "ssl", "tls"];

const MIN_PROBE_COUNT: u32 = 1;
const MAX_PROBE_COUNT: u32 = 5;
const MIN_PROBE_TIMEOUT_SECONDS: u64 = 1;
const MAX_PROBE_TIMEOUT_SECONDS: u64 = 5;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub always_send_notification: bool,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default)]
    pub tcp: TcpSamplerConfig,
    #[serde(default)]
    pub icmp: IcmpSamplerConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A monitored endpoint. `target` carries the probing scheme, e.g.
/// `tcp://nas.local:445` or `icmp://phone.lan`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub target: String,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Icmp,
}

impl Scheme {
    /// Splits a target into its scheme and the bare address behind it.
    pub fn split(target: &str) -> Option<(Scheme, &str)> {
        if let Some(address) = target.strip_prefix(TCP_PREFIX) {
            Some((Scheme::Tcp, address))
        } else if let Some(address) = target.strip_prefix(ICMP_PREFIX) {
            Some((Scheme::Icmp, address))
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Icmp => "icmp",
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TcpSamplerConfig {
    pub count: u32,
    pub timeout_seconds: u64,
}

impl Default for TcpSamplerConfig {
    fn default() -> Self {
        TcpSamplerConfig {
            count: 3,
            timeout_seconds: 1,
        }
    }
}

impl TcpSamplerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IcmpSamplerConfig {
    pub count: u32,
    pub timeout_seconds: u64,
    pub use_privileged: bool,
}

impl Default for IcmpSamplerConfig {
    fn default() -> Self {
        IcmpSamplerConfig {
            count: 3,
            timeout_seconds: 1,
            // Raw sockets are the only mode known to work out of the box on Linux
            use_privileged: cfg!(target_os = "linux"),
        }
    }
}

impl IcmpSamplerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub default_topic: String,
    pub client_id: Option<String>,
    #[serde(default)]
    pub random_client_id_suffix: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    /// Extra CA bundle trusted on top of the system roots.
    pub tls_ca_cert: Option<PathBuf>,
    pub tls_client_cert: Option<PathBuf>,
    pub tls_client_key: Option<PathBuf>,
    /// Skip broker certificate verification.
    #[serde(default)]
    pub tls_insecure: bool,
}

impl MqttConfig {
    /// Host and port of the broker, e.g. `mqtt://broker.lan:1883` or
    /// `mqtts://broker.lan:8883`.
    pub fn broker_addr(&self) -> Result<(String, u16), ConfigError> {
        let invalid = || ConfigError::Broker(self.broker.clone());

        let (scheme, rest) = self.broker.split_once("://").ok_or_else(invalid)?;
        if !PLAIN_SCHEMES.contains(&scheme) && !TLS_SCHEMES.contains(&scheme) {
            return Err(invalid());
        }
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok((host.to_string(), port))
    }

    pub fn uses_tls(&self) -> bool {
        self.broker
            .split_once("://")
            .is_some_and(|(scheme, _)| TLS_SCHEMES.contains(&scheme))
    }

    fn validate_tls(&self, errors: &mut Vec<ConfigError>) {
        let files = [
            ("mqtt.tls_ca_cert", &self.tls_ca_cert),
            ("mqtt.tls_client_cert", &self.tls_client_cert),
            ("mqtt.tls_client_key", &self.tls_client_key),
        ];

        let configured = self.tls_insecure || files.iter().any(|(_, path)| path.is_some());
        if configured && !self.uses_tls() {
            errors.push(ConfigError::TlsWithoutSecureBroker(self.broker.clone()));
        }
        if self.tls_client_cert.is_some() != self.tls_client_key.is_some() {
            errors.push(ConfigError::PartialClientCert);
        }
        for (field, path) in files {
            if let Some(path) = path {
                if !path.is_file() {
                    errors.push(ConfigError::MissingFile {
                        field,
                        path: path.clone(),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for environment variable {name}")]
    Env { name: String, value: String },
    #[error("no devices configured")]
    NoDevices,
    #[error("device #{index} has an empty name")]
    EmptyName { index: usize },
    #[error("device {name:?} has an empty target")]
    EmptyTarget { name: String },
    #[error("device name {name:?} is used more than once")]
    DuplicateName { name: String },
    #[error("device {name:?}: unrecognized address scheme in {target:?}")]
    UnrecognizedScheme { name: String, target: String },
    #[error("device {name:?}: target {target:?} has no host")]
    MissingHost { name: String, target: String },
    #[error("device {name:?}: tcp target {target:?} must be of the form host:port")]
    MissingPort { name: String, target: String },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("interval_seconds must be greater than zero")]
    ZeroInterval,
    #[error("invalid mqtt broker {0:?}, expected mqtt://host:port or mqtts://host:port")]
    Broker(String),
    #[error("tls settings need an mqtts:// broker, got {0:?}")]
    TlsWithoutSecureBroker(String),
    #[error("mqtt tls client certificate and key must be set together")]
    PartialClientCert,
    #[error("{field}: {path} does not exist or is not a file")]
    MissingFile { field: &'static str, path: PathBuf },
    #[error("mqtt.default_topic must not be empty")]
    EmptyTopic,
    #[error("mqtt username and password must be set together")]
    PartialCredentials,
    #[error("invalid metrics address {0:?}")]
    MetricsAddr(String),
    #[error("{} configuration problems: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9224".to_string()
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml(&contents)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::de::from_str(contents)?)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// `None` when the exporter is disabled via an empty address.
    pub fn metrics_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.metrics_addr.is_empty() {
            return Ok(None);
        }
        self.metrics_addr
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::MetricsAddr(self.metrics_addr.clone()))
    }

    /// Overrides a handful of settings from `PRESENCE_MONITOR_*` variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("ALWAYS_SEND_NOTIFICATION") {
            self.always_send_notification = parse_bool(&name, &value)?;
        }
        if let Some((name, value)) = var("ICMP_PRIVILEGED") {
            self.icmp.use_privileged = parse_bool(&name, &value)?;
        }
        if let Some((_, value)) = var("METRICS_ADDR") {
            self.metrics_addr = value;
        }
        if let Some((_, value)) = var("MQTT_BROKER") {
            self.mqtt.broker = value;
        }
        if let Some((_, value)) = var("MQTT_DEFAULT_TOPIC") {
            self.mqtt.default_topic = value;
        }
        if let Some((_, value)) = var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(value);
        }
        if let Some((_, value)) = var("MQTT_USERNAME") {
            self.mqtt.username = Some(value);
        }
        if let Some((_, value)) = var("MQTT_PASSWORD") {
            self.mqtt.password = Some(value);
        }
        if let Some((_, value)) = var("MQTT_TLS_CA_CERT") {
            self.mqtt.tls_ca_cert = Some(value.into());
        }
        if let Some((_, value)) = var("MQTT_TLS_CLIENT_CERT") {
            self.mqtt.tls_client_cert = Some(value.into());
        }
        if let Some((_, value)) = var("MQTT_TLS_CLIENT_KEY") {
            self.mqtt.tls_client_key = Some(value.into());
        }
        if let Some((name, value)) = var("MQTT_TLS_INSECURE") {
            self.mqtt.tls_insecure = parse_bool(&name, &value)?;
        }

        Ok(())
    }

    /// Checks the whole configuration and reports every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.interval_seconds == 0 {
            errors.push(ConfigError::ZeroInterval);
        }
        check_range(&mut errors, "tcp.count", self.tcp.count.into(), MIN_PROBE_COUNT.into(), MAX_PROBE_COUNT.into());
        check_range(&mut errors, "tcp.timeout_seconds", self.tcp.timeout_seconds, MIN_PROBE_TIMEOUT_SECONDS, MAX_PROBE_TIMEOUT_SECONDS);
        check_range(&mut errors, "icmp.count", self.icmp.count.into(), MIN_PROBE_COUNT.into(), MAX_PROBE_COUNT.into());
        check_range(&mut errors, "icmp.timeout_seconds", self.icmp.timeout_seconds, MIN_PROBE_TIMEOUT_SECONDS, MAX_PROBE_TIMEOUT_SECONDS);

        if let Err(err) = self.mqtt.broker_addr() {
            errors.push(err);
        }
        if self.mqtt.default_topic.trim().is_empty() {
            errors.push(ConfigError::EmptyTopic);
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            errors.push(ConfigError::PartialCredentials);
        }
        self.mqtt.validate_tls(&mut errors);
        if let Err(err) = self.metrics_socket_addr() {
            errors.push(err);
        }

        if self.devices.is_empty() {
            errors.push(ConfigError::NoDevices);
        }
        let mut seen = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.name.trim().is_empty() {
                errors.push(ConfigError::EmptyName { index });
            } else if !seen.insert(device.name.as_str()) {
                errors.push(ConfigError::DuplicateName {
                    name: device.name.clone(),
                });
            }
            if let Err(err) = device.validate() {
                errors.push(err);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}

impl Device {
    /// Scheme and bare address, rejecting targets no sampler can probe.
    pub fn address(&self) -> Result<(Scheme, &str), ConfigError> {
        let (scheme, address) =
            Scheme::split(&self.target).ok_or_else(|| ConfigError::UnrecognizedScheme {
                name: self.name.clone(),
                target: self.target.clone(),
            })?;

        if address.is_empty() {
            return Err(ConfigError::MissingHost {
                name: self.name.clone(),
                target: self.target.clone(),
            });
        }

        Ok((scheme, address))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::EmptyTarget {
                name: self.name.clone(),
            });
        }

        let (scheme, address) = self.address()?;
        if scheme == Scheme::Tcp {
            let valid = address
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::MissingPort {
                    name: self.name.clone(),
                    target: self.target.clone(),
                });
            }
        }

        Ok(())
    }
}

fn check_range(errors: &mut Vec<ConfigError>, field: &'static str, value: u64, min: u64, max: u64) {
    if !(min..=max).contains(&value) {
        errors.push(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
