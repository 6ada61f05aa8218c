//! Probing strategies. Every device gets exactly one [`Sampler`], chosen once
//! from the scheme prefix of its target.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{AppConfig, ConfigError, Device, IcmpSamplerConfig, Scheme, TcpSamplerConfig};
use crate::messages::ProbeOutcome;

mod icmp;
mod tcp;

pub use icmp::{Echo, IcmpSampler, SurgeEcho};
pub use tcp::{Dialer, TcpDialer, TcpSampler};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("attempt {attempt}: could not connect to {address}: {source}")]
    Connect {
        attempt: u32,
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("attempt {attempt}: connecting to {address} timed out after {timeout:?}")]
    Timeout {
        attempt: u32,
        address: String,
        timeout: Duration,
    },
    #[error("{} attempts failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ProbeError>),
    #[error("could not resolve {host}: {source}")]
    ResolutionFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("could not open icmp socket: {0}")]
    Socket(#[source] io::Error),
    #[error("echo request to {address} failed: {message}")]
    Echo { address: IpAddr, message: String },
    #[error("check did not finish within {0:?}")]
    Deadline(Duration),
}

impl ProbeError {
    /// Underlying failures, flattening aggregated attempts.
    pub fn causes(&self) -> Vec<&ProbeError> {
        match self {
            ProbeError::Aggregate(errors) => errors.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }
}

fn join_errors(errors: &[ProbeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Network primitives shared by all samplers.
#[derive(Clone)]
pub struct Probes {
    pub dialer: Arc<dyn Dialer>,
    pub echo: Arc<dyn Echo>,
}

impl Probes {
    pub fn system(icmp: &IcmpSamplerConfig) -> Self {
        Probes {
            dialer: Arc::new(TcpDialer),
            echo: Arc::new(SurgeEcho::new(icmp.use_privileged)),
        }
    }
}

pub enum Sampler {
    Tcp(TcpSampler),
    Icmp(IcmpSampler),
}

impl Sampler {
    pub fn new(
        device: &Device,
        tcp: &TcpSamplerConfig,
        icmp: &IcmpSamplerConfig,
        probes: &Probes,
    ) -> Result<Self, ConfigError> {
        let (scheme, address) = device.address()?;
        let sampler = match scheme {
            Scheme::Tcp => Sampler::Tcp(TcpSampler::new(
                device.clone(),
                address,
                tcp,
                probes.dialer.clone(),
            )),
            Scheme::Icmp => Sampler::Icmp(IcmpSampler::new(
                device.clone(),
                address,
                icmp,
                probes.echo.clone(),
            )),
        };
        Ok(sampler)
    }

    pub async fn check(&self) -> ProbeOutcome {
        match self {
            Sampler::Tcp(sampler) => sampler.check().await,
            Sampler::Icmp(sampler) => sampler.check().await,
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            Sampler::Tcp(sampler) => sampler.device(),
            Sampler::Icmp(sampler) => sampler.device(),
        }
    }

    /// Target with the scheme prefix stripped.
    pub fn address(&self) -> &str {
        match self {
            Sampler::Tcp(sampler) => sampler.address(),
            Sampler::Icmp(sampler) => sampler.address(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            Sampler::Tcp(_) => Scheme::Tcp,
            Sampler::Icmp(_) => Scheme::Icmp,
        }
    }

    /// Longest a single check may take according to its configuration.
    pub fn budget(&self) -> Duration {
        match self {
            Sampler::Tcp(sampler) => sampler.budget(),
            Sampler::Icmp(sampler) => sampler.budget(),
        }
    }
}

/// Builds one sampler per configured device. Any device no sampler can
/// handle aborts the whole build.
pub fn build_samplers(config: &AppConfig, probes: &Probes) -> Result<Vec<Sampler>, ConfigError> {
    config
        .devices
        .iter()
        .map(|device| Sampler::new(device, &config.tcp, &config.icmp, probes))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::FutureExt as _;
    use futures::future::BoxFuture;

    use super::{Dialer, Echo, ProbeError};

    /// Dialer replaying scripted results per address; unscripted dials are refused.
    #[derive(Default)]
    pub struct ScriptedDialer {
        script: Mutex<HashMap<String, VecDeque<io::Result<()>>>>,
        reachable: Mutex<Vec<String>>,
        pub dials: Mutex<Vec<String>>,
    }

    impl ScriptedDialer {
        pub fn push(&self, address: &str, result: io::Result<()>) {
            self.script
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .push_back(result);
        }

        pub fn set_reachable(&self, address: &str) {
            self.reachable.lock().unwrap().push(address.to_string());
        }

        pub fn dial_count(&self) -> usize {
            self.dials.lock().unwrap().len()
        }
    }

    impl Dialer for ScriptedDialer {
        fn dial<'a>(&'a self, address: &'a str, _timeout: Duration) -> BoxFuture<'a, io::Result<()>> {
            self.dials.lock().unwrap().push(address.to_string());
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(address)
                .and_then(VecDeque::pop_front);
            let result = scripted.unwrap_or_else(|| {
                if self.reachable.lock().unwrap().iter().any(|a| a == address) {
                    Ok(())
                } else {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                }
            });
            async move { result }.boxed()
        }
    }

    /// Echo transport answering only for hosts listed in `replying`.
    #[derive(Default)]
    pub struct ScriptedEcho {
        pub replying: Mutex<Vec<String>>,
        pub unresolvable: Mutex<Vec<String>>,
        pub echoes: Mutex<usize>,
    }

    fn fake_address(host: &str) -> IpAddr {
        let last = host.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    impl Echo for ScriptedEcho {
        fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<IpAddr>> {
            let unresolvable = self.unresolvable.lock().unwrap().iter().any(|h| h == host);
            let result = if unresolvable {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such host"))
            } else {
                Ok(fake_address(host))
            };
            async move { result }.boxed()
        }

        fn echo(
            &self,
            address: IpAddr,
            _identifier: u16,
            _sequence: u16,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<Option<Duration>, ProbeError>> {
            *self.echoes.lock().unwrap() += 1;
            let replies = self
                .replying
                .lock()
                .unwrap()
                .iter()
                .any(|host| fake_address(host) == address);
            async move { Ok(replies.then_some(Duration::from_millis(3))) }.boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::{ScriptedDialer, ScriptedEcho};
    use super::*;

    fn probes() -> Probes {
        Probes {
            dialer: Arc::new(ScriptedDialer::default()),
            echo: Arc::new(ScriptedEcho::default()),
        }
    }

    fn device(name: &str, target: &str) -> Device {
        Device {
            name: name.to_string(),
            target: target.to_string(),
            topic: None,
        }
    }

    #[test]
    fn test_sampler_selected_by_scheme() {
        let tcp = TcpSamplerConfig::default();
        let icmp = IcmpSamplerConfig::default();

        let sampler = Sampler::new(&device("nas", "tcp://nas:445"), &tcp, &icmp, &probes()).unwrap();
        assert_eq!(sampler.scheme(), Scheme::Tcp);
        assert_eq!(sampler.address(), "nas:445");
        assert_eq!(sampler.device().target, "tcp://nas:445");
        assert_eq!(sampler.budget(), Duration::from_secs(3));

        let sampler = Sampler::new(&device("phone", "icmp://phone"), &tcp, &icmp, &probes()).unwrap();
        assert_eq!(sampler.scheme(), Scheme::Icmp);
        assert_eq!(sampler.address(), "phone");
    }

    #[test]
    fn test_unrecognized_scheme_is_fatal() {
        let mut config = AppConfig::from_toml(
            r#"
            [mqtt]
            broker = "mqtt://localhost:1883"
            default_topic = "presence"

            [[devices]]
            name = "ok"
            target = "tcp://ok:80"

            [[devices]]
            name = "bad"
            target = "https://bad"
            "#,
        )
        .unwrap();

        let result = build_samplers(&config, &probes());
        assert!(matches!(result, Err(ConfigError::UnrecognizedScheme { name, .. }) if name == "bad"));

        config.devices.pop();
        assert_eq!(build_samplers(&config, &probes()).unwrap().len(), 1);
    }

    #[test]
    fn test_causes_flatten_aggregate() {
        let err = ProbeError::Aggregate(vec![
            ProbeError::Deadline(Duration::from_secs(1)),
            ProbeError::Aggregate(vec![ProbeError::Deadline(Duration::from_secs(2))]),
        ]);
        assert_eq!(err.causes().len(), 2);
        assert!(err.to_string().starts_with("2 attempts failed"));
    }
}
