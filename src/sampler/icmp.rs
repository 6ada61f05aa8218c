use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::{debug, warn};
use socket2::Type;
use surge_ping::{Client, ICMP, PingIdentifier, PingSequence, SurgeError};
use tokio::sync::OnceCell;
use tokio::time::Instant;

use super::ProbeError;
use crate::config::{Device, IcmpSamplerConfig};
use crate::messages::ProbeOutcome;

const PAYLOAD: [u8; 56] = [0; 56];

/// Name resolution and single ICMP echo round-trips.
pub trait Echo: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<IpAddr>>;

    /// `Ok(None)` when no reply arrived within `timeout`.
    fn echo(
        &self,
        address: IpAddr,
        identifier: u16,
        sequence: u16,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Duration>, ProbeError>>;
}

/// Echo transport backed by `surge-ping`. One client per address family is
/// opened lazily and shared by every ICMP sampler.
pub struct SurgeEcho {
    privileged: bool,
    v4: OnceCell<Client>,
    v6: OnceCell<Client>,
}

impl SurgeEcho {
    pub fn new(privileged: bool) -> Self {
        SurgeEcho {
            privileged,
            v4: OnceCell::new(),
            v6: OnceCell::new(),
        }
    }

    async fn client(&self, address: IpAddr) -> Result<&Client, ProbeError> {
        let (cell, kind) = match address {
            IpAddr::V4(_) => (&self.v4, ICMP::V4),
            IpAddr::V6(_) => (&self.v6, ICMP::V6),
        };
        let privileged = self.privileged;

        cell.get_or_try_init(|| async move {
            Client::new(&socket_config(kind, privileged)).map_err(ProbeError::Socket)
        })
        .await
    }
}

fn socket_config(kind: ICMP, privileged: bool) -> surge_ping::Config {
    let sock_type = if privileged { Type::RAW } else { Type::DGRAM };
    surge_ping::Config::builder()
        .kind(kind)
        .sock_type_hint(sock_type)
        .build()
}

impl Echo for SurgeEcho {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<IpAddr>> {
        resolve_host(host).boxed()
    }

    fn echo(
        &self,
        address: IpAddr,
        identifier: u16,
        sequence: u16,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Duration>, ProbeError>> {
        self.echo_once(address, identifier, sequence, timeout).boxed()
    }
}

impl SurgeEcho {
    async fn echo_once(
        &self,
        address: IpAddr,
        identifier: u16,
        sequence: u16,
        timeout: Duration,
    ) -> Result<Option<Duration>, ProbeError> {
        let client = self.client(address).await?;
        let mut pinger = client.pinger(address, PingIdentifier(identifier)).await;
        pinger.timeout(timeout);

        match pinger.ping(PingSequence(sequence), &PAYLOAD).await {
            Ok((_, rtt)) => Ok(Some(rtt)),
            Err(SurgeError::Timeout { .. }) => Ok(None),
            Err(err) => Err(ProbeError::Echo {
                address,
                message: err.to_string(),
            }),
        }
    }
}

async fn resolve_host(host: &str) -> io::Result<IpAddr> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return Ok(address);
    }
    tokio::net::lookup_host((host, 0))
        .await?
        .next()
        .map(|socket_addr| socket_addr.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses returned"))
}

pub struct IcmpSampler {
    device: Device,
    host: String,
    count: u32,
    timeout: Duration,
    identifier: u16,
    echo: Arc<dyn Echo>,
}

impl IcmpSampler {
    pub fn new(device: Device, host: &str, config: &IcmpSamplerConfig, echo: Arc<dyn Echo>) -> Self {
        IcmpSampler {
            device,
            host: host.to_string(),
            count: config.count,
            timeout: config.timeout(),
            identifier: rand::random(),
            echo,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn address(&self) -> &str {
        &self.host
    }

    pub fn budget(&self) -> Duration {
        self.timeout
    }

    /// Sends up to `count` echo requests inside the timeout window and reports
    /// presence on the first reply. An unresolvable host is always absent.
    pub async fn check(&self) -> ProbeOutcome {
        let address = match self.echo.resolve(&self.host).await {
            Ok(address) => address,
            Err(source) => {
                warn!("could not resolve host {}: {}", self.host, source);
                return ProbeOutcome::failed(ProbeError::ResolutionFailed {
                    host: self.host.clone(),
                    source,
                });
            }
        };

        let deadline = Instant::now() + self.timeout;
        // Split the window so every request gets a fair share of it
        let per_echo = self.timeout / self.count.max(1);
        let mut last_error = None;

        for sequence in 0..self.count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let wait = per_echo.min(remaining);
            match self.echo.echo(address, self.identifier, sequence as u16, wait).await {
                Ok(Some(rtt)) => {
                    debug!("{} ({}) replied in {:?}", self.host, address, rtt);
                    return ProbeOutcome::present();
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("echo to {} failed: {}", address, err);
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => ProbeOutcome::failed(err),
            None => ProbeOutcome::absent(),
        }
    }
}
