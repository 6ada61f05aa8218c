use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::debug;
use tokio::net::TcpStream;

use super::ProbeError;
use crate::config::{Device, TcpSamplerConfig};
use crate::messages::ProbeOutcome;

/// Opens a connection to `address` and closes it again.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, address: &'a str, timeout: Duration) -> BoxFuture<'a, io::Result<()>>;
}

pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, address: &'a str, timeout: Duration) -> BoxFuture<'a, io::Result<()>> {
        connect(address, timeout).boxed()
    }
}

async fn connect(address: &str, timeout: Duration) -> io::Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
    // Only reachability matters, the socket is closed right away.
    drop(stream);
    Ok(())
}

pub struct TcpSampler {
    device: Device,
    address: String,
    count: u32,
    timeout: Duration,
    dialer: Arc<dyn Dialer>,
}

impl TcpSampler {
    pub fn new(device: Device, address: &str, config: &TcpSamplerConfig, dialer: Arc<dyn Dialer>) -> Self {
        TcpSampler {
            device,
            address: address.to_string(),
            count: config.count,
            timeout: config.timeout(),
            dialer,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn budget(&self) -> Duration {
        self.timeout * self.count
    }

    /// Present as soon as one of `count` sequential attempts connects.
    pub async fn check(&self) -> ProbeOutcome {
        let mut errors = Vec::new();

        for attempt in 1..=self.count {
            match self.dialer.dial(&self.address, self.timeout).await {
                Ok(()) => {
                    if !errors.is_empty() {
                        debug!(
                            "{} answered on attempt {} after {} failures",
                            self.address,
                            attempt,
                            errors.len()
                        );
                    }
                    return ProbeOutcome::present();
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    errors.push(ProbeError::Timeout {
                        attempt,
                        address: self.address.clone(),
                        timeout: self.timeout,
                    });
                }
                Err(source) => {
                    errors.push(ProbeError::Connect {
                        attempt,
                        address: self.address.clone(),
                        source,
                    });
                }
            }
        }

        ProbeOutcome::failed(ProbeError::Aggregate(errors))
    }
}
