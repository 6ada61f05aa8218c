use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::messages::{Outcome, ProbeOutcome};
use crate::metrics::Telemetry;
use crate::notifier::Notifier;
use crate::sampler::{ProbeError, Sampler};
use crate::state::DeviceState;

/// Slack on top of a sampler's own budget before its check is abandoned.
const CHECK_GRACE: Duration = Duration::from_secs(1);

/// What happened to one device during a tick.
#[derive(Debug, Default, Clone, Copy)]
struct DeviceReport {
    failed: bool,
    changed: bool,
    notified: bool,
}

/// Totals for one tick over all devices.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub failed: usize,
    pub changed: usize,
    pub notified: usize,
}

impl TickReport {
    fn record(&mut self, device: DeviceReport) {
        self.checked += 1;
        self.failed += usize::from(device.failed);
        self.changed += usize::from(device.changed);
        self.notified += usize::from(device.notified);
    }
}

struct Engine {
    samplers: Vec<Sampler>,
    notifier: Arc<dyn Notifier>,
    state: Arc<dyn DeviceState>,
    telemetry: Arc<dyn Telemetry>,
    always_notify: bool,
}

pub struct Manager {
    engine: Arc<Engine>,
    interval: Duration,
}

impl Engine {
    async fn probe_device(&self, index: usize) -> DeviceReport {
        let sampler = &self.samplers[index];
        let device = sampler.device();
        let budget = sampler.budget();

        let outcome = match tokio::time::timeout(budget + CHECK_GRACE, sampler.check()).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::failed(ProbeError::Deadline(budget)),
        };

        let failed = match &outcome.error {
            Some(err) => {
                error!("error probing {}: {}", device.name, err);
                for cause in err.causes() {
                    debug!("{} ({}): {:?}", device.name, sampler.scheme().label(), cause);
                }
                self.telemetry
                    .inc_probe_error(sampler.scheme(), &device.name, sampler.address());
                true
            }
            None => {
                self.telemetry
                    .set_present(&device.name, sampler.address(), outcome.present);
                debug!("Probed {}={}", device.name, outcome.present);
                false
            }
        };

        let mut report = self.evaluate_state(sampler, outcome.present).await;
        report.failed = failed;
        report
    }

    async fn evaluate_state(&self, sampler: &Sampler, present: bool) -> DeviceReport {
        let device = sampler.device();
        let changed = self.state.has_state_changed(&device.name, present);

        if changed {
            self.telemetry
                .inc_state_change(&device.name, sampler.address());
            info!("Detected state change: {} is_present={}", device.name, present);
        }

        if !changed && !self.always_notify {
            // Nothing to tell when only changes are announced
            return DeviceReport {
                changed,
                ..Default::default()
            };
        }

        let notified = match self.notifier.notify(device, Outcome::from(present)).await {
            Ok(()) => true,
            Err(err) => {
                error!("error dispatching update for {}: {}", device.name, err);
                self.telemetry.inc_notification_error();
                false
            }
        };

        DeviceReport {
            changed,
            notified,
            ..Default::default()
        }
    }
}

impl Manager {
    pub fn new(
        samplers: Vec<Sampler>,
        notifier: Arc<dyn Notifier>,
        state: Arc<dyn DeviceState>,
        telemetry: Arc<dyn Telemetry>,
        always_notify: bool,
        interval: Duration,
    ) -> Self {
        Manager {
            engine: Arc::new(Engine {
                samplers,
                notifier,
                state,
                telemetry,
                always_notify,
            }),
            interval,
        }
    }

    /// Probes every device concurrently and returns once all of them are done.
    pub async fn tick(&self) -> TickReport {
        let mut tasks = JoinSet::new();
        for index in 0..self.engine.samplers.len() {
            let engine = self.engine.clone();
            tasks.spawn(async move { engine.probe_device(index).await });
        }

        let mut report = TickReport::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(device) => report.record(device),
                Err(err) => error!("device check aborted: {}", err),
            }
        }

        self.engine.telemetry.heartbeat();
        report
    }

    /// Ticks once right away and then on every interval until `cancel` fires.
    /// A tick in flight is allowed to finish.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        info!(
            "Monitoring {} devices every {:?}",
            self.engine.samplers.len(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Got cancellation, stopping manager loop");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.checked < self.engine.samplers.len() {
                        warn!(
                            "Only {} of {} device checks completed",
                            report.checked,
                            self.engine.samplers.len()
                        );
                    }
                    debug!(
                        "Tick finished: {} checked, {} failed, {} changed, {} notified",
                        report.checked, report.failed, report.changed, report.notified
                    );
                }
            }
        }
    }
}
