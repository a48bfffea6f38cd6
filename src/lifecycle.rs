use tracing::info;

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::job::{AggregationJob, JobPhase};
use crate::transport::{BrokerLink, TransportConnection};

/// The network bearer underneath the broker session (the radio and its IP
/// attachment). Availability is polled; loss is not signalled asynchronously.
pub trait NetworkBearer {
    fn available(&mut self) -> bool;
    fn disconnect(&mut self);
}

/// Deep-sleep control. `suspend_micros` powers the core down and never
/// returns; the next boot starts a fresh duty cycle from scratch.
pub trait PowerControl {
    fn suspend_micros(&mut self, duration_us: u64) -> !;
}

/// Periodic tick driver behind the sampling cadence.
pub trait TickSource {
    fn stop(&mut self);
}

/// Sequences the end of a duty cycle: stop ticking, tear the stack down from
/// the top, settle, then suspend. Every teardown step is best-effort; a
/// failed disconnect must never keep the device awake draining the battery.
#[derive(Debug)]
pub struct LifecycleCoordinator {
    config: LifecycleConfig,
}

impl LifecycleCoordinator {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn is_ready_for_suspend(&self, job: &AggregationJob) -> bool {
        job.phase() == JobPhase::ReadyForSuspend
    }

    /// Teardown in strict order: tick source first so no sampling callback
    /// fires mid-teardown, then the broker session, then the bearer, then a
    /// settle delay to let in-flight frames leave the radio.
    pub fn prepare_for_suspend<T, L, B, C>(
        &self,
        ticker: &mut T,
        transport: &mut TransportConnection,
        link: &mut L,
        bearer: &mut B,
        clock: &C,
    ) where
        T: TickSource,
        L: BrokerLink,
        B: NetworkBearer,
        C: Clock,
    {
        info!("preparing for suspend");
        ticker.stop();
        transport.disconnect(link);
        bearer.disconnect();
        clock.delay_ms(self.config.settle_ms);
    }

    pub fn shutdown<T, L, B, C, P>(
        &self,
        ticker: &mut T,
        transport: &mut TransportConnection,
        link: &mut L,
        bearer: &mut B,
        clock: &C,
        power: &mut P,
    ) -> !
    where
        T: TickSource,
        L: BrokerLink,
        B: NetworkBearer,
        C: Clock,
        P: PowerControl,
    {
        self.prepare_for_suspend(ticker, transport, link, bearer, clock);
        info!(
            duration_us = self.config.sleep_duration_us,
            "entering deep sleep"
        );
        power.suspend_micros(self.config.sleep_duration_us)
    }
}
