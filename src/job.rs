use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{DutyCycleConfig, CYCLE_CAP, WINDOW_CAP};

/// Source of raw biometric readings. Implementations wrap the sensor bus;
/// readings are taken synchronously on the tick path.
pub trait VitalsSource {
    fn temperature(&mut self) -> f32;
    fn pulse_rate(&mut self) -> f32;
}

/// Where a finished cycle report goes. `try_send` is one immediate delivery
/// attempt; `queue_for_retry` hands the report to deferred delivery after the
/// transmit budget runs out.
pub trait CycleSink {
    fn try_send(&mut self, averages: &CycleAverages) -> bool;
    fn queue_for_retry(&mut self, averages: &CycleAverages);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Collecting,
    Transmitting,
    ReadyForSuspend,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    temperature: f32,
    pulse_rate: f32,
}

#[derive(Debug, Clone, Copy)]
struct WindowAverage {
    temperature: f32,
    pulse_rate: f32,
}

/// Per-cycle means, one value per vital. SpO2 is a fixed placeholder until
/// the oximeter channel is wired up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleAverages {
    pub temperature: f32,
    pub pulse_rate: f32,
    pub spo2: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobStats {
    pub samples_taken: u32,
    pub windows_completed: u32,
    pub cycles_completed: u32,
    pub sends_attempted: u32,
    pub sends_failed: u32,
}

/// Drives one duty cycle: collect W samples per window, K windows per cycle,
/// average, transmit once, then declare the cycle done. The job always
/// reaches `ReadyForSuspend` after transmission is attempted; delivery
/// failures are the retry queue's problem, not a reason to stay awake.
#[derive(Debug)]
pub struct AggregationJob {
    config: DutyCycleConfig,
    phase: JobPhase,
    window: heapless::Vec<Sample, WINDOW_CAP>,
    completed_windows: heapless::Vec<WindowAverage, CYCLE_CAP>,
    stats: JobStats,
}

impl AggregationJob {
    pub fn new(mut config: DutyCycleConfig) -> Self {
        if config.samples_per_window == 0 || config.samples_per_window > WINDOW_CAP {
            warn!(
                requested = config.samples_per_window,
                cap = WINDOW_CAP,
                "samples per window clamped"
            );
            config.samples_per_window = config.samples_per_window.clamp(1, WINDOW_CAP);
        }
        if config.windows_per_cycle == 0 || config.windows_per_cycle > CYCLE_CAP {
            warn!(
                requested = config.windows_per_cycle,
                cap = CYCLE_CAP,
                "windows per cycle clamped"
            );
            config.windows_per_cycle = config.windows_per_cycle.clamp(1, CYCLE_CAP);
        }
        Self {
            config,
            phase: JobPhase::Idle,
            window: heapless::Vec::new(),
            completed_windows: heapless::Vec::new(),
            stats: JobStats::default(),
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    /// Begins collecting. A no-op unless the job is idle.
    pub fn start_job(&mut self) {
        if self.phase != JobPhase::Idle {
            return;
        }
        info!(
            samples_per_window = self.config.samples_per_window,
            windows_per_cycle = self.config.windows_per_cycle,
            "duty cycle started"
        );
        self.phase = JobPhase::Collecting;
    }

    /// Discards partial state and returns to idle.
    pub fn reset(&mut self) {
        self.window.clear();
        self.completed_windows.clear();
        self.phase = JobPhase::Idle;
    }

    /// One collection step. Takes a sample while collecting; when the window
    /// fills, folds it into a window average; when the last window completes,
    /// transmits the cycle report and moves to `ReadyForSuspend`.
    pub fn tick<S, K, C>(&mut self, source: &mut S, sink: &mut K, clock: &C)
    where
        S: VitalsSource,
        K: CycleSink,
        C: Clock,
    {
        if self.phase != JobPhase::Collecting {
            return;
        }

        let sample = Sample {
            temperature: source.temperature(),
            pulse_rate: source.pulse_rate(),
        };
        self.stats.samples_taken += 1;
        // Capacity is enforced by the constructor clamp.
        let _ = self.window.push(sample);

        if self.window.len() < self.config.samples_per_window {
            return;
        }

        let count = self.window.len() as f32;
        let average = WindowAverage {
            temperature: self.window.iter().map(|s| s.temperature).sum::<f32>() / count,
            pulse_rate: self.window.iter().map(|s| s.pulse_rate).sum::<f32>() / count,
        };
        self.window.clear();
        let _ = self.completed_windows.push(average);
        self.stats.windows_completed += 1;
        debug!(
            window = self.completed_windows.len(),
            of = self.config.windows_per_cycle,
            temperature = average.temperature,
            pulse_rate = average.pulse_rate,
            "window complete"
        );

        if self.completed_windows.len() < self.config.windows_per_cycle {
            return;
        }

        self.phase = JobPhase::Transmitting;
        let averages = self.cycle_averages();
        self.completed_windows.clear();
        self.stats.cycles_completed += 1;
        info!(
            temperature = averages.temperature,
            pulse_rate = averages.pulse_rate,
            "cycle complete, transmitting"
        );
        self.run_transmit(&averages, sink, clock);
        self.phase = JobPhase::ReadyForSuspend;
    }

    fn cycle_averages(&self) -> CycleAverages {
        let count = self.completed_windows.len() as f32;
        CycleAverages {
            temperature: self
                .completed_windows
                .iter()
                .map(|w| w.temperature)
                .sum::<f32>()
                / count,
            pulse_rate: self
                .completed_windows
                .iter()
                .map(|w| w.pulse_rate)
                .sum::<f32>()
                / count,
            spo2: self.config.default_spo2,
        }
    }

    /// Attempts delivery until it succeeds or the transmit budget is spent.
    /// The report is queued for deferred retry at most once, and only after
    /// every in-budget attempt has failed.
    fn run_transmit<K: CycleSink, C: Clock>(
        &mut self,
        averages: &CycleAverages,
        sink: &mut K,
        clock: &C,
    ) {
        let deadline_ms = clock.now_ms() + self.config.transmit_budget_ms;
        loop {
            self.stats.sends_attempted += 1;
            if sink.try_send(averages) {
                return;
            }
            self.stats.sends_failed += 1;
            if clock.now_ms() >= deadline_ms {
                break;
            }
            clock.delay_ms(self.config.transmit_retry_pause_ms);
        }
        warn!("transmit budget exhausted; report queued for retry");
        sink.queue_for_retry(averages);
    }
}
