//! Agent health monitor
//!
//! Samples process CPU and memory on a fixed cadence, tracks heartbeat
//! latency and per-command outcomes, and classifies each signal against
//! static thresholds. Aggregate health is the worst individual signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::domain_types::{HealthSampleSecs, HealthWindowSamples};

/// Commands below this count do not influence the success-rate signal
const MIN_COMMANDS_FOR_RATE: u64 = 5;

/// Classification of one signal, or the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Degraded,
    Unhealthy,
}

/// Cumulative command counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
}

/// Health snapshot returned by the probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub cpu_percent_avg: f64,
    pub memory_percent_avg: f64,
    pub heartbeat_latency_avg_secs: f64,
    pub command_success_rate: Option<f64>,
    pub counters: CommandCounters,
    pub signals: SignalStates,
}

/// Per-signal classification detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStates {
    pub cpu: HealthState,
    pub memory: HealthState,
    pub heartbeat: HealthState,
    pub commands: HealthState,
}

#[derive(Debug, Default)]
struct Windows {
    cpu: VecDeque<f64>,
    memory: VecDeque<f64>,
    heartbeat_latency: VecDeque<f64>,
    response_times: VecDeque<f64>,
}

/// The monitor; sampling is driven externally on `sample_interval`
pub struct HealthMonitor {
    windows: Mutex<Windows>,
    window_len: usize,
    sample_interval: HealthSampleSecs,
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    timeout: AtomicU64,
    system: Mutex<System>,
}

impl HealthMonitor {
    /// Creates a monitor with the given window geometry
    #[must_use]
    pub fn new(sample_interval: HealthSampleSecs, window: HealthWindowSamples) -> Self {
        Self {
            windows: Mutex::new(Windows::default()),
            window_len: window.as_usize(),
            sample_interval,
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
            system: Mutex::new(System::new()),
        }
    }

    /// The cadence the owner should call [`Self::sample`] on
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        self.sample_interval.as_duration()
    }

    /// Takes one CPU/memory sample of this process
    pub fn sample(&self) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return;
        };
        let (cpu, memory_percent) = {
            let mut system = self.system.lock().unwrap();
            system.refresh_processes();
            system.refresh_memory();
            let Some(process) = system.process(pid) else {
                return;
            };
            let total = system.total_memory();
            let memory_percent = if total == 0 {
                0.0
            } else {
                process.memory() as f64 / total as f64 * 100.0
            };
            (f64::from(process.cpu_usage()), memory_percent)
        };
        self.record_sample(cpu, memory_percent);
    }

    /// Records one externally measured CPU/memory sample
    pub fn record_sample(&self, cpu_percent: f64, memory_percent: f64) {
        let mut windows = self.windows.lock().unwrap();
        push_bounded(&mut windows.cpu, cpu_percent, self.window_len);
        push_bounded(&mut windows.memory, memory_percent, self.window_len);
        debug!(cpu = cpu_percent, memory = memory_percent, "health sample");
    }

    /// Records one heartbeat round latency
    pub fn record_heartbeat_latency(&self, latency: Duration) {
        let mut windows = self.windows.lock().unwrap();
        push_bounded(
            &mut windows.heartbeat_latency,
            latency.as_secs_f64(),
            self.window_len,
        );
    }

    /// Records one dispatched command outcome
    pub fn record_command(&self, success: bool, timed_out: bool, duration: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else if timed_out {
            self.timeout.fetch_add(1, Ordering::Relaxed);
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut windows = self.windows.lock().unwrap();
        push_bounded(
            &mut windows.response_times,
            duration.as_secs_f64(),
            self.window_len,
        );
    }

    /// Current counters
    #[must_use]
    pub fn counters(&self) -> CommandCounters {
        CommandCounters {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }

    /// Classifies every signal and aggregates to the worst
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let windows = self.windows.lock().unwrap();
        let cpu_avg = average(&windows.cpu);
        let memory_avg = average(&windows.memory);
        let heartbeat_avg = average(&windows.heartbeat_latency);
        drop(windows);

        let counters = self.counters();
        let success_rate = if counters.total >= MIN_COMMANDS_FOR_RATE {
            Some(counters.success as f64 / counters.total as f64)
        } else {
            None
        };

        let signals = SignalStates {
            cpu: classify_percent(cpu_avg),
            memory: classify_percent(memory_avg),
            heartbeat: classify_latency(heartbeat_avg),
            commands: classify_rate(success_rate),
        };
        let state = signals
            .cpu
            .max(signals.memory)
            .max(signals.heartbeat)
            .max(signals.commands);

        HealthReport {
            state,
            cpu_percent_avg: cpu_avg,
            memory_percent_avg: memory_avg,
            heartbeat_latency_avg_secs: heartbeat_avg,
            command_success_rate: success_rate,
            counters,
            signals,
        }
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, cap: usize) {
    if window.len() >= cap {
        window.pop_front();
    }
    window.push_back(value);
}

fn average(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

fn classify_percent(avg: f64) -> HealthState {
    if avg >= 95.0 {
        HealthState::Unhealthy
    } else if avg >= 80.0 {
        HealthState::Degraded
    } else {
        HealthState::Ok
    }
}

fn classify_latency(avg_secs: f64) -> HealthState {
    if avg_secs >= 10.0 {
        HealthState::Unhealthy
    } else if avg_secs >= 2.0 {
        HealthState::Degraded
    } else {
        HealthState::Ok
    }
}

fn classify_rate(rate: Option<f64>) -> HealthState {
    match rate {
        None => HealthState::Ok,
        Some(rate) if rate < 0.5 => HealthState::Unhealthy,
        Some(rate) if rate < 0.8 => HealthState::Degraded,
        Some(_) => HealthState::Ok,
    }
}
