use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{LedControlError, Result};

/// Animation time wraps after one week so trig helpers never see huge
/// arguments.
pub const TIME_WRAP_SECONDS: f64 = 604_800.0;

/// Monotonic animation clock with a resettable epoch.
///
/// Lock-free so that a reset from a request thread never waits on the render
/// thread.
#[derive(Debug)]
pub struct RenderClock {
    base: Instant,
    epoch_nanos: AtomicU64,
}

impl Default for RenderClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderClock {
    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    pub fn with_epoch(epoch: Instant) -> Self {
        Self {
            base: epoch,
            epoch_nanos: AtomicU64::new(0),
        }
    }

    /// Re-bases elapsed time to zero.
    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&self, instant: Instant) {
        let nanos = instant.saturating_duration_since(self.base).as_nanos() as u64;
        self.epoch_nanos.store(nanos, Ordering::Release);
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed_at(Instant::now())
    }

    /// Seconds from the epoch to `instant`, never negative, wrapped at
    /// [`TIME_WRAP_SECONDS`].
    pub fn elapsed_at(&self, instant: Instant) -> f64 {
        let since_base = instant.saturating_duration_since(self.base).as_nanos() as u64;
        let nanos = since_base.saturating_sub(self.epoch_nanos.load(Ordering::Acquire));
        (nanos as f64 / 1e9) % TIME_WRAP_SECONDS
    }
}

#[derive(Debug)]
struct StatsInner {
    cycles: u64,
    last_start: Option<Instant>,
    measured_cycles: u64,
    measured_at: Instant,
    cost_total: Duration,
    cost_cycles: u64,
}

/// Reset-on-read cycle statistics of a [`RenderScheduler`].
#[derive(Debug)]
pub struct FrameStats {
    inner: Mutex<StatsInner>,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                cycles: 0,
                last_start: None,
                measured_cycles: 0,
                measured_at: Instant::now(),
                cost_total: Duration::ZERO,
                cost_cycles: 0,
            }),
        }
    }

    pub fn record(&self, start: Instant, cost: Duration) {
        if let Ok(mut inner) = self.lock() {
            inner.cycles += 1;
            inner.last_start = Some(start);
            inner.cost_total += cost;
            inner.cost_cycles += 1;
        }
    }

    pub fn cycles(&self) -> Result<u64> {
        Ok(self.lock()?.cycles)
    }

    /// Cycles per second between the cycle starts seen since the previous
    /// call. Zero when no time has passed.
    pub fn rate(&self) -> Result<f64> {
        let mut inner = self.lock()?;
        let Some(last_start) = inner.last_start else {
            return Ok(0.0);
        };
        let cycles = inner.cycles - inner.measured_cycles;
        let seconds = last_start
            .saturating_duration_since(inner.measured_at)
            .as_secs_f64();
        inner.measured_cycles = inner.cycles;
        inner.measured_at = last_start;
        if seconds > 0.0 {
            Ok(cycles as f64 / seconds)
        } else {
            Ok(0.0)
        }
    }

    /// Mean execution time of the cycles since the previous call.
    pub fn average_cost(&self) -> Result<Duration> {
        let mut inner = self.lock()?;
        let average = match inner.cost_cycles {
            0 => Duration::ZERO,
            n => inner.cost_total / n as u32,
        };
        inner.cost_total = Duration::ZERO;
        inner.cost_cycles = 0;
        Ok(average)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StatsInner>> {
        self.inner
            .lock()
            .map_err(|_| LedControlError::Poisoned("frame statistics"))
    }
}

/// Fixed-rate loop on a dedicated thread.
///
/// Each wait is `interval - (now - cycle_start)` floored at zero, so an
/// overrunning cycle is followed immediately by the next one and missed ticks
/// are never caught up.
#[derive(Debug)]
pub struct RenderScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<FrameStats>,
}

impl RenderScheduler {
    /// Spawns the loop. `cycle` receives the start instant of each cycle.
    pub fn start<F>(refresh_rate: f64, mut cycle: F) -> Result<Self>
    where
        F: FnMut(Instant) + Send + 'static,
    {
        if !(refresh_rate.is_finite() && refresh_rate > 0.0) {
            return Err(LedControlError::InvalidConfig(format!(
                "refresh rate must be positive, got {refresh_rate}"
            )));
        }
        let interval = Duration::from_secs_f64(1.0 / refresh_rate);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let stats = Arc::new(FrameStats::new());
        let loop_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("ledcontrol-render".to_string())
            .spawn(move || {
                let mut wait = Duration::ZERO;
                loop {
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let start = Instant::now();
                    cycle(start);
                    let cost = start.elapsed();
                    loop_stats.record(start, cost);
                    wait = interval.saturating_sub(start.elapsed());
                }
            })?;

        tracing::info!(refresh_rate, "render loop started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<FrameStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the loop and blocks until its thread has exited.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // a closed channel also ends the loop
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("render thread panicked");
            } else {
                tracing::info!("render loop stopped");
            }
        }
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
