use std::time::{Duration, Instant};
use tracing::info;

pub const DEFAULT_TICK_INTERVAL: u64 = 50_000;

/// Sink for per-record progress. `tick` is called on the hot path.
pub trait ProgressMonitor {
    fn start(&mut self);

    fn tick(&mut self);

    fn finish(&mut self);

    fn ticks(&self) -> u64;

    fn elapsed(&self) -> Duration;
}

impl<M: ProgressMonitor + ?Sized> ProgressMonitor for &mut M {
    fn start(&mut self) {
        (**self).start()
    }

    fn tick(&mut self) {
        (**self).tick()
    }

    fn finish(&mut self) {
        (**self).finish()
    }

    fn ticks(&self) -> u64 {
        (**self).ticks()
    }

    fn elapsed(&self) -> Duration {
        (**self).elapsed()
    }
}

fn per_second(count: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (count as f64 / secs) as u64
    } else {
        count
    }
}

/// Logs a line every `interval` ticks with the batch and overall rate.
#[derive(Debug)]
pub struct LogProgressMonitor {
    label: &'static str,
    interval: u64,
    ticks: u64,
    started: Option<Instant>,
    batch_started: Option<Instant>,
    finished: Option<Duration>,
}

impl LogProgressMonitor {
    pub fn new(label: &'static str, interval: u64) -> Self {
        Self { label, interval: interval.max(1), ticks: 0, started: None, batch_started: None, finished: None }
    }
}

impl ProgressMonitor for LogProgressMonitor {
    fn start(&mut self) {
        let now = Instant::now();
        self.started = Some(now);
        self.batch_started = Some(now);
        self.finished = None;
        self.ticks = 0;
    }

    fn tick(&mut self) {
        self.ticks += 1;
        if self.ticks % self.interval != 0 {
            return;
        }

        let now = Instant::now();
        let batch = self.batch_started.map(|t| now - t).unwrap_or_default();
        self.batch_started = Some(now);

        info!(
            total = self.ticks,
            batch_rate = per_second(self.interval, batch),
            avg_rate = per_second(self.ticks, self.elapsed()),
            "{}: {} [batch {}/s, avg {}/s]",
            self.label,
            self.ticks,
            per_second(self.interval, batch),
            per_second(self.ticks, self.elapsed()),
        );
    }

    fn finish(&mut self) {
        let elapsed = self.elapsed();
        self.finished = Some(elapsed);

        info!(
            total = self.ticks,
            secs = elapsed.as_secs_f64(),
            "{} {} in {:.2} s [{} per s]",
            self.ticks,
            self.label,
            elapsed.as_secs_f64(),
            per_second(self.ticks, elapsed),
        );
    }

    fn ticks(&self) -> u64 {
        self.ticks
    }

    fn elapsed(&self) -> Duration {
        match (self.finished, self.started) {
            (Some(elapsed), _) => elapsed,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }
}

/// Counts ticks and measures time without logging.
#[derive(Debug, Default)]
pub struct NullProgressMonitor {
    ticks: u64,
    started: Option<Instant>,
    finished: Option<Duration>,
}

impl ProgressMonitor for NullProgressMonitor {
    fn start(&mut self) {
        self.started = Some(Instant::now());
        self.finished = None;
        self.ticks = 0;
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }

    fn finish(&mut self) {
        self.finished = Some(self.elapsed());
    }

    fn ticks(&self) -> u64 {
        self.ticks
    }

    fn elapsed(&self) -> Duration {
        match (self.finished, self.started) {
            (Some(elapsed), _) => elapsed,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_ticks() {
        let mut monitor = LogProgressMonitor::new("statements", 10);
        monitor.start();
        for _ in 0..35 {
            monitor.tick();
        }
        monitor.finish();

        assert_eq!(monitor.ticks(), 35);
        let elapsed = monitor.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(monitor.elapsed(), elapsed, "elapsed is frozen by finish");
    }

    #[test]
    fn forwards_through_references() {
        fn drive<M: ProgressMonitor>(mut monitor: M) {
            monitor.start();
            monitor.tick();
            monitor.tick();
        }

        let mut monitor = NullProgressMonitor::default();
        drive(&mut monitor);
        drive(&mut monitor as &mut dyn ProgressMonitor);
        assert_eq!(monitor.ticks(), 2);
    }

    #[test]
    fn rate_of_zero_duration() {
        assert_eq!(per_second(10, Duration::ZERO), 10);
        assert_eq!(per_second(10, Duration::from_secs(2)), 5);
    }
}
