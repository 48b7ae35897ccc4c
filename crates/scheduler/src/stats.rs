use std::sync::atomic::{AtomicU64, Ordering};

/// Window length shared by every frame-time average in the pipeline.
pub const STAT_SAMPLES: usize = 20;

/// Fixed-window arithmetic mean over the last `N` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage<const N: usize> {
    samples: [u64; N],
    len: usize,
    cursor: usize,
    sum: u64,
    last: u64,
}

impl<const N: usize> Default for MovingAverage<N> {
    fn default() -> Self {
        Self {
            samples: [0; N],
            len: 0,
            cursor: 0,
            sum: 0,
            last: 0,
        }
    }
}

impl<const N: usize> MovingAverage<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: u64) {
        if N == 0 {
            self.last = value;
            return;
        }
        if self.len == N {
            self.sum -= self.samples[self.cursor];
        } else {
            self.len += 1;
        }
        self.samples[self.cursor] = value;
        self.sum += value;
        self.cursor = (self.cursor + 1) % N;
        self.last = value;
    }

    pub fn average(&self) -> u64 {
        if self.len == 0 {
            0
        } else {
            self.sum / self.len as u64
        }
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Latency sources tracked by the presentation scheduler.
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub presentation_interval: MovingAverage<STAT_SAMPLES>,
    pub frame_time: MovingAverage<STAT_SAMPLES>,
    pub fence_time: MovingAverage<STAT_SAMPLES>,
    pub timestamp_time: MovingAverage<STAT_SAMPLES>,
}

/// Lock-free mirror of the scheduler's statistics, readable from any thread.
#[derive(Debug, Default)]
pub struct SharedStats {
    last_interval: AtomicU64,
    avg_interval: AtomicU64,
    last_frame_time: AtomicU64,
    avg_frame_time: AtomicU64,
    avg_fence_time: AtomicU64,
    avg_timestamp_time: AtomicU64,
    director_frame_time: AtomicU64,
    presented: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    recreated: AtomicU64,
}

impl SharedStats {
    pub fn publish(&self, stats: &FrameStats) {
        self.last_interval
            .store(stats.presentation_interval.last(), Ordering::Relaxed);
        self.avg_interval
            .store(stats.presentation_interval.average(), Ordering::Relaxed);
        self.last_frame_time
            .store(stats.frame_time.last(), Ordering::Relaxed);
        self.avg_frame_time
            .store(stats.frame_time.average(), Ordering::Relaxed);
        self.avg_fence_time
            .store(stats.fence_time.average(), Ordering::Relaxed);
        self.avg_timestamp_time
            .store(stats.timestamp_time.average(), Ordering::Relaxed);
    }

    pub fn set_director_frame_time(&self, micros: u64) {
        self.director_frame_time.store(micros, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recreated(&self) {
        self.recreated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            last_interval: self.last_interval.load(Ordering::Relaxed),
            avg_interval: self.avg_interval.load(Ordering::Relaxed),
            last_frame_time: self.last_frame_time.load(Ordering::Relaxed),
            avg_frame_time: self.avg_frame_time.load(Ordering::Relaxed),
            avg_fence_time: self.avg_fence_time.load(Ordering::Relaxed),
            avg_timestamp_time: self.avg_timestamp_time.load(Ordering::Relaxed),
            director_frame_time: self.director_frame_time.load(Ordering::Relaxed),
            frames_presented: self.presented.load(Ordering::Relaxed),
            frames_failed: self.failed.load(Ordering::Relaxed),
            frames_cancelled: self.cancelled.load(Ordering::Relaxed),
            swapchain_recreations: self.recreated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SharedStats`]. Raw values are microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub last_interval: u64,
    pub avg_interval: u64,
    pub last_frame_time: u64,
    pub avg_frame_time: u64,
    pub avg_fence_time: u64,
    pub avg_timestamp_time: u64,
    pub director_frame_time: u64,
    pub frames_presented: u64,
    pub frames_failed: u64,
    pub frames_cancelled: u64,
    pub swapchain_recreations: u64,
}

fn per_second(interval_micros: u64) -> f32 {
    if interval_micros == 0 {
        0.0
    } else {
        1.0 / (interval_micros as f32 / 1_000_000.0)
    }
}

fn millis(value: u64) -> f32 {
    value as f32 / 1_000.0
}

impl StatsSnapshot {
    pub fn fps(&self) -> f32 {
        per_second(self.last_interval)
    }

    pub fn avg_fps(&self) -> f32 {
        per_second(self.avg_interval)
    }

    /// Milliseconds spent producing the last frame.
    pub fn spf(&self) -> f32 {
        millis(self.last_frame_time)
    }

    pub fn fence_frame_time(&self) -> f32 {
        millis(self.avg_fence_time)
    }

    pub fn timestamp_frame_time(&self) -> f32 {
        millis(self.avg_timestamp_time)
    }

    pub fn director_frame_time(&self) -> f32 {
        millis(self.director_frame_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_covers_last_window_only() {
        let mut avg = MovingAverage::<4>::new();
        assert_eq!(avg.average(), 0);
        for value in [10, 20, 30, 40] {
            avg.push(value);
        }
        assert_eq!(avg.average(), 25);
        avg.push(100);
        assert_eq!(avg.len(), 4);
        assert_eq!(avg.average(), (20 + 30 + 40 + 100) / 4);
        assert_eq!(avg.last(), 100);
    }

    #[test]
    fn snapshot_converts_units() {
        let shared = SharedStats::default();
        let mut stats = FrameStats::default();
        stats.presentation_interval.push(16_000);
        stats.presentation_interval.push(20_000);
        stats.frame_time.push(4_500);
        stats.fence_time.push(2_000);
        shared.publish(&stats);
        shared.set_director_frame_time(250);

        let snapshot = shared.snapshot();
        assert!((snapshot.fps() - 50.0).abs() < 0.01);
        assert!((snapshot.avg_fps() - 1_000_000.0 / 18_000.0).abs() < 0.01);
        assert!((snapshot.spf() - 4.5).abs() < f32::EPSILON);
        assert!((snapshot.fence_frame_time() - 2.0).abs() < f32::EPSILON);
        assert!((snapshot.director_frame_time() - 0.25).abs() < f32::EPSILON);
        assert_eq!(snapshot.timestamp_frame_time(), 0.0);
    }

    #[test]
    fn empty_snapshot_reports_zero_fps() {
        assert_eq!(StatsSnapshot::default().fps(), 0.0);
    }
}
