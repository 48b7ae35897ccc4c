use std::time::Duration;

/// Timing snapshot for one update pass. Clock values are microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UpdateTime {
    /// Monotonic clock at the time of the update.
    pub global: u64,
    /// Time since the previous update, clamped to the configured maximum.
    pub delta: u64,
    /// Time since the timeline started.
    pub app: u64,
    /// `delta` in seconds.
    pub dt: f32,
}

/// Produces successive [`UpdateTime`] values with a clamped delta.
#[derive(Debug, Clone)]
pub struct Timeline {
    start: u64,
    current: UpdateTime,
    max_delta: u64,
}

impl Timeline {
    pub fn new(now: u64, max_delta: Duration) -> Self {
        Self {
            start: now,
            current: UpdateTime {
                global: now,
                ..UpdateTime::default()
            },
            max_delta: max_delta.as_micros() as u64,
        }
    }

    pub fn current(&self) -> &UpdateTime {
        &self.current
    }

    pub fn max_delta(&self) -> u64 {
        self.max_delta
    }

    /// Advances to `now`. A clock that moved backwards is held at the last
    /// reading and yields a zero delta.
    pub fn tick(&mut self, now: u64) -> UpdateTime {
        let now = now.max(self.current.global);
        let delta = (now - self.current.global).min(self.max_delta);
        self.current = UpdateTime {
            global: now,
            delta,
            app: now.saturating_sub(self.start),
            dt: delta as f32 / 1_000_000.0,
        };
        self.current
    }
}
