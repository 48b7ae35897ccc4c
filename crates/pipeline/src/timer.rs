use std::collections::BTreeMap;
use std::time::Duration;

use crate::time::UpdateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnMut(&UpdateTime)>;

struct TimerEntry {
    interval: u64,
    elapsed: u64,
    repeating: bool,
    callback: TimerCallback,
}

/// Callbacks fired from the director's update after an accumulated amount of
/// tick time. Time only advances while updates run, so a paused director
/// also pauses its timers.
#[derive(Default)]
pub struct TimedScheduler {
    entries: BTreeMap<TimerId, TimerEntry>,
    next_id: u64,
}

impl TimedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_once(
        &mut self,
        delay: Duration,
        callback: impl FnMut(&UpdateTime) + 'static,
    ) -> TimerId {
        self.insert(delay, false, Box::new(callback))
    }

    /// Fires at most once per update even if several intervals elapsed.
    pub fn schedule_repeating(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&UpdateTime) + 'static,
    ) -> TimerId {
        self.insert(interval, true, Box::new(callback))
    }

    pub fn unschedule(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn unschedule_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn update(&mut self, time: &UpdateTime) {
        let mut finished = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            entry.elapsed = entry.elapsed.saturating_add(time.delta);
            if entry.elapsed < entry.interval {
                continue;
            }
            (entry.callback)(time);
            if entry.repeating {
                entry.elapsed = (entry.elapsed - entry.interval).min(entry.interval);
            } else {
                finished.push(*id);
            }
        }
        for id in finished {
            self.entries.remove(&id);
        }
    }

    fn insert(&mut self, delay: Duration, repeating: bool, callback: TimerCallback) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert(
            id,
            TimerEntry {
                interval: delay.as_micros() as u64,
                elapsed: 0,
                repeating,
                callback,
            },
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn step(delta: u64) -> UpdateTime {
        UpdateTime {
            delta,
            ..UpdateTime::default()
        }
    }

    #[test]
    fn one_shot_fires_once_after_delay() {
        let hits = Rc::new(Cell::new(0));
        let mut timers = TimedScheduler::new();
        let counter = hits.clone();
        timers.schedule_once(Duration::from_millis(10), move |_| counter.set(counter.get() + 1));

        timers.update(&step(6_000));
        assert_eq!(hits.get(), 0);
        timers.update(&step(6_000));
        assert_eq!(hits.get(), 1);
        timers.update(&step(20_000));
        assert_eq!(hits.get(), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn repeating_timer_keeps_cadence() {
        let hits = Rc::new(Cell::new(0));
        let mut timers = TimedScheduler::new();
        let counter = hits.clone();
        let id =
            timers.schedule_repeating(Duration::from_millis(5), move |_| counter.set(counter.get() + 1));
        for _ in 0..4 {
            timers.update(&step(5_000));
        }
        assert_eq!(hits.get(), 4);
        assert!(timers.unschedule(id));
        timers.update(&step(5_000));
        assert_eq!(hits.get(), 4);
    }

    #[test]
    fn repeating_timer_fires_once_per_update_after_a_stall() {
        let hits = Rc::new(Cell::new(0));
        let mut timers = TimedScheduler::new();
        let counter = hits.clone();
        timers.schedule_repeating(Duration::from_millis(5), move |_| counter.set(counter.get() + 1));

        timers.update(&step(17_000));
        assert_eq!(hits.get(), 1);
        // Backlog is capped at one interval.
        timers.update(&step(0));
        assert_eq!(hits.get(), 2);
        timers.update(&step(1_000));
        assert_eq!(hits.get(), 2);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn unschedule_all_drops_pending_callbacks() {
        let mut timers = TimedScheduler::new();
        timers.schedule_once(Duration::ZERO, |_| panic!("cancelled timer fired"));
        timers.unschedule_all();
        timers.update(&step(1));
    }
}
