use std::collections::BTreeMap;
use std::time::Duration;

use tracing::trace;

use crate::time::UpdateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

struct RunningAction {
    tag: &'static str,
    duration: u64,
    elapsed: u64,
    step: Box<dyn FnMut(f32)>,
    complete: Option<Box<dyn FnOnce()>>,
}

/// Time-based animations advanced by the director every tick. `step`
/// receives progress in `0.0..=1.0`; the final step always reports `1.0`.
#[derive(Default)]
pub struct ActionManager {
    running: BTreeMap<ActionId, RunningAction>,
    next_id: u64,
}

impl ActionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(
        &mut self,
        tag: &'static str,
        duration: Duration,
        step: impl FnMut(f32) + 'static,
    ) -> ActionId {
        self.next_id += 1;
        let id = ActionId(self.next_id);
        self.running.insert(
            id,
            RunningAction {
                tag,
                duration: duration.as_micros() as u64,
                elapsed: 0,
                step: Box::new(step),
                complete: None,
            },
        );
        id
    }

    pub fn on_complete(&mut self, id: ActionId, complete: impl FnOnce() + 'static) -> bool {
        match self.running.get_mut(&id) {
            Some(action) => {
                action.complete = Some(Box::new(complete));
                true
            }
            None => false,
        }
    }

    /// Stops without running the completion callback.
    pub fn stop(&mut self, id: ActionId) -> bool {
        self.running.remove(&id).is_some()
    }

    pub fn stop_all(&mut self) {
        self.running.clear();
    }

    pub fn is_running(&self, id: ActionId) -> bool {
        self.running.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn update(&mut self, time: &UpdateTime) {
        let mut finished = Vec::new();
        for (id, action) in self.running.iter_mut() {
            action.elapsed = action.elapsed.saturating_add(time.delta);
            let progress = if action.duration == 0 {
                1.0
            } else {
                (action.elapsed as f32 / action.duration as f32).min(1.0)
            };
            (action.step)(progress);
            if progress >= 1.0 {
                finished.push(*id);
            }
        }
        for id in finished {
            if let Some(action) = self.running.remove(&id) {
                trace!(action = action.tag, "action finished");
                if let Some(complete) = action.complete {
                    complete();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn step(delta: u64) -> UpdateTime {
        UpdateTime {
            delta,
            ..UpdateTime::default()
        }
    }

    #[test]
    fn progress_reaches_one_and_completes() {
        let progress = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(RefCell::new(false));
        let mut actions = ActionManager::new();
        let sink = progress.clone();
        let id = actions.run("fade", Duration::from_millis(100), move |p| {
            sink.borrow_mut().push(p)
        });
        let flag = done.clone();
        assert!(actions.on_complete(id, move || *flag.borrow_mut() = true));

        actions.update(&step(50_000));
        actions.update(&step(80_000));
        assert_eq!(*progress.borrow(), vec![0.5, 1.0]);
        assert!(*done.borrow());
        assert!(!actions.is_running(id));
    }

    #[test]
    fn stopped_action_skips_completion() {
        let mut actions = ActionManager::new();
        let id = actions.run("slide", Duration::from_secs(1), |_| {});
        actions.on_complete(id, || panic!("stopped action completed"));
        assert!(actions.stop(id));
        actions.update(&step(2_000_000));
        assert!(actions.is_empty());
    }
}
