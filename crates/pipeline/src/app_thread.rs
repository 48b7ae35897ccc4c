use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, tick, unbounded};
use pipeconfig::AppSettings;
use scheduler::SharedClock;
use tracing::{debug, error, info};

use crate::context::AppContext;
use crate::task::{AppTask, TaskSender};

#[derive(Debug, thiserror::Error)]
pub enum AppThreadError {
    #[error("failed to spawn logic thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("logic thread setup failed: {0}")]
    Setup(String),
    #[error("logic thread panicked")]
    Panicked,
}

/// Cloneable, thread-safe front for the logic thread.
#[derive(Debug, Clone)]
pub struct AppHandle {
    tasks: TaskSender,
}

impl AppHandle {
    pub fn task_sender(&self) -> TaskSender {
        self.tasks.clone()
    }

    /// Queues `task` for the next loop iteration, even from the logic thread.
    pub fn perform(&self, task: AppTask) -> bool {
        self.tasks.perform(task)
    }

    pub fn wakeup(&self) -> bool {
        self.tasks.wakeup()
    }

    pub fn is_on_app_thread(&self) -> bool {
        self.tasks.is_on_app_thread()
    }
}

/// Owns the logic thread. The thread ticks on a fixed interval and runs the
/// task queue in between; [`AppContext`] is created on it and never leaves it.
pub struct AppThread {
    handle: AppHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl AppThread {
    /// Spawns the thread and runs `setup` on it before the first tick.
    pub fn start<F>(
        settings: AppSettings,
        clock: SharedClock,
        setup: F,
    ) -> Result<Self, AppThreadError>
    where
        F: FnOnce(&mut AppContext) -> anyhow::Result<()> + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let tasks = TaskSender::new(tx.clone(), Arc::new(OnceLock::new()));
        let handle = AppHandle {
            tasks: tasks.clone(),
        };
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let join_handle = thread::Builder::new()
            .name("app-logic".into())
            .spawn(move || {
                tasks.bind_current_thread();
                let mut ctx = AppContext::with_channel(&settings, clock, tx, rx, tasks);
                if let Err(err) = setup(&mut ctx) {
                    error!("logic thread setup failed: {err:#}");
                    let _ = ready_tx.send(Err(format!("{err:#}")));
                    ctx.shutdown();
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                run_app_loop(&mut ctx, settings);
            })
            .map_err(AppThreadError::Spawn)?;

        let mut app = Self {
            handle,
            join_handle: Some(join_handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(app),
            Ok(Err(message)) => {
                app.join()?;
                Err(AppThreadError::Setup(message))
            }
            Err(_) => {
                app.join()?;
                Err(AppThreadError::Panicked)
            }
        }
    }

    pub fn handle(&self) -> AppHandle {
        self.handle.clone()
    }

    /// Asks the loop to finish once no exit guard is held, then joins it.
    /// Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<(), AppThreadError> {
        if self.join_handle.is_some() {
            self.handle.tasks.stop();
        }
        self.join()
    }

    fn join(&mut self) -> Result<(), AppThreadError> {
        match self.join_handle.take() {
            Some(join_handle) => join_handle.join().map_err(|_| AppThreadError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for AppThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_app_loop(ctx: &mut AppContext, settings: AppSettings) {
    let ticker = tick(settings.update_interval);
    let messages = ctx.receiver();
    info!(interval = ?settings.update_interval, "logic thread started");

    ctx.perform_update(false);
    while !ctx.should_exit() {
        select! {
            recv(messages) -> message => match message {
                Ok(message) => ctx.handle_message(message),
                Err(_) => break,
            },
            recv(ticker) -> _ => ctx.perform_update(false),
        }
    }

    debug!(failed_tasks = ctx.failed_tasks(), "logic thread finishing");
    ctx.shutdown();
    info!("logic thread finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use scheduler::MonotonicClock;

    use super::*;

    fn settings() -> AppSettings {
        AppSettings {
            update_interval: Duration::from_millis(5),
            ..AppSettings::default()
        }
    }

    #[test]
    fn runs_tasks_on_the_logic_thread() {
        let mut app = AppThread::start(settings(), MonotonicClock::shared(), |_| Ok(())).unwrap();
        let handle = app.handle();
        assert!(!handle.is_on_app_thread());

        let (tx, rx) = bounded(1);
        handle.perform(AppTask::new("ping", move |ctx| {
            let on_thread = ctx.task_sender().is_on_app_thread();
            let _ = tx.send(on_thread);
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        app.stop().unwrap();
        app.stop().unwrap();
        assert!(!handle.perform(AppTask::new("late", |_| {})));
    }

    #[test]
    fn timer_drives_listener_updates() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let (tx, rx) = bounded(1);
        let mut app = AppThread::start(settings(), MonotonicClock::shared(), move |ctx| {
            let owner = ctx.create_object();
            ctx.add_listener(owner, move |_, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 3 {
                    let _ = tx.try_send(());
                }
            });
            Ok(())
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        app.stop().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn setup_failure_is_reported() {
        let result = AppThread::start(settings(), MonotonicClock::shared(), |_| {
            Err(anyhow::anyhow!("no display"))
        });
        match result {
            Err(AppThreadError::Setup(message)) => assert!(message.contains("no display")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("setup failure was ignored"),
        }
    }

    #[test]
    fn stop_waits_for_exit_guards() {
        let released = Arc::new(AtomicUsize::new(0));
        let flag = released.clone();
        let mut app = AppThread::start(settings(), MonotonicClock::shared(), |ctx| {
            ctx.retain_exit_guard();
            Ok(())
        })
        .unwrap();
        let handle = app.handle();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flag.store(1, Ordering::SeqCst);
            handle.perform(AppTask::new("release", |ctx| ctx.release_exit_guard()));
        });
        app.stop().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
    }

    #[test]
    fn unbalanced_exit_guard_release_ends_the_loop() {
        let mut app = AppThread::start(settings(), MonotonicClock::shared(), |_| Ok(())).unwrap();
        let handle = app.handle();
        assert!(handle.perform(AppTask::new("close", |ctx| ctx.release_exit_guard())));

        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = tx.send(app.stop());
        });
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Err(AppThreadError::Panicked)));
    }
}
