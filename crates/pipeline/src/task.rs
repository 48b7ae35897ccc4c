use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crossbeam_channel::Sender;
use tracing::warn;

use crate::context::AppContext;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of something living on the logic thread that tasks and
/// listeners can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object:{}", self.0)
    }
}

pub type TaskFn = Box<dyn FnOnce(&mut AppContext) + Send>;

/// Unit of work for the logic thread.
///
/// A task bound to a `target` is dropped unrun once that object has been
/// released. `defer` forces the task onto the queue even when posted from the
/// logic thread itself, so it runs after the current update pass.
pub struct AppTask {
    job: TaskFn,
    target: Option<ObjectId>,
    tag: &'static str,
    defer: bool,
}

impl AppTask {
    pub fn new(tag: &'static str, job: impl FnOnce(&mut AppContext) + Send + 'static) -> Self {
        Self {
            job: Box::new(job),
            target: None,
            tag,
            defer: false,
        }
    }

    pub fn with_target(mut self, target: ObjectId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn deferred(mut self) -> Self {
        self.defer = true;
        self
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn target(&self) -> Option<ObjectId> {
        self.target
    }

    pub fn is_deferred(&self) -> bool {
        self.defer
    }

    pub(crate) fn into_job(self) -> TaskFn {
        self.job
    }
}

impl fmt::Debug for AppTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppTask")
            .field("tag", &self.tag)
            .field("target", &self.target)
            .field("defer", &self.defer)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum AppMessage {
    Task(AppTask),
    Wakeup,
    Stop,
}

/// Posts work to the logic thread from any thread.
#[derive(Clone)]
pub struct TaskSender {
    tx: Sender<AppMessage>,
    thread: Arc<OnceLock<ThreadId>>,
}

impl TaskSender {
    pub(crate) fn new(tx: Sender<AppMessage>, thread: Arc<OnceLock<ThreadId>>) -> Self {
        Self { tx, thread }
    }

    /// Queues `task` for the next loop iteration.
    pub fn perform(&self, task: AppTask) -> bool {
        self.send(AppMessage::Task(task))
    }

    /// Requests an out-of-band update pass.
    pub fn wakeup(&self) -> bool {
        self.send(AppMessage::Wakeup)
    }

    pub(crate) fn stop(&self) -> bool {
        self.send(AppMessage::Stop)
    }

    pub fn is_on_app_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn bind_current_thread(&self) {
        let _ = self.thread.set(thread::current().id());
    }

    fn send(&self, message: AppMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(message = ?err.0, "logic thread is gone");
                false
            }
        }
    }
}

impl fmt::Debug for TaskSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSender")
            .field("thread", &self.thread.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_are_unique_and_increasing() {
        let first = ObjectId::next();
        let second = ObjectId::next();
        assert!(second > first);
    }

    #[test]
    fn builder_sets_routing_fields() {
        let target = ObjectId::next();
        let task = AppTask::new("ping", |_| {}).with_target(target).deferred();
        assert_eq!(task.tag(), "ping");
        assert_eq!(task.target(), Some(target));
        assert!(task.is_deferred());
    }
}
