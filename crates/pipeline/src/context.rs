use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use pipeconfig::AppSettings;
use scheduler::{FrameConstraints, PresentationHandle, SharedClock, WindowId};
use tracing::{debug, error, info, trace, warn};

use crate::director::Director;
use crate::events::{EventChannel, NetworkState, ThemeInfo};
use crate::extension::{Extension, ExtensionKey};
use crate::resource::ResourceCache;
use crate::scene::QueueCompiler;
use crate::task::{AppMessage, AppTask, ObjectId, TaskSender};
use crate::time::{Timeline, UpdateTime};

type Listener = Rc<RefCell<Box<dyn FnMut(&mut AppContext, &UpdateTime, bool)>>>;

/// Panic payload for misuse of the logic-thread contract. Unlike an ordinary
/// task panic it is never absorbed: it unwinds through the task loop and
/// takes the logic thread down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractViolation(pub &'static str);

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Everything owned by the logic thread.
///
/// Only ever touched from that thread: other threads reach it through
/// [`TaskSender`]. It can also be driven by hand, which is how tests step the
/// pipeline without spawning a thread.
pub struct AppContext {
    clock: SharedClock,
    timeline: Timeline,
    max_delta: Duration,
    tx: Sender<AppMessage>,
    rx: Receiver<AppMessage>,
    tasks: TaskSender,
    directors: BTreeMap<WindowId, Director>,
    extensions: BTreeMap<ExtensionKey, Box<dyn Extension>>,
    listeners: BTreeMap<ObjectId, Listener>,
    live_objects: HashSet<ObjectId>,
    exit_guards: usize,
    stop_requested: bool,
    failed_tasks: u64,
    network_state: NetworkState,
    theme: ThemeInfo,
    network_events: EventChannel<NetworkState>,
    theme_events: EventChannel<ThemeInfo>,
}

impl AppContext {
    pub fn new(settings: &AppSettings, clock: SharedClock) -> Self {
        let (tx, rx) = unbounded();
        let tasks = TaskSender::new(tx.clone(), Arc::new(OnceLock::new()));
        Self::with_channel(settings, clock, tx, rx, tasks)
    }

    pub(crate) fn with_channel(
        settings: &AppSettings,
        clock: SharedClock,
        tx: Sender<AppMessage>,
        rx: Receiver<AppMessage>,
        tasks: TaskSender,
    ) -> Self {
        let now = clock.now_micros();
        Self {
            clock,
            timeline: Timeline::new(now, settings.max_delta),
            max_delta: settings.max_delta,
            tx,
            rx,
            tasks,
            directors: BTreeMap::new(),
            extensions: BTreeMap::new(),
            listeners: BTreeMap::new(),
            live_objects: HashSet::new(),
            exit_guards: 0,
            stop_requested: false,
            failed_tasks: 0,
            network_state: NetworkState::default(),
            theme: ThemeInfo::default(),
            network_events: EventChannel::new("network-state-changed"),
            theme_events: EventChannel::new("theme-changed"),
        }
    }

    pub fn task_sender(&self) -> TaskSender {
        self.tasks.clone()
    }

    pub(crate) fn receiver(&self) -> Receiver<AppMessage> {
        self.rx.clone()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn time(&self) -> &UpdateTime {
        self.timeline.current()
    }

    /// Runs `task` inline unless it asks to be deferred, in which case it
    /// runs after the current update pass.
    pub fn perform_on_app_thread(&mut self, task: AppTask) {
        if task.is_deferred() {
            if self.tx.send(AppMessage::Task(task)).is_err() {
                warn!("logic queue closed, deferred task dropped");
            }
        } else {
            self.run_task(task);
        }
    }

    /// Queues an out-of-band update pass.
    pub fn request_wakeup(&self) {
        let _ = self.tx.send(AppMessage::Wakeup);
    }

    /// Processes the messages queued when the call starts. Messages queued
    /// while draining wait for the next call. Returns the number processed.
    pub fn drain_tasks(&mut self) -> usize {
        let queued = self.rx.len();
        let mut processed = 0;
        while processed < queued {
            let Ok(message) = self.rx.try_recv() else {
                break;
            };
            self.handle_message(message);
            processed += 1;
        }
        processed
    }

    pub(crate) fn handle_message(&mut self, message: AppMessage) {
        match message {
            AppMessage::Task(task) => self.run_task(task),
            AppMessage::Wakeup => self.perform_update(true),
            AppMessage::Stop => {
                debug!(exit_guards = self.exit_guards, "logic thread stop requested");
                self.stop_requested = true;
            }
        }
    }

    /// One tick: directors, then extensions, then listeners.
    pub fn perform_update(&mut self, woken: bool) {
        let now = self.clock.now_micros();
        let time = self.timeline.tick(now);
        trace!(global = time.global, delta = time.delta, woken, "logic update");

        for director in self.directors.values_mut() {
            director.update(now);
        }
        for extension in self.extensions.values_mut() {
            extension.update(&time, woken);
        }

        let listeners: Vec<(ObjectId, Listener)> = self
            .listeners
            .iter()
            .map(|(owner, listener)| (*owner, listener.clone()))
            .collect();
        for (owner, listener) in listeners {
            if !self.listeners.contains_key(&owner) {
                continue;
            }
            match listener.try_borrow_mut() {
                Ok(mut callback) => callback(self, &time, woken),
                Err(_) => warn!(%owner, "listener re-entered during its own update"),
            }
        }
    }

    /// Registers a per-tick callback. Returns `false` if `owner` already has one.
    pub fn add_listener(
        &mut self,
        owner: ObjectId,
        callback: impl FnMut(&mut AppContext, &UpdateTime, bool) + 'static,
    ) -> bool {
        if self.listeners.contains_key(&owner) {
            return false;
        }
        self.listeners
            .insert(owner, Rc::new(RefCell::new(Box::new(callback))));
        true
    }

    pub fn remove_listener(&mut self, owner: ObjectId) -> bool {
        self.listeners.remove(&owner).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Registers and initializes an extension. Keys are unique.
    pub fn add_extension(&mut self, mut extension: Box<dyn Extension>) -> bool {
        let key = extension.key();
        if self.extensions.contains_key(&key) {
            warn!(extension = %key, "extension already registered");
            return false;
        }
        extension.initialize(&self.tasks);
        debug!(extension = %key, "extension registered");
        self.extensions.insert(key, extension);
        true
    }

    pub fn extension_mut(&mut self, key: ExtensionKey) -> Option<&mut (dyn Extension + 'static)> {
        self.extensions.get_mut(&key).map(|extension| extension.as_mut())
    }

    pub fn has_extension(&self, key: ExtensionKey) -> bool {
        self.extensions.contains_key(&key)
    }

    pub fn resource_cache_mut(&mut self) -> Option<&mut ResourceCache> {
        self.extensions
            .get_mut(&ExtensionKey::ResourceCache)
            .and_then(|extension| extension.as_resource_cache())
    }

    pub fn create_object(&mut self) -> ObjectId {
        let id = ObjectId::next();
        self.live_objects.insert(id);
        id
    }

    /// Tasks targeting a released object are dropped unrun.
    pub fn release_object(&mut self, id: ObjectId) -> bool {
        self.live_objects.remove(&id)
    }

    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.live_objects.contains(&id)
    }

    /// Creates the orchestrator for a newly opened window.
    pub fn handle_window_created(
        &mut self,
        window: WindowId,
        presentation: PresentationHandle,
        constraints: FrameConstraints,
        compiler: Arc<dyn QueueCompiler>,
    ) -> &mut Director {
        if let Some(mut previous) = self.directors.remove(&window) {
            warn!(%window, "window created twice, replacing director");
            self.release_object(previous.id());
            previous.end();
        }
        let director = Director::new(
            window,
            presentation,
            self.tasks.clone(),
            compiler,
            constraints,
            self.max_delta,
            self.clock.now_micros(),
        );
        self.live_objects.insert(director.id());
        info!(%window, "director created");
        self.directors.entry(window).or_insert(director)
    }

    /// Ends the window's orchestrator and then its presentation scheduler.
    pub fn handle_window_destroyed(&mut self, window: WindowId) -> bool {
        let Some(mut director) = self.directors.remove(&window) else {
            return false;
        };
        self.release_object(director.id());
        let presentation = director.presentation().cloned();
        director.end();
        if let Some(presentation) = presentation {
            presentation.end();
        }
        info!(%window, "window destroyed");
        true
    }

    pub fn director(&self, window: WindowId) -> Option<&Director> {
        self.directors.get(&window)
    }

    pub fn director_mut(&mut self, window: WindowId) -> Option<&mut Director> {
        self.directors.get_mut(&window)
    }

    pub fn windows(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.directors.keys().copied()
    }

    /// Keeps [`crate::AppThread::stop`] waiting until a matching release.
    pub fn retain_exit_guard(&mut self) {
        self.exit_guards += 1;
    }

    /// # Panics
    ///
    /// Panics with a [`ContractViolation`] when no guard is retained.
    pub fn release_exit_guard(&mut self) {
        if self.exit_guards == 0 {
            let violation = ContractViolation("exit guard released without being retained");
            error!("{violation}");
            panic::panic_any(violation);
        }
        self.exit_guards -= 1;
    }

    pub fn exit_guards(&self) -> usize {
        self.exit_guards
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub(crate) fn should_exit(&self) -> bool {
        self.stop_requested && self.exit_guards == 0
    }

    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks
    }

    pub fn network_state(&self) -> NetworkState {
        self.network_state
    }

    pub fn theme(&self) -> &ThemeInfo {
        &self.theme
    }

    pub fn network_events(&mut self) -> &mut EventChannel<NetworkState> {
        &mut self.network_events
    }

    pub fn theme_events(&mut self) -> &mut EventChannel<ThemeInfo> {
        &mut self.theme_events
    }

    pub fn set_network_state(&mut self, state: NetworkState) {
        if state == self.network_state {
            return;
        }
        self.network_state = state;
        self.network_events.emit(&state);
    }

    pub fn set_theme(&mut self, theme: ThemeInfo) {
        if theme == self.theme {
            return;
        }
        self.theme_events.emit(&theme);
        self.theme = theme;
    }

    /// Ends every director and invalidates every extension.
    pub fn shutdown(&mut self) {
        let windows: Vec<WindowId> = self.directors.keys().copied().collect();
        for window in windows {
            self.handle_window_destroyed(window);
        }
        for extension in self.extensions.values_mut() {
            extension.invalidate();
        }
        self.extensions.clear();
        self.listeners.clear();
        self.network_events.clear();
        self.theme_events.clear();
    }

    fn run_task(&mut self, task: AppTask) {
        if let Some(target) = task.target() {
            if !self.live_objects.contains(&target) {
                trace!(task = task.tag(), %target, "task target released, dropping");
                return;
            }
        }
        let tag = task.tag();
        let job = task.into_job();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(self))) {
            if payload.is::<ContractViolation>() {
                panic::resume_unwind(payload);
            }
            self.failed_tasks += 1;
            error!(task = tag, "logic task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Mutex;

    use scheduler::ManualClock;

    use super::*;
    use crate::resource::{CompileCallback, ResourceCompiler, TemporaryFlags};

    fn context() -> (AppContext, ManualClock) {
        let clock = ManualClock::new(0);
        let ctx = AppContext::new(&AppSettings::default(), Arc::new(clock.clone()));
        (ctx, clock)
    }

    #[test]
    fn inline_tasks_run_immediately_and_deferred_wait() {
        let (mut ctx, _clock) = context();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let log = ran.clone();
        ctx.perform_on_app_thread(AppTask::new("inline", move |_| {
            log.lock().unwrap().push("inline")
        }));
        let log = ran.clone();
        ctx.perform_on_app_thread(
            AppTask::new("deferred", move |_| log.lock().unwrap().push("deferred")).deferred(),
        );
        assert_eq!(*ran.lock().unwrap(), vec!["inline"]);

        assert_eq!(ctx.drain_tasks(), 1);
        assert_eq!(*ran.lock().unwrap(), vec!["inline", "deferred"]);
    }

    #[test]
    fn tasks_queued_while_draining_wait_for_next_pass() {
        let (mut ctx, _clock) = context();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        ctx.task_sender().perform(AppTask::new("outer", move |ctx| {
            *counter.lock().unwrap() += 1;
            let counter = counter.clone();
            ctx.perform_on_app_thread(
                AppTask::new("inner", move |_| *counter.lock().unwrap() += 10).deferred(),
            );
        }));

        assert_eq!(ctx.drain_tasks(), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(ctx.drain_tasks(), 1);
        assert_eq!(*hits.lock().unwrap(), 11);
    }

    #[test]
    fn tasks_for_released_targets_are_dropped() {
        let (mut ctx, _clock) = context();
        let target = ctx.create_object();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        ctx.task_sender().perform(
            AppTask::new("bound", move |_| *counter.lock().unwrap() += 1).with_target(target),
        );
        assert!(ctx.release_object(target));
        ctx.drain_tasks();
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn panicking_task_does_not_stop_the_queue() {
        let (mut ctx, _clock) = context();
        let hits = Arc::new(Mutex::new(0));
        let sender = ctx.task_sender();
        sender.perform(AppTask::new("bad", |_| panic!("task failure")));
        let counter = hits.clone();
        sender.perform(AppTask::new("good", move |_| *counter.lock().unwrap() += 1));

        assert_eq!(ctx.drain_tasks(), 2);
        assert_eq!(ctx.failed_tasks(), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn listeners_see_clamped_time_and_wake_flag() {
        let (mut ctx, clock) = context();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        assert!(ctx.add_listener(ObjectId::next(), move |_, time, woken| {
            sink.borrow_mut().push((time.delta, woken))
        }));

        clock.advance(Duration::from_millis(16));
        ctx.perform_update(false);
        clock.advance(Duration::from_secs(10));
        ctx.request_wakeup();
        ctx.drain_tasks();

        assert_eq!(*seen.borrow(), vec![(16_000, false), (100_000, true)]);
    }

    #[test]
    fn listener_may_remove_others_mid_pass() {
        let (mut ctx, _clock) = context();
        let first = ObjectId::next();
        let second = ObjectId::next();
        let hits = Rc::new(Cell::new(0));
        let (a, b) = if first < second { (first, second) } else { (second, first) };

        assert!(ctx.add_listener(a, move |ctx, _, _| {
            ctx.remove_listener(b);
        }));
        let counter = hits.clone();
        assert!(ctx.add_listener(b, move |_, _, _| counter.set(counter.get() + 1)));
        assert!(!ctx.add_listener(b, |_, _, _| {}));

        ctx.perform_update(false);
        assert_eq!(hits.get(), 0);
        assert_eq!(ctx.listener_count(), 1);
    }

    #[test]
    fn exit_guards_block_exit_until_released() {
        let (mut ctx, _clock) = context();
        ctx.retain_exit_guard();
        ctx.handle_message(AppMessage::Stop);
        assert!(ctx.is_stop_requested());
        assert!(!ctx.should_exit());
        ctx.release_exit_guard();
        assert!(ctx.should_exit());
    }

    #[test]
    fn releasing_unretained_exit_guard_panics() {
        let (mut ctx, _clock) = context();
        let payload = panic::catch_unwind(AssertUnwindSafe(|| ctx.release_exit_guard()))
            .unwrap_err();
        assert_eq!(
            payload.downcast_ref::<ContractViolation>(),
            Some(&ContractViolation("exit guard released without being retained"))
        );
    }

    #[test]
    fn contract_violation_escapes_the_task_queue() {
        let (mut ctx, _clock) = context();
        ctx.task_sender()
            .perform(AppTask::new("close", |ctx| ctx.release_exit_guard()));

        let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.drain_tasks()));
        let payload = result.unwrap_err();
        assert!(payload.is::<ContractViolation>());
        assert_eq!(ctx.failed_tasks(), 0);
    }

    #[test]
    fn network_and_theme_changes_are_emitted_once() {
        let (mut ctx, _clock) = context();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ctx.network_events()
            .subscribe(ObjectId::next(), move |state: &NetworkState| {
                sink.borrow_mut().push(state.online)
            });
        let online = NetworkState {
            online: true,
            ..NetworkState::default()
        };
        ctx.set_network_state(online);
        ctx.set_network_state(online);
        assert_eq!(*seen.borrow(), vec![true]);

        let themes = Rc::new(Cell::new(0));
        let counter = themes.clone();
        ctx.theme_events()
            .subscribe(ObjectId::next(), move |_| counter.set(counter.get() + 1));
        ctx.set_theme(ThemeInfo {
            dark: true,
            ..ThemeInfo::default()
        });
        assert_eq!(themes.get(), 1);
        assert!(ctx.theme().dark);
    }

    struct InstantCompiler;

    impl ResourceCompiler for InstantCompiler {
        fn compile(&self, _name: &str, done: CompileCallback) {
            done(true);
        }
    }

    #[test]
    fn resource_cache_compiles_through_the_logic_queue() {
        let (mut ctx, clock) = context();
        assert!(ctx.add_extension(Box::new(ResourceCache::new(Arc::new(InstantCompiler)))));
        assert!(!ctx.add_extension(Box::new(ResourceCache::new(Arc::new(InstantCompiler)))));

        let loaded = Rc::new(Cell::new(false));
        let flag = loaded.clone();
        let cache = ctx.resource_cache_mut().unwrap();
        cache.add_temporary("atlas", Duration::from_secs(2), TemporaryFlags::default());
        assert!(cache.load("atlas", move |ok| flag.set(ok)));

        clock.advance(Duration::from_millis(16));
        ctx.perform_update(false);
        assert!(!loaded.get());

        ctx.drain_tasks();
        assert!(loaded.get());
        assert!(ctx.resource_cache_mut().unwrap().is_loaded("atlas"));
        assert_eq!(ctx.drain_tasks(), 1);
    }
}
