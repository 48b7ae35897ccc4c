use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scheduler::{
    FrameConstraints, FrameUnit, MovingAverage, PresentationHandle, PresentedFrame,
    RenderQueueId, StatsSnapshot, WindowId, STAT_SAMPLES,
};
use tracing::{debug, info, trace, warn};

use crate::actions::ActionManager;
use crate::input::{InputDispatcher, InputEvent};
use crate::scene::{FrameScratch, QueueCompiler, RenderOutcome, Scene, SceneError};
use crate::task::{AppTask, ObjectId, TaskSender};
use crate::time::{Timeline, UpdateTime};
use crate::timer::TimedScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorState {
    NoScene,
    SceneActive,
    TransitionPending,
    Ended,
}

/// Renderer-side numbers for the last drawn frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DrawStat {
    pub vertices: u32,
    pub triangles: u32,
    pub draw_calls: u32,
    pub cached_images: u32,
    /// Microseconds spent preparing vertex input.
    pub vertex_input_time: u64,
}

/// Frame orchestrator for one window.
///
/// Owns the visible scene and the scene waiting to replace it. Scene swaps
/// only happen inside [`Director::update`], at most one per tick, so a frame
/// handed out by [`Director::acquire_frame`] always renders into the scene
/// whose queue it was created for.
pub struct Director {
    id: ObjectId,
    window: WindowId,
    presentation: Option<PresentationHandle>,
    tasks: TaskSender,
    compiler: Arc<dyn QueueCompiler>,
    constraints: FrameConstraints,
    timeline: Timeline,
    state: DirectorState,
    current: Option<Box<dyn Scene>>,
    pending: Option<Box<dyn Scene>>,
    compiling: Vec<(u64, Box<dyn Scene>)>,
    next_ticket: u64,
    applied_ticket: u64,
    timers: TimedScheduler,
    actions: ActionManager,
    input: InputDispatcher,
    autorelease: Vec<Box<dyn Any>>,
    scratch: FrameScratch,
    acquire_time: MovingAverage<STAT_SAMPLES>,
    draw_stat: DrawStat,
    last_presented: Option<PresentedFrame>,
    last_order: u64,
    frames_rendered: u64,
    frames_rejected: u64,
}

impl Director {
    pub fn new(
        window: WindowId,
        presentation: PresentationHandle,
        tasks: TaskSender,
        compiler: Arc<dyn QueueCompiler>,
        constraints: FrameConstraints,
        max_delta: Duration,
        now: u64,
    ) -> Self {
        Self {
            id: ObjectId::next(),
            window,
            presentation: Some(presentation),
            tasks,
            compiler,
            constraints,
            timeline: Timeline::new(now, max_delta),
            state: DirectorState::NoScene,
            current: None,
            pending: None,
            compiling: Vec::new(),
            next_ticket: 0,
            applied_ticket: 0,
            timers: TimedScheduler::new(),
            actions: ActionManager::new(),
            input: InputDispatcher::new(),
            autorelease: Vec::new(),
            scratch: FrameScratch::default(),
            acquire_time: MovingAverage::new(),
            draw_stat: DrawStat::default(),
            last_presented: None,
            last_order: 0,
            frames_rendered: 0,
            frames_rejected: 0,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn state(&self) -> DirectorState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == DirectorState::Ended
    }

    pub fn presentation(&self) -> Option<&PresentationHandle> {
        self.presentation.as_ref()
    }

    pub fn constraints(&self) -> &FrameConstraints {
        &self.constraints
    }

    pub fn time(&self) -> &UpdateTime {
        self.timeline.current()
    }

    pub fn current_scene(&self) -> Option<&dyn Scene> {
        self.current.as_deref()
    }

    pub fn has_pending_scene(&self) -> bool {
        self.pending.is_some()
    }

    pub fn timers(&mut self) -> &mut TimedScheduler {
        &mut self.timers
    }

    pub fn actions(&mut self) -> &mut ActionManager {
        &mut self.actions
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    pub fn last_presented(&self) -> Option<&PresentedFrame> {
        self.last_presented.as_ref()
    }

    pub fn handle(&self) -> DirectorHandle {
        DirectorHandle {
            window: self.window,
            target: self.id,
            tasks: self.tasks.clone(),
        }
    }

    /// Starts compiling `scene`. Returns the compile ticket, or `None` once
    /// the director has ended.
    pub fn run_scene(&mut self, scene: Box<dyn Scene>) -> Option<u64> {
        if self.is_ended() {
            warn!(window = %self.window, scene = scene.name(), "run_scene after end");
            return None;
        }
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let request = scene.queue_request(self.window, &self.constraints);
        debug!(window = %self.window, scene = scene.name(), ticket, "compiling scene");
        self.compiling.push((ticket, scene));

        let tasks = self.tasks.clone();
        let window = self.window;
        let target = self.id;
        self.compiler.compile_queue(
            request,
            Box::new(move |result| {
                tasks.perform(
                    AppTask::new("scene-compiled", move |ctx| {
                        if let Some(director) = ctx.director_mut(window) {
                            director.handle_scene_compiled(ticket, result);
                        }
                    })
                    .with_target(target),
                );
            }),
        );
        Some(ticket)
    }

    /// Completion of a scene compile, on the logic thread.
    pub fn handle_scene_compiled(
        &mut self,
        ticket: u64,
        result: Result<RenderQueueId, SceneError>,
    ) {
        let Some(position) = self.compiling.iter().position(|(t, _)| *t == ticket) else {
            return;
        };
        let (_, mut scene) = self.compiling.remove(position);
        if self.is_ended() {
            return;
        }
        if ticket < self.applied_ticket {
            debug!(window = %self.window, scene = scene.name(), ticket, "superseded scene dropped");
            return;
        }
        let queue = match result {
            Ok(queue) => queue,
            Err(err) => {
                warn!(window = %self.window, scene = scene.name(), "scene compile failed: {err}");
                return;
            }
        };
        scene.handle_compiled(queue);
        self.applied_ticket = ticket;

        if self.current.is_none() {
            self.promote(scene);
            return;
        }
        if let Some(replaced) = self.pending.replace(scene) {
            debug!(window = %self.window, scene = replaced.name(), "pending scene replaced");
            self.autorelease.push(Box::new(replaced));
        }
        self.state = DirectorState::TransitionPending;
    }

    /// Per-tick update: promotes the pending scene, advances timers, actions
    /// and input, then drains the autorelease list.
    pub fn update(&mut self, now: u64) -> UpdateTime {
        if self.is_ended() {
            return *self.timeline.current();
        }
        let time = self.timeline.tick(now);
        if let Some(scene) = self.pending.take() {
            self.promote(scene);
        }
        self.advance(&time);
        self.autorelease.clear();
        time
    }

    /// Accepts a frame with an acquired image and schedules its render
    /// request on the logic queue. Rejected frames are left to the caller.
    pub fn acquire_frame(&mut self, frame: &FrameUnit, now: u64) -> bool {
        let started = Instant::now();
        if self.is_ended() {
            return self.reject(frame, "director ended");
        }
        let Some(queue) = self.current.as_ref().and_then(|scene| scene.queue()) else {
            return self.reject(frame, "no compiled scene");
        };
        if frame.stamp_queue(queue) != queue {
            return self.reject(frame, "render queue mismatch");
        }
        if frame.order() <= self.last_order {
            return self.reject(frame, "frame order went backwards");
        }
        self.last_order = frame.order();

        if frame.constraints() != &self.constraints {
            self.set_frame_constraints(frame.constraints().clone());
        }
        let time = self.timeline.tick(now);
        self.advance(&time);

        let window = self.window;
        let unit = frame.clone();
        self.tasks.perform(
            AppTask::new("render-frame", move |ctx| {
                if let Some(director) = ctx.director_mut(window) {
                    director.render_frame(&unit);
                }
            })
            .with_target(self.id)
            .deferred(),
        );

        self.acquire_time.push(started.elapsed().as_micros() as u64);
        if let Some(presentation) = &self.presentation {
            presentation
                .shared_stats()
                .set_director_frame_time(self.acquire_time.average());
        }
        trace!(window = %self.window, frame = frame.order(), %queue, "frame accepted");
        true
    }

    /// Hands an accepted frame to the visible scene and resolves it.
    pub fn render_frame(&mut self, frame: &FrameUnit) -> RenderOutcome {
        let order = frame.order();
        let outcome = match self.current.as_mut() {
            _ if self.state == DirectorState::Ended => Err("director ended".to_string()),
            None => Err("no scene".to_string()),
            Some(scene) if scene.queue() != frame.queue() => {
                Err("scene changed before render".to_string())
            }
            Some(scene) => {
                self.scratch.reset();
                scene
                    .render_request(frame, &mut self.scratch)
                    .map_err(|err| err.to_string())
            }
        };

        let outcome = match outcome.and_then(|()| frame.submit().map_err(|err| err.to_string())) {
            Ok(()) => {
                self.frames_rendered += 1;
                RenderOutcome::Submitted { order }
            }
            Err(reason) => {
                debug!(window = %self.window, frame = order, %reason, "frame not rendered");
                if let Err(err) = frame.cancel() {
                    trace!(window = %self.window, frame = order, "cancel after resolve: {err}");
                }
                RenderOutcome::Cancelled { order, reason }
            }
        };

        if self.wants_next_frame() {
            self.request_frame();
        }
        outcome
    }

    pub fn set_frame_constraints(&mut self, constraints: FrameConstraints) {
        if constraints == self.constraints {
            return;
        }
        debug!(
            window = %self.window,
            width = constraints.extent.width,
            height = constraints.extent.height,
            "frame constraints changed"
        );
        self.constraints = constraints;
        if let Some(scene) = self.current.as_mut() {
            scene.set_frame_constraints(&self.constraints);
        }
    }

    pub fn handle_input(&mut self, event: InputEvent) {
        if self.is_ended() {
            return;
        }
        self.input.push(event);
        self.request_frame();
    }

    pub fn handle_frame_presented(&mut self, presented: PresentedFrame) {
        self.last_presented = Some(presented);
    }

    pub fn set_draw_stat(&mut self, stat: DrawStat) {
        self.draw_stat = stat;
    }

    pub fn draw_stat(&self) -> &DrawStat {
        &self.draw_stat
    }

    /// Keeps `object` alive until the end of the current tick.
    pub fn autorelease(&mut self, object: Box<dyn Any>) {
        self.autorelease.push(object);
    }

    /// Asks the presentation scheduler for another frame.
    pub fn request_frame(&self) -> bool {
        self.presentation
            .as_ref()
            .is_some_and(|presentation| presentation.set_ready_for_next_frame())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.presentation
            .as_ref()
            .map(PresentationHandle::stats)
            .unwrap_or_default()
    }

    pub fn fps(&self) -> f32 {
        self.stats().fps()
    }

    pub fn avg_fps(&self) -> f32 {
        self.stats().avg_fps()
    }

    pub fn spf(&self) -> f32 {
        self.stats().spf()
    }

    pub fn fence_frame_time(&self) -> f32 {
        self.stats().fence_frame_time()
    }

    pub fn timestamp_frame_time(&self) -> f32 {
        self.stats().timestamp_frame_time()
    }

    /// Milliseconds spent inside [`Director::acquire_frame`], averaged.
    pub fn director_frame_time(&self) -> f32 {
        self.acquire_time.average() as f32 / 1_000.0
    }

    /// Finalizes the visible scene and detaches from the window. Terminal.
    pub fn end(&mut self) {
        if self.is_ended() {
            return;
        }
        if let Some(mut scene) = self.current.take() {
            scene.handle_finished();
        }
        self.pending = None;
        self.compiling.clear();
        self.timers.unschedule_all();
        self.actions.stop_all();
        self.input.clear();
        self.autorelease.clear();
        self.presentation = None;
        self.state = DirectorState::Ended;
        info!(window = %self.window, rendered = self.frames_rendered, "director ended");
    }

    fn promote(&mut self, mut scene: Box<dyn Scene>) {
        if let Some(mut outgoing) = self.current.take() {
            outgoing.handle_finished();
            self.autorelease.push(Box::new(outgoing));
        }
        scene.set_frame_constraints(&self.constraints);
        scene.handle_presented();
        let queue = scene.queue();
        info!(window = %self.window, scene = scene.name(), "scene promoted");
        self.current = Some(scene);
        self.state = DirectorState::SceneActive;
        if let (Some(queue), Some(presentation)) = (queue, &self.presentation) {
            presentation.run_with_queue(queue);
        }
    }

    fn advance(&mut self, time: &UpdateTime) {
        self.timers.update(time);
        self.actions.update(time);
        let events = self.input.drain();
        if let Some(scene) = self.current.as_mut() {
            for event in &events {
                scene.handle_input(event);
            }
            scene.update(time);
        }
    }

    fn wants_next_frame(&self) -> bool {
        !self.actions.is_empty()
            || self.input.has_active_pointers()
            || self
                .current
                .as_ref()
                .is_some_and(|scene| scene.has_active_interactions())
    }

    fn reject(&mut self, frame: &FrameUnit, reason: &'static str) -> bool {
        self.frames_rejected += 1;
        trace!(window = %self.window, frame = frame.order(), reason, "frame rejected");
        false
    }
}

/// Posts director updates from threads other than the logic thread.
#[derive(Debug, Clone)]
pub struct DirectorHandle {
    window: WindowId,
    target: ObjectId,
    tasks: TaskSender,
}

impl DirectorHandle {
    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn push_draw_stat(&self, stat: DrawStat) -> bool {
        let window = self.window;
        self.tasks.perform(
            AppTask::new("draw-stat", move |ctx| {
                if let Some(director) = ctx.director_mut(window) {
                    director.set_draw_stat(stat);
                }
            })
            .with_target(self.target),
        )
    }

    pub fn push_input(&self, event: InputEvent) -> bool {
        let window = self.window;
        self.tasks.perform(
            AppTask::new("input", move |ctx| {
                if let Some(director) = ctx.director_mut(window) {
                    director.handle_input(event);
                }
            })
            .with_target(self.target),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, OnceLock};

    use crossbeam_channel::{unbounded, Receiver, Sender};
    use pipeconfig::AppSettings;
    use scheduler::{
        Clock, EngineCommand, FrameSpec, FrameStage, ManualClock, PresentationEvent, SharedStats,
    };

    use super::*;
    use crate::context::AppContext;
    use crate::input::InputKind;
    use crate::scene::{QueueCallback, QueueRequest};

    const WINDOW: WindowId = WindowId(1);

    type Log = Rc<RefCell<Vec<String>>>;

    struct RecordingScene {
        name: &'static str,
        queue: Option<RenderQueueId>,
        log: Log,
        fail_render: bool,
    }

    impl RecordingScene {
        fn boxed(name: &'static str, log: &Log) -> Box<dyn Scene> {
            Box::new(Self {
                name,
                queue: None,
                log: log.clone(),
                fail_render: false,
            })
        }

        fn record(&self, what: &str) {
            self.log.borrow_mut().push(format!("{}:{what}", self.name));
        }
    }

    impl Scene for RecordingScene {
        fn name(&self) -> &str {
            self.name
        }

        fn handle_compiled(&mut self, queue: RenderQueueId) {
            self.queue = Some(queue);
        }

        fn queue(&self) -> Option<RenderQueueId> {
            self.queue
        }

        fn set_frame_constraints(&mut self, _constraints: &FrameConstraints) {
            self.record("constraints");
        }

        fn handle_presented(&mut self) {
            self.record("presented");
        }

        fn handle_finished(&mut self) {
            self.record("finished");
        }

        fn handle_input(&mut self, _event: &InputEvent) -> bool {
            self.record("input");
            true
        }

        fn render_request(
            &mut self,
            frame: &FrameUnit,
            scratch: &mut FrameScratch,
        ) -> Result<(), SceneError> {
            self.record(&format!("render{}", frame.order()));
            scratch.push_command("draw");
            if self.fail_render {
                return Err(SceneError::Render("boom".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct ImmediateCompiler {
        next: AtomicU64,
        fail: Mutex<Vec<String>>,
    }

    impl QueueCompiler for ImmediateCompiler {
        fn compile_queue(&self, request: QueueRequest, done: QueueCallback) {
            if self.fail.lock().unwrap().contains(&request.name) {
                done(Err(SceneError::Compile {
                    name: request.name,
                    reason: "rejected".into(),
                }));
                return;
            }
            let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            done(Ok(RenderQueueId(id)));
        }
    }

    /// Compiler that parks callbacks until the test releases them.
    #[derive(Default)]
    struct ParkedCompiler {
        parked: Mutex<Vec<(String, QueueCallback)>>,
    }

    impl QueueCompiler for ParkedCompiler {
        fn compile_queue(&self, request: QueueRequest, done: QueueCallback) {
            self.parked.lock().unwrap().push((request.name, done));
        }
    }

    impl ParkedCompiler {
        fn release(&self, name: &str, queue: u64) {
            let mut parked = self.parked.lock().unwrap();
            let index = parked.iter().position(|(n, _)| n == name).unwrap();
            let (_, done) = parked.remove(index);
            drop(parked);
            done(Ok(RenderQueueId(queue)));
        }
    }

    struct Fixture {
        ctx: AppContext,
        clock: ManualClock,
        log: Log,
        sink: Sender<PresentationEvent>,
        commands: Receiver<PresentationEvent>,
    }

    impl Fixture {
        fn new(compiler: Arc<dyn QueueCompiler>) -> Self {
            let clock = ManualClock::new(1_000);
            let ctx_clock = clock.clone();
            let mut ctx = AppContext::new(&AppSettings::default(), Arc::new(ctx_clock));
            let (sink, commands) = unbounded();
            let handle = PresentationHandle::new(
                WINDOW,
                sink.clone(),
                Arc::new(SharedStats::default()),
                Arc::new(OnceLock::new()),
            );
            ctx.handle_window_created(WINDOW, handle, FrameConstraints::default(), compiler);
            Self {
                ctx,
                clock,
                log: Rc::new(RefCell::new(Vec::new())),
                sink,
                commands,
            }
        }

        fn director(&mut self) -> &mut Director {
            self.ctx.director_mut(WINDOW).unwrap()
        }

        fn run_scene(&mut self, name: &'static str) {
            let scene = RecordingScene::boxed(name, &self.log);
            self.director().run_scene(scene);
        }

        fn frame(&self, order: u64, queue: Option<u64>) -> FrameUnit {
            let frame = FrameUnit::new(
                FrameSpec {
                    window: WINDOW,
                    order,
                    constraints: FrameConstraints::default(),
                    queue: queue.map(RenderQueueId),
                    created_at: self.clock.now_micros(),
                    correctable: false,
                },
                self.sink.clone(),
            );
            frame.dispatch().unwrap();
            frame
        }

        fn acquire(&mut self, frame: &FrameUnit) -> bool {
            let now = self.clock.now_micros();
            self.director().acquire_frame(frame, now)
        }

        fn update(&mut self) {
            let now = self.clock.advance(Duration::from_millis(16));
            self.director().update(now);
        }

        fn events(&self) -> Vec<PresentationEvent> {
            self.commands.try_iter().collect()
        }

        fn log(&self) -> Vec<String> {
            self.log.borrow().clone()
        }
    }

    fn submitted(events: &[PresentationEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|event| match event {
                PresentationEvent::FrameSubmitted { order } => Some(*order),
                _ => None,
            })
            .collect()
    }

    fn run_queues(events: &[PresentationEvent]) -> Vec<RenderQueueId> {
        events
            .iter()
            .filter_map(|event| match event {
                PresentationEvent::Command(EngineCommand::Run { queue }) => Some(*queue),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scene_lifecycle_end_to_end() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));

        let frame = fx.frame(1, Some(1));
        assert!(!fx.acquire(&frame));
        assert_eq!(fx.director().state(), DirectorState::NoScene);

        let scene_a = RecordingScene::boxed("a", &fx.log);
        fx.director().run_scene(scene_a);
        fx.ctx.drain_tasks();
        assert_eq!(fx.director().state(), DirectorState::SceneActive);
        assert_eq!(run_queues(&fx.events()), vec![RenderQueueId(1)]);

        let frame = fx.frame(2, Some(1));
        assert!(fx.acquire(&frame));
        fx.ctx.drain_tasks();
        assert_eq!(submitted(&fx.events()), vec![2]);
        assert_eq!(frame.stage(), FrameStage::Submitted);

        let scene_b = RecordingScene::boxed("b", &fx.log);
        fx.director().run_scene(scene_b);
        fx.ctx.drain_tasks();
        assert_eq!(fx.director().state(), DirectorState::TransitionPending);

        let frame = fx.frame(3, Some(1));
        assert!(fx.acquire(&frame));
        fx.ctx.drain_tasks();
        assert_eq!(submitted(&fx.events()), vec![3]);

        fx.update();
        assert_eq!(fx.director().state(), DirectorState::SceneActive);
        assert_eq!(run_queues(&fx.events()), vec![RenderQueueId(2)]);

        fx.director().end();
        let frame = fx.frame(4, Some(2));
        assert!(!fx.acquire(&frame));
        assert_eq!(fx.director().state(), DirectorState::Ended);

        assert_eq!(
            fx.log(),
            vec![
                "a:constraints",
                "a:presented",
                "a:render2",
                "a:render3",
                "a:finished",
                "b:constraints",
                "b:presented",
                "b:finished",
            ]
        );
    }

    #[test]
    fn only_the_latest_pending_scene_is_promoted() {
        let compiler = Arc::new(ParkedCompiler::default());
        let mut fx = Fixture::new(compiler.clone());

        fx.run_scene("a");
        compiler.release("a", 1);
        fx.ctx.drain_tasks();

        fx.run_scene("b");
        fx.run_scene("c");
        compiler.release("b", 2);
        compiler.release("c", 3);
        fx.ctx.drain_tasks();

        fx.update();
        fx.update();
        let log = fx.log();
        assert!(!log.iter().any(|entry| entry.starts_with("b:")));
        assert_eq!(log.iter().filter(|entry| *entry == "a:finished").count(), 1);
        assert!(log.contains(&"c:presented".to_string()));
        assert_eq!(
            fx.director().current_scene().and_then(|scene| scene.queue()),
            Some(RenderQueueId(3))
        );
    }

    #[test]
    fn stale_compile_after_newer_scene_is_dropped() {
        let compiler = Arc::new(ParkedCompiler::default());
        let mut fx = Fixture::new(compiler.clone());

        fx.run_scene("a");
        compiler.release("a", 1);
        fx.ctx.drain_tasks();

        fx.run_scene("b");
        fx.run_scene("c");
        compiler.release("c", 3);
        fx.ctx.drain_tasks();
        compiler.release("b", 2);
        fx.ctx.drain_tasks();

        fx.update();
        assert_eq!(
            fx.director().current_scene().and_then(|scene| scene.queue()),
            Some(RenderQueueId(3))
        );
    }

    #[test]
    fn failed_compile_keeps_previous_scene() {
        let compiler = Arc::new(ImmediateCompiler::default());
        compiler.fail.lock().unwrap().push("broken".into());
        let mut fx = Fixture::new(compiler);

        fx.run_scene("a");
        fx.ctx.drain_tasks();
        fx.run_scene("broken");
        fx.ctx.drain_tasks();
        fx.update();

        assert_eq!(fx.director().state(), DirectorState::SceneActive);
        assert_eq!(fx.director().current_scene().map(|s| s.name().to_string()), Some("a".into()));
        assert!(!fx.log().iter().any(|entry| entry == "a:finished"));
    }

    #[test]
    fn queue_mismatch_is_rejected_without_touching_scene() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        fx.run_scene("a");
        fx.ctx.drain_tasks();
        let before = fx.log();

        let frame = fx.frame(1, Some(7));
        assert!(!fx.acquire(&frame));
        fx.ctx.drain_tasks();
        assert_eq!(fx.log(), before);
        assert_eq!(fx.director().frames_rejected(), 1);
        assert_eq!(frame.stage(), FrameStage::ImageAcquired);
    }

    #[test]
    fn frame_without_queue_is_stamped_with_current_queue() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        fx.run_scene("a");
        fx.ctx.drain_tasks();

        let frame = fx.frame(1, None);
        assert!(fx.acquire(&frame));
        assert_eq!(frame.queue(), Some(RenderQueueId(1)));
    }

    #[test]
    fn frame_orders_must_increase() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        fx.run_scene("a");
        fx.ctx.drain_tasks();

        for (order, accepted) in [(5, true), (5, false), (4, false), (6, true)] {
            let frame = fx.frame(order, Some(1));
            assert_eq!(fx.acquire(&frame), accepted, "order {order}");
        }
    }

    #[test]
    fn render_failure_cancels_frame() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        let log = fx.log.clone();
        fx.director().run_scene(Box::new(RecordingScene {
            name: "a",
            queue: None,
            log,
            fail_render: true,
        }));
        fx.ctx.drain_tasks();

        let frame = fx.frame(1, Some(1));
        assert!(fx.acquire(&frame));
        fx.ctx.drain_tasks();
        assert_eq!(frame.stage(), FrameStage::Invalidated);
        assert!(fx
            .events()
            .iter()
            .any(|event| matches!(event, PresentationEvent::FrameCancelled { order: 1 })));
    }

    #[test]
    fn delta_is_clamped_by_director() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        let now = fx.clock.advance(Duration::from_secs(30));
        let time = fx.director().update(now);
        assert_eq!(time.delta, AppSettings::default().max_delta.as_micros() as u64);
    }

    #[test]
    fn director_update_drives_repeating_timers() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        let hits = Rc::new(std::cell::Cell::new(0));
        let counter = hits.clone();
        fx.director()
            .timers()
            .schedule_repeating(Duration::from_millis(16), move |_| {
                counter.set(counter.get() + 1)
            });

        fx.update();
        fx.update();
        assert_eq!(hits.get(), 2);

        fx.director().end();
        assert!(fx.director().timers().is_empty());
        fx.update();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn input_reaches_scene_and_requests_frame() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        fx.run_scene("a");
        fx.ctx.drain_tasks();
        fx.events();

        fx.director().handle_input(InputEvent {
            kind: InputKind::Key {
                code: 32,
                pressed: true,
            },
            timestamp: 0,
        });
        assert!(fx.events().iter().any(|event| matches!(
            event,
            PresentationEvent::Command(EngineCommand::SetReadyForNextFrame)
        )));
        fx.update();
        assert!(fx.log().contains(&"a:input".to_string()));
    }

    #[test]
    fn draw_stats_are_bounced_through_the_logic_queue() {
        let mut fx = Fixture::new(Arc::new(ImmediateCompiler::default()));
        let handle = fx.director().handle();
        let stat = DrawStat {
            draw_calls: 12,
            triangles: 400,
            ..DrawStat::default()
        };
        assert!(handle.push_draw_stat(stat));
        assert_eq!(fx.director().draw_stat(), &DrawStat::default());
        fx.ctx.drain_tasks();
        assert_eq!(fx.director().draw_stat(), &stat);
    }
}
