use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use pipeconfig::ResolvedWindow;
use tracing::{debug, error, info, trace, warn};

use crate::clock::micros;
use crate::constraints::{ContentPadding, FrameConstraints};
use crate::device::{
    AcquireTicket, DeprecationFlags, DeviceError, PresentReport, PresentStatus, PresentTicket,
    PresentationWindow, PresentedFrame, Surface, SwapchainDevice, SwapchainImage,
};
use crate::event::{DeprecationCallback, EngineCommand, PresentationEvent};
use crate::frame::{FrameSpec, FrameStage, FrameUnit};
use crate::stats::{FrameStats, SharedStats};
use crate::{RenderQueueId, WindowId};

/// Retry cadence for rejected frames when no target interval is configured.
pub const DEFAULT_RETRY_INTERVAL: u64 = 16_666;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationState {
    Idle,
    Running,
    AcquirePending,
    PresentPending,
    Deprecating,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    NotRunning,
    NotReady,
    FrameInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { order: u64 },
    /// The present window is still closed; a retry is armed for `until`.
    Deferred { until: u64 },
    Declined(DeclineReason),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub constraints: FrameConstraints,
    pub render_on_demand: bool,
    pub engine_update_interval: u64,
    pub use_present_window: bool,
    /// Rendered frames wait for [`PresentationEngine::handle_display_link`]
    /// instead of a present window.
    pub follow_display_link: bool,
    /// Admit the next frame once the previous one is submitted, without
    /// waiting for its present to complete.
    pub pre_start_frame: bool,
}

impl EngineSettings {
    pub fn from_window(window: &ResolvedWindow) -> Self {
        Self {
            constraints: FrameConstraints::from_window(window),
            render_on_demand: window.render_on_demand,
            engine_update_interval: micros(window.engine_update_interval),
            use_present_window: window.use_present_window,
            follow_display_link: window.follow_display_link,
            pre_start_frame: window.pre_start_frame,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            constraints: FrameConstraints::default(),
            render_on_demand: true,
            engine_update_interval: 250,
            use_present_window: true,
            follow_display_link: false,
            pre_start_frame: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Deprecating,
    Ended,
}

#[derive(Debug)]
struct FrameRecord {
    order: u64,
    created_at: u64,
    image: SwapchainImage,
    correctable: bool,
    stage: FrameStage,
}

#[derive(Debug)]
struct ScheduledPresent {
    deadline: u64,
    record: FrameRecord,
}

#[derive(Default)]
struct PendingDeprecation {
    flags: DeprecationFlags,
    callbacks: Vec<DeprecationCallback>,
}

/// Per-window presentation scheduler.
///
/// A single-threaded state machine: every input arrives either as a
/// [`PresentationEvent`] or through [`poll_timers`](Self::poll_timers), and
/// every asynchronous device or scene result comes back through the event
/// sender the engine was built with.
pub struct PresentationEngine {
    window_id: WindowId,
    device: Box<dyn SwapchainDevice>,
    window: Box<dyn PresentationWindow>,
    events: Sender<PresentationEvent>,
    shared: Arc<SharedStats>,
    stats: FrameStats,
    phase: Phase,
    surface: Option<Surface>,
    generation: u64,
    queue: Option<RenderQueueId>,
    constraints: FrameConstraints,
    next_order: u64,
    frames_awaiting_images: VecDeque<FrameUnit>,
    dispatched: BTreeMap<u64, FrameRecord>,
    scheduled_present_handles: VecDeque<ScheduledPresent>,
    scheduled_for_present: VecDeque<FrameRecord>,
    awaiting_display_link: VecDeque<FrameRecord>,
    requested_images: usize,
    acquired_images: VecDeque<SwapchainImage>,
    ready_for_next_frame: bool,
    render_on_demand: bool,
    target_frame_interval: Option<u64>,
    engine_update_interval: u64,
    use_present_window: bool,
    follow_display_link: bool,
    pre_start_frame: bool,
    next_present_window: u64,
    last_present_at: Option<u64>,
    retry_at: Option<u64>,
    retry_correctable: bool,
    deprecation: Option<PendingDeprecation>,
    fast_mode: bool,
    presentation_waiters: Vec<Sender<bool>>,
}

impl PresentationEngine {
    pub fn new(
        window_id: WindowId,
        settings: EngineSettings,
        device: Box<dyn SwapchainDevice>,
        window: Box<dyn PresentationWindow>,
        events: Sender<PresentationEvent>,
        shared: Arc<SharedStats>,
    ) -> Self {
        Self {
            window_id,
            device,
            window,
            events,
            shared,
            stats: FrameStats::default(),
            phase: Phase::Idle,
            surface: None,
            generation: 0,
            queue: None,
            target_frame_interval: settings.constraints.frame_interval,
            constraints: settings.constraints,
            next_order: 1,
            frames_awaiting_images: VecDeque::new(),
            dispatched: BTreeMap::new(),
            scheduled_present_handles: VecDeque::new(),
            scheduled_for_present: VecDeque::new(),
            awaiting_display_link: VecDeque::new(),
            requested_images: 0,
            acquired_images: VecDeque::new(),
            ready_for_next_frame: false,
            render_on_demand: settings.render_on_demand,
            engine_update_interval: settings.engine_update_interval,
            use_present_window: settings.use_present_window,
            follow_display_link: settings.follow_display_link,
            pre_start_frame: settings.pre_start_frame,
            next_present_window: 0,
            last_present_at: None,
            retry_at: None,
            retry_correctable: false,
            deprecation: None,
            fast_mode: false,
            presentation_waiters: Vec::new(),
        }
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    pub fn state(&self) -> PresentationState {
        match self.phase {
            Phase::Idle => PresentationState::Idle,
            Phase::Deprecating => PresentationState::Deprecating,
            Phase::Ended => PresentationState::Ended,
            Phase::Running => {
                if !self.frames_awaiting_images.is_empty() {
                    PresentationState::AcquirePending
                } else if !self.dispatched.is_empty()
                    || !self.scheduled_present_handles.is_empty()
                    || !self.scheduled_for_present.is_empty()
                    || !self.awaiting_display_link.is_empty()
                {
                    PresentationState::PresentPending
                } else {
                    PresentationState::Running
                }
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub fn queue(&self) -> Option<RenderQueueId> {
        self.queue
    }

    pub fn constraints(&self) -> &FrameConstraints {
        &self.constraints
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn fast_mode(&self) -> bool {
        self.fast_mode
    }

    pub fn is_ready_for_next_frame(&self) -> bool {
        self.ready_for_next_frame
    }

    pub fn is_render_on_demand(&self) -> bool {
        self.render_on_demand
    }

    pub fn target_frame_interval(&self) -> Option<u64> {
        self.target_frame_interval
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn active_frames(&self) -> usize {
        self.frames_awaiting_images.len()
            + self.dispatched.len()
            + self.scheduled_present_handles.len()
            + self.scheduled_for_present.len()
            + self.awaiting_display_link.len()
    }

    /// Frames that block admission of the next one. With pre-start enabled a
    /// submitted frame no longer counts.
    fn admission_frames(&self) -> usize {
        if self.pre_start_frame {
            self.frames_awaiting_images.len() + self.dispatched.len()
        } else {
            self.active_frames()
        }
    }

    pub fn follows_display_link(&self) -> bool {
        self.follow_display_link
    }

    pub fn acquired_image_count(&self) -> usize {
        self.acquired_images.len()
    }

    pub fn requested_image_count(&self) -> usize {
        self.requested_images
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<u64> {
        let present = self
            .scheduled_present_handles
            .front()
            .map(|scheduled| scheduled.deadline);
        match (self.retry_at, present) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_event(&mut self, event: PresentationEvent, now: u64) {
        match event {
            PresentationEvent::ImageAcquired { generation, result } => {
                self.handle_image_acquired(generation, result, now)
            }
            PresentationEvent::FrameSubmitted { order } => self.handle_frame_submitted(order, now),
            PresentationEvent::FrameCancelled { order } => self.handle_frame_cancelled(order, now),
            PresentationEvent::PresentComplete {
                generation,
                order,
                report,
            } => self.handle_present_complete(generation, order, report, now),
            PresentationEvent::Command(command) => self.handle_command(command, now),
        }
    }

    pub fn handle_command(&mut self, command: EngineCommand, now: u64) {
        trace!(window = %self.window_id, ?command, "presentation command");
        match command {
            EngineCommand::Run { queue } => {
                if let Err(err) = self.run(queue, now) {
                    error!(window = %self.window_id, "failed to start presentation: {err}");
                }
            }
            EngineCommand::End | EngineCommand::Shutdown => self.end(now),
            EngineCommand::Deprecate { flags, callback } => {
                self.deprecate_swapchain(flags, callback, now)
            }
            EngineCommand::SetRenderOnDemand(value) => self.set_render_on_demand(value, now),
            EngineCommand::SetTargetFrameInterval(value) => {
                self.set_target_frame_interval(value, now)
            }
            EngineCommand::DisplayLink => self.handle_display_link(now),
            EngineCommand::SetReadyForNextFrame => self.set_ready_for_next_frame(now),
            EngineCommand::SetFrameConstraints(constraints) => {
                self.set_frame_constraints(constraints, now)
            }
            EngineCommand::SetContentPadding(padding) => self.set_content_padding(padding, now),
            EngineCommand::ScheduleNextImage => {
                self.schedule_next_image(now, false);
            }
            EngineCommand::WaitForPresentation(waiter) => {
                self.wait_until_frame_presentation(waiter, now)
            }
        }
    }

    /// Starts presenting frames for `queue`, creating the swapchain on first use.
    pub fn run(&mut self, queue: RenderQueueId, now: u64) -> Result<(), DeviceError> {
        match self.phase {
            Phase::Ended => Err(DeviceError::Other(format!(
                "presentation for window {} has ended",
                self.window_id
            ))),
            Phase::Idle => {
                self.queue = Some(queue);
                self.create_swapchain()?;
                self.schedule_next_image(now, false);
                Ok(())
            }
            Phase::Running | Phase::Deprecating => {
                if self.queue != Some(queue) {
                    debug!(window = %self.window_id, %queue, "presentation queue switched");
                }
                self.queue = Some(queue);
                self.ready_for_next_frame = true;
                if self.phase == Phase::Running && self.admission_frames() == 0 {
                    self.schedule_next_image(now, false);
                }
                Ok(())
            }
        }
    }

    /// Admission control for a new frame.
    pub fn schedule_next_image(&mut self, now: u64, correctable: bool) -> ScheduleOutcome {
        if self.phase != Phase::Running || self.queue.is_none() {
            return ScheduleOutcome::Declined(DeclineReason::NotRunning);
        }
        if self.admission_frames() > 0 {
            return ScheduleOutcome::Declined(DeclineReason::FrameInFlight);
        }
        if self.render_on_demand && !self.ready_for_next_frame {
            return ScheduleOutcome::Declined(DeclineReason::NotReady);
        }
        if self.present_window_closed(now) {
            let until = self.next_present_window;
            self.arm_retry(until);
            self.retry_correctable |= correctable;
            trace!(window = %self.window_id, until, "present window closed, retry armed");
            return ScheduleOutcome::Deferred { until };
        }

        let order = self.next_order;
        self.next_order += 1;
        let frame = FrameUnit::new(
            FrameSpec {
                window: self.window_id,
                order,
                constraints: self.constraints.clone(),
                queue: self.queue,
                created_at: now,
                correctable,
            },
            self.events.clone(),
        );
        self.ready_for_next_frame = false;
        self.retry_at = None;
        self.retry_correctable = false;
        trace!(window = %self.window_id, frame = order, "frame scheduled");
        self.schedule_image(frame);
        ScheduleOutcome::Scheduled { order }
    }

    pub fn poll_timers(&mut self, now: u64) {
        if let Some(at) = self.retry_at {
            if at <= now {
                self.retry_at = None;
                let correctable = std::mem::take(&mut self.retry_correctable);
                self.schedule_next_image(now, correctable);
            }
        }
        while self
            .scheduled_present_handles
            .front()
            .is_some_and(|scheduled| scheduled.deadline <= now)
        {
            if let Some(scheduled) = self.scheduled_present_handles.pop_front() {
                self.present_with_queue(scheduled.record, now);
            }
        }
    }

    /// Marks the swapchain for replacement. Requests arriving before the
    /// replacement happens are coalesced; their callbacks run once, in call
    /// order, after every admitted present has completed.
    pub fn deprecate_swapchain(
        &mut self,
        flags: DeprecationFlags,
        callback: Option<DeprecationCallback>,
        now: u64,
    ) {
        match self.phase {
            Phase::Ended => {
                if let Some(callback) = callback {
                    callback(false);
                }
            }
            Phase::Idle => {
                let ending = flags.contains(DeprecationFlags::END_OF_LIFE);
                if ending {
                    self.finish_end();
                }
                if let Some(callback) = callback {
                    callback(ending);
                }
            }
            Phase::Running | Phase::Deprecating => {
                if self.phase == Phase::Running {
                    info!(window = %self.window_id, ?flags, generation = self.generation, "swapchain deprecated");
                }
                let pending = self.deprecation.get_or_insert_with(PendingDeprecation::default);
                pending.flags |= flags;
                if let Some(callback) = callback {
                    pending.callbacks.push(callback);
                }
                self.phase = Phase::Deprecating;
                self.retry_at = None;
                for frame in self.frames_awaiting_images.drain(..) {
                    frame.invalidate();
                }
                while let Some(scheduled) = self.scheduled_present_handles.pop_front() {
                    self.present_with_queue(scheduled.record, now);
                }
                while let Some(record) = self.awaiting_display_link.pop_front() {
                    self.present_with_queue(record, now);
                }
                self.try_finish_deprecation(now);
            }
        }
    }

    pub fn end(&mut self, now: u64) {
        self.deprecate_swapchain(DeprecationFlags::END_OF_LIFE, None, now);
    }

    /// Tears everything down without waiting for the device.
    pub fn force_end(&mut self) {
        if self.phase == Phase::Ended {
            return;
        }
        warn!(
            window = %self.window_id,
            in_flight = self.scheduled_for_present.len(),
            "forcing presentation shutdown"
        );
        let images: Vec<_> = self
            .acquired_images
            .drain(..)
            .chain(self.dispatched.values().map(|record| record.image))
            .chain(self.awaiting_display_link.iter().map(|record| record.image))
            .collect();
        for image in images {
            self.device.release_image(image);
        }
        self.dispatched.clear();
        self.awaiting_display_link.clear();
        self.scheduled_for_present.clear();
        if self.generation > 0 && self.phase != Phase::Idle {
            self.device.destroy_swapchain(self.generation);
        }
        let callbacks = self
            .deprecation
            .take()
            .map(|pending| pending.callbacks)
            .unwrap_or_default();
        self.finish_end();
        for callback in callbacks {
            callback(false);
        }
    }

    pub fn set_render_on_demand(&mut self, value: bool, now: u64) {
        self.render_on_demand = value;
        if !value && self.phase == Phase::Running && self.admission_frames() == 0 {
            self.schedule_next_image(now, false);
        }
    }

    /// Changes the present cadence. The present window is recomputed from
    /// the last present, so a retry or a held present armed for the old
    /// interval fires no later than the new one allows.
    pub fn set_target_frame_interval(&mut self, interval: Option<u64>, now: u64) {
        let interval = interval.filter(|value| *value > 0);
        self.constraints.frame_interval = interval;
        self.retarget(interval, now);
    }

    fn retarget(&mut self, interval: Option<u64>, now: u64) {
        if interval == self.target_frame_interval {
            return;
        }
        debug!(window = %self.window_id, ?interval, "target frame interval changed");
        self.target_frame_interval = interval;
        self.next_present_window = match (interval, self.last_present_at) {
            (Some(target), Some(last)) => {
                last + target.saturating_sub(self.engine_update_interval)
            }
            _ => 0,
        };
        let window = self.next_present_window;
        for scheduled in &mut self.scheduled_present_handles {
            scheduled.deadline = scheduled.deadline.min(window);
        }
        if let Some(at) = self.retry_at {
            self.retry_at = Some(at.min(window.max(now)));
        }
        self.poll_timers(now);
        if self.phase == Phase::Running
            && self.admission_frames() == 0
            && (!self.render_on_demand || self.ready_for_next_frame)
        {
            self.schedule_next_image(now, false);
        }
    }

    /// Display refresh signal: presents every frame held for it.
    pub fn handle_display_link(&mut self, now: u64) {
        if self.phase != Phase::Running || self.awaiting_display_link.is_empty() {
            return;
        }
        trace!(
            window = %self.window_id,
            frames = self.awaiting_display_link.len(),
            "display link"
        );
        while let Some(record) = self.awaiting_display_link.pop_front() {
            self.present_with_queue(record, now);
        }
    }

    /// Requests a new frame in render-on-demand mode.
    pub fn set_ready_for_next_frame(&mut self, now: u64) {
        if !self.render_on_demand {
            return;
        }
        self.request_frame(now);
    }

    pub fn set_frame_constraints(&mut self, constraints: FrameConstraints, now: u64) {
        if constraints == self.constraints {
            return;
        }
        let recreate = self.constraints.requires_recreation(&constraints);
        let padding_only = self.constraints.differs_only_in_padding(&constraints);
        let interval = constraints.frame_interval.filter(|value| *value > 0);
        self.constraints = constraints;
        if recreate {
            self.deprecate_swapchain(DeprecationFlags::RESIZE, None, now);
        } else if padding_only {
            self.request_frame(now);
        }
        self.retarget(interval, now);
    }

    pub fn set_content_padding(&mut self, padding: ContentPadding, now: u64) {
        let mut constraints = self.constraints.clone();
        constraints.content_padding = padding;
        self.set_frame_constraints(constraints, now);
    }

    /// Opens the present window and reports to `waiter` once the next frame
    /// is on screen.
    pub fn wait_until_frame_presentation(&mut self, waiter: Sender<bool>, now: u64) {
        if self.phase == Phase::Ended {
            let _ = waiter.send(false);
            return;
        }
        self.presentation_waiters.push(waiter);
        self.next_present_window = 0;
        self.request_frame(now);
    }

    fn request_frame(&mut self, now: u64) {
        self.ready_for_next_frame = true;
        if self.phase == Phase::Running && self.admission_frames() == 0 {
            self.schedule_next_image(now, false);
        }
    }

    fn present_window_closed(&self, now: u64) -> bool {
        !self.follow_display_link
            && self.use_present_window
            && self.target_frame_interval.is_some()
            && self.next_present_window > now + self.engine_update_interval
    }

    fn retry_interval(&self) -> u64 {
        self.target_frame_interval.unwrap_or(DEFAULT_RETRY_INTERVAL)
    }

    fn arm_retry(&mut self, at: u64) {
        self.retry_at = Some(self.retry_at.map_or(at, |current| current.min(at)));
    }

    fn create_swapchain(&mut self) -> Result<(), DeviceError> {
        let surface = match self.surface {
            Some(surface) => surface,
            None => {
                let surface = self.window.make_surface()?;
                self.surface = Some(surface);
                surface
            }
        };
        let info = self.device.surface_info(&surface)?;
        let config = self.window.select_swapchain_config(&info, self.fast_mode);
        let generation = self.generation + 1;
        self.device.create_swapchain(&surface, &config, generation)?;
        self.generation = generation;
        self.requested_images = 0;
        self.phase = Phase::Running;
        self.ready_for_next_frame = true;
        self.next_present_window = 0;
        self.shared.record_recreated();
        info!(
            window = %self.window_id,
            generation,
            width = config.extent.width,
            height = config.extent.height,
            mode = ?config.present_mode,
            fast = self.fast_mode,
            "swapchain created"
        );
        Ok(())
    }

    fn schedule_image(&mut self, frame: FrameUnit) {
        if let Some(image) = self.acquired_images.pop_front() {
            self.dispatch(frame, image);
        } else {
            self.frames_awaiting_images.push_back(frame);
            self.acquire_scheduled_image();
        }
    }

    fn acquire_scheduled_image(&mut self) {
        if self.requested_images < self.frames_awaiting_images.len() {
            self.requested_images += 1;
            trace!(window = %self.window_id, generation = self.generation, "image requested");
            self.device
                .acquire_image(AcquireTicket::new(self.generation, self.events.clone()));
        }
    }

    fn dispatch(&mut self, frame: FrameUnit, image: SwapchainImage) {
        if let Err(err) = frame.dispatch() {
            debug!(window = %self.window_id, "skipping frame: {err}");
            self.acquired_images.push_front(image);
            return;
        }
        let order = frame.order();
        self.dispatched.insert(
            order,
            FrameRecord {
                order,
                created_at: frame.created_at(),
                image,
                correctable: frame.is_correctable(),
                stage: FrameStage::ImageAcquired,
            },
        );
        trace!(window = %self.window_id, frame = order, image = image.index, "frame dispatched");
        self.window.acquire_frame_data(frame);
    }

    fn has_swapchain(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::Deprecating)
    }

    fn handle_image_acquired(
        &mut self,
        generation: u64,
        result: Result<SwapchainImage, DeviceError>,
        now: u64,
    ) {
        if generation != self.generation || !self.has_swapchain() {
            trace!(window = %self.window_id, generation, "stale acquisition result");
            return;
        }
        self.requested_images = self.requested_images.saturating_sub(1);
        match result {
            Ok(image) => {
                if self.phase == Phase::Deprecating {
                    self.device.release_image(image);
                    self.try_finish_deprecation(now);
                    return;
                }
                match self.frames_awaiting_images.pop_front() {
                    Some(frame) => self.dispatch(frame, image),
                    None => self.acquired_images.push_back(image),
                }
            }
            Err(err) => {
                warn!(window = %self.window_id, "image acquisition failed: {err}");
                for frame in self.frames_awaiting_images.drain(..) {
                    frame.invalidate();
                    self.shared.record_failed();
                }
                self.ready_for_next_frame = true;
                match err {
                    DeviceError::OutOfDate | DeviceError::SurfaceLost => {
                        self.deprecate_swapchain(DeprecationFlags::RESIZE, None, now)
                    }
                    _ if self.phase == Phase::Deprecating => self.try_finish_deprecation(now),
                    _ => self.arm_retry(now + self.retry_interval()),
                }
            }
        }
    }

    fn handle_frame_submitted(&mut self, order: u64, now: u64) {
        let Some(mut record) = self.dispatched.remove(&order) else {
            debug!(window = %self.window_id, frame = order, "submission for unknown frame");
            return;
        };
        record.stage = FrameStage::Submitted;
        self.present(record, now);
        if self.pre_start_frame
            && self.phase == Phase::Running
            && (!self.render_on_demand || self.ready_for_next_frame)
        {
            trace!(window = %self.window_id, frame = order, "pre-starting next frame");
            self.schedule_next_image(now, false);
        }
    }

    fn handle_frame_cancelled(&mut self, order: u64, now: u64) {
        let Some(record) = self.dispatched.remove(&order) else {
            return;
        };
        debug!(window = %self.window_id, frame = order, "frame rejected, image kept for reuse");
        self.shared.record_cancelled();
        self.ready_for_next_frame = true;
        match self.phase {
            Phase::Running => {
                self.acquired_images.push_front(record.image);
                self.arm_retry(now + self.retry_interval());
            }
            Phase::Deprecating => {
                self.device.release_image(record.image);
                self.try_finish_deprecation(now);
            }
            Phase::Idle | Phase::Ended => {}
        }
    }

    fn present(&mut self, record: FrameRecord, now: u64) {
        if self.phase == Phase::Running && self.follow_display_link {
            trace!(window = %self.window_id, frame = record.order, "present held for display link");
            self.awaiting_display_link.push_back(record);
        } else if self.phase == Phase::Running && self.present_window_closed(now) {
            let deadline = self.next_present_window;
            trace!(window = %self.window_id, frame = record.order, deadline, "present deferred");
            self.scheduled_present_handles
                .push_back(ScheduledPresent { deadline, record });
        } else {
            self.present_with_queue(record, now);
        }
    }

    fn present_with_queue(&mut self, mut record: FrameRecord, now: u64) {
        if record.image.generation != self.generation || !self.has_swapchain() {
            warn!(
                window = %self.window_id,
                frame = record.order,
                stage = ?record.stage,
                "frame outlived its swapchain"
            );
            self.shared.record_failed();
            self.ready_for_next_frame = true;
            self.after_frame(now);
            return;
        }
        if let (false, Some(target)) = (self.follow_display_link, self.target_frame_interval) {
            self.next_present_window = now + target.saturating_sub(self.engine_update_interval);
        }
        let ticket = PresentTicket::new(self.generation, record.order, self.events.clone());
        let image = record.image;
        record.stage = FrameStage::Rendered;
        self.scheduled_for_present.push_back(record);
        self.device.present(image, ticket);
    }

    fn handle_present_complete(
        &mut self,
        generation: u64,
        order: u64,
        report: PresentReport,
        now: u64,
    ) {
        let Some(index) = self
            .scheduled_for_present
            .iter()
            .position(|record| record.order == order)
        else {
            debug!(window = %self.window_id, frame = order, generation, "present completion for unknown frame");
            return;
        };
        if index != 0 {
            debug!(window = %self.window_id, frame = order, "present completed out of order");
        }
        let Some(mut record) = self.scheduled_for_present.remove(index) else {
            return;
        };

        if report.status.is_presented() {
            record.stage = FrameStage::Presented;
            self.record_presented(&record, &report, now);
            let presented = PresentedFrame {
                order: record.order,
                status: report.status,
                frame_time: now.saturating_sub(record.created_at),
            };
            self.window.handle_frame_presented(&presented);
            for waiter in self.presentation_waiters.drain(..) {
                let _ = waiter.send(true);
            }
            if report.status == PresentStatus::Suboptimal {
                self.deprecate_swapchain(DeprecationFlags::SUBOPTIMAL, None, now);
            }
        } else {
            warn!(window = %self.window_id, frame = order, status = ?report.status, "present failed");
            self.shared.record_failed();
            self.ready_for_next_frame = true;
            if report.status == PresentStatus::OutOfDate {
                self.deprecate_swapchain(DeprecationFlags::RESIZE, None, now);
            }
        }
        self.after_frame(now);
    }

    fn record_presented(&mut self, record: &FrameRecord, report: &PresentReport, now: u64) {
        if let Some(last) = self.last_present_at {
            let interval = now.saturating_sub(last);
            self.stats.presentation_interval.push(interval);
            if let Some(target) = self.target_frame_interval {
                if record.correctable && interval > target + self.engine_update_interval {
                    let overshoot = interval - target;
                    self.next_present_window = self.next_present_window.saturating_sub(overshoot);
                    trace!(window = %self.window_id, overshoot, "present window corrected");
                }
            }
        }
        self.last_present_at = Some(now);
        self.stats
            .frame_time
            .push(now.saturating_sub(record.created_at));
        self.stats.fence_time.push(report.fence_time);
        self.stats.timestamp_time.push(report.timestamp_time);
        self.shared.publish(&self.stats);
        self.shared.record_presented();
    }

    fn after_frame(&mut self, now: u64) {
        match self.phase {
            Phase::Deprecating => self.try_finish_deprecation(now),
            Phase::Running => {
                if self.admission_frames() == 0
                    && (!self.render_on_demand || self.ready_for_next_frame)
                {
                    self.schedule_next_image(now, true);
                }
            }
            Phase::Idle | Phase::Ended => {}
        }
    }

    fn try_finish_deprecation(&mut self, now: u64) {
        if self.phase != Phase::Deprecating
            || !self.dispatched.is_empty()
            || !self.scheduled_for_present.is_empty()
            || !self.scheduled_present_handles.is_empty()
            || !self.awaiting_display_link.is_empty()
            || self.requested_images > 0
        {
            return;
        }
        let pending = self.deprecation.take().unwrap_or_default();
        let images: Vec<_> = self.acquired_images.drain(..).collect();
        for image in images {
            self.device.release_image(image);
        }
        self.device.destroy_swapchain(self.generation);

        let success = if pending.flags.contains(DeprecationFlags::END_OF_LIFE) {
            self.finish_end();
            true
        } else {
            self.fast_mode = pending.flags.contains(DeprecationFlags::FAST);
            match self.create_swapchain() {
                Ok(()) => true,
                Err(err) => {
                    error!(window = %self.window_id, "failed to recreate swapchain: {err}");
                    self.phase = Phase::Idle;
                    false
                }
            }
        };

        for callback in pending.callbacks {
            callback(success);
        }
        if self.phase == Phase::Running {
            self.schedule_next_image(now, false);
        }
    }

    fn finish_end(&mut self) {
        self.phase = Phase::Ended;
        for frame in self.frames_awaiting_images.drain(..) {
            frame.invalidate();
        }
        self.scheduled_present_handles.clear();
        self.acquired_images.clear();
        self.requested_images = 0;
        self.retry_at = None;
        self.ready_for_next_frame = false;
        for waiter in self.presentation_waiters.drain(..) {
            let _ = waiter.send(false);
        }
        info!(window = %self.window_id, "presentation ended");
    }
}
