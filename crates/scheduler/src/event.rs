use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::warn;

use crate::constraints::{ContentPadding, FrameConstraints};
use crate::device::{DeprecationFlags, DeviceError, PresentReport, SwapchainImage};
use crate::stats::{SharedStats, StatsSnapshot};
use crate::{RenderQueueId, WindowId};

pub type DeprecationCallback = Box<dyn FnOnce(bool) + Send>;

/// Everything the presentation thread reacts to: completions coming back from
/// the device and frames, plus commands posted by other threads.
pub enum PresentationEvent {
    ImageAcquired {
        generation: u64,
        result: Result<SwapchainImage, DeviceError>,
    },
    FrameSubmitted {
        order: u64,
    },
    FrameCancelled {
        order: u64,
    },
    PresentComplete {
        generation: u64,
        order: u64,
        report: PresentReport,
    },
    Command(EngineCommand),
}

pub enum EngineCommand {
    Run { queue: RenderQueueId },
    End,
    Deprecate {
        flags: DeprecationFlags,
        callback: Option<DeprecationCallback>,
    },
    SetRenderOnDemand(bool),
    SetTargetFrameInterval(Option<u64>),
    SetReadyForNextFrame,
    SetFrameConstraints(FrameConstraints),
    SetContentPadding(ContentPadding),
    ScheduleNextImage,
    DisplayLink,
    WaitForPresentation(Sender<bool>),
    Shutdown,
}

impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineCommand::Run { queue } => f.debug_struct("Run").field("queue", queue).finish(),
            EngineCommand::End => f.write_str("End"),
            EngineCommand::Deprecate { flags, callback } => f
                .debug_struct("Deprecate")
                .field("flags", flags)
                .field("callback", &callback.is_some())
                .finish(),
            EngineCommand::SetRenderOnDemand(value) => {
                f.debug_tuple("SetRenderOnDemand").field(value).finish()
            }
            EngineCommand::SetTargetFrameInterval(value) => {
                f.debug_tuple("SetTargetFrameInterval").field(value).finish()
            }
            EngineCommand::SetReadyForNextFrame => f.write_str("SetReadyForNextFrame"),
            EngineCommand::SetFrameConstraints(value) => {
                f.debug_tuple("SetFrameConstraints").field(value).finish()
            }
            EngineCommand::SetContentPadding(value) => {
                f.debug_tuple("SetContentPadding").field(value).finish()
            }
            EngineCommand::ScheduleNextImage => f.write_str("ScheduleNextImage"),
            EngineCommand::DisplayLink => f.write_str("DisplayLink"),
            EngineCommand::WaitForPresentation(_) => f.write_str("WaitForPresentation"),
            EngineCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl fmt::Debug for PresentationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresentationEvent::ImageAcquired { generation, result } => f
                .debug_struct("ImageAcquired")
                .field("generation", generation)
                .field("result", result)
                .finish(),
            PresentationEvent::FrameSubmitted { order } => {
                f.debug_struct("FrameSubmitted").field("order", order).finish()
            }
            PresentationEvent::FrameCancelled { order } => {
                f.debug_struct("FrameCancelled").field("order", order).finish()
            }
            PresentationEvent::PresentComplete {
                generation,
                order,
                report,
            } => f
                .debug_struct("PresentComplete")
                .field("generation", generation)
                .field("order", order)
                .field("report", report)
                .finish(),
            PresentationEvent::Command(command) => command.fmt(f),
        }
    }
}

/// Cloneable, thread-safe front for one window's presentation scheduler.
#[derive(Clone)]
pub struct PresentationHandle {
    window: WindowId,
    events: Sender<PresentationEvent>,
    stats: Arc<SharedStats>,
    loop_thread: Arc<OnceLock<ThreadId>>,
}

impl PresentationHandle {
    pub fn new(
        window: WindowId,
        events: Sender<PresentationEvent>,
        stats: Arc<SharedStats>,
        loop_thread: Arc<OnceLock<ThreadId>>,
    ) -> Self {
        Self {
            window,
            events,
            stats,
            loop_thread,
        }
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    fn send(&self, command: EngineCommand) -> bool {
        match self.events.send(PresentationEvent::Command(command)) {
            Ok(()) => true,
            Err(err) => {
                warn!(window = %self.window, command = ?err.0, "presentation thread is gone");
                false
            }
        }
    }

    pub fn run_with_queue(&self, queue: RenderQueueId) -> bool {
        self.send(EngineCommand::Run { queue })
    }

    pub fn end(&self) -> bool {
        self.send(EngineCommand::End)
    }

    pub fn deprecate_swapchain(
        &self,
        flags: DeprecationFlags,
        callback: Option<DeprecationCallback>,
    ) -> bool {
        self.send(EngineCommand::Deprecate { flags, callback })
    }

    pub fn set_render_on_demand(&self, value: bool) -> bool {
        self.send(EngineCommand::SetRenderOnDemand(value))
    }

    pub fn set_target_frame_interval(&self, interval: Option<Duration>) -> bool {
        self.send(EngineCommand::SetTargetFrameInterval(
            interval.map(|value| value.as_micros() as u64),
        ))
    }

    pub fn set_ready_for_next_frame(&self) -> bool {
        self.send(EngineCommand::SetReadyForNextFrame)
    }

    pub fn set_frame_constraints(&self, constraints: FrameConstraints) -> bool {
        self.send(EngineCommand::SetFrameConstraints(constraints))
    }

    pub fn set_content_padding(&self, padding: ContentPadding) -> bool {
        self.send(EngineCommand::SetContentPadding(padding))
    }

    pub fn schedule_next_image(&self) -> bool {
        self.send(EngineCommand::ScheduleNextImage)
    }

    /// Forwards a display refresh signal from the platform.
    pub fn signal_display_link(&self) -> bool {
        self.send(EngineCommand::DisplayLink)
    }

    /// Blocks until the next frame reaches the screen or `timeout` passes.
    ///
    /// Returns `false` on timeout, when the scheduler ends first, or when
    /// called from the presentation thread itself.
    pub fn wait_until_frame_presentation(&self, timeout: Duration) -> bool {
        if self.loop_thread.get() == Some(&thread::current().id()) {
            warn!(window = %self.window, "wait_until_frame_presentation called on presentation thread");
            return false;
        }
        let (tx, rx) = bounded(1);
        if !self.send(EngineCommand::WaitForPresentation(tx)) {
            return false;
        }
        rx.recv_timeout(timeout).unwrap_or(false)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shared_stats(&self) -> &Arc<SharedStats> {
        &self.stats
    }

    pub(crate) fn shutdown(&self) -> bool {
        self.send(EngineCommand::Shutdown)
    }
}

impl fmt::Debug for PresentationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationHandle")
            .field("window", &self.window)
            .finish()
    }
}
