//! Swapchain-side half of the frame pipeline: frame units, admission control
//! for image acquisition and present timing, and the thread that runs it.

use std::fmt;

pub mod clock;
pub mod constraints;
pub mod device;
pub mod engine;
pub mod event;
pub mod frame;
pub mod runtime;
pub mod stats;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use constraints::{ContentPadding, Extent, FrameConstraints, SurfaceTransform};
pub use device::{
    default_swapchain_config, AcquireTicket, ColorSpace, DeprecationFlags, DeviceError,
    PresentMode, PresentReport, PresentStatus, PresentTicket, PresentationWindow, PresentedFrame,
    Surface, SurfaceInfo, SwapchainConfig, SwapchainDevice, SwapchainImage,
};
pub use engine::{
    DeclineReason, EngineSettings, PresentationEngine, PresentationState, ScheduleOutcome,
};
pub use event::{DeprecationCallback, EngineCommand, PresentationEvent, PresentationHandle};
pub use frame::{FrameError, FrameSpec, FrameStage, FrameUnit};
pub use runtime::PresentationLoop;
pub use stats::{FrameStats, MovingAverage, SharedStats, StatsSnapshot, STAT_SAMPLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window:{}", self.0)
    }
}

/// Identity of a compiled render queue; frames only render into the queue
/// they were created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderQueueId(pub u64);

impl fmt::Display for RenderQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue:{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresentationError {
    #[error("failed to spawn presentation thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("presentation thread for {0} panicked")]
    Panicked(WindowId),
}
