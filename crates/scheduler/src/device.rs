//! Contracts for the swapchain owner and the window glue that feeds frames
//! to the scene side. Both are driven from the presentation thread only.

use std::fmt;

use bitflags::bitflags;
use crossbeam_channel::Sender;

use crate::constraints::Extent;
use crate::event::PresentationEvent;
use crate::frame::FrameUnit;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("swapchain is out of date")]
    OutOfDate,
    #[error("surface was lost")]
    SurfaceLost,
    #[error("device was lost")]
    DeviceLost,
    #[error("operation timed out")]
    Timeout,
    #[error("device request was dropped without a result")]
    Abandoned,
    #[error("{0}")]
    Other(String),
}

bitflags! {
    /// Reasons a swapchain is being replaced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeprecationFlags: u32 {
        const RESIZE = 1 << 0;
        const COLOR_SPACE = 1 << 1;
        const SUBOPTIMAL = 1 << 2;
        /// Tear down without recreating.
        const END_OF_LIFE = 1 << 3;
        /// Recreate with the cheap configuration used during live resize.
        const FAST = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Srgb,
    DisplayP3,
    ExtendedLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceInfo {
    pub current_extent: Extent,
    pub min_image_count: u32,
    pub max_image_count: u32,
    pub present_modes: Vec<PresentMode>,
    pub color_spaces: Vec<ColorSpace>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainConfig {
    pub extent: Extent,
    pub present_mode: PresentMode,
    pub color_space: ColorSpace,
    pub image_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub generation: u64,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Ok,
    Suboptimal,
    OutOfDate,
    Failed,
}

impl PresentStatus {
    /// Whether the image reached the screen.
    pub fn is_presented(self) -> bool {
        matches!(self, PresentStatus::Ok | PresentStatus::Suboptimal)
    }
}

/// Completion data for one present, times in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresentReport {
    pub status: PresentStatus,
    pub fence_time: u64,
    pub timestamp_time: u64,
}

impl PresentReport {
    pub fn failed() -> Self {
        Self {
            status: PresentStatus::Failed,
            fence_time: 0,
            timestamp_time: 0,
        }
    }
}

/// One outstanding image acquisition. Completing it posts the result back to
/// the scheduler; dropping it unfinished reports [`DeviceError::Abandoned`].
pub struct AcquireTicket {
    generation: u64,
    sink: Option<Sender<PresentationEvent>>,
}

impl AcquireTicket {
    pub fn new(generation: u64, sink: Sender<PresentationEvent>) -> Self {
        Self {
            generation,
            sink: Some(sink),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn complete(mut self, result: Result<SwapchainImage, DeviceError>) {
        self.send(result);
    }

    fn send(&mut self, result: Result<SwapchainImage, DeviceError>) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(PresentationEvent::ImageAcquired {
                generation: self.generation,
                result,
            });
        }
    }
}

impl Drop for AcquireTicket {
    fn drop(&mut self) {
        self.send(Err(DeviceError::Abandoned));
    }
}

impl fmt::Debug for AcquireTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireTicket")
            .field("generation", &self.generation)
            .finish()
    }
}

/// One outstanding present, completed with the device's report.
pub struct PresentTicket {
    generation: u64,
    order: u64,
    sink: Option<Sender<PresentationEvent>>,
}

impl PresentTicket {
    pub fn new(generation: u64, order: u64, sink: Sender<PresentationEvent>) -> Self {
        Self {
            generation,
            order,
            sink: Some(sink),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn complete(mut self, report: PresentReport) {
        self.send(report);
    }

    fn send(&mut self, report: PresentReport) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(PresentationEvent::PresentComplete {
                generation: self.generation,
                order: self.order,
                report,
            });
        }
    }
}

impl Drop for PresentTicket {
    fn drop(&mut self) {
        self.send(PresentReport::failed());
    }
}

impl fmt::Debug for PresentTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentTicket")
            .field("generation", &self.generation)
            .field("order", &self.order)
            .finish()
    }
}

/// Owner of the surface's swapchain. Acquire and present complete
/// asynchronously through their tickets.
pub trait SwapchainDevice: Send {
    fn surface_info(&mut self, surface: &Surface) -> Result<SurfaceInfo, DeviceError>;

    fn create_swapchain(
        &mut self,
        surface: &Surface,
        config: &SwapchainConfig,
        generation: u64,
    ) -> Result<(), DeviceError>;

    fn acquire_image(&mut self, ticket: AcquireTicket);

    fn present(&mut self, image: SwapchainImage, ticket: PresentTicket);

    /// Returns an acquired image that will not be presented.
    fn release_image(&mut self, image: SwapchainImage);

    fn destroy_swapchain(&mut self, generation: u64);
}

/// Window-side glue for one presentation scheduler.
pub trait PresentationWindow: Send {
    fn make_surface(&mut self) -> Result<Surface, DeviceError>;

    fn select_swapchain_config(&self, info: &SurfaceInfo, fast: bool) -> SwapchainConfig;

    /// Hands a frame with an acquired image to the scene side. The frame must
    /// eventually be submitted or cancelled.
    fn acquire_frame_data(&mut self, frame: FrameUnit);

    fn handle_frame_presented(&mut self, presented: &PresentedFrame);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresentedFrame {
    pub order: u64,
    pub status: PresentStatus,
    pub frame_time: u64,
}

/// Picks a configuration from what the surface supports. Fast mode prefers
/// mailbox and the minimum image count so live resizes recreate cheaply.
pub fn default_swapchain_config(info: &SurfaceInfo, fast: bool) -> SwapchainConfig {
    let present_mode = if fast && info.present_modes.contains(&PresentMode::Mailbox) {
        PresentMode::Mailbox
    } else if info.present_modes.contains(&PresentMode::Fifo) || info.present_modes.is_empty() {
        PresentMode::Fifo
    } else {
        info.present_modes[0]
    };
    let color_space = info.color_spaces.first().copied().unwrap_or(ColorSpace::Srgb);
    let image_count = if fast {
        info.min_image_count.max(1)
    } else {
        (info.min_image_count + 1).min(info.max_image_count.max(info.min_image_count))
    };
    SwapchainConfig {
        extent: info.current_extent,
        present_mode,
        color_space,
        image_count: image_count.max(1),
    }
}
