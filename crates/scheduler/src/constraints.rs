use std::time::Duration;

use pipeconfig::{Padding, ResolvedWindow};

use crate::clock::micros;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceTransform {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl SurfaceTransform {
    /// Quarter turns swap the logical width and height of the surface.
    pub fn swaps_axes(self) -> bool {
        matches!(self, SurfaceTransform::Rotate90 | SurfaceTransform::Rotate270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContentPadding {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl From<Padding> for ContentPadding {
    fn from(value: Padding) -> Self {
        Self {
            top: value.top,
            right: value.right,
            bottom: value.bottom,
            left: value.left,
        }
    }
}

/// Target surface description valid for one frame attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameConstraints {
    pub extent: Extent,
    pub density: f32,
    pub content_padding: ContentPadding,
    pub transform: SurfaceTransform,
    /// Target interval between presents in microseconds; `None` is uncapped.
    pub frame_interval: Option<u64>,
}

impl Default for FrameConstraints {
    fn default() -> Self {
        Self {
            extent: Extent::new(1024, 768),
            density: 1.0,
            content_padding: ContentPadding::default(),
            transform: SurfaceTransform::Identity,
            frame_interval: None,
        }
    }
}

impl FrameConstraints {
    pub fn from_window(window: &ResolvedWindow) -> Self {
        Self {
            extent: Extent::new(window.width, window.height),
            density: window.density,
            content_padding: window.padding.into(),
            transform: SurfaceTransform::Identity,
            frame_interval: window.frame_interval.map(micros),
        }
    }

    pub fn frame_interval_duration(&self) -> Option<Duration> {
        self.frame_interval.map(Duration::from_micros)
    }

    /// Extent as seen by the scene once the surface transform is applied.
    pub fn logical_extent(&self) -> Extent {
        if self.transform.swaps_axes() {
            Extent::new(self.extent.height, self.extent.width)
        } else {
            self.extent
        }
    }

    /// True when a change to `other` requires a new swapchain.
    pub fn requires_recreation(&self, other: &FrameConstraints) -> bool {
        self.extent != other.extent
            || self.transform != other.transform
            || self.density != other.density
    }

    pub fn differs_only_in_padding(&self, other: &FrameConstraints) -> bool {
        !self.requires_recreation(other)
            && self.frame_interval == other.frame_interval
            && self.content_padding != other.content_padding
    }
}
