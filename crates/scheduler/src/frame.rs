use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::Sender;
use tracing::{debug, trace};

use crate::constraints::FrameConstraints;
use crate::event::PresentationEvent;
use crate::{RenderQueueId, WindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameStage {
    Created = 0,
    ImageAcquired = 1,
    Submitted = 2,
    Rendered = 3,
    Presented = 4,
    Invalidated = 5,
}

impl FrameStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FrameStage::Created,
            1 => FrameStage::ImageAcquired,
            2 => FrameStage::Submitted,
            3 => FrameStage::Rendered,
            4 => FrameStage::Presented,
            _ => FrameStage::Invalidated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame {order} was already resolved ({stage:?})")]
    AlreadyResolved { order: u64, stage: FrameStage },
    #[error("frame {order} has not been handed out for rendering")]
    NotDispatched { order: u64 },
}

/// Everything the scheduler knows about a frame when it creates one.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub window: WindowId,
    pub order: u64,
    pub constraints: FrameConstraints,
    pub queue: Option<RenderQueueId>,
    pub created_at: u64,
    pub correctable: bool,
}

/// One attempt to render and present one image.
///
/// Cloning shares the same attempt. Resolution (`submit` or `cancel`) happens
/// exactly once and is reported back to the owning scheduler through its
/// event sink. Dropping the last handle of a dispatched, unresolved frame
/// cancels it so the scheduler never waits forever.
#[derive(Clone)]
pub struct FrameUnit {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    window: WindowId,
    order: u64,
    constraints: FrameConstraints,
    queue: OnceLock<RenderQueueId>,
    created_at: u64,
    correctable: bool,
    stage: AtomicU8,
    sink: Sender<PresentationEvent>,
}

impl FrameUnit {
    pub fn new(spec: FrameSpec, sink: Sender<PresentationEvent>) -> Self {
        let queue = OnceLock::new();
        if let Some(id) = spec.queue {
            let _ = queue.set(id);
        }
        Self {
            inner: Arc::new(FrameInner {
                window: spec.window,
                order: spec.order,
                constraints: spec.constraints,
                queue,
                created_at: spec.created_at,
                correctable: spec.correctable,
                stage: AtomicU8::new(FrameStage::Created as u8),
                sink,
            }),
        }
    }

    pub fn window(&self) -> WindowId {
        self.inner.window
    }

    pub fn order(&self) -> u64 {
        self.inner.order
    }

    pub fn constraints(&self) -> &FrameConstraints {
        &self.inner.constraints
    }

    pub fn queue(&self) -> Option<RenderQueueId> {
        self.inner.queue.get().copied()
    }

    /// Sets the target queue when the frame has none and returns the queue
    /// the frame targets afterwards.
    pub fn stamp_queue(&self, queue: RenderQueueId) -> RenderQueueId {
        *self.inner.queue.get_or_init(|| queue)
    }

    pub fn created_at(&self) -> u64 {
        self.inner.created_at
    }

    pub fn is_correctable(&self) -> bool {
        self.inner.correctable
    }

    pub fn stage(&self) -> FrameStage {
        FrameStage::from_u8(self.inner.stage.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.stage(),
            FrameStage::Submitted
                | FrameStage::Rendered
                | FrameStage::Presented
                | FrameStage::Invalidated
        )
    }

    /// Marks the frame as holding a swapchain image and handed out for rendering.
    pub fn dispatch(&self) -> Result<(), FrameError> {
        self.transition(FrameStage::Created, FrameStage::ImageAcquired)
    }

    /// Reports the render work for this frame as submitted.
    pub fn submit(&self) -> Result<(), FrameError> {
        self.transition(FrameStage::ImageAcquired, FrameStage::Submitted)?;
        trace!(window = %self.inner.window, frame = self.inner.order, "frame submitted");
        let _ = self.inner.sink.send(PresentationEvent::FrameSubmitted {
            order: self.inner.order,
        });
        Ok(())
    }

    /// Gives the frame back without rendering; its image is reused.
    pub fn cancel(&self) -> Result<(), FrameError> {
        self.transition(FrameStage::ImageAcquired, FrameStage::Invalidated)?;
        debug!(window = %self.inner.window, frame = self.inner.order, "frame cancelled");
        let _ = self.inner.sink.send(PresentationEvent::FrameCancelled {
            order: self.inner.order,
        });
        Ok(())
    }

    /// Drops a frame that never left the scheduler; nothing is reported.
    pub(crate) fn invalidate(&self) {
        self.inner
            .stage
            .store(FrameStage::Invalidated as u8, Ordering::Release);
    }

    fn transition(&self, from: FrameStage, to: FrameStage) -> Result<(), FrameError> {
        match self.inner.stage.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if current == FrameStage::Created as u8 => Err(FrameError::NotDispatched {
                order: self.inner.order,
            }),
            Err(current) => Err(FrameError::AlreadyResolved {
                order: self.inner.order,
                stage: FrameStage::from_u8(current),
            }),
        }
    }
}

impl fmt::Debug for FrameUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameUnit")
            .field("window", &self.inner.window)
            .field("order", &self.inner.order)
            .field("queue", &self.queue())
            .field("stage", &self.stage())
            .finish()
    }
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if self.stage.load(Ordering::Acquire) == FrameStage::ImageAcquired as u8 {
            debug!(window = %self.window, frame = self.order, "frame dropped unresolved");
            let _ = self
                .sink
                .send(PresentationEvent::FrameCancelled { order: self.order });
        }
    }
}
