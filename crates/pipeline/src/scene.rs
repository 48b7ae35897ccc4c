use scheduler::{Extent, FrameConstraints, FrameUnit, RenderQueueId, WindowId};

use crate::input::InputEvent;
use crate::time::UpdateTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SceneError {
    #[error("render queue `{name}` failed to compile: {reason}")]
    Compile { name: String, reason: String },
    #[error("render request failed: {0}")]
    Render(String),
}

/// What a compiler needs to build a scene's render queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRequest {
    pub name: String,
    pub window: WindowId,
    pub extent: Extent,
    pub density: f32,
}

pub type QueueCallback = Box<dyn FnOnce(Result<RenderQueueId, SceneError>) + Send>;

/// Compiles render queues off the logic thread.
pub trait QueueCompiler: Send + Sync {
    /// Must eventually call `done` exactly once, from any thread.
    fn compile_queue(&self, request: QueueRequest, done: QueueCallback);
}

/// Result of handing a frame to the current scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Submitted { order: u64 },
    Cancelled { order: u64, reason: String },
}

/// Per-frame scratch storage, reset before every render request.
#[derive(Debug, Default)]
pub struct FrameScratch {
    commands: Vec<String>,
    bytes: usize,
}

impl FrameScratch {
    pub fn push_command(&mut self, command: impl Into<String>) {
        let command = command.into();
        self.bytes += command.len();
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn used_bytes(&self) -> usize {
        self.bytes
    }

    pub fn reset(&mut self) {
        self.commands.clear();
        self.bytes = 0;
    }
}

/// Scene content driven by a [`crate::Director`]. Lives on the logic thread.
pub trait Scene {
    fn name(&self) -> &str;

    fn queue_request(&self, window: WindowId, constraints: &FrameConstraints) -> QueueRequest {
        QueueRequest {
            name: self.name().to_string(),
            window,
            extent: constraints.extent,
            density: constraints.density,
        }
    }

    fn handle_compiled(&mut self, queue: RenderQueueId);

    /// The compiled render queue; `None` until [`Scene::handle_compiled`].
    fn queue(&self) -> Option<RenderQueueId>;

    fn set_frame_constraints(&mut self, constraints: &FrameConstraints);

    /// The scene became the visible one.
    fn handle_presented(&mut self);

    /// The scene stopped being the visible one. Called exactly once.
    fn handle_finished(&mut self);

    fn update(&mut self, _time: &UpdateTime) {}

    fn handle_input(&mut self, _event: &InputEvent) -> bool {
        false
    }

    /// Scenes with running interactions keep requesting frames in
    /// render-on-demand mode.
    fn has_active_interactions(&self) -> bool {
        false
    }

    fn render_request(
        &mut self,
        frame: &FrameUnit,
        scratch: &mut FrameScratch,
    ) -> Result<(), SceneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_tracks_usage_until_reset() {
        let mut scratch = FrameScratch::default();
        scratch.push_command("clear");
        scratch.push_command("draw 3");
        assert_eq!(scratch.commands().len(), 2);
        assert_eq!(scratch.used_bytes(), 11);
        scratch.reset();
        assert!(scratch.commands().is_empty());
        assert_eq!(scratch.used_bytes(), 0);
    }
}
