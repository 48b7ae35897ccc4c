//! Logic-thread half of the frame pipeline.
//!
//! The logic thread owns every [`Director`] and the scenes they show. The
//! presentation thread of each window talks to it only through queued tasks:
//!
//! ```text
//!   PresentationLoop (per window)              AppThread (logic)
//!   ─────────────────────────────              ─────────────────
//!   schedule_next_image
//!        │ image acquired
//!        ▼
//!   DirectorWindow::acquire_frame_data ──task──▶ Director::acquire_frame
//!                                                     │ deferred task
//!                                                     ▼
//!   FrameSubmitted / FrameCancelled ◀──────────  Director::render_frame ──▶ Scene
//!        │
//!        ▼
//!   present ──▶ handle_frame_presented ──task──▶ Director::handle_frame_presented
//! ```
//!
//! Every tick [`AppContext::perform_update`] updates the directors (which is
//! where pending scenes get promoted), then the extensions such as the
//! [`ResourceCache`], then the registered listeners.

pub mod actions;
pub mod app_thread;
pub mod context;
pub mod director;
pub mod events;
pub mod extension;
pub mod input;
pub mod resource;
pub mod scene;
pub mod task;
pub mod time;
pub mod timer;
pub mod window;

pub use actions::{ActionId, ActionManager};
pub use app_thread::{AppHandle, AppThread, AppThreadError};
pub use context::{AppContext, ContractViolation};
pub use director::{Director, DirectorHandle, DirectorState, DrawStat};
pub use events::{EventChannel, NetworkState, ThemeInfo};
pub use extension::{Extension, ExtensionKey};
pub use input::{InputDispatcher, InputEvent, InputKind};
pub use resource::{
    CompileCallback, LoadCallback, ResourceCache, ResourceCompiler, TemporaryFlags,
    TemporaryResource,
};
pub use scene::{
    FrameScratch, QueueCallback, QueueCompiler, QueueRequest, RenderOutcome, Scene, SceneError,
};
pub use task::{AppTask, ObjectId, TaskSender};
pub use time::{Timeline, UpdateTime};
pub use timer::{TimedScheduler, TimerId};
pub use window::DirectorWindow;
