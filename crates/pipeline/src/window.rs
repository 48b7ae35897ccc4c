use scheduler::{
    default_swapchain_config, DeviceError, FrameUnit, PresentationWindow, PresentedFrame,
    Surface, SurfaceInfo, SwapchainConfig, WindowId,
};
use tracing::trace;

use crate::task::{AppTask, TaskSender};

/// [`PresentationWindow`] that forwards frames to the window's
/// [`crate::Director`] on the logic thread.
///
/// Runs on the presentation thread and never blocks on scene logic: every
/// call becomes a logic task. A frame the director rejects is cancelled so
/// its image goes back to the scheduler.
pub struct DirectorWindow {
    window: WindowId,
    surface: u64,
    tasks: TaskSender,
}

impl DirectorWindow {
    pub fn new(window: WindowId, tasks: TaskSender) -> Self {
        Self {
            window,
            surface: window.0,
            tasks,
        }
    }
}

impl PresentationWindow for DirectorWindow {
    fn make_surface(&mut self) -> Result<Surface, DeviceError> {
        Ok(Surface { id: self.surface })
    }

    fn select_swapchain_config(&self, info: &SurfaceInfo, fast: bool) -> SwapchainConfig {
        default_swapchain_config(info, fast)
    }

    fn acquire_frame_data(&mut self, frame: FrameUnit) {
        let window = self.window;
        trace!(%window, frame = frame.order(), "forwarding frame to director");
        self.tasks.perform(AppTask::new("acquire-frame", move |ctx| {
            let now = ctx.clock().now_micros();
            let accepted = ctx
                .director_mut(window)
                .is_some_and(|director| director.acquire_frame(&frame, now));
            if !accepted {
                if let Err(err) = frame.cancel() {
                    trace!(%window, frame = frame.order(), "rejected frame already resolved: {err}");
                }
            }
        }));
    }

    fn handle_frame_presented(&mut self, presented: &PresentedFrame) {
        let window = self.window;
        let presented = *presented;
        self.tasks.perform(AppTask::new("frame-presented", move |ctx| {
            if let Some(director) = ctx.director_mut(window) {
                director.handle_frame_presented(presented);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use pipeconfig::AppSettings;
    use scheduler::{
        AcquireTicket, EngineSettings, Extent, FrameConstraints, MonotonicClock, PresentMode,
        PresentReport, PresentStatus, PresentTicket, PresentationLoop, RenderQueueId,
        SwapchainDevice, SwapchainImage,
    };

    use super::*;
    use crate::app_thread::AppThread;
    use crate::scene::{
        FrameScratch, QueueCallback, QueueCompiler, QueueRequest, Scene, SceneError,
    };

    struct InstantDevice {
        next: u32,
    }

    impl SwapchainDevice for InstantDevice {
        fn surface_info(&mut self, _surface: &Surface) -> Result<SurfaceInfo, DeviceError> {
            Ok(SurfaceInfo {
                current_extent: Extent::new(640, 480),
                min_image_count: 2,
                max_image_count: 3,
                present_modes: vec![PresentMode::Fifo],
                color_spaces: Vec::new(),
            })
        }

        fn create_swapchain(
            &mut self,
            _surface: &Surface,
            _config: &SwapchainConfig,
            _generation: u64,
        ) -> Result<(), DeviceError> {
            Ok(())
        }

        fn acquire_image(&mut self, ticket: AcquireTicket) {
            let generation = ticket.generation();
            ticket.complete(Ok(SwapchainImage {
                generation,
                index: self.next % 3,
            }));
            self.next += 1;
        }

        fn present(&mut self, _image: SwapchainImage, ticket: PresentTicket) {
            ticket.complete(PresentReport {
                status: PresentStatus::Ok,
                fence_time: 120,
                timestamp_time: 80,
            });
        }

        fn release_image(&mut self, _image: SwapchainImage) {}

        fn destroy_swapchain(&mut self, _generation: u64) {}
    }

    struct CountingScene {
        queue: Option<RenderQueueId>,
        renders: Arc<AtomicU64>,
    }

    impl Scene for CountingScene {
        fn name(&self) -> &str {
            "counting"
        }

        fn handle_compiled(&mut self, queue: RenderQueueId) {
            self.queue = Some(queue);
        }

        fn queue(&self) -> Option<RenderQueueId> {
            self.queue
        }

        fn set_frame_constraints(&mut self, _constraints: &FrameConstraints) {}

        fn handle_presented(&mut self) {}

        fn handle_finished(&mut self) {}

        fn render_request(
            &mut self,
            _frame: &FrameUnit,
            scratch: &mut FrameScratch,
        ) -> Result<(), SceneError> {
            scratch.push_command("clear");
            self.renders.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ImmediateCompiler;

    impl QueueCompiler for ImmediateCompiler {
        fn compile_queue(&self, _request: QueueRequest, done: QueueCallback) {
            done(Ok(RenderQueueId(42)));
        }
    }

    #[test]
    fn frames_flow_between_presentation_and_logic_threads() {
        const WINDOW: WindowId = WindowId(1);
        let clock = MonotonicClock::shared();
        let mut app = AppThread::start(
            AppSettings {
                update_interval: Duration::from_millis(5),
                ..AppSettings::default()
            },
            clock.clone(),
            |_| Ok(()),
        )
        .unwrap();
        let presentation = PresentationLoop::spawn(
            WINDOW,
            EngineSettings {
                render_on_demand: false,
                ..EngineSettings::default()
            },
            Box::new(InstantDevice { next: 0 }),
            Box::new(DirectorWindow::new(WINDOW, app.handle().task_sender())),
            clock,
        )
        .unwrap();

        let renders = Arc::new(AtomicU64::new(0));
        let scene_renders = renders.clone();
        let handle = presentation.handle();
        app.handle().perform(AppTask::new("open-window", move |ctx| {
            let director = ctx.handle_window_created(
                WINDOW,
                handle,
                FrameConstraints::default(),
                Arc::new(ImmediateCompiler),
            );
            director.run_scene(Box::new(CountingScene {
                queue: None,
                renders: scene_renders,
            }));
        }));

        let handle = presentation.handle();
        for _ in 0..3 {
            assert!(handle.wait_until_frame_presentation(Duration::from_secs(5)));
        }
        assert!(renders.load(Ordering::SeqCst) >= 3);
        assert!(handle.stats().frames_presented >= 3);

        app.handle().perform(AppTask::new("close-window", |ctx| {
            ctx.handle_window_destroyed(WINDOW);
        }));
        presentation.shutdown().unwrap();
        app.stop().unwrap();
    }
}
