use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::device::{PresentationWindow, SwapchainDevice};
use crate::engine::{EngineSettings, PresentationEngine};
use crate::event::{EngineCommand, PresentationEvent, PresentationHandle};
use crate::stats::SharedStats;
use crate::{PresentationError, WindowId};

/// How long shutdown waits for in-flight presents before tearing down anyway.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owns the thread that drives one window's [`PresentationEngine`].
pub struct PresentationLoop {
    handle: PresentationHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl PresentationLoop {
    pub fn spawn(
        window_id: WindowId,
        settings: EngineSettings,
        device: Box<dyn SwapchainDevice>,
        window: Box<dyn PresentationWindow>,
        clock: SharedClock,
    ) -> Result<Self, PresentationError> {
        let (events_tx, events_rx) = unbounded();
        let stats = Arc::new(SharedStats::default());
        let loop_thread = Arc::new(OnceLock::new());
        let handle = PresentationHandle::new(
            window_id,
            events_tx.clone(),
            stats.clone(),
            loop_thread.clone(),
        );
        let engine =
            PresentationEngine::new(window_id, settings, device, window, events_tx, stats);

        let join_handle = thread::Builder::new()
            .name(format!("present-{window_id}"))
            .spawn(move || {
                let _ = loop_thread.set(thread::current().id());
                run_presentation_loop(engine, events_rx, clock);
            })
            .map_err(PresentationError::Spawn)?;

        Ok(Self {
            handle,
            join_handle: Some(join_handle),
        })
    }

    pub fn handle(&self) -> PresentationHandle {
        self.handle.clone()
    }

    /// Ends presentation, waits for in-flight frames and joins the thread.
    pub fn shutdown(mut self) -> Result<(), PresentationError> {
        if let Some(join_handle) = self.join_handle.take() {
            self.handle.shutdown();
            join_handle
                .join()
                .map_err(|_| PresentationError::Panicked(self.handle.window()))?;
        }
        Ok(())
    }
}

impl Drop for PresentationLoop {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.handle.shutdown();
            let _ = join_handle.join();
        }
    }
}

fn run_presentation_loop(
    mut engine: PresentationEngine,
    events: Receiver<PresentationEvent>,
    clock: SharedClock,
) {
    let window = engine.window_id();
    let mut shutdown_requested: Option<Instant> = None;
    info!(%window, "presentation loop started");

    loop {
        let now = clock.now_micros();
        engine.poll_timers(now);
        if shutdown_requested.is_some() && engine.is_ended() {
            break;
        }

        let mut timeout = engine
            .next_deadline()
            .map(|deadline| Duration::from_micros(deadline.saturating_sub(now)));
        if let Some(requested) = shutdown_requested {
            let remaining = SHUTDOWN_GRACE.saturating_sub(requested.elapsed());
            if remaining.is_zero() {
                engine.force_end();
                break;
            }
            timeout = Some(timeout.map_or(remaining, |wait| wait.min(remaining)));
        }

        let event = match timeout {
            Some(wait) => match events.recv_timeout(wait) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        if matches!(event, PresentationEvent::Command(EngineCommand::Shutdown)) {
            debug!(%window, "presentation shutdown requested");
            shutdown_requested.get_or_insert_with(Instant::now);
        }
        engine.handle_event(event, clock.now_micros());
    }

    info!(%window, "presentation loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::constraints::Extent;
    use crate::device::{
        default_swapchain_config, AcquireTicket, DeviceError, PresentMode, PresentReport,
        PresentStatus, PresentTicket, PresentedFrame, Surface, SurfaceInfo, SwapchainConfig,
        SwapchainImage,
    };
    use crate::frame::FrameUnit;
    use crate::RenderQueueId;

    struct InstantDevice {
        next: u32,
    }

    impl SwapchainDevice for InstantDevice {
        fn surface_info(&mut self, _surface: &Surface) -> Result<SurfaceInfo, DeviceError> {
            Ok(SurfaceInfo {
                current_extent: Extent::new(320, 200),
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
                fence_time: 100,
                timestamp_time: 50,
            });
        }

        fn release_image(&mut self, _image: SwapchainImage) {}

        fn destroy_swapchain(&mut self, _generation: u64) {}
    }

    struct SubmittingWindow;

    impl PresentationWindow for SubmittingWindow {
        fn make_surface(&mut self) -> Result<Surface, DeviceError> {
            Ok(Surface { id: 9 })
        }

        fn select_swapchain_config(&self, info: &SurfaceInfo, fast: bool) -> SwapchainConfig {
            default_swapchain_config(info, fast)
        }

        fn acquire_frame_data(&mut self, frame: FrameUnit) {
            let _ = frame.submit();
        }

        fn handle_frame_presented(&mut self, _presented: &PresentedFrame) {}
    }

    #[test]
    fn loop_presents_and_shuts_down() {
        let presentation = PresentationLoop::spawn(
            WindowId(3),
            EngineSettings::default(),
            Box::new(InstantDevice { next: 0 }),
            Box::new(SubmittingWindow),
            MonotonicClock::shared(),
        )
        .unwrap();
        let handle = presentation.handle();
        assert!(handle.run_with_queue(RenderQueueId(1)));
        assert!(handle.wait_until_frame_presentation(Duration::from_secs(5)));
        assert!(handle.stats().frames_presented >= 1);

        presentation.shutdown().unwrap();
        assert!(!handle.wait_until_frame_presentation(Duration::from_millis(50)));
    }
}
