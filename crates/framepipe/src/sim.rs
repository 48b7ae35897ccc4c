//! Simulated GPU and compilers used by the headless runner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use pipeline::{
    CompileCallback, DirectorHandle, DrawStat, FrameScratch, QueueCallback, QueueCompiler,
    QueueRequest, ResourceCompiler, Scene, SceneError, UpdateTime,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scheduler::{
    AcquireTicket, ColorSpace, DeviceError, Extent, FrameConstraints, FrameUnit, PresentMode,
    PresentReport, PresentStatus, PresentTicket, PresentationHandle, RenderQueueId, Surface,
    SurfaceInfo, SwapchainConfig, SwapchainDevice, SwapchainImage,
};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send>;

/// Runs jobs in submission order, each no earlier than its due time.
struct Worker {
    jobs: Option<Sender<(Instant, Job)>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded::<(Instant, Job)>();
        let join_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(rx))
            .with_context(|| format!("failed to spawn {name} thread"))?;
        Ok(Self {
            jobs: Some(tx),
            join_handle: Some(join_handle),
        })
    }

    fn submit(&self, due: Instant, job: Job) {
        let Some(jobs) = self.jobs.as_ref() else {
            job();
            return;
        };
        if let Err(err) = jobs.send((due, job)) {
            let (_, job) = err.into_inner();
            job();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

fn run_worker(jobs: Receiver<(Instant, Job)>) {
    for (due, job) in jobs {
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        job();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimTiming {
    pub latency: Duration,
    pub jitter: Duration,
}

/// Swapchain device whose acquires and presents complete on a worker thread
/// after a seeded random latency.
pub struct SimDevice {
    extent: Arc<Mutex<Extent>>,
    director: Arc<OnceLock<DirectorHandle>>,
    timing: SimTiming,
    rng: StdRng,
    image_count: u32,
    next_image: u32,
    presented: u64,
    worker: Worker,
}

impl SimDevice {
    pub fn new(
        extent: Arc<Mutex<Extent>>,
        director: Arc<OnceLock<DirectorHandle>>,
        timing: SimTiming,
        seed: u64,
    ) -> Result<Self> {
        Ok(Self {
            extent,
            director,
            timing,
            rng: StdRng::seed_from_u64(seed),
            image_count: 0,
            next_image: 0,
            presented: 0,
            worker: Worker::spawn("sim-gpu")?,
        })
    }

    fn jitter(&mut self) -> Duration {
        let max = self.timing.jitter.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.rng.gen_range(0..=max))
    }

    fn current_extent(&self) -> Extent {
        match self.extent.lock() {
            Ok(extent) => *extent,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl SwapchainDevice for SimDevice {
    fn surface_info(&mut self, _surface: &Surface) -> Result<SurfaceInfo, DeviceError> {
        Ok(SurfaceInfo {
            current_extent: self.current_extent(),
            min_image_count: 2,
            max_image_count: 4,
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
            color_spaces: vec![ColorSpace::Srgb],
        })
    }

    fn create_swapchain(
        &mut self,
        surface: &Surface,
        config: &SwapchainConfig,
        generation: u64,
    ) -> Result<(), DeviceError> {
        if config.extent.is_empty() {
            return Err(DeviceError::SurfaceLost);
        }
        debug!(
            surface = surface.id,
            generation,
            images = config.image_count,
            "simulated swapchain created"
        );
        self.image_count = config.image_count.max(1);
        self.next_image = 0;
        Ok(())
    }

    fn acquire_image(&mut self, ticket: AcquireTicket) {
        let image = SwapchainImage {
            generation: ticket.generation(),
            index: self.next_image % self.image_count.max(1),
        };
        self.next_image = self.next_image.wrapping_add(1);
        let due = Instant::now() + self.jitter();
        self.worker
            .submit(due, Box::new(move || ticket.complete(Ok(image))));
    }

    fn present(&mut self, image: SwapchainImage, ticket: PresentTicket) {
        let latency = self.timing.latency + self.jitter();
        let fence_time = latency.as_micros() as u64;
        let report = PresentReport {
            status: PresentStatus::Ok,
            fence_time,
            timestamp_time: fence_time * 3 / 5,
        };
        trace!(order = ticket.order(), index = image.index, ?latency, "simulated present");
        self.worker
            .submit(Instant::now() + latency, Box::new(move || ticket.complete(report)));

        self.presented += 1;
        if let Some(director) = self.director.get() {
            let extent = self.current_extent();
            director.push_draw_stat(DrawStat {
                vertices: 4,
                triangles: 2,
                draw_calls: 1 + (self.presented % 3) as u32,
                cached_images: self.image_count,
                vertex_input_time: u64::from(extent.width / 64),
            });
        }
    }

    fn release_image(&mut self, image: SwapchainImage) {
        trace!(generation = image.generation, index = image.index, "image released");
    }

    fn destroy_swapchain(&mut self, generation: u64) {
        debug!(generation, "simulated swapchain destroyed");
    }
}

/// Compiles render queues on a worker thread after a fixed delay.
pub struct SimCompiler {
    delay: Duration,
    next_queue: AtomicU64,
    worker: Worker,
}

impl SimCompiler {
    pub fn spawn(delay: Duration) -> Result<Self> {
        Ok(Self {
            delay,
            next_queue: AtomicU64::new(1),
            worker: Worker::spawn("sim-compiler")?,
        })
    }
}

impl QueueCompiler for SimCompiler {
    fn compile_queue(&self, request: QueueRequest, done: QueueCallback) {
        let queue = RenderQueueId(self.next_queue.fetch_add(1, Ordering::Relaxed));
        debug!(
            scene = %request.name,
            window = %request.window,
            width = request.extent.width,
            height = request.extent.height,
            %queue,
            "compiling render queue"
        );
        let result = if request.extent.is_empty() {
            Err(SceneError::Compile {
                name: request.name,
                reason: "empty extent".into(),
            })
        } else {
            Ok(queue)
        };
        self.worker
            .submit(Instant::now() + self.delay, Box::new(move || done(result)));
    }
}

/// Resource compiler that fails every name starting with `missing`.
pub struct SimResourceCompiler {
    worker: Worker,
}

impl SimResourceCompiler {
    pub fn spawn() -> Result<Self> {
        Ok(Self {
            worker: Worker::spawn("sim-resources")?,
        })
    }
}

impl ResourceCompiler for SimResourceCompiler {
    fn compile(&self, name: &str, done: CompileCallback) {
        let success = !name.starts_with("missing");
        self.worker
            .submit(Instant::now(), Box::new(move || done(success)));
    }
}

/// Refresh signal for windows that follow the display link. Stops when
/// dropped or once the presentation thread is gone.
pub struct SimDisplayLink {
    stop: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SimDisplayLink {
    pub fn spawn(presentation: PresentationHandle, refresh: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(refresh);
        let join_handle = thread::Builder::new()
            .name(format!("sim-vsync-{}", presentation.window()))
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        if !presentation.signal_display_link() {
                            break;
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            })
            .context("failed to spawn display link thread")?;
        debug!(?refresh, "display link started");
        Ok(Self {
            stop: Some(stop_tx),
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for SimDisplayLink {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

/// A rotating quad that never stops animating.
pub struct SimScene {
    name: String,
    queue: Option<RenderQueueId>,
    extent: Extent,
    angle: f32,
    presented: bool,
}

impl SimScene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            extent: Extent::default(),
            angle: 0.0,
            presented: false,
        }
    }
}

impl Scene for SimScene {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_compiled(&mut self, queue: RenderQueueId) {
        self.queue = Some(queue);
    }

    fn queue(&self) -> Option<RenderQueueId> {
        self.queue
    }

    fn set_frame_constraints(&mut self, constraints: &FrameConstraints) {
        self.extent = constraints.logical_extent();
    }

    fn handle_presented(&mut self) {
        self.presented = true;
    }

    fn handle_finished(&mut self) {
        self.presented = false;
    }

    fn update(&mut self, time: &UpdateTime) {
        self.angle = (self.angle + time.dt * 90.0) % 360.0;
    }

    fn has_active_interactions(&self) -> bool {
        self.presented
    }

    fn render_request(
        &mut self,
        frame: &FrameUnit,
        scratch: &mut FrameScratch,
    ) -> Result<(), SceneError> {
        let extent = frame.constraints().logical_extent();
        if extent.is_empty() {
            return Err(SceneError::Render(format!(
                "frame {} has an empty extent",
                frame.order()
            )));
        }
        scratch.push_command("clear");
        scratch.push_command(format!(
            "quad {}x{} rot={:.1}",
            extent.width, extent.height, self.angle
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler::{EngineCommand, PresentationEvent, SharedStats, WindowId};

    #[test]
    fn worker_runs_jobs_in_order() {
        let worker = Worker::spawn("test-worker").unwrap();
        let (tx, rx) = unbounded();
        let start = Instant::now();
        for index in 0..4 {
            let tx = tx.clone();
            worker.submit(
                start + Duration::from_millis(2),
                Box::new(move || {
                    let _ = tx.send(index);
                }),
            );
        }
        let seen: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, [0, 1, 2, 3]);
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn compiler_hands_out_increasing_queues() {
        let compiler = SimCompiler::spawn(Duration::ZERO).unwrap();
        let (tx, rx) = bounded(2);
        for _ in 0..2 {
            let tx = tx.clone();
            compiler.compile_queue(
                QueueRequest {
                    name: "quad".into(),
                    window: WindowId(1),
                    extent: Extent::new(64, 64),
                    density: 1.0,
                },
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
        }
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(second > first);
    }

    #[test]
    fn empty_extent_fails_to_compile() {
        let compiler = SimCompiler::spawn(Duration::ZERO).unwrap();
        let (tx, rx) = bounded(1);
        compiler.compile_queue(
            QueueRequest {
                name: "quad".into(),
                window: WindowId(1),
                extent: Extent::new(0, 64),
                density: 1.0,
            },
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(SceneError::Compile { .. })));
    }

    #[test]
    fn jitter_is_reproducible_per_seed() {
        let timing = SimTiming {
            latency: Duration::from_millis(1),
            jitter: Duration::from_micros(500),
        };
        let extent = Arc::new(Mutex::new(Extent::new(64, 64)));
        let mut a = SimDevice::new(extent.clone(), Arc::default(), timing, 11).unwrap();
        let mut b = SimDevice::new(extent, Arc::default(), timing, 11).unwrap();
        let left: Vec<Duration> = (0..8).map(|_| a.jitter()).collect();
        let right: Vec<Duration> = (0..8).map(|_| b.jitter()).collect();
        assert_eq!(left, right);
        assert!(left.iter().all(|value| *value <= timing.jitter));
    }

    #[test]
    fn surface_follows_shared_extent() {
        let extent = Arc::new(Mutex::new(Extent::new(64, 64)));
        let timing = SimTiming {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        };
        let mut device = SimDevice::new(extent.clone(), Arc::default(), timing, 1).unwrap();
        let surface = Surface { id: 1 };
        assert_eq!(
            device.surface_info(&surface).unwrap().current_extent,
            Extent::new(64, 64)
        );
        *extent.lock().unwrap() = Extent::new(128, 32);
        assert_eq!(
            device.surface_info(&surface).unwrap().current_extent,
            Extent::new(128, 32)
        );
    }

    #[test]
    fn scene_animates_only_while_presented() {
        let mut scene = SimScene::new("quad");
        assert!(!scene.has_active_interactions());
        scene.handle_presented();
        assert!(scene.has_active_interactions());
        scene.update(&UpdateTime {
            global: 0,
            delta: 0,
            app: 0,
            dt: 1.0,
        });
        assert!((scene.angle - 90.0).abs() < f32::EPSILON);
        scene.handle_finished();
        assert!(!scene.has_active_interactions());
    }

    #[test]
    fn display_link_ticks_until_dropped() {
        let (tx, rx) = unbounded();
        let handle = PresentationHandle::new(
            WindowId(2),
            tx,
            Arc::new(SharedStats::default()),
            Arc::new(OnceLock::new()),
        );
        let link = SimDisplayLink::spawn(handle, Duration::from_millis(1)).unwrap();
        for _ in 0..3 {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(
                event,
                PresentationEvent::Command(EngineCommand::DisplayLink)
            ));
        }
        drop(link);
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
    }
}
