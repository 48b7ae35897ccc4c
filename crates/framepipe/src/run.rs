use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::bounded;
use pipeconfig::{PipelineConfig, ResolvedWindow};
use pipeline::{
    AppHandle, AppTask, AppThread, DirectorHandle, DirectorWindow, QueueCompiler, ResourceCache,
    TemporaryFlags,
};
use scheduler::{
    EngineSettings, Extent, FrameConstraints, MonotonicClock, PresentationLoop, SharedClock,
    WindowId,
};
use tracing_subscriber::EnvFilter;

use crate::cli::RunArgs;
use crate::paths::AppPaths;
use crate::report::{RunReport, WindowReport};
use crate::sim::{
    SimCompiler, SimDevice, SimDisplayLink, SimResourceCompiler, SimScene, SimTiming,
};

const DEFAULT_FRAMES: u64 = 120;
const STALL_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const COMPILE_DELAY: Duration = Duration::from_millis(1);
const RESOURCE_TIMEOUT: Duration = Duration::from_secs(2);
/// Display refresh for windows that follow the display link without a cap.
const DEFAULT_REFRESH: Duration = Duration::from_micros(16_666);

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads `explicit`, or the default config file when it exists, or the
/// built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<(PipelineConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = AppPaths::discover()?.config_file();
            if !default.exists() {
                tracing::debug!(path = %default.display(), "no config file, using defaults");
                return Ok((PipelineConfig::default(), None));
            }
            default
        }
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = PipelineConfig::from_toml_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok((config, Some(path)))
}

/// Configured windows first, then `window-N` until `requested` is reached.
pub fn window_names(config: &PipelineConfig, requested: Option<usize>) -> Vec<String> {
    let mut names: Vec<String> = config.window_names().map(str::to_string).collect();
    if names.is_empty() {
        names.push("main".to_string());
    }
    if let Some(count) = requested {
        let count = count.max(1);
        names.truncate(count);
        while names.len() < count {
            names.push(format!("window-{}", names.len()));
        }
    }
    names
}

fn resolve_windows(config: &PipelineConfig, args: &RunArgs) -> Result<Vec<ResolvedWindow>> {
    let frame_interval = args
        .fps
        .map(pipeconfig::frame_interval)
        .transpose()
        .context("invalid --fps")?;
    Ok(window_names(config, args.windows)
        .iter()
        .map(|name| {
            let mut window = config.resolve_window(name);
            if let Some(interval) = frame_interval {
                window.frame_interval = interval;
            }
            if let Some(render_on_demand) = args.render_on_demand {
                window.render_on_demand = render_on_demand;
            }
            window.follow_display_link |= args.display_link;
            window.pre_start_frame |= args.pre_start;
            window
        })
        .collect())
}

struct Session {
    id: WindowId,
    window: ResolvedWindow,
    extent: Arc<Mutex<Extent>>,
    presentation: PresentationLoop,
    display_link: Option<SimDisplayLink>,
}

impl Session {
    fn presented(&self) -> u64 {
        self.presentation.handle().stats().frames_presented
    }

    fn recreations(&self) -> u64 {
        self.presentation.handle().stats().swapchain_recreations
    }

    fn resize(&self, width: u32, height: u32) {
        let extent = Extent::new(width, height);
        match self.extent.lock() {
            Ok(mut current) => *current = extent,
            Err(poisoned) => *poisoned.into_inner() = extent,
        }
        let mut constraints = FrameConstraints::from_window(&self.window);
        constraints.extent = extent;
        tracing::info!(window = %self.window.name, width, height, "resizing window");
        self.presentation.handle().set_frame_constraints(constraints);
    }
}

pub fn run(args: RunArgs) -> Result<()> {
    let (config, source) = load_config(args.config.as_deref())?;
    let windows = resolve_windows(&config, &args)?;
    tracing::debug!(
        config = ?source,
        windows = windows.len(),
        update_interval = ?config.app.update_interval,
        max_delta = ?config.app.max_delta,
        "resolved pipeline configuration"
    );

    let clock = MonotonicClock::shared();
    let mut app = AppThread::start(config.app.clone(), clock.clone(), |ctx| {
        let compiler = SimResourceCompiler::spawn()?;
        ctx.add_extension(Box::new(ResourceCache::new(Arc::new(compiler))));
        Ok(())
    })
    .context("failed to start logic thread")?;
    let compiler: Arc<dyn QueueCompiler> = Arc::new(SimCompiler::spawn(COMPILE_DELAY)?);

    let started = Instant::now();
    let mut sessions = Vec::with_capacity(windows.len());
    for (index, window) in windows.into_iter().enumerate() {
        let session = open_window(
            &app.handle(),
            index,
            window,
            &args,
            clock.clone(),
            compiler.clone(),
        )?;
        sessions.push(session);
    }

    let driven = drive(&sessions, &args, started);
    let report = collect_report(&app.handle(), &sessions, &args, started);
    close_windows(&app.handle(), sessions)?;
    app.stop().context("logic thread did not stop cleanly")?;
    driven?;
    let report = report?;

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn open_window(
    app: &AppHandle,
    index: usize,
    window: ResolvedWindow,
    args: &RunArgs,
    clock: SharedClock,
    compiler: Arc<dyn QueueCompiler>,
) -> Result<Session> {
    let id = WindowId(index as u64 + 1);
    let extent = Arc::new(Mutex::new(Extent::new(window.width, window.height)));
    let director_slot: Arc<OnceLock<DirectorHandle>> = Arc::new(OnceLock::new());
    let device = SimDevice::new(
        extent.clone(),
        director_slot.clone(),
        SimTiming {
            latency: args.latency,
            jitter: args.jitter,
        },
        args.seed.wrapping_add(index as u64),
    )?;
    let presentation = PresentationLoop::spawn(
        id,
        EngineSettings::from_window(&window),
        Box::new(device),
        Box::new(DirectorWindow::new(id, app.task_sender())),
        clock,
    )
    .with_context(|| format!("failed to start presentation for '{}'", window.name))?;

    let handle = presentation.handle();
    let constraints = FrameConstraints::from_window(&window);
    let name = window.name.clone();
    tracing::info!(
        window = %name,
        %id,
        width = window.width,
        height = window.height,
        "opening window"
    );
    app.perform(AppTask::new("open-window", move |ctx| {
        ctx.retain_exit_guard();
        let director = ctx.handle_window_created(id, handle, constraints, compiler);
        director.run_scene(Box::new(SimScene::new(format!("{name}/quad"))));
        let _ = director_slot.set(director.handle());

        if let Some(cache) = ctx.resource_cache_mut() {
            let resource = format!("{name}/atlas");
            cache.add_temporary(resource.clone(), RESOURCE_TIMEOUT, TemporaryFlags::default());
            let label = resource.clone();
            cache.load(&resource, move |loaded| {
                tracing::debug!(resource = %label, loaded, "window resource ready");
            });
        }
    }));

    let display_link = if window.follow_display_link {
        let refresh = FrameConstraints::from_window(&window)
            .frame_interval_duration()
            .unwrap_or(DEFAULT_REFRESH);
        Some(SimDisplayLink::spawn(presentation.handle(), refresh)?)
    } else {
        None
    };

    Ok(Session {
        id,
        window,
        extent,
        presentation,
        display_link,
    })
}

fn drive(sessions: &[Session], args: &RunArgs, started: Instant) -> Result<()> {
    let frames = match (args.frames, args.duration) {
        (None, None) => Some(DEFAULT_FRAMES),
        (frames, _) => frames,
    };
    // Swapchain generation count of the first window when it was resized.
    let mut resized_from: Option<u64> = None;

    loop {
        if args.duration.is_some_and(|limit| started.elapsed() >= limit) {
            return Ok(());
        }
        let pending = sessions.iter().enumerate().find_map(|(index, session)| {
            let below_target = frames.map_or(true, |target| session.presented() < target);
            let awaiting_resize =
                index == 0 && resized_from.is_some_and(|before| session.recreations() <= before);
            (below_target || awaiting_resize).then_some(session)
        });
        let Some(session) = pending else {
            return Ok(());
        };

        let wait = args
            .duration
            .map_or(STALL_TIMEOUT, |limit| {
                limit.saturating_sub(started.elapsed()).min(STALL_TIMEOUT)
            });
        if !session.presentation.handle().wait_until_frame_presentation(wait) {
            if args.duration.is_some_and(|limit| started.elapsed() >= limit) {
                return Ok(());
            }
            bail!(
                "window '{}' stopped presenting after {} frame(s)",
                session.window.name,
                session.presented()
            );
        }

        if let (Some(at), Some(first)) = (args.resize_at, sessions.first()) {
            if resized_from.is_none() && first.presented() >= at {
                let (width, height) = args.resize_to;
                resized_from = Some(first.recreations());
                first.resize(width, height);
            }
        }
    }
}

fn collect_report(
    app: &AppHandle,
    sessions: &[Session],
    args: &RunArgs,
    started: Instant,
) -> Result<RunReport> {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let targets: Vec<(WindowId, String)> = sessions
        .iter()
        .map(|session| (session.id, session.window.name.clone()))
        .collect();
    let (tx, rx) = bounded(1);
    app.perform(AppTask::new("collect-stats", move |ctx| {
        let windows: Vec<WindowReport> = targets
            .iter()
            .filter_map(|(id, name)| {
                ctx.director(*id)
                    .map(|director| WindowReport::from_director(name, director))
            })
            .collect();
        let _ = tx.send(windows);
    }));
    let windows = rx
        .recv_timeout(REPLY_TIMEOUT)
        .map_err(|_| anyhow!("logic thread did not report statistics"))?;
    Ok(RunReport {
        elapsed_ms,
        seed: args.seed,
        windows,
    })
}

fn close_windows(app: &AppHandle, sessions: Vec<Session>) -> Result<()> {
    let ids: Vec<WindowId> = sessions.iter().map(|session| session.id).collect();
    let (tx, rx) = bounded(1);
    app.perform(AppTask::new("close-windows", move |ctx| {
        for id in ids {
            if ctx.handle_window_destroyed(id) {
                ctx.release_exit_guard();
            }
        }
        let _ = tx.send(());
    }));
    if rx.recv_timeout(REPLY_TIMEOUT).is_err() {
        tracing::warn!("logic thread did not acknowledge window teardown");
    }

    for session in sessions {
        let name = session.window.name.clone();
        drop(session.display_link);
        session
            .presentation
            .shutdown()
            .with_context(|| format!("presentation for '{name}' did not stop cleanly"))?;
    }
    Ok(())
}
