use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "framepipe",
    author,
    version,
    about = "Drives the frame pipeline against simulated swapchains",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline configuration file (TOML). Defaults to `framepipe.toml` in the config directory.
    #[arg(long, value_name = "FILE", env = "FRAMEPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stop once every window presented this many frames.
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u64>,

    /// Stop after this long (seconds or `500ms`, `2s`, ...).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Number of simulated windows; configured windows are used first.
    #[arg(long, value_name = "COUNT")]
    pub windows: Option<usize>,

    /// Override the target FPS of every window (0=uncapped).
    #[arg(long, value_name = "FPS", value_parser = parse_fps)]
    pub fps: Option<f32>,

    /// Override render-on-demand for every window.
    #[arg(long, value_name = "BOOL")]
    pub render_on_demand: Option<bool>,

    /// Seed for the simulated device latency jitter.
    #[arg(long, value_name = "SEED", default_value_t = 7)]
    pub seed: u64,

    /// Mean simulated present latency.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "2ms")]
    pub latency: Duration,

    /// Maximum random deviation added to every simulated latency.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "500us")]
    pub jitter: Duration,

    /// Resize the first window once it presented this many frames.
    #[arg(long, value_name = "FRAME")]
    pub resize_at: Option<u64>,

    /// Extent used by `--resize-at` (e.g. `1920x1080`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_extent, default_value = "1920x1080")]
    pub resize_to: (u32, u32),

    /// Hold rendered frames for a simulated display refresh signal.
    #[arg(long)]
    pub display_link: bool,

    /// Start the next frame as soon as the previous one is submitted.
    #[arg(long)]
    pub pre_start: bool,

    /// Print the final statistics as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect the pipeline configuration.
    Config(ConfigCommand),
}

#[derive(Parser, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the resolved configuration directory and file.
    Where,
    /// Validate a configuration file and print the resolved windows.
    Check {
        /// File to check; defaults to the resolved configuration file.
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_duration(value: &str) -> Result<Duration, String> {
    pipeconfig::parse_duration(value).map_err(|err| err.to_string())
}

pub fn parse_fps(value: &str) -> Result<f32, String> {
    let fps: f32 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid frame rate '{value}'"))?;
    pipeconfig::frame_interval(fps).map_err(|err| err.to_string())?;
    Ok(fps)
}

pub fn parse_extent(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid extent '{trimmed}'; expected WIDTHxHEIGHT"))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width in '{trimmed}'"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height in '{trimmed}'"))?;
    if width == 0 || height == 0 {
        return Err(format!("extent must be non-zero, got {width}x{height}"));
    }
    Ok((width, height))
}
