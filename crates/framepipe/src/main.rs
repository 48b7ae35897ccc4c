mod cli;
mod paths;
mod report;
mod run;
mod sim;

use std::path::PathBuf;

use anyhow::Result;
use cli::{Command, ConfigAction};
use paths::AppPaths;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Config(config_cmd)) => {
            handle_config_command(config_cmd.action, cli.run.config)
        }
        None => run::run(cli.run),
    }
}

fn handle_config_command(action: ConfigAction, explicit: Option<PathBuf>) -> Result<()> {
    match action {
        ConfigAction::Where => run_config_where(explicit),
        ConfigAction::Check { file } => run_config_check(file.or(explicit)),
    }
}

fn run_config_where(explicit: Option<PathBuf>) -> Result<()> {
    let paths = AppPaths::discover()?;
    println!("Configuration:");
    println!("  dir:        {}", paths.config_dir().display());
    println!("  file:       {}", paths.config_file().display());
    if let Some(path) = explicit {
        println!("  override:   {}", path.display());
    }
    Ok(())
}

fn run_config_check(file: Option<PathBuf>) -> Result<()> {
    let (config, source) = run::load_config(file.as_deref())?;
    match &source {
        Some(path) => println!("{}: ok", path.display()),
        None => println!("no config file found; built-in defaults apply"),
    }
    println!(
        "app: update_interval={:?} max_delta={:?}",
        config.app.update_interval, config.app.max_delta
    );
    for name in run::window_names(&config, None) {
        let window = config.resolve_window(&name);
        let fps = window
            .frame_interval
            .map(|interval| format!("{:.1}", 1.0 / interval.as_secs_f64()))
            .unwrap_or_else(|| "uncapped".to_string());
        println!(
            "  {:<12} {}x{} density={} fps={} on_demand={}",
            window.name,
            window.width,
            window.height,
            window.density,
            fps,
            window.render_on_demand
        );
    }
    Ok(())
}
