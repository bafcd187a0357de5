//! Witness provisioning TUI.
//!
//! Runs a provisioning session in the background and shows the operator
//! what to do next, the state machine, milestones and the log.

mod app;
mod event;
mod ui;

use std::fs::OpenOptions;
use std::io;
use std::panic;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::{
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use app::App;
use event::{Event, EventHandler};

const LOG_FILE: &str = "witness-tui.log";
const TICK_RATE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("witness.toml"));

    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_terminal();
        original_hook(panic_info);
    }));

    // the terminal belongs to the UI, so tracing goes to a file
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
        .with_context(|| format!("Failed to open {LOG_FILE}"))?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let terminal = setup_terminal()?;
    let result = run_app(terminal, App::new(config_path));
    restore_terminal()?;
    result
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen)?;
    Ok(())
}

fn run_app(mut terminal: Terminal<CrosstermBackend<io::Stdout>>, mut app: App) -> Result<()> {
    let events = EventHandler::new(TICK_RATE);

    while !app.should_quit {
        terminal.draw(|frame| ui::draw(frame, &app))?;

        match events.next()? {
            Event::Tick => app.on_tick(),
            Event::Key(key) => app.on_key(key),
        }
    }

    app.shutdown();
    Ok(())
}
