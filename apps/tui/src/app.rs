//! Application state and input handling.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use tokio_util::sync::CancellationToken;
use witness_core::bundle::FirmwareSet;
use witness_core::config::ProvisionConfig;
use witness_core::events::{LogLevel, Persona, ProvisionEvent, ProvisionObserver};
use witness_core::log::LogStateTracker;
use witness_core::provision::{ProvisionReport, ProvisionSession, ProvisionState, UsbBackend};
use witness_core::verify::VerifierSet;

type Prepared = (ProvisionConfig, FirmwareSet, VerifierSet, LogStateTracker);

const MAX_LOG_ENTRIES: usize = 1000;
const MAX_PENDING_EVENTS: usize = 500;

/// Rows of the options panel; the last one is the start button.
pub const OPTION_ROWS: usize = 4;
pub const START_ROW: usize = OPTION_ROWS - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Main,
    Logs,
    Help,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Milestone {
    pub name: String,
    pub passed: bool,
}

/// How the last run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Provisioned { serial: String, identity: String, fused: bool },
    Failed,
    Cancelled,
}

/// Queues session events until the next tick.
pub struct TuiObserver {
    events: Mutex<VecDeque<ProvisionEvent>>,
}

impl TuiObserver {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    pub fn drain_events(&self) -> Vec<ProvisionEvent> {
        match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl ProvisionObserver for TuiObserver {
    fn on_event(&self, event: &ProvisionEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= MAX_PENDING_EVENTS {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
    }
}

pub struct App {
    pub should_quit: bool,
    pub current_tab: Tab,
    pub config_path: PathBuf,

    pub fuse: bool,
    pub wipe_applet_data: bool,
    pub override_safety: bool,
    pub selected: usize,

    pub state: ProvisionState,
    pub is_running: bool,
    pub progress: u8,
    pub operation: String,
    pub prompt: Option<String>,
    pub countdown: Option<(String, u64)>,
    pub device: Option<(Persona, String)>,
    pub milestones: Vec<Milestone>,
    pub warnings: usize,
    pub outcome: Option<Outcome>,

    pub logs: VecDeque<LogEntry>,
    pub log_scroll: usize,

    observer: Arc<TuiObserver>,
    cancel: Option<CancellationToken>,
    session_thread: Option<JoinHandle<Result<ProvisionReport>>>,
}

impl App {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            should_quit: false,
            current_tab: Tab::Main,
            config_path,
            fuse: false,
            wipe_applet_data: false,
            override_safety: false,
            selected: START_ROW,
            state: ProvisionState::Init,
            is_running: false,
            progress: 0,
            operation: String::new(),
            prompt: None,
            countdown: None,
            device: None,
            milestones: Vec::new(),
            warnings: 0,
            outcome: None,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            log_scroll: 0,
            observer: Arc::new(TuiObserver::new()),
            cancel: None,
            session_thread: None,
        }
    }

    pub fn on_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('q') | KeyCode::Char('c') if ctrl => {
                self.should_quit = true;
                return;
            }
            KeyCode::Esc => {
                if self.current_tab == Tab::Main {
                    self.should_quit = true;
                } else {
                    self.current_tab = Tab::Main;
                }
                return;
            }
            KeyCode::F(1) => {
                self.current_tab = Tab::Help;
                return;
            }
            KeyCode::F(2) => {
                self.current_tab = Tab::Logs;
                return;
            }
            _ => {}
        }

        match self.current_tab {
            Tab::Main => self.handle_main_key(key),
            Tab::Logs => self.handle_logs_key(key),
            Tab::Help => self.current_tab = Tab::Main,
        }
    }

    fn handle_main_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected = self.selected.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.selected = (self.selected + 1).min(START_ROW);
            }
            KeyCode::Enter | KeyCode::Char(' ') => self.activate_selected(),
            KeyCode::Char('x') => self.cancel_run(),
            _ => {}
        }
    }

    fn handle_logs_key(&mut self, key: KeyEvent) {
        let last = self.logs.len().saturating_sub(1);
        self.log_scroll = match key.code {
            KeyCode::Up | KeyCode::Char('k') => self.log_scroll.saturating_sub(1),
            KeyCode::Down | KeyCode::Char('j') => (self.log_scroll + 1).min(last),
            KeyCode::PageUp => self.log_scroll.saturating_sub(10),
            KeyCode::PageDown => (self.log_scroll + 10).min(last),
            KeyCode::Home => 0,
            KeyCode::End => last,
            _ => self.log_scroll,
        };
    }

    fn activate_selected(&mut self) {
        // options are frozen once a run starts
        if self.is_running {
            return;
        }
        match self.selected {
            0 => self.fuse = !self.fuse,
            1 => self.wipe_applet_data = !self.wipe_applet_data,
            2 => self.override_safety = !self.override_safety,
            _ => self.start(),
        }
    }

    /// Load the configuration with the chosen options and fetch the bundles.
    fn prepare(&self) -> Result<Prepared> {
        let mut config = ProvisionConfig::load_from_file(&self.config_path)?;
        config.options.fuse |= self.fuse;
        config.options.wipe_applet_data |= self.wipe_applet_data;
        config.options.override_safety |= self.override_safety;
        config.validate()?;
        let firmware = FirmwareSet::fetch(&config.bundle_fetcher()).context("Failed to fetch firmware bundles")?;
        let verifiers = config.verifier_set()?;
        let tracker = config.log_tracker()?;
        Ok((config, firmware, verifiers, tracker))
    }

    fn start(&mut self) {
        let (config, firmware, verifiers, tracker) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                self.add_log(LogLevel::Error, format!("{e:#}"));
                return;
            }
        };

        self.reset_run();
        self.is_running = true;
        self.add_log(
            LogLevel::Info,
            format!("Provisioning started (fuse: {})", if config.options.fuse { "yes" } else { "no" }),
        );

        let cancel = CancellationToken::new();
        let observer = self.observer.clone();
        let token = cancel.clone();
        self.session_thread = Some(thread::spawn(move || {
            let backend = UsbBackend::new(config.device.clone());
            ProvisionSession::with_observer(config, firmware, verifiers, tracker, backend, observer)
                .with_cancellation(token)
                .run()
        }));
        self.cancel = Some(cancel);
    }

    fn reset_run(&mut self) {
        self.state = ProvisionState::Init;
        self.progress = 0;
        self.operation.clear();
        self.prompt = None;
        self.countdown = None;
        self.device = None;
        self.milestones.clear();
        self.warnings = 0;
        self.outcome = None;
    }

    fn cancel_run(&mut self) {
        if let Some(cancel) = &self.cancel {
            if !cancel.is_cancelled() {
                cancel.cancel();
                self.add_log(LogLevel::Warn, "Cancelling run");
            }
        }
    }

    pub fn on_tick(&mut self) {
        for event in self.observer.drain_events() {
            self.process_event(event);
        }

        if self.session_thread.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = self.session_thread.take() {
                let result = handle.join();
                self.finish_run(result);
            }
        }
    }

    fn finish_run(&mut self, result: thread::Result<Result<ProvisionReport>>) {
        // the session's own events may still be queued
        for event in self.observer.drain_events() {
            self.process_event(event);
        }
        let cancelled = self.cancel.take().is_some_and(|c| c.is_cancelled());
        self.is_running = false;
        self.prompt = None;
        self.countdown = None;

        match result {
            Ok(Ok(report)) => {
                self.progress = 100;
                self.outcome = Some(Outcome::Provisioned {
                    serial: report.status.serial,
                    identity: report.status.identity,
                    fused: report.fused,
                });
                self.add_log(
                    LogLevel::Info,
                    format!("Run finished with {} warning(s)", report.warnings.len()),
                );
            }
            Ok(Err(e)) => {
                self.outcome = Some(if cancelled { Outcome::Cancelled } else { Outcome::Failed });
                self.add_log(LogLevel::Error, format!("{e:#}"));
            }
            Err(_) => {
                self.outcome = Some(Outcome::Failed);
                self.add_log(LogLevel::Error, "Provisioning thread panicked");
            }
        }
    }

    pub fn process_event(&mut self, event: ProvisionEvent) {
        match event {
            ProvisionEvent::PhaseChanged { to, .. } => {
                self.state = to;
                self.countdown = None;
                if to.is_terminal() {
                    self.prompt = None;
                }
                self.add_log(LogLevel::Info, format!("State: {to}"));
            }
            ProvisionEvent::Prompt { message } => {
                self.add_log(LogLevel::Info, format!("Operator: {message}"));
                self.prompt = Some(message);
            }
            ProvisionEvent::Countdown { action, remaining_secs } => {
                self.countdown = (remaining_secs > 0).then_some((action, remaining_secs));
            }
            ProvisionEvent::DeviceDetected { persona, path } => {
                self.add_log(LogLevel::Info, format!("Detected {persona} device at {path}"));
                self.device = Some((persona, path));
            }
            ProvisionEvent::Milestone { name, passed } => {
                let level = if passed { LogLevel::Info } else { LogLevel::Error };
                self.add_log(level, format!("{} {name}", if passed { "PASS" } else { "FAIL" }));
                self.milestones.push(Milestone { name, passed });
            }
            ProvisionEvent::Warning { message } => {
                self.warnings += 1;
                self.add_log(LogLevel::Warn, message);
            }
            ProvisionEvent::Progress { operation, current, total } => {
                self.progress = if total > 0 { (current.min(total) * 100 / total) as u8 } else { 0 };
                self.operation = operation;
            }
            ProvisionEvent::Log { level, message } => self.add_log(level, message),
            ProvisionEvent::Complete { serial, identity } => {
                self.progress = 100;
                self.add_log(LogLevel::Info, format!("Device {serial} provisioned, identity {identity}"));
            }
        }
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            level,
            message: message.into(),
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        });
        self.log_scroll = self.logs.len().saturating_sub(1);
    }

    /// Cancel any running session and wait for it to stop.
    pub fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.session_thread.take() {
            let _ = handle.join();
        }
    }
}
