//! Terminal input, read on a background thread and interleaved with ticks.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{self, KeyEvent, KeyEventKind};

#[derive(Debug, Clone)]
pub enum Event {
    /// Time to drain session events and redraw.
    Tick,
    /// A key press (releases and repeats are dropped).
    Key(KeyEvent),
}

pub struct EventHandler {
    receiver: mpsc::Receiver<Event>,
}

impl EventHandler {
    pub fn new(tick_rate: Duration) -> Self {
        let (sender, receiver) = mpsc::channel();

        thread::spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                let timeout = tick_rate.saturating_sub(last_tick.elapsed());
                if event::poll(timeout).unwrap_or(false) {
                    if let Ok(event::Event::Key(key)) = event::read() {
                        if key.kind == KeyEventKind::Press && sender.send(Event::Key(key)).is_err() {
                            return;
                        }
                    }
                }

                if last_tick.elapsed() >= tick_rate {
                    if sender.send(Event::Tick).is_err() {
                        return;
                    }
                    last_tick = Instant::now();
                }
            }
        });

        Self { receiver }
    }

    /// Block until the next event.
    pub fn next(&self) -> Result<Event> {
        Ok(self.receiver.recv()?)
    }
}
