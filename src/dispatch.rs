//! Event queue into the UI thread, and the UI sink it drives
//!
//! Background threads (hotkey listener, stdin reader, capture and turn
//! workers, endpoint probes, model loader) only ever `post` here. The UI loop
//! drains the queue once per tick and is the only caller of [`UiSink`].

use chrono::Local;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::capture::{CaptureEvent, CaptureState};
use crate::config::DialogueMode;
use crate::coordinator::{TurnEvent, TurnId, TurnOutcome};
use crate::endpoint::Endpoint;
use crate::hotkey::HotkeyAction;

/// Everything that can happen to the UI thread
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Hotkey(HotkeyAction),
    /// A typed line
    Text(String),
    Capture { session: u64, event: CaptureEvent },
    Turn(TurnEvent),
    EndpointResolved(Option<Endpoint>),
    ModelLoaded(Result<(), String>),
    /// Stdin closed
    InputClosed,
}

/// Cloneable posting handle
#[derive(Clone)]
pub struct Dispatcher {
    tx: Sender<AppEvent>,
}

impl Dispatcher {
    pub fn post(&self, event: AppEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event posted after the UI loop exited");
        }
    }
}

/// Receiving side, owned by the UI loop
pub struct EventQueue {
    rx: Receiver<AppEvent>,
}

impl EventQueue {
    /// Wait up to `tick` for the first event, then take everything queued
    /// behind it
    pub fn drain(&self, tick: Duration) -> Vec<AppEvent> {
        let mut events = Vec::new();
        match self.rx.recv_timeout(tick) {
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return events,
        }
        events.extend(self.rx.try_iter());
        events
    }
}

pub fn channel() -> (Dispatcher, EventQueue) {
    let (tx, rx) = mpsc::channel();
    (Dispatcher { tx }, EventQueue { rx })
}

/// Presentation calls made by the pipeline. Only ever called on the UI
/// thread.
pub trait UiSink {
    /// A turn began. Only streamed turns have a reply line to open; an
    /// action turn answers through `notice`.
    fn on_turn_start(&mut self, turn: TurnId, mode: DialogueMode);
    fn on_tokens(&mut self, turn: TurnId, text: &str);
    fn on_turn_end(&mut self, turn: TurnId, outcome: &TurnOutcome);
    fn on_capture_state_changed(&mut self, state: CaptureState);
    fn thinking(&mut self, on: bool);
    /// An assistant line
    fn notice(&mut self, text: &str);
    /// Echo of what the user said or typed
    fn user(&mut self, text: &str);
    fn clear(&mut self);
}

const ASSISTANT: &str = "Jarvis >";
const USER: &str = "Você >";
const THINKING: &str = "...";

/// Terminal transcript
pub struct ConsoleSink<W: Write> {
    out: W,
    timestamps: bool,
    /// A streamed reply is open on the current line
    mid_line: bool,
    thinking: bool,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W, timestamps: bool) -> Self {
        Self {
            out,
            timestamps,
            mid_line: false,
            thinking: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn prefix(&self, who: &str) -> String {
        if self.timestamps {
            format!("[{}] {who} ", Local::now().format("%H:%M:%S"))
        } else {
            format!("{who} ")
        }
    }

    fn close_line(&mut self) {
        if self.mid_line {
            self.mid_line = false;
            self.write("\n");
        }
    }

    fn line(&mut self, who: &str, text: &str) {
        self.close_line();
        let line = format!("{}{text}\n", self.prefix(who));
        self.write(&line);
    }

    fn write(&mut self, text: &str) {
        // a closed stdout is not worth crashing over
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }
}

impl<W: Write> UiSink for ConsoleSink<W> {
    fn on_turn_start(&mut self, _turn: TurnId, mode: DialogueMode) {
        self.close_line();
        if mode == DialogueMode::Actions {
            return;
        }
        let prefix = self.prefix(ASSISTANT);
        self.write(&prefix);
        self.mid_line = true;
    }

    fn on_tokens(&mut self, _turn: TurnId, text: &str) {
        self.write(text);
    }

    fn on_turn_end(&mut self, _turn: TurnId, outcome: &TurnOutcome) {
        match outcome {
            TurnOutcome::Completed { .. } => self.close_line(),
            TurnOutcome::Cancelled => {
                if self.mid_line {
                    self.write(" [cancelado]");
                    self.close_line();
                } else {
                    self.line(ASSISTANT, "Cancelado.");
                }
            }
        }
    }

    fn on_capture_state_changed(&mut self, state: CaptureState) {
        match state {
            CaptureState::Recording => self.line(ASSISTANT, "Ouvindo..."),
            CaptureState::Finalizing => self.line(ASSISTANT, "Processando áudio..."),
            CaptureState::Idle | CaptureState::Rejected | CaptureState::Ready => {}
        }
    }

    fn thinking(&mut self, on: bool) {
        if on == self.thinking || !self.mid_line {
            self.thinking = on && self.mid_line;
            return;
        }
        self.thinking = on;
        if on {
            self.write(THINKING);
        } else {
            // erase the indicator in place
            let back = "\u{8}".repeat(THINKING.len());
            self.write(&format!("{back}{}{back}", " ".repeat(THINKING.len())));
        }
    }

    fn notice(&mut self, text: &str) {
        self.line(ASSISTANT, text);
    }

    fn user(&mut self, text: &str) {
        self.line(USER, text);
    }

    fn clear(&mut self) {
        self.mid_line = false;
        self.thinking = false;
        // ANSI clear screen + home
        self.write("\x1b[2J\x1b[H");
    }
}

/// One call into a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum UiCall {
    TurnStart(TurnId),
    Tokens(TurnId, String),
    TurnEnd(TurnId, TurnOutcome),
    Capture(CaptureState),
    Thinking(bool),
    Notice(String),
    User(String),
    Clear,
}

/// Sink that remembers every call, for tests and headless runs
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<UiCall>,
}

impl RecordingSink {
    pub fn tokens_of(&self, turn: TurnId) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                UiCall::Tokens(t, text) if *t == turn => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn text_of(&self, turn: TurnId) -> String {
        self.tokens_of(turn).concat()
    }

    pub fn outcome_of(&self, turn: TurnId) -> Option<TurnOutcome> {
        self.calls.iter().find_map(|call| match call {
            UiCall::TurnEnd(t, outcome) if *t == turn => Some(*outcome),
            _ => None,
        })
    }

    pub fn turn_ends(&self) -> usize {
        self.calls.iter().filter(|c| matches!(c, UiCall::TurnEnd(..))).count()
    }

    pub fn notices(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                UiCall::Notice(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn capture_states(&self) -> Vec<CaptureState> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                UiCall::Capture(state) => Some(*state),
                _ => None,
            })
            .collect()
    }
}

impl UiSink for RecordingSink {
    fn on_turn_start(&mut self, turn: TurnId, _mode: DialogueMode) {
        self.calls.push(UiCall::TurnStart(turn));
    }

    fn on_tokens(&mut self, turn: TurnId, text: &str) {
        self.calls.push(UiCall::Tokens(turn, text.to_string()));
    }

    fn on_turn_end(&mut self, turn: TurnId, outcome: &TurnOutcome) {
        self.calls.push(UiCall::TurnEnd(turn, *outcome));
    }

    fn on_capture_state_changed(&mut self, state: CaptureState) {
        self.calls.push(UiCall::Capture(state));
    }

    fn thinking(&mut self, on: bool) {
        self.calls.push(UiCall::Thinking(on));
    }

    fn notice(&mut self, text: &str) {
        self.calls.push(UiCall::Notice(text.to_string()));
    }

    fn user(&mut self, text: &str) {
        self.calls.push(UiCall::User(text.to_string()));
    }

    fn clear(&mut self) {
        self.calls.push(UiCall::Clear);
    }
}
