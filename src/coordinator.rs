//! Lifecycle of the live dialogue turn
//!
//! Each `submit` bumps a generation counter and runs the network work on its
//! own worker thread. Workers never touch the UI: they post [`TurnEvent`]s,
//! which the UI thread feeds back through [`StreamingTaskCoordinator::apply`].
//! Events from any turn other than the live one are dropped there, so only
//! the newest generation ever reaches the sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::DialogueMode;
use crate::dispatch::UiSink;
use crate::endpoint::{Endpoint, EndpointState};
use crate::gateway::{apply_youtube_correction, Decision, DialogueBackend, StreamOutcome, TokenSink};

pub type TurnId = u64;

/// Notice shown when dialogue is requested while no endpoint is known
pub const UNAVAILABLE_NOTICE: &str = "Modelo de linguagem indisponível. Apenas comandos diretos funcionam agora.";

/// How a turn ended, as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `fallback` is set when the reply came from the one-shot path
    Completed { fallback: bool },
    Cancelled,
}

/// Posted by turn workers to the UI thread
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Tokens { turn: TurnId, text: String },
    Decision { turn: TurnId, decision: Decision },
    Finished { turn: TurnId, outcome: TurnOutcome },
}

impl TurnEvent {
    pub fn turn(&self) -> TurnId {
        match self {
            TurnEvent::Tokens { turn, .. } | TurnEvent::Decision { turn, .. } | TurnEvent::Finished { turn, .. } => *turn,
        }
    }
}

/// Where workers post their events
pub type TurnEvents = Arc<dyn Fn(TurnEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// No endpoint resolved; nothing was started
    Unavailable,
}

/// One request/response exchange, as carried by its worker
pub struct DialogueTurn {
    pub id: TurnId,
    pub input: String,
    cancel: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl DialogueTurn {
    /// Cancelled explicitly, or superseded by a newer generation
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire) || self.generation.load(Ordering::Acquire) != self.id
    }
}

struct LiveTurn {
    id: TurnId,
    cancel: Arc<AtomicBool>,
    output: String,
    thinking: bool,
}

/// Owns the single live turn
pub struct StreamingTaskCoordinator<B: DialogueBackend> {
    backend: Arc<B>,
    endpoint: Arc<EndpointState>,
    generation: Arc<AtomicU64>,
    live: Option<LiveTurn>,
    events: TurnEvents,
}

impl<B: DialogueBackend> StreamingTaskCoordinator<B> {
    pub fn new(backend: Arc<B>, endpoint: Arc<EndpointState>, events: TurnEvents) -> Self {
        Self {
            backend,
            endpoint,
            generation: Arc::new(AtomicU64::new(0)),
            live: None,
            events,
        }
    }

    pub fn live_turn(&self) -> Option<TurnId> {
        self.live.as_ref().map(|t| t.id)
    }

    pub fn generation(&self) -> TurnId {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a turn for `input`. Cancels the live turn first. Rejected
    /// synchronously, with a notice and without a worker, when no endpoint
    /// is available.
    pub fn submit(&mut self, input: &str, mode: DialogueMode, ui: &mut dyn UiSink) -> Result<TurnId, SubmitError> {
        let Some(endpoint) = self.endpoint.current() else {
            tracing::info!("dialogue requested while the model is unavailable");
            ui.notice(UNAVAILABLE_NOTICE);
            return Err(SubmitError::Unavailable);
        };

        self.cancel(ui);

        let id = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = Arc::new(AtomicBool::new(false));
        let turn = DialogueTurn {
            id,
            input: input.to_string(),
            cancel: cancel.clone(),
            generation: self.generation.clone(),
        };

        self.live = Some(LiveTurn {
            id,
            cancel,
            output: String::new(),
            thinking: true,
        });
        ui.on_turn_start(id, mode);
        ui.thinking(true);

        let backend = self.backend.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(format!("turn-{id}"))
            .spawn(move || run_turn(backend.as_ref(), &endpoint, &turn, mode, &events));

        if let Err(e) = spawned {
            tracing::error!(turn = id, error = %e, "could not spawn turn worker");
            // no worker will ever finish this turn
            (self.events)(TurnEvent::Tokens {
                turn: id,
                text: crate::gateway::FALLBACK_REPLY.to_string(),
            });
            (self.events)(TurnEvent::Finished {
                turn: id,
                outcome: TurnOutcome::Completed { fallback: true },
            });
        }

        tracing::debug!(turn = id, ?mode, "turn started");
        Ok(id)
    }

    /// Cancel the live turn, if any. The terminal notice is emitted here;
    /// whatever its worker posts afterwards is dropped by [`apply`].
    ///
    /// [`apply`]: Self::apply
    pub fn cancel(&mut self, ui: &mut dyn UiSink) -> bool {
        let Some(live) = self.live.take() else {
            return false;
        };
        live.cancel.store(true, Ordering::Release);
        if live.thinking {
            ui.thinking(false);
        }
        tracing::info!(turn = live.id, delivered = live.output.len(), "turn cancelled");
        ui.on_turn_end(live.id, &TurnOutcome::Cancelled);
        true
    }

    /// Apply a worker event on the UI thread. Returns the decision of an
    /// action-mode turn for the caller to route.
    pub fn apply(&mut self, event: TurnEvent, ui: &mut dyn UiSink) -> Option<Decision> {
        let Some(live) = self.live.as_mut().filter(|live| live.id == event.turn()) else {
            tracing::trace!(turn = event.turn(), "dropping event from a stale turn");
            return None;
        };

        match event {
            TurnEvent::Tokens { turn, text } => {
                if live.thinking {
                    live.thinking = false;
                    ui.thinking(false);
                }
                live.output.push_str(&text);
                ui.on_tokens(turn, &text);
                None
            }
            TurnEvent::Decision { decision, .. } => {
                if live.thinking {
                    live.thinking = false;
                    ui.thinking(false);
                }
                Some(decision)
            }
            TurnEvent::Finished { turn, outcome } => {
                if live.thinking {
                    ui.thinking(false);
                }
                tracing::debug!(turn, ?outcome, chars = live.output.chars().count(), "turn finished");
                self.live = None;
                ui.on_turn_end(turn, &outcome);
                None
            }
        }
    }
}

/// Forwards tokens of one turn to the UI thread
struct ForwardingSink<'a> {
    turn: &'a DialogueTurn,
    events: &'a TurnEvents,
    delivered: usize,
}

impl TokenSink for ForwardingSink<'_> {
    fn is_cancelled(&self) -> bool {
        self.turn.is_cancelled()
    }

    fn deliver(&mut self, token: &str) {
        self.delivered += 1;
        (self.events)(TurnEvent::Tokens {
            turn: self.turn.id,
            text: token.to_string(),
        });
    }
}

fn run_turn<B: DialogueBackend + ?Sized>(
    backend: &B,
    endpoint: &Endpoint,
    turn: &DialogueTurn,
    mode: DialogueMode,
    events: &TurnEvents,
) {
    let finish = |outcome| events(TurnEvent::Finished { turn: turn.id, outcome });

    match mode {
        DialogueMode::Stream => {
            let mut sink = ForwardingSink {
                turn,
                events,
                delivered: 0,
            };
            match backend.stream(endpoint, &turn.input, &mut sink) {
                StreamOutcome::Completed => finish(TurnOutcome::Completed { fallback: false }),
                StreamOutcome::Cancelled => finish(TurnOutcome::Cancelled),
                StreamOutcome::TransportError(e) => {
                    tracing::warn!(turn = turn.id, delivered = sink.delivered, error = %e, "stream failed, falling back to one-shot");
                    if turn.is_cancelled() {
                        finish(TurnOutcome::Cancelled);
                        return;
                    }
                    let text = backend.complete(endpoint, &turn.input);
                    if turn.is_cancelled() {
                        finish(TurnOutcome::Cancelled);
                        return;
                    }
                    events(TurnEvent::Tokens { turn: turn.id, text });
                    finish(TurnOutcome::Completed { fallback: true });
                }
            }
        }
        DialogueMode::Actions => {
            let decision = apply_youtube_correction(&turn.input, backend.decide(endpoint, &turn.input));
            if turn.is_cancelled() {
                finish(TurnOutcome::Cancelled);
                return;
            }
            tracing::debug!(turn = turn.id, ?decision, "model decided");
            events(TurnEvent::Decision { turn: turn.id, decision });
            finish(TurnOutcome::Completed { fallback: false });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{RecordingSink, UiCall};
    use crate::gateway::Action;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Streams `fragments` (each tagged with the input), pausing between
    /// them; optionally fails after `fail_after` fragments.
    struct Scripted {
        fragments: Vec<&'static str>,
        pause: Duration,
        fail_after: Option<usize>,
        streams: AtomicUsize,
        completes: AtomicUsize,
        cancelled_streams: AtomicUsize,
    }

    impl Scripted {
        fn new(fragments: Vec<&'static str>, pause: Duration) -> Self {
            Self {
                fragments,
                pause,
                fail_after: None,
                streams: AtomicUsize::new(0),
                completes: AtomicUsize::new(0),
                cancelled_streams: AtomicUsize::new(0),
            }
        }
    }

    impl DialogueBackend for Scripted {
        fn complete(&self, _endpoint: &Endpoint, input: &str) -> String {
            self.completes.fetch_add(1, Ordering::SeqCst);
            format!("[completo:{input}]")
        }

        fn stream(&self, _endpoint: &Endpoint, input: &str, sink: &mut dyn TokenSink) -> StreamOutcome {
            self.streams.fetch_add(1, Ordering::SeqCst);
            for (i, fragment) in self.fragments.iter().enumerate() {
                if self.fail_after == Some(i) {
                    return StreamOutcome::TransportError("connection reset".to_string());
                }
                thread::sleep(self.pause);
                if sink.is_cancelled() {
                    self.cancelled_streams.fetch_add(1, Ordering::SeqCst);
                    return StreamOutcome::Cancelled;
                }
                sink.deliver(&format!("{input}:{fragment} "));
            }
            StreamOutcome::Completed
        }

        fn decide(&self, _endpoint: &Endpoint, input: &str) -> Decision {
            Decision::chat(&format!("resposta para {input}"))
        }
    }

    fn setup(backend: Scripted, available: bool) -> (StreamingTaskCoordinator<Scripted>, Arc<Scripted>, Receiver<TurnEvent>) {
        let endpoint = Arc::new(EndpointState::new());
        if available {
            endpoint.publish(Some(Endpoint::new("http://localhost:11434", "/api/chat")));
        }
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let events: TurnEvents = Arc::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        });
        let backend = Arc::new(backend);
        (StreamingTaskCoordinator::new(backend.clone(), endpoint, events), backend, rx)
    }

    /// Pump events into the coordinator until no turn is live
    fn drive(coordinator: &mut StreamingTaskCoordinator<Scripted>, rx: &Receiver<TurnEvent>, ui: &mut RecordingSink) -> Vec<Decision> {
        let mut decisions = Vec::new();
        while coordinator.live_turn().is_some() {
            let event = rx.recv_timeout(Duration::from_secs(5)).expect("turn never finished");
            decisions.extend(coordinator.apply(event, ui));
        }
        decisions
    }

    #[test]
    fn completed_stream_reaches_sink_in_order() {
        let (mut coordinator, _backend, rx) = setup(Scripted::new(vec!["a", "b", "c"], Duration::ZERO), true);
        let mut ui = RecordingSink::default();

        let turn = coordinator.submit("oi", DialogueMode::Stream, &mut ui).unwrap();
        drive(&mut coordinator, &rx, &mut ui);

        assert_eq!(ui.text_of(turn), "oi:a oi:b oi:c ");
        assert_eq!(ui.outcome_of(turn), Some(TurnOutcome::Completed { fallback: false }));
        assert_eq!(ui.calls.first(), Some(&UiCall::TurnStart(turn)));
    }

    #[test]
    fn only_the_last_of_rapid_submits_reaches_the_sink() {
        let (mut coordinator, backend, rx) = setup(
            Scripted::new(vec!["1", "2", "3", "4"], Duration::from_millis(20)),
            true,
        );
        let mut ui = RecordingSink::default();

        let turns: Vec<TurnId> = (0..5)
            .map(|n| coordinator.submit(&format!("t{n}"), DialogueMode::Stream, &mut ui).unwrap())
            .collect();
        let last = *turns.last().unwrap();
        drive(&mut coordinator, &rx, &mut ui);

        for &turn in &turns[..4] {
            assert_eq!(ui.text_of(turn), "");
            assert_eq!(ui.outcome_of(turn), Some(TurnOutcome::Cancelled));
        }
        assert_eq!(ui.text_of(last), "t4:1 t4:2 t4:3 t4:4 ");
        assert_eq!(ui.outcome_of(last), Some(TurnOutcome::Completed { fallback: false }));
        assert_eq!(ui.turn_ends(), 5);

        // stale workers stop at their next fragment
        thread::sleep(Duration::from_millis(100));
        assert_eq!(backend.cancelled_streams.load(Ordering::SeqCst), 4);
        while let Ok(event) = rx.try_recv() {
            assert!(coordinator.apply(event, &mut ui).is_none());
        }
        assert_eq!(ui.turn_ends(), 5);
    }

    #[test]
    fn transport_error_falls_back_once_without_duplicates() {
        let mut backend = Scripted::new(vec!["1", "2", "3", "4", "5", "6", "7"], Duration::ZERO);
        backend.fail_after = Some(5);
        let (mut coordinator, backend, rx) = setup(backend, true);
        let mut ui = RecordingSink::default();

        let turn = coordinator.submit("x", DialogueMode::Stream, &mut ui).unwrap();
        drive(&mut coordinator, &rx, &mut ui);

        assert_eq!(
            ui.tokens_of(turn),
            vec!["x:1 ", "x:2 ", "x:3 ", "x:4 ", "x:5 ", "[completo:x]"]
        );
        assert_eq!(ui.outcome_of(turn), Some(TurnOutcome::Completed { fallback: true }));
        assert_eq!(backend.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_keeps_partial_output_and_ends_once() {
        let (mut coordinator, _backend, rx) = setup(
            Scripted::new(vec!["1", "2", "3", "4", "5", "6"], Duration::from_millis(30)),
            true,
        );
        let mut ui = RecordingSink::default();

        let turn = coordinator.submit("longo", DialogueMode::Stream, &mut ui).unwrap();
        while ui.tokens_of(turn).len() < 2 {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            coordinator.apply(event, &mut ui);
        }
        assert!(coordinator.cancel(&mut ui));
        assert!(!coordinator.cancel(&mut ui));

        let partial = ui.text_of(turn);
        assert!(partial.starts_with("longo:1 longo:2 "));

        thread::sleep(Duration::from_millis(100));
        while let Ok(event) = rx.try_recv() {
            coordinator.apply(event, &mut ui);
        }
        assert_eq!(ui.text_of(turn), partial);
        assert_eq!(ui.outcome_of(turn), Some(TurnOutcome::Cancelled));
        assert_eq!(ui.turn_ends(), 1);
    }

    #[test]
    fn unavailable_endpoint_rejects_synchronously() {
        let (mut coordinator, backend, rx) = setup(Scripted::new(vec!["a"], Duration::ZERO), false);
        let mut ui = RecordingSink::default();

        assert_eq!(
            coordinator.submit("oi", DialogueMode::Stream, &mut ui),
            Err(SubmitError::Unavailable)
        );
        assert_eq!(ui.notices(), vec![UNAVAILABLE_NOTICE.to_string()]);
        assert!(coordinator.live_turn().is_none());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(backend.streams.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.generation(), 0);
    }

    #[test]
    fn action_mode_hands_back_a_decision() {
        let (mut coordinator, _backend, rx) = setup(Scripted::new(vec![], Duration::ZERO), true);
        let mut ui = RecordingSink::default();

        coordinator.submit("toca lofi no youtube", DialogueMode::Actions, &mut ui).unwrap();
        let decisions = drive(&mut coordinator, &rx, &mut ui);

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::Youtube);
        assert_eq!(decisions[0].query.as_deref(), Some("toca lofi"));
    }

    #[test]
    fn superseded_turn_is_cancelled_by_generation() {
        let generation = Arc::new(AtomicU64::new(3));
        let turn = DialogueTurn {
            id: 3,
            input: String::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            generation: generation.clone(),
        };
        assert!(!turn.is_cancelled());
        generation.store(4, Ordering::SeqCst);
        assert!(turn.is_cancelled());
    }
}
