//! The UI thread
//!
//! [`App`] owns every piece of UI-side state: the capture job handle, the
//! coordinator with its live turn, the router and the suspended flag. It
//! only changes in response to queued [`AppEvent`]s, one tick at a time.

use std::sync::Arc;
use std::time::Duration;

use crate::audio::FrameSource;
use crate::capture::{CaptureEvent, CaptureJob, CaptureJobConfig, CaptureSettings, CaptureState};
use crate::config::SharedConfig;
use crate::coordinator::{StreamingTaskCoordinator, TurnEvents};
use crate::dispatch::{AppEvent, Dispatcher, EventQueue, UiSink};
use crate::endpoint::{Availability, Endpoint, EndpointResolver, EndpointState};
use crate::gateway::DialogueBackend;
use crate::hotkey::HotkeyAction;
use crate::router::{
    classify, CommandRouter, ControlCommand, Launcher, Route, BLOCKED_NOTICE, HELP_TEXT, UNKNOWN_DIRECT_NOTICE,
};
use crate::transcribe::{ModelHandle, ModelStatus};
use crate::Result;

pub const DISCARDED_NOTICE: &str = "Gravação descartada.";

pub const GREETING: &str = "Jarvis online. Digite um comando ou mensagem.";

/// Opens the frame source for one capture session: `(device, frame_ms)`.
/// Called on the capture worker.
pub type SourceOpener = Arc<dyn Fn(&str, u64) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Whether the UI loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct App<B: DialogueBackend, L: Launcher> {
    config: SharedConfig,
    dispatcher: Dispatcher,
    endpoint: Arc<EndpointState>,
    coordinator: StreamingTaskCoordinator<B>,
    router: CommandRouter<L>,
    model: ModelHandle,
    opener: Option<SourceOpener>,
    capture: Option<CaptureJob>,
    capture_state: CaptureState,
    next_capture: u64,
    suspended: bool,
    resolving: bool,
}

impl<B: DialogueBackend, L: Launcher> App<B, L> {
    /// `opener` is `None` in text-only mode
    pub fn new(
        config: SharedConfig,
        dispatcher: Dispatcher,
        backend: B,
        launcher: L,
        model: ModelHandle,
        opener: Option<SourceOpener>,
    ) -> Self {
        let endpoint = Arc::new(EndpointState::new());
        let turn_dispatcher = dispatcher.clone();
        let events: TurnEvents = Arc::new(move |event| turn_dispatcher.post(AppEvent::Turn(event)));
        Self {
            config,
            dispatcher,
            coordinator: StreamingTaskCoordinator::new(Arc::new(backend), endpoint.clone(), events),
            endpoint,
            router: CommandRouter::new(launcher),
            model,
            opener,
            capture: None,
            capture_state: CaptureState::Idle,
            next_capture: 0,
            suspended: false,
            resolving: false,
        }
    }

    pub fn endpoint(&self) -> &Arc<EndpointState> {
        &self.endpoint
    }

    pub fn coordinator(&self) -> &StreamingTaskCoordinator<B> {
        &self.coordinator
    }

    pub fn router(&self) -> &CommandRouter<L> {
        &self.router
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture_state
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving
    }

    /// Greet and kick off the first endpoint resolution
    pub fn start(&mut self, ui: &mut dyn UiSink) {
        ui.notice(GREETING);
        self.spawn_resolve();
    }

    /// Drain the queue once per tick until told to quit
    pub fn run(&mut self, queue: &EventQueue, ui: &mut dyn UiSink, tick: Duration) {
        loop {
            for event in queue.drain(tick) {
                if self.handle(event, ui) == Flow::Quit {
                    self.shutdown(ui);
                    return;
                }
            }
        }
    }

    pub fn handle(&mut self, event: AppEvent, ui: &mut dyn UiSink) -> Flow {
        match event {
            AppEvent::Hotkey(HotkeyAction::Capture) => self.toggle_capture(ui),
            AppEvent::Hotkey(HotkeyAction::Cancel) => self.cancel(ui),
            AppEvent::Text(line) => return self.submit_text(&line, ui),
            AppEvent::Capture { session, event } => return self.on_capture_event(session, event, ui),
            AppEvent::Turn(event) => {
                if let Some(decision) = self.coordinator.apply(event, ui) {
                    let blocked = self.config.load().blocked.clone();
                    self.router.execute_decision(&decision, &blocked, ui);
                }
            }
            AppEvent::EndpointResolved(endpoint) => self.on_resolved(endpoint, ui),
            AppEvent::ModelLoaded(Ok(())) => {
                let hotkey = self.config.load().hotkey.clone();
                ui.notice(&format!("Reconhecimento de voz pronto. Pressione {hotkey} para falar."));
            }
            AppEvent::ModelLoaded(Err(e)) => {
                ui.notice(&format!("Falha ao carregar o modelo de voz: {e}"));
            }
            AppEvent::InputClosed => {
                // without a keyboard or a microphone nothing can reach us anymore
                if self.opener.is_none() {
                    return Flow::Quit;
                }
                tracing::info!("stdin closed, voice only from now on");
            }
        }
        Flow::Continue
    }

    /// A typed line
    pub fn submit_text(&mut self, line: &str, ui: &mut dyn UiSink) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }
        ui.user(line);
        self.route(line, ui)
    }

    fn route(&mut self, text: &str, ui: &mut dyn UiSink) -> Flow {
        let config = self.config.load_full();
        match classify(text, &config) {
            Route::Blocked => {
                tracing::warn!(text, "blocked command");
                ui.notice(BLOCKED_NOTICE);
            }
            Route::Control(control) => return self.control(control, ui),
            Route::Command(command) => {
                // a command supersedes whatever the model was saying
                self.coordinator.cancel(ui);
                self.router.execute(&command, ui);
            }
            Route::Unknown(cmd) => {
                tracing::debug!(cmd, "unknown direct command");
                ui.notice(UNKNOWN_DIRECT_NOTICE);
            }
            Route::Dialogue(text) => {
                if self.coordinator.submit(&text, config.llm.mode, ui).is_err() && !self.resolving && !self.suspended {
                    // maybe the service came up since the last probe
                    self.spawn_resolve();
                }
            }
        }
        Flow::Continue
    }

    fn control(&mut self, control: ControlCommand, ui: &mut dyn UiSink) -> Flow {
        match control {
            ControlCommand::Cancel => self.cancel(ui),
            ControlCommand::Suspend => self.suspend(ui),
            ControlCommand::Resume => self.resume(ui),
            ControlCommand::Help => ui.notice(HELP_TEXT),
            ControlCommand::Quit => {
                ui.notice("Até logo.");
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    /// Cancel the live turn and any capture in progress
    pub fn cancel(&mut self, ui: &mut dyn UiSink) {
        let turn = self.coordinator.cancel(ui);
        let capture = self.abort_capture(ui);
        if !turn && !capture {
            ui.notice("Nada para cancelar.");
        }
    }

    /// Enter the suspended state: capture stops and hotkey captures are
    /// ignored until [`resume`](Self::resume)
    pub fn suspend(&mut self, ui: &mut dyn UiSink) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        self.abort_capture(ui);
        tracing::info!("suspended");
        ui.notice("Pausado. Use /retomar para continuar.");
    }

    /// Leave the suspended state and re-check the model service
    pub fn resume(&mut self, ui: &mut dyn UiSink) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        tracing::info!("resumed");
        ui.notice("Retomado.");
        self.spawn_resolve();
    }

    pub fn shutdown(&mut self, ui: &mut dyn UiSink) {
        tracing::info!(turns = self.coordinator.generation(), "shutting down");
        self.coordinator.cancel(ui);
        if let Some(job) = self.capture.take() {
            job.abort();
        }
    }

    /// Probe the endpoint candidates on a worker; the result comes back as
    /// [`AppEvent::EndpointResolved`]
    pub fn spawn_resolve(&mut self) {
        if self.resolving {
            return;
        }
        self.resolving = true;
        let llm = self.config.load().llm.clone();
        let dispatcher = self.dispatcher.clone();
        std::thread::spawn(move || {
            let endpoint = match EndpointResolver::from_config(&llm) {
                Ok(resolver) => resolver.resolve(),
                Err(e) => {
                    tracing::error!(error = %e, "could not build the probe client");
                    None
                }
            };
            dispatcher.post(AppEvent::EndpointResolved(endpoint));
        });
    }

    fn on_resolved(&mut self, endpoint: Option<Endpoint>, ui: &mut dyn UiSink) {
        self.resolving = false;
        let url = endpoint.as_ref().map(|e| e.chat_url());
        match (self.endpoint.publish(endpoint), url) {
            (Availability::BecameAvailable, Some(url)) => {
                ui.notice(&format!("Modelo de linguagem conectado ({url})."));
            }
            (Availability::Moved, Some(url)) => {
                ui.notice(&format!("Modelo de linguagem agora em {url}."));
            }
            (Availability::BecameUnavailable, _) => {
                ui.notice("Modelo de linguagem indisponível. Modo somente comandos.");
            }
            _ => {}
        }
    }

    fn toggle_capture(&mut self, ui: &mut dyn UiSink) {
        if self.suspended {
            tracing::debug!("capture hotkey ignored while suspended");
            return;
        }
        if self.abort_capture(ui) {
            return;
        }
        let Some(opener) = self.opener.clone() else {
            ui.notice("Captura de voz desativada neste modo.");
            return;
        };
        let Some(transcriber) = self.model.ready() else {
            match self.model.status() {
                ModelStatus::Failed => ui.notice("Modelo de voz indisponível."),
                _ => ui.notice("Modelo de voz ainda carregando, aguarde."),
            }
            return;
        };

        let config = self.config.load();
        let job = CaptureJobConfig {
            settings: CaptureSettings::from(&config.capture),
            transcriber,
            language: config.language.clone(),
            timeout: config.processing_timeout(),
        };
        let device = config.device.clone();
        let frame_ms = config.capture.frame_ms;

        self.next_capture += 1;
        let id = self.next_capture;
        let dispatcher = self.dispatcher.clone();
        tracing::info!(session = id, "capture started");
        self.capture = Some(CaptureJob::spawn(
            id,
            move || opener(&device, frame_ms),
            job,
            move |event| dispatcher.post(AppEvent::Capture { session: id, event }),
        ));
    }

    /// Tear down the running capture, if any. Its buffer is discarded and
    /// the discard is the session's one terminal notice.
    fn abort_capture(&mut self, ui: &mut dyn UiSink) -> bool {
        let Some(job) = self.capture.take() else {
            return false;
        };
        job.abort();
        tracing::info!(session = job.id(), state = %self.capture_state, "capture aborted");
        self.set_capture_state(CaptureState::Idle, ui);
        ui.notice(DISCARDED_NOTICE);
        true
    }

    fn set_capture_state(&mut self, state: CaptureState, ui: &mut dyn UiSink) {
        if self.capture_state != state {
            self.capture_state = state;
            ui.on_capture_state_changed(state);
        }
    }

    fn on_capture_event(&mut self, session: u64, event: CaptureEvent, ui: &mut dyn UiSink) -> Flow {
        if self.capture.as_ref().map(|job| job.id()) != Some(session) {
            tracing::trace!(session, "dropping event from a superseded capture");
            return Flow::Continue;
        }
        match event {
            CaptureEvent::State(state) => {
                self.set_capture_state(state, ui);
                if state == CaptureState::Idle {
                    self.capture = None;
                }
            }
            CaptureEvent::Rejected(rejected) => ui.notice(&rejected.to_string()),
            CaptureEvent::TranscriptionFailed { timed_out: true } => {
                ui.notice("A transcrição demorou demais e foi abandonada.");
            }
            CaptureEvent::TranscriptionFailed { timed_out: false } => ui.notice("Não consegui transcrever o áudio."),
            CaptureEvent::DeviceFailed(e) => ui.notice(&format!("Microfone indisponível: {e}")),
            CaptureEvent::Transcribed(text) => {
                ui.user(&text);
                return self.route(&text, ui);
            }
        }
        Flow::Continue
    }
}
