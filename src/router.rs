//! Command routing
//!
//! Decides whether an utterance is a direct command, a control command for
//! the app itself, or dialogue for the model, and carries out direct
//! commands and model decisions through a [`Launcher`].

use enigo::{Enigo, Keyboard, Settings};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::UiSink;
use crate::gateway::{Action, Decision};
use crate::{Error, Result};

pub const BLOCKED_NOTICE: &str = "Comando bloqueado por segurança.";
pub const UNKNOWN_DIRECT_NOTICE: &str = "Comando direto não reconhecido.";
pub const UNKNOWN_ACTION_NOTICE: &str = "Ação não reconhecida.";
pub const NOTHING_TO_OPEN_NOTICE: &str = "Nada para abrir.";

pub const HELP_TEXT: &str = "Comandos: abrir <alvo>, pesquisar <consulta>, youtube <consulta>, \
digitar <texto>, limpar. Controle: /cancelar, /pausar, /retomar, /sair, /ajuda. \
Qualquer outra frase vai para o modelo.";

/// True when `text` contains none of the blocked fragments
pub fn is_safe_command(text: &str, blocked: &[String]) -> bool {
    let lower = text.to_lowercase();
    !blocked
        .iter()
        .filter(|b| !b.is_empty())
        .any(|b| lower.contains(&b.to_lowercase()))
}

/// Apply aliases (e.g., "bloco de nota" -> "notepad"). Text without any alias
/// keeps its case.
pub fn normalize_aliases(text: &str, aliases: &HashMap<String, String>) -> String {
    let lower = text.to_lowercase();
    if !aliases.keys().any(|from| !from.is_empty() && lower.contains(&from.to_lowercase())) {
        return text.to_string();
    }
    let mut result = lower;
    for (from, to) in aliases {
        if !from.is_empty() {
            result = result.replace(&from.to_lowercase(), to);
        }
    }
    result
}

/// Normalize text for command phrase matching.
/// Collapses spaces and turns number words into digits.
pub fn normalize_for_matching(s: &str) -> String {
    s.to_lowercase()
        .split_whitespace()
        .map(|word| match word {
            "zero" => "0",
            "um" | "uma" => "1",
            "dois" | "duas" => "2",
            "três" | "tres" => "3",
            "quatro" => "4",
            "cinco" => "5",
            "seis" => "6",
            "sete" => "7",
            "oito" => "8",
            "nove" => "9",
            "dez" => "10",
            _ => word,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Expand `$VAR` and `${VAR}` (e.g. "$TERMINAL" -> "kitty"). Unset
/// variables expand to nothing; values are not expanded again.
pub fn expand_env_vars(s: &str) -> String {
    shellexpand::env_with_context_no_errors(s, |name| Some(std::env::var(name).unwrap_or_default())).into_owned()
}

pub fn search_url(query: &str) -> String {
    format!("https://www.google.com/search?q={}", urlencoding::encode(query))
}

pub fn youtube_url(query: &str) -> String {
    format!("https://www.youtube.com/results?search_query={}", urlencoding::encode(query))
}

/// Commands carried out by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectCommand {
    Open(String),
    Search(String),
    Youtube(String),
    Type(String),
    Clear,
    /// A `[commands]` entry
    Custom { phrase: String, command: String },
}

/// Commands aimed at the app itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Cancel,
    Suspend,
    Resume,
    Quit,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A command that hit the safety filter
    Blocked,
    Control(ControlCommand),
    Command(DirectCommand),
    /// `/something` that is not a known command
    Unknown(String),
    Dialogue(String),
}

fn parse_control(cmd: &str) -> Option<ControlCommand> {
    match cmd.to_lowercase().as_str() {
        "cancelar" | "parar" => Some(ControlCommand::Cancel),
        "pausar" => Some(ControlCommand::Suspend),
        "retomar" => Some(ControlCommand::Resume),
        "sair" => Some(ControlCommand::Quit),
        "ajuda" | "help" => Some(ControlCommand::Help),
        _ => None,
    }
}

/// Parse `verb argument`. Speech often ends with punctuation, which is
/// dropped from the argument.
fn parse_direct(text: &str) -> Option<DirectCommand> {
    let text = text.trim();
    let (verb, rest) = match text.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (text, ""),
    };
    let verb = verb
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase();
    let arg = rest.trim_end_matches(['.', '!', '?', ',', ';']).trim().to_string();

    match verb.as_str() {
        "abrir" | "abra" => Some(DirectCommand::Open(arg)),
        "pesquisar" | "pesquise" => Some(DirectCommand::Search(arg)),
        "youtube" => Some(DirectCommand::Youtube(arg)),
        "digitar" | "digite" => Some(DirectCommand::Type(arg)),
        "limpar" if arg.is_empty() => Some(DirectCommand::Clear),
        _ => None,
    }
}

fn match_custom(text: &str, commands: &HashMap<String, String>) -> Option<DirectCommand> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let wanted = normalize_for_matching(&cleaned);
    commands.iter().find_map(|(phrase, command)| {
        (normalize_for_matching(phrase) == wanted).then(|| DirectCommand::Custom {
            phrase: phrase.clone(),
            command: command.clone(),
        })
    })
}

/// Decide where `text` goes. A leading `/` marks a typed command; without it
/// the first word can still be a command verb, and whole-phrase custom
/// commands are tried after alias normalization.
pub fn classify(text: &str, config: &Config) -> Route {
    let text = text.trim();

    if let Some(cmd) = text.strip_prefix('/') {
        let cmd = cmd.trim();
        if let Some(control) = parse_control(cmd) {
            return Route::Control(control);
        }
        if !is_safe_command(cmd, &config.blocked) {
            return Route::Blocked;
        }
        return match parse_direct(cmd).or_else(|| match_custom(cmd, &config.commands)) {
            Some(command) => Route::Command(command),
            None => Route::Unknown(cmd.to_string()),
        };
    }

    let aliased = normalize_aliases(text, &config.aliases);
    match parse_direct(&aliased).or_else(|| match_custom(&aliased, &config.commands)) {
        Some(_) if !is_safe_command(&aliased, &config.blocked) => Route::Blocked,
        Some(command) => Route::Command(command),
        None => Route::Dialogue(text.to_string()),
    }
}

/// The outside world, as the router sees it
pub trait Launcher {
    /// Open an application, file or address by name
    fn open_target(&self, target: &str) -> Result<()>;
    fn open_url(&self, url: &str) -> Result<()>;
    /// Type text at the cursor
    fn type_text(&self, text: &str) -> Result<()>;
    fn run_shell(&self, command: &str) -> Result<()>;
}

/// Launcher backed by the platform opener, the shell and enigo
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl SystemLauncher {
    fn opener(target: &str) -> Command {
        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", ""]);
            cmd
        };
        #[cfg(target_os = "macos")]
        let mut cmd = Command::new("open");
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let mut cmd = Command::new("xdg-open");

        cmd.arg(target);
        cmd
    }

    /// Spawn on a short-lived thread and report early exits
    fn spawn_detached(mut command: Command, what: String) {
        std::thread::spawn(move || {
            let result = command.stdout(Stdio::null()).stderr(Stdio::null()).spawn();
            match result {
                Ok(mut child) => {
                    std::thread::sleep(Duration::from_millis(100));
                    match child.try_wait() {
                        Ok(Some(status)) if !status.success() => {
                            tracing::warn!(what = %what, %status, "launched command exited with failure");
                        }
                        Ok(_) => tracing::debug!(what = %what, "launched"),
                        Err(e) => tracing::warn!(what = %what, error = %e, "error checking launched command"),
                    }
                }
                Err(e) => tracing::error!(what = %what, error = %e, "failed to spawn"),
            }
        });
    }
}

impl Launcher for SystemLauncher {
    fn open_target(&self, target: &str) -> Result<()> {
        let looks_like_path = target.contains('/') || target.contains('\\') || target.contains(':');
        if cfg!(any(target_os = "windows", target_os = "macos")) || looks_like_path {
            Self::spawn_detached(Self::opener(target), target.to_string());
            return Ok(());
        }
        // a bare name on Linux is most likely a program on PATH
        self.run_shell(target)
    }

    fn open_url(&self, url: &str) -> Result<()> {
        Self::spawn_detached(Self::opener(url), url.to_string());
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<()> {
        let mut enigo = Enigo::new(&Settings::default()).map_err(|e| Error::Launch(format!("enigo init: {e}")))?;
        enigo.text(text).map_err(|e| Error::Launch(format!("typing failed: {e}")))
    }

    fn run_shell(&self, command: &str) -> Result<()> {
        let expanded = expand_env_vars(command);
        if expanded.trim().is_empty() {
            return Err(Error::Launch(format!(
                "command expanded to an empty string (check env vars): {command}"
            )));
        }

        #[cfg(target_os = "windows")]
        let cmd = {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", &expanded]);
            cmd
        };

        #[cfg(not(target_os = "windows"))]
        let cmd = {
            let parts: Vec<&str> = expanded.split_whitespace().collect();
            if parts.len() == 1 && !expanded.contains(['|', '&', ';', '>', '<', '$', '`', '(', ')']) {
                Command::new(expanded.trim())
            } else {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", &expanded]);
                cmd
            }
        };

        tracing::info!(command = %expanded, "executing");
        Self::spawn_detached(cmd, expanded);
        Ok(())
    }
}

/// Carries out direct commands and model decisions
pub struct CommandRouter<L: Launcher> {
    launcher: L,
}

impl<L: Launcher> CommandRouter<L> {
    pub fn new(launcher: L) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn execute(&self, command: &DirectCommand, ui: &mut dyn UiSink) {
        tracing::info!(?command, "direct command");
        let result = match command {
            DirectCommand::Open(target) => self.open(target, ui),
            DirectCommand::Search(query) => self.search(query, ui),
            DirectCommand::Youtube(query) => self.youtube(query, ui),
            DirectCommand::Type(text) => self.type_text(text, ui),
            DirectCommand::Clear => {
                ui.clear();
                Ok(())
            }
            DirectCommand::Custom { phrase, command } => self.launcher.run_shell(command).map(|()| {
                ui.notice(&format!("Executando: {phrase}"));
            }),
        };
        self.report(result, ui);
    }

    /// Carry out what the model decided. Blocked fragments anywhere in the
    /// decision stop it.
    pub fn execute_decision(&self, decision: &Decision, blocked: &[String], ui: &mut dyn UiSink) {
        tracing::info!(?decision, "model decision");
        if decision.action != Action::Chat {
            let fields = [&decision.target, &decision.query, &decision.text];
            let combined: Vec<&str> = fields.iter().filter_map(|f| f.as_deref()).collect();
            if !is_safe_command(&combined.join(" "), blocked) {
                ui.notice(BLOCKED_NOTICE);
                return;
            }
        }

        let field = |f: &Option<String>| f.clone().unwrap_or_default();
        let result = match decision.action {
            Action::Chat => {
                ui.notice(&field(&decision.response));
                Ok(())
            }
            Action::Open => self.open(&field(&decision.target), ui),
            Action::Search => self.search(&field(&decision.query), ui),
            Action::Youtube => self.youtube(&field(&decision.query), ui),
            Action::Type => self.type_text(&field(&decision.text), ui),
            Action::Clear => {
                ui.clear();
                Ok(())
            }
            Action::Unknown => {
                ui.notice(UNKNOWN_ACTION_NOTICE);
                Ok(())
            }
        };
        self.report(result, ui);
    }

    fn report(&self, result: Result<()>, ui: &mut dyn UiSink) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "command failed");
            ui.notice(&format!("Não consegui executar o comando: {e}"));
        }
    }

    fn open(&self, target: &str, ui: &mut dyn UiSink) -> Result<()> {
        let target = target.trim();
        if target.is_empty() {
            ui.notice(NOTHING_TO_OPEN_NOTICE);
            return Ok(());
        }
        self.launcher.open_target(target)?;
        ui.notice(&format!("Abrindo: {target}"));
        Ok(())
    }

    fn search(&self, query: &str, ui: &mut dyn UiSink) -> Result<()> {
        self.launcher.open_url(&search_url(query.trim()))?;
        ui.notice(&format!("Pesquisando no Google: {}", query.trim()));
        Ok(())
    }

    fn youtube(&self, query: &str, ui: &mut dyn UiSink) -> Result<()> {
        self.launcher.open_url(&youtube_url(query.trim()))?;
        ui.notice(&format!("Pesquisando no YouTube: {}", query.trim()));
        Ok(())
    }

    fn type_text(&self, text: &str, ui: &mut dyn UiSink) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.launcher.type_text(text)?;
        ui.notice("Texto digitado.");
        Ok(())
    }
}
