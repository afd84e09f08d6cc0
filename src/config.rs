//! Configuration loading, defaults and hot reload
//!
//! The config file is TOML. Every key has a default, so a partial file is
//! fine. Edits are picked up while running; a file that fails to parse keeps
//! the previous config in place.

use arc_swap::ArcSwap;
use notify::{recommended_watcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Config shared between the UI thread and the background threads.
pub type SharedConfig = Arc<ArcSwap<Config>>;

/// Persona used for streamed conversation.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Você é um assistente pessoal estilo J.A.R.V.I.S. \
Responda em português, de forma curta e direta.";

/// Persona used when the model has to pick an action.
pub const DEFAULT_ACTION_PROMPT: &str = r#"Você é um assistente pessoal estilo J.A.R.V.I.S.

Você pode responder de duas formas APENAS:
1) Conversa normal
2) Comando do sistema

Quando for um comando, responda EXCLUSIVAMENTE em JSON puro.
Sem markdown. Sem texto fora do JSON.

Formato:

{
  "action": "open | search | youtube | type | clear | chat",
  "target": "string opcional",
  "query": "string opcional",
  "text": "string opcional",
  "response": "string opcional"
}

Nunca invente ações fora da lista.
Nunca explique comandos."#;

/// Configuration for Jarvis
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub model_dir: String, // empty = search the usual places
    pub language: String,
    pub threads: usize,
    pub device: String,
    pub hotkey: String,
    pub cancel_hotkey: String, // empty = disabled
    pub processing_timeout_secs: u64, // 0 = no timeout
    pub quiet: bool,
    pub blocked: Vec<String>,
    pub llm: LlmConfig,
    pub capture: CaptureConfig,
    pub commands: HashMap<String, String>,
    pub aliases: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "small".to_string(),
            model_dir: String::new(),
            language: "pt".to_string(),
            threads: 4,
            device: String::new(),
            hotkey: "F12".to_string(),
            cancel_hotkey: "F11".to_string(),
            processing_timeout_secs: 30,
            quiet: false,
            blocked: ["format", "del ", "rm ", "shutdown", "reboot", "poweroff"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            llm: LlmConfig::default(),
            capture: CaptureConfig::default(),
            commands: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

/// How typed and spoken text that is not a direct command reaches the model.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DialogueMode {
    /// Stream a conversational reply token by token.
    #[default]
    Stream,
    /// Ask the model for a JSON action and hand it to the command router.
    Actions,
}

/// HTTP method used to probe an endpoint candidate.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    Get,
    Head,
    Post,
}

/// One health/status path to try on every candidate base address.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub method: ProbeMethod,
    pub path: String,
    /// Chat path to use when this probe succeeds (defaults to `llm.chat_path`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_path: Option<String>,
}

impl ProbeConfig {
    pub fn new(method: ProbeMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            chat_path: None,
        }
    }
}

/// Language model service settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub alternate_urls: Vec<String>,
    pub probes: Vec<ProbeConfig>,
    pub chat_path: String,
    pub model: String,
    pub temperature: f32,
    pub probe_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub mode: DialogueMode,
    pub system_prompt: String,
    pub action_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            alternate_urls: vec!["http://127.0.0.1:11434".to_string()],
            probes: vec![
                ProbeConfig::new(ProbeMethod::Get, "/api/tags"),
                ProbeConfig::new(ProbeMethod::Get, "/api/version"),
                ProbeConfig::new(ProbeMethod::Head, "/"),
            ],
            chat_path: "/api/chat".to_string(),
            model: "llama3.2:1b".to_string(),
            temperature: 0.7,
            probe_timeout_ms: 2000,
            request_timeout_secs: 60,
            mode: DialogueMode::Stream,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            action_prompt: DEFAULT_ACTION_PROMPT.to_string(),
        }
    }
}

impl LlmConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Voice capture thresholds
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub silence_ms: u64,
    pub min_duration_ms: u64,
    pub hard_cap_secs: u64,
    pub rms_threshold: f32,
    pub frame_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_ms: 1500,
            min_duration_ms: 500,
            hard_cap_secs: 30,
            rms_threshold: 0.01,
            frame_ms: 30,
        }
    }
}

impl Config {
    /// Load config from the first location that has one, creating a default
    /// file when none exists.
    pub fn load(explicit: Option<&Path>) -> (Self, Option<PathBuf>) {
        if let Some(path) = explicit {
            match Self::load_from(path) {
                Some(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    return (config, Some(path.to_path_buf()));
                }
                None => {
                    tracing::warn!(path = %path.display(), "config unusable, using defaults");
                    return (Self::default(), Some(path.to_path_buf()));
                }
            }
        }

        let config_paths = [
            dirs::config_dir().map(|p| p.join("jarvis").join("config.toml")),
            dirs::home_dir().map(|p| p.join(".jarvis").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in config_paths.into_iter().flatten() {
            if path.exists() {
                if let Some(config) = Self::load_from(&path) {
                    tracing::info!(path = %path.display(), "loaded config");
                    return (config, Some(path));
                }
            }
        }

        // No config found - create one at the default location
        if let Some(config_dir) = dirs::config_dir() {
            let jarvis_dir = config_dir.join("jarvis");
            let config_path = jarvis_dir.join("config.toml");

            if let Err(e) = fs::create_dir_all(&jarvis_dir) {
                tracing::warn!(error = %e, "failed to create config directory");
            } else if let Err(e) = fs::write(&config_path, Self::default_config_content()) {
                tracing::warn!(error = %e, "failed to write default config");
            } else {
                tracing::info!(path = %config_path.display(), "created default config");
                return (Self::default(), Some(config_path));
            }
        }

        tracing::info!("using default config");
        (Self::default(), None)
    }

    /// Read and validate a config file. Errors are logged and yield `None`.
    pub fn load_from(path: &Path) -> Option<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config read error");
                return None;
            }
        };
        match Self::parse(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config parse error");
                None
            }
        }
    }

    /// Parse config text and check the values that would break the pipeline.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if !(capture.rms_threshold > 0.0 && capture.rms_threshold < 1.0) {
            return Err(Error::Config(format!(
                "capture.rms_threshold must be between 0 and 1, got {}",
                capture.rms_threshold
            )));
        }
        if capture.frame_ms == 0 {
            return Err(Error::Config("capture.frame_ms must be positive".to_string()));
        }
        if capture.hard_cap_secs == 0 || capture.min_duration_ms > capture.hard_cap_secs.saturating_mul(1000) {
            return Err(Error::Config(
                "capture.hard_cap_secs must be positive and not shorter than min_duration_ms".to_string(),
            ));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(Error::Config("llm.base_url is empty".to_string()));
        }
        if self.llm.probes.is_empty() {
            return Err(Error::Config("llm.probes needs at least one entry".to_string()));
        }
        if !self.llm.chat_path.starts_with('/') {
            return Err(Error::Config(format!(
                "llm.chat_path must start with '/', got '{}'",
                self.llm.chat_path
            )));
        }
        Ok(())
    }

    pub fn default_config_content() -> &'static str {
        r##"# Jarvis Configuration
# Changes are hot-reloaded - no restart needed!

# Whisper model: tiny, base, small, medium, large
# Tip: Use "tiny" or "base" on older/weaker CPUs
model = "small"

# Directory holding ggml-<model>.bin (supports ~). Empty = auto
model_dir = ""

# Language hint for transcription (ISO 639-1)
language = "pt"

# Threads for whisper inference
threads = 4

# Audio device name (partial match). Empty = auto-detect
device = ""

# Hotkey that starts voice capture. Press again while recording to abort.
# Options: F1-F12, ScrollLock, Pause, PrintScreen, Insert, Home, End, PageUp, PageDown, Num0-Num9, Escape
hotkey = "F12"

# Hotkey that cancels the reply being streamed. Empty = disabled
cancel_hotkey = "F11"

# Transcription timeout in seconds (0 = no timeout)
processing_timeout_secs = 30

# Only log warnings and errors to stderr (RUST_LOG and -v take precedence)
quiet = false

# Utterances containing any of these are never executed
blocked = ["format", "del ", "rm ", "shutdown", "reboot", "poweroff"]

[llm]
base_url = "http://localhost:11434"
alternate_urls = ["http://127.0.0.1:11434"]
chat_path = "/api/chat"
model = "llama3.2:1b"
temperature = 0.7
probe_timeout_ms = 2000
request_timeout_secs = 60
# "stream" = conversational replies, "actions" = model picks an action as JSON
mode = "stream"

[[llm.probes]]
method = "GET"
path = "/api/tags"

[[llm.probes]]
method = "GET"
path = "/api/version"

[[llm.probes]]
method = "HEAD"
path = "/"

[capture]
# Silence that ends an utterance
silence_ms = 1500
# Shorter recordings are rejected
min_duration_ms = 500
# Recording is finalized after this no matter what
hard_cap_secs = 30
# RMS level that counts as speech (0-1)
rms_threshold = 0.01
frame_ms = 30

# Custom voice commands: spoken phrase -> shell command
# Supports $ENV_VAR expansion (e.g., $TERMINAL, $BROWSER, $EDITOR)
[commands]
# "abrir terminal" = "$TERMINAL"

# Aliases for common misrecognitions: what whisper hears -> what you meant
[aliases]
# "bloco de nota" = "bloco de notas"
"##
    }

    pub fn model_filename(&self) -> String {
        format!("ggml-{}.bin", self.model)
    }

    pub fn model_url(&self) -> String {
        format!(
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-{}.bin",
            self.model
        )
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        (self.processing_timeout_secs > 0).then(|| Duration::from_secs(self.processing_timeout_secs))
    }
}

/// Watch the config file and swap in every version that parses.
pub fn spawn_watcher(path: PathBuf, config: SharedConfig) {
    std::thread::spawn(move || {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match recommended_watcher(tx) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create config watcher");
                return;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::warn!(error = %e, "failed to watch config file");
            return;
        }
        tracing::info!(path = %path.display(), "watching config for changes");

        for event in rx.into_iter().flatten() {
            if event.kind.is_modify() {
                // editors write in several steps
                std::thread::sleep(Duration::from_millis(100));
                if let Some(new_config) = Config::load_from(&path) {
                    if **config.load() != new_config {
                        config.store(Arc::new(new_config));
                        tracing::info!("config reloaded");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_file_matches_defaults() {
        let parsed = Config::parse(Config::default_config_content()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed = Config::parse(
            r#"
language = "en"

[capture]
silence_ms = 900
"#,
        )
        .unwrap();
        assert_eq!(parsed.language, "en");
        assert_eq!(parsed.capture.silence_ms, 900);
        assert_eq!(parsed.capture.min_duration_ms, 500);
        assert_eq!(parsed.llm.model, "llama3.2:1b");
        assert_eq!(parsed.llm.mode, DialogueMode::Stream);
    }

    #[test]
    fn actions_mode_and_custom_probes_parse() {
        let parsed = Config::parse(
            r#"
[llm]
mode = "actions"

[[llm.probes]]
method = "POST"
path = "/v1/health"
chat_path = "/v1/chat"
"#,
        )
        .unwrap();
        assert_eq!(parsed.llm.mode, DialogueMode::Actions);
        assert_eq!(parsed.llm.probes.len(), 1);
        assert_eq!(parsed.llm.probes[0].method, ProbeMethod::Post);
        assert_eq!(parsed.llm.probes[0].chat_path.as_deref(), Some("/v1/chat"));
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        assert!(Config::parse("[capture]\nrms_threshold = 0.0").is_err());
        assert!(Config::parse("[capture]\nrms_threshold = 1.5").is_err());
        assert!(Config::parse("[capture]\nframe_ms = 0").is_err());
        assert!(Config::parse("[capture]\nhard_cap_secs = 0").is_err());
        assert!(Config::parse("[llm]\nchat_path = \"api/chat\"").is_err());
        assert!(Config::parse("[llm]\nprobes = []").is_err());
    }

    #[test]
    fn huge_hard_cap_does_not_overflow() {
        let huge = i64::MAX;
        let parsed = Config::parse(&format!("[capture]\nhard_cap_secs = {huge}")).unwrap();
        assert_eq!(parsed.capture.hard_cap_secs, huge as u64);
        assert!(Config::parse(&format!("[capture]\nhard_cap_secs = 1\nmin_duration_ms = {huge}")).is_err());
    }

    #[test]
    fn load_from_ignores_broken_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "language = [").unwrap();
        assert!(Config::load_from(file.path()).is_none());
    }

    #[test]
    fn explicit_path_is_used() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "hotkey = \"F9\"\nthreads = 2").unwrap();
        let (config, path) = Config::load(Some(file.path()));
        assert_eq!(config.hotkey, "F9");
        assert_eq!(config.threads, 2);
        assert_eq!(path.as_deref(), Some(file.path()));
    }

    #[test]
    fn processing_timeout_zero_means_none() {
        let mut config = Config::default();
        assert_eq!(config.processing_timeout(), Some(Duration::from_secs(30)));
        config.processing_timeout_secs = 0;
        assert_eq!(config.processing_timeout(), None);
    }
}
