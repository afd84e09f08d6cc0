//! Chat client for the local language model service
//!
//! Speaks the `/api/chat` protocol: a JSON request, answered either by one
//! JSON object or, when streaming, by newline-delimited JSON fragments of the
//! form `{"message":{"content":"..."},"done":false}`.
//!
//! The gateway never retries. Fallback policy lives in the coordinator.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};

use crate::config::SharedConfig;
use crate::endpoint::Endpoint;
use crate::Result;

/// Shown when a one-shot completion fails
pub const FALLBACK_REPLY: &str = "Não consegui falar com o modelo agora. Tente novamente em instantes.";

/// Shown when the model's action reply cannot be used
pub const FALLBACK_DECISION: &str = "Não consegui interpretar sua solicitação.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
}

/// Request body for `/api/chat`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub options: ChatOptions,
}

impl ChatRequest {
    pub fn new(model: &str, system: &str, user: &str, stream: bool, temperature: f32) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !system.trim().is_empty() {
            messages.push(ChatMessage::new("system", system));
        }
        messages.push(ChatMessage::new("user", user));
        Self {
            model: model.to_string(),
            messages,
            stream,
            options: ChatOptions { temperature },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FragmentMessage {
    #[serde(default)]
    content: String,
}

/// One JSON object of a chat response (streamed or not)
#[derive(Debug, Default, Deserialize)]
struct WireFragment {
    #[serde(default)]
    message: Option<FragmentMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// A parsed fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub content: String,
    pub done: bool,
}

/// Parse one NDJSON line. An `error` field counts as a failure.
pub fn parse_fragment(line: &str) -> std::result::Result<Fragment, String> {
    let wire: WireFragment = serde_json::from_str(line).map_err(|e| format!("bad fragment: {e}"))?;
    if let Some(error) = wire.error {
        return Err(format!("model error: {error}"));
    }
    Ok(Fragment {
        content: wire.message.map(|m| m.content).unwrap_or_default(),
        done: wire.done,
    })
}

/// How a streamed turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    TransportError(String),
}

/// Where streamed tokens go. Checked for cancellation before every fragment
/// is delivered.
pub trait TokenSink {
    fn is_cancelled(&self) -> bool;
    fn deliver(&mut self, token: &str);
}

/// Action the model (or a direct command) asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Open,
    Search,
    Youtube,
    Type,
    Clear,
    Chat,
    #[serde(other)]
    Unknown,
}

/// Structured reply of the action-extraction mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl Decision {
    pub fn chat(response: &str) -> Self {
        Self {
            action: Action::Chat,
            target: None,
            query: None,
            text: None,
            response: Some(response.to_string()),
        }
    }
}

/// Pull the first `{` .. last `}` span out of a reply and parse it
pub fn extract_decision(reply: &str) -> Option<Decision> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

const YOUTUBE_FILLER: &[&str] = &["youtube", "pesquise", "pesquisar", "no", "na"];

/// Lowercase `text` and drop the filler words
pub fn clean_query(text: &str, filler: &[&str]) -> String {
    text.to_lowercase()
        .split_whitespace()
        .filter(|word| !filler.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Small models often answer "search" or "chat" when the user clearly asked
/// for YouTube. Any input naming YouTube becomes a YouTube search.
pub fn apply_youtube_correction(input: &str, mut decision: Decision) -> Decision {
    if !input.to_lowercase().contains("youtube") {
        return decision;
    }
    let source = decision
        .query
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .unwrap_or(input);
    decision.query = Some(clean_query(source, YOUTUBE_FILLER));
    decision.action = Action::Youtube;
    decision
}

/// The operations the coordinator needs from a chat service
pub trait DialogueBackend: Send + Sync + 'static {
    /// One-shot completion. Never fails: transport errors yield
    /// [`FALLBACK_REPLY`].
    fn complete(&self, endpoint: &Endpoint, input: &str) -> String;

    /// Streamed completion, fragment by fragment into `sink`
    fn stream(&self, endpoint: &Endpoint, input: &str, sink: &mut dyn TokenSink) -> StreamOutcome;

    /// Ask for a structured action. Never fails: unusable replies yield a
    /// chat decision with [`FALLBACK_DECISION`].
    fn decide(&self, endpoint: &Endpoint, input: &str) -> Decision;
}

/// HTTP implementation of [`DialogueBackend`]
pub struct DialogueGateway {
    client: Client,
    config: SharedConfig,
}

impl DialogueGateway {
    pub fn new(config: SharedConfig) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self { client, config })
    }

    fn post(&self, endpoint: &Endpoint, request: &ChatRequest) -> reqwest::Result<reqwest::blocking::Response> {
        let timeout = self.config.load().llm.request_timeout();
        self.client
            .post(endpoint.chat_url())
            .timeout(timeout)
            .json(request)
            .send()?
            .error_for_status()
    }

    fn one_shot(&self, endpoint: &Endpoint, request: &ChatRequest) -> std::result::Result<String, String> {
        let response = self.post(endpoint, request).map_err(|e| e.to_string())?;
        let body = response.text().map_err(|e| e.to_string())?;
        let fragment = parse_fragment(body.trim())?;
        Ok(fragment.content)
    }
}

impl DialogueBackend for DialogueGateway {
    fn complete(&self, endpoint: &Endpoint, input: &str) -> String {
        let llm = self.config.load().llm.clone();
        let request = ChatRequest::new(&llm.model, &llm.system_prompt, input, false, llm.temperature);
        match self.one_shot(endpoint, &request) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!("model returned an empty completion");
                FALLBACK_REPLY.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "completion failed");
                FALLBACK_REPLY.to_string()
            }
        }
    }

    fn stream(&self, endpoint: &Endpoint, input: &str, sink: &mut dyn TokenSink) -> StreamOutcome {
        if sink.is_cancelled() {
            return StreamOutcome::Cancelled;
        }

        let llm = self.config.load().llm.clone();
        let request = ChatRequest::new(&llm.model, &llm.system_prompt, input, true, llm.temperature);
        let response = match self.post(endpoint, &request) {
            Ok(response) => response,
            Err(e) => return StreamOutcome::TransportError(e.to_string()),
        };

        let mut fragments = 0usize;
        for line in BufReader::new(response).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(fragments, error = %e, "stream broke");
                    return StreamOutcome::TransportError(e.to_string());
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let fragment = match parse_fragment(&line) {
                Ok(fragment) => fragment,
                Err(e) => return StreamOutcome::TransportError(e),
            };
            fragments += 1;

            // the only cancellation checkpoint: one per fragment
            if sink.is_cancelled() {
                tracing::debug!(fragments, "stream cancelled");
                return StreamOutcome::Cancelled;
            }
            if !fragment.content.is_empty() {
                sink.deliver(&fragment.content);
            }
            if fragment.done {
                break;
            }
        }
        tracing::debug!(fragments, "stream completed");
        StreamOutcome::Completed
    }

    fn decide(&self, endpoint: &Endpoint, input: &str) -> Decision {
        let llm = self.config.load().llm.clone();
        let request = ChatRequest::new(&llm.model, &llm.action_prompt, input, false, 0.0);
        let reply = match self.one_shot(endpoint, &request) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "action request failed");
                return Decision::chat(FALLBACK_DECISION);
            }
        };
        extract_decision(&reply).unwrap_or_else(|| {
            tracing::warn!(reply = %reply, "model reply had no usable action");
            Decision::chat(FALLBACK_DECISION)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_in_wire_shape() {
        let request = ChatRequest::new("llama3.2:1b", "seja breve", "oi", true, 0.7);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3.2:1b");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "oi");
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn empty_system_prompt_is_left_out() {
        let request = ChatRequest::new("m", "  ", "oi", false, 0.0);
        assert_eq!(request.messages, vec![ChatMessage::new("user", "oi")]);
    }

    #[test]
    fn fragments_parse() {
        let f = parse_fragment(r#"{"model":"m","message":{"role":"assistant","content":"Olá"},"done":false}"#).unwrap();
        assert_eq!(f, Fragment { content: "Olá".to_string(), done: false });

        let last = parse_fragment(r#"{"model":"m","message":{"role":"assistant","content":""},"done":true}"#).unwrap();
        assert!(last.done);
        assert!(last.content.is_empty());

        let bare = parse_fragment(r#"{"done":true}"#).unwrap();
        assert!(bare.done);
    }

    #[test]
    fn error_fragments_and_garbage_fail() {
        assert!(parse_fragment(r#"{"error":"model not found"}"#).unwrap_err().contains("model not found"));
        assert!(parse_fragment("not json").is_err());
    }

    #[test]
    fn decision_is_found_inside_chatter() {
        let reply = "Claro! {\"action\": \"open\", \"target\": \"notepad\"} Pronto.";
        let decision = extract_decision(reply).unwrap();
        assert_eq!(decision.action, Action::Open);
        assert_eq!(decision.target.as_deref(), Some("notepad"));
        assert_eq!(decision.query, None);
    }

    #[test]
    fn unknown_action_and_missing_json() {
        let decision = extract_decision(r#"{"action":"reboot"}"#).unwrap();
        assert_eq!(decision.action, Action::Unknown);
        assert!(extract_decision("sem json aqui").is_none());
        assert!(extract_decision("} invertido {").is_none());
    }

    #[test]
    fn youtube_mentions_force_a_youtube_search() {
        let fixed = apply_youtube_correction("pesquise lofi no YouTube", Decision::chat("ok"));
        assert_eq!(fixed.action, Action::Youtube);
        assert_eq!(fixed.query.as_deref(), Some("lofi"));

        let untouched = apply_youtube_correction("abrir notas", Decision::chat("ok"));
        assert_eq!(untouched.action, Action::Chat);
    }

    #[test]
    fn model_query_is_preferred_when_present() {
        let decision = Decision {
            action: Action::Search,
            target: None,
            query: Some("Rust no YouTube".to_string()),
            text: None,
            response: None,
        };
        let fixed = apply_youtube_correction("quero rust no youtube", decision);
        assert_eq!(fixed.query.as_deref(), Some("rust"));
    }
}
