//! Language model endpoint discovery
//!
//! Probes an ordered list of candidates (base address x probe path) with a
//! short timeout. The first candidate that answers with anything below 500
//! fixes the chat URL until the next resolution. Resolution is idempotent
//! and is re-run whenever the UI comes back from a suspended state.

use arc_swap::ArcSwapOption;
use reqwest::blocking::Client;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{LlmConfig, ProbeMethod};
use crate::Result;

/// One address/path pair to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub base_url: String,
    pub probe_path: String,
    pub method: ProbeMethod,
    /// Chat path used if this candidate answers
    pub chat_path: String,
}

impl EndpointCandidate {
    pub fn probe_url(&self) -> String {
        join_url(&self.base_url, &self.probe_path)
    }
}

/// The working chat endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub chat_path: String,
}

impl Endpoint {
    pub fn new(base_url: &str, chat_path: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_path: chat_path.to_string(),
        }
    }

    pub fn chat_url(&self) -> String {
        join_url(&self.base_url, &self.chat_path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.chat_url())
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Expand the configured bases and probes into the ordered candidate list.
/// Duplicate bases are skipped.
pub fn candidates(llm: &LlmConfig) -> Vec<EndpointCandidate> {
    let mut bases: Vec<String> = Vec::new();
    for base in std::iter::once(&llm.base_url).chain(llm.alternate_urls.iter()) {
        let base = base.trim().trim_end_matches('/').to_string();
        if !base.is_empty() && !bases.contains(&base) {
            bases.push(base);
        }
    }

    bases
        .iter()
        .flat_map(|base| {
            llm.probes.iter().map(move |probe| EndpointCandidate {
                base_url: base.clone(),
                probe_path: probe.path.clone(),
                method: probe.method,
                chat_path: probe.chat_path.clone().unwrap_or_else(|| llm.chat_path.clone()),
            })
        })
        .collect()
}

/// What a single probe saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Answered with a status below 500
    Reachable(u16),
    /// Answered with a server error
    ServerError(u16),
    TimedOut,
    Unreachable(String),
}

impl ProbeStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeStatus::Reachable(_))
    }
}

/// Probes candidates in order until one answers
pub struct EndpointResolver {
    client: Client,
    candidates: Vec<EndpointCandidate>,
}

impl EndpointResolver {
    pub fn new(candidates: Vec<EndpointCandidate>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, candidates })
    }

    pub fn from_config(llm: &LlmConfig) -> Result<Self> {
        Self::new(candidates(llm), llm.probe_timeout())
    }

    pub fn candidates(&self) -> &[EndpointCandidate] {
        &self.candidates
    }

    pub fn probe(&self, candidate: &EndpointCandidate) -> ProbeStatus {
        let url = candidate.probe_url();
        let request = match candidate.method {
            ProbeMethod::Get => self.client.get(&url),
            ProbeMethod::Head => self.client.head(&url),
            ProbeMethod::Post => self.client.post(&url),
        };

        match request.send() {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() {
                    ProbeStatus::ServerError(status.as_u16())
                } else {
                    ProbeStatus::Reachable(status.as_u16())
                }
            }
            Err(e) if e.is_timeout() => ProbeStatus::TimedOut,
            Err(e) => ProbeStatus::Unreachable(e.to_string()),
        }
    }

    /// First candidate that answers, or `None` when the service is down
    pub fn resolve(&self) -> Option<Endpoint> {
        let started = Instant::now();
        for candidate in &self.candidates {
            let status = self.probe(candidate);
            tracing::debug!(url = %candidate.probe_url(), ?status, "probed endpoint");
            if status.is_available() {
                let endpoint = Endpoint::new(&candidate.base_url, &candidate.chat_path);
                tracing::info!(
                    chat_url = %endpoint.chat_url(),
                    ms = started.elapsed().as_millis() as u64,
                    "language model available"
                );
                return Some(endpoint);
            }
        }
        tracing::warn!(
            candidates = self.candidates.len(),
            ms = started.elapsed().as_millis() as u64,
            "language model unavailable"
        );
        None
    }
}

/// Change in availability after publishing a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    BecameAvailable,
    BecameUnavailable,
    /// Still available, at a different URL
    Moved,
    Unchanged,
}

/// Current endpoint shared by the UI thread and workers. `None` means
/// dialogue is disabled (command-only mode).
#[derive(Default)]
pub struct EndpointState {
    current: ArcSwapOption<Endpoint>,
    resolved_once: AtomicBool,
}

impl EndpointState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Endpoint>> {
        self.current.load_full()
    }

    pub fn is_available(&self) -> bool {
        self.current.load().is_some()
    }

    /// Store a resolution result. The first call always reports a change so
    /// the startup state gets announced.
    pub fn publish(&self, endpoint: Option<Endpoint>) -> Availability {
        let first = !self.resolved_once.swap(true, Ordering::AcqRel);
        let next = endpoint.map(Arc::new);
        let previous = self.current.swap(next.clone());

        match (previous, next) {
            (None, Some(_)) => Availability::BecameAvailable,
            (Some(_), None) => Availability::BecameUnavailable,
            (None, None) if first => Availability::BecameUnavailable,
            (Some(a), Some(b)) if a != b => Availability::Moved,
            _ => Availability::Unchanged,
        }
    }
}
