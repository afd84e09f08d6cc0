#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jarvis::app::{App, SourceOpener};
use jarvis::audio::{AudioBuffer, FrameRead, FrameSource};
use jarvis::config::{LlmConfig, ProbeConfig, ProbeMethod, SharedConfig};
use jarvis::dispatch::{EventQueue, RecordingSink};
use jarvis::gateway::DialogueBackend;
use jarvis::router::Launcher;
use jarvis::transcribe::Transcriber;
use jarvis::{Config, Result};

pub fn fragment(content: &str) -> String {
    serde_json::json!({ "message": { "role": "assistant", "content": content }, "done": false }).to_string()
}

pub fn done_fragment() -> String {
    serde_json::json!({ "message": { "role": "assistant", "content": "" }, "done": true }).to_string()
}

pub fn completion(content: &str) -> String {
    serde_json::json!({ "message": { "role": "assistant", "content": content }, "done": true }).to_string()
}

/// `count` numbered fragments ("t1 ", "t2 ", ...)
pub fn numbered(count: usize) -> Vec<String> {
    (1..=count).map(|i| fragment(&format!("t{i} "))).collect()
}

/// A whole NDJSON reply in one body
pub fn ndjson(lines: &[String]) -> ResponseTemplate {
    let body: String = lines.iter().map(|line| format!("{line}\n")).collect();
    ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson")
}

/// `count` numbered fragments followed by the done marker
pub fn numbered_reply(count: usize) -> ResponseTemplate {
    let mut lines = numbered(count);
    lines.push(done_fragment());
    ndjson(&lines)
}

pub fn json_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(completion(content), "application/json")
}

/// Healthy model service: `GET /api/tags` answers, streamed chats get
/// `stream`, one-shot chats get `reply`
pub async fn model_service(stream: ResponseTemplate, reply: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"models":[]}"#))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({ "stream": true })))
        .respond_with(stream)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply)
        .mount(&server)
        .await;
    server
}

/// Run blocking client code off the async test thread
pub async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

/// Streamed reply written as real HTTP chunks, `pause` apart. With `cut` the
/// connection drops before the terminating chunk.
#[derive(Debug, Clone)]
pub struct PacedStream {
    pub lines: Vec<String>,
    pub pause: Duration,
    pub cut: bool,
}

pub fn paced(count: usize, pause: Duration, cut: bool) -> PacedStream {
    let mut lines = numbered(count);
    if !cut {
        lines.push(done_fragment());
    }
    PacedStream { lines, pause, cut }
}

/// Model service whose streamed replies arrive chunk by chunk over time,
/// or break off mid-body. Probes answer 200 and one-shot chats get `reply`.
pub struct StreamServer {
    base_url: String,
    chats: Arc<AtomicUsize>,
}

impl StreamServer {
    pub fn start(stream: PacedStream, reply: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stream server");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
        let chats = Arc::new(AtomicUsize::new(0));
        let reply = completion(reply);

        let counter = chats.clone();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { continue };
                let stream = stream.clone();
                let reply = reply.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    // the client hanging up early is fine
                    let _ = serve(conn, &stream, &reply, &counter);
                });
            }
        });

        Self { base_url, chats }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Chat requests received, streamed or not
    pub fn chat_requests(&self) -> usize {
        self.chats.load(Ordering::SeqCst)
    }
}

fn serve(conn: TcpStream, stream: &PacedStream, reply: &str, chats: &AtomicUsize) -> std::io::Result<()> {
    let mut reader = BufReader::new(conn.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let mut length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let header = header.trim();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body)?;

    let mut conn = conn;
    if !request_line.starts_with("POST") {
        return write!(conn, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}");
    }
    chats.fetch_add(1, Ordering::SeqCst);
    if !String::from_utf8_lossy(&body).contains("\"stream\":true") {
        return write!(
            conn,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
            reply.len()
        );
    }

    write!(
        conn,
        "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    )?;
    conn.flush()?;
    for line in &stream.lines {
        let data = format!("{line}\n");
        write!(conn, "{:x}\r\n{data}\r\n", data.len())?;
        conn.flush()?;
        std::thread::sleep(stream.pause);
    }
    if stream.cut {
        return conn.shutdown(std::net::Shutdown::Both);
    }
    write!(conn, "0\r\n\r\n")?;
    conn.flush()
}

/// A local address nothing listens on
pub fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

/// Language model settings pointing at `base_url` only, probed with
/// `GET /api/tags`
pub fn llm_at(base_url: &str) -> LlmConfig {
    LlmConfig {
        base_url: base_url.to_string(),
        alternate_urls: Vec::new(),
        probes: vec![ProbeConfig::new(ProbeMethod::Get, "/api/tags")],
        model: "test-model".to_string(),
        probe_timeout_ms: 500,
        request_timeout_secs: 5,
        ..LlmConfig::default()
    }
}

pub fn config_at(base_url: &str) -> Config {
    Config {
        llm: llm_at(base_url),
        ..Config::default()
    }
}

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

/// Launcher that writes down what it was asked to do
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingLauncher {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl Launcher for RecordingLauncher {
    fn open_target(&self, target: &str) -> Result<()> {
        self.record(format!("open {target}"))
    }

    fn open_url(&self, url: &str) -> Result<()> {
        self.record(format!("url {url}"))
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.record(format!("type {text}"))
    }

    fn run_shell(&self, command: &str) -> Result<()> {
        self.record(format!("shell {command}"))
    }
}

pub const RATE: u32 = 16000;
const FRAME: usize = 480;

fn frame(amplitude: f32) -> Vec<f32> {
    (0..FRAME).map(|i| if i % 2 == 0 { amplitude } else { -amplitude }).collect()
}

/// 30ms frames of a square wave at `amplitude`
pub fn frames(amplitude: f32, ms: u64) -> Vec<Vec<f32>> {
    (0..ms / 30).map(|_| frame(amplitude)).collect()
}

/// Frame source that plays back a fixed script, then closes
pub struct ScriptedSource {
    frames: VecDeque<Vec<f32>>,
}

impl FrameSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn next_frame(&mut self, _wait: Duration) -> FrameRead {
        match self.frames.pop_front() {
            Some(frame) => FrameRead::Frame(frame),
            None => FrameRead::Closed,
        }
    }
}

/// Opener that hands out a fresh [`ScriptedSource`] on every capture
pub fn scripted_opener(script: Vec<Vec<f32>>) -> SourceOpener {
    let opener: SourceOpener = Arc::new(move |_device: &str, _frame_ms: u64| {
        let source: Box<dyn FrameSource> = Box::new(ScriptedSource {
            frames: script.iter().cloned().collect(),
        });
        Ok(source)
    });
    opener
}

/// Live-like source: one loud frame every 30ms, forever
pub struct EndlessSource;

impl FrameSource for EndlessSource {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn next_frame(&mut self, _wait: Duration) -> FrameRead {
        std::thread::sleep(Duration::from_millis(30));
        FrameRead::Frame(frame(0.3))
    }
}

/// Opener for [`EndlessSource`], counting how often it was called
pub fn endless_opener(opened: Arc<AtomicUsize>) -> SourceOpener {
    let opener: SourceOpener = Arc::new(move |_device: &str, _frame_ms: u64| {
        opened.fetch_add(1, Ordering::SeqCst);
        let source: Box<dyn FrameSource> = Box::new(EndlessSource);
        Ok(source)
    });
    opener
}

/// Transcriber that always hears the same thing
pub struct FixedTranscriber {
    pub text: String,
    pub calls: AtomicUsize,
}

impl FixedTranscriber {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcriber for FixedTranscriber {
    fn transcribe(&self, _audio: &AudioBuffer, _language: &str) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.text.clone()
    }
}

/// Feed queued events into the app until `done` holds or `timeout` passes
pub fn pump_until<B, L>(
    app: &mut App<B, L>,
    queue: &EventQueue,
    ui: &mut RecordingSink,
    timeout: Duration,
    mut done: impl FnMut(&App<B, L>, &RecordingSink) -> bool,
) -> bool
where
    B: DialogueBackend,
    L: Launcher,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(app, ui) {
            return true;
        }
        for event in queue.drain(Duration::from_millis(10)) {
            app.handle(event, ui);
        }
    }
    done(app, ui)
}

/// Keep pumping for `duration` regardless of what happens
pub fn pump_for<B, L>(app: &mut App<B, L>, queue: &EventQueue, ui: &mut RecordingSink, duration: Duration)
where
    B: DialogueBackend,
    L: Launcher,
{
    pump_until(app, queue, ui, duration, |_, _| false);
}
