use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use jarvis::app::{App, SourceOpener};
use jarvis::audio::{FrameSource, MicrophoneSource};
use jarvis::config::{spawn_watcher, SharedConfig};
use jarvis::dispatch::{self, AppEvent, ConsoleSink, Dispatcher};
use jarvis::gateway::DialogueGateway;
use jarvis::hotkey::{self, parse_hotkey};
use jarvis::router::SystemLauncher;
use jarvis::transcribe::{spawn_model_load, ModelHandle};
use jarvis::Config;

/// How long the UI loop waits for events before looping again
const TICK: Duration = Duration::from_millis(50);

type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Jarvis - talk or type to a local language model
#[derive(Parser)]
#[command(name = "jarvis", version, about)]
struct Cli {
    /// Config file (default: first of ~/.config/jarvis/config.toml, ~/.jarvis/config.toml, ./config.toml)
    #[arg(short, long, env = "JARVIS_CONFIG")]
    config: Option<PathBuf>,

    /// Typed input only: no whisper model, microphone or global hotkeys
    #[arg(long)]
    text_only: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Prefix transcript lines with the time
    #[arg(long)]
    timestamps: bool,

    /// Print the default config file and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::default_config_content());
        return ExitCode::SUCCESS;
    }

    let log = init_logging(&cli);

    match run(cli, &log) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn default_filter(quiet: bool, verbose: u8) -> &'static str {
    match (quiet, verbose) {
        (_, 2..) => "trace",
        (_, 1) => "info,jarvis=debug",
        (true, 0) => "warn",
        (false, 0) => "info",
    }
}

/// Logs go to stderr so they never interleave with the transcript on stdout
fn init_logging(cli: &Cli) -> LogHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(cli.quiet, cli.verbose)));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
    handle
}

fn open_microphone(device: &str, frame_ms: u64) -> jarvis::Result<Box<dyn FrameSource>> {
    let source = MicrophoneSource::open(device, frame_ms)?;
    Ok(Box::new(source))
}

/// Typed lines become events; EOF is reported once
fn spawn_stdin_reader(dispatcher: Dispatcher) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => dispatcher.post(AppEvent::Text(line)),
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read error");
                    break;
                }
            }
        }
        dispatcher.post(AppEvent::InputClosed);
    });
}

fn run(cli: Cli, log: &LogHandle) -> Result<()> {
    let (config, config_path) = Config::load(cli.config.as_deref());

    // `quiet` in the file only applies when nothing more specific was asked for
    if config.quiet && !cli.quiet && cli.verbose == 0 && std::env::var_os("RUST_LOG").is_none() {
        if let Err(e) = log.modify(|filter| *filter = EnvFilter::new("warn")) {
            tracing::warn!(error = %e, "could not apply quiet log level");
        }
    }

    if parse_hotkey(&config.hotkey).is_none() {
        tracing::warn!(hotkey = %config.hotkey, "unknown hotkey, will default to F12");
    }
    tracing::info!(
        model = %config.model,
        language = %config.language,
        llm = %config.llm.model,
        mode = ?config.llm.mode,
        commands = config.commands.len(),
        aliases = config.aliases.len(),
        "starting jarvis"
    );

    let config: SharedConfig = Arc::new(ArcSwap::from_pointee(config));
    if let Some(path) = config_path {
        spawn_watcher(path, config.clone());
    }

    let (dispatcher, queue) = dispatch::channel();
    let model = ModelHandle::new();

    let opener: Option<SourceOpener> = if cli.text_only {
        tracing::info!("text-only mode, voice capture disabled");
        None
    } else {
        let loaded = dispatcher.clone();
        spawn_model_load(Config::clone(&config.load()), model.clone(), move |result| {
            loaded.post(AppEvent::ModelLoaded(result));
        });
        hotkey::spawn_listener(config.clone(), dispatcher.clone());
        let open: SourceOpener = Arc::new(open_microphone);
        Some(open)
    };

    spawn_stdin_reader(dispatcher.clone());

    let backend = DialogueGateway::new(config.clone()).context("failed to build HTTP client")?;
    let mut app = App::new(config, dispatcher, backend, SystemLauncher, model, opener);
    let mut ui = ConsoleSink::new(std::io::stdout(), cli.timestamps);

    app.start(&mut ui);
    app.run(&queue, &mut ui, TICK);
    tracing::info!("bye");
    Ok(())
}
