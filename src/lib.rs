//! Jarvis - talk or type to a local language model
//!
//! Voice is captured until the speaker goes quiet, transcribed with whisper
//! and routed either to a direct command or to a locally hosted chat model
//! whose reply streams back token by token.

pub mod app;
pub mod audio;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod hotkey;
pub mod model;
pub mod router;
pub mod transcribe;
pub mod vad;

pub use config::Config;
pub use error::{Error, Result};
