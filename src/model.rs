//! Model download and path management
//!
//! Handles downloading Whisper models from HuggingFace and
//! finding model files across multiple locations.

use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Download a model from HuggingFace with progress bar
pub fn download_model(url: &str, dest: &Path) -> Result<()> {
    tracing::info!(url, "downloading model");

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut response = reqwest::blocking::get(url)?;

    if !response.status().is_success() {
        return Err(Error::Model(format!("download failed: HTTP {}", response.status())));
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[jarvis] {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .map_err(|e| Error::Model(e.to_string()))?
            .progress_chars("##-"),
    );

    // write to a temp name so a cut download never looks like a model
    let partial = dest.with_extension("part");
    let mut file = File::create(&partial)?;
    let mut downloaded: u64 = 0;
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = response.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n])?;
        downloaded += n as u64;
        pb.set_position(downloaded);
    }
    file.flush()?;
    drop(file);
    fs::rename(&partial, dest)?;

    pb.finish_with_message("Download complete!");
    tracing::info!(path = %dest.display(), "model saved");

    Ok(())
}

/// Get the preferred model install location
pub fn get_model_install_path(model_dir: &str, model_name: &str) -> PathBuf {
    if let Some(dir) = expand_model_dir(model_dir) {
        return dir.join(model_name);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jarvis")
        .join("models")
        .join(model_name)
}

/// Get the model path, checking multiple locations
pub fn get_model_path(model_dir: &str, model_name: &str) -> PathBuf {
    let candidates = [
        // 0. Configured directory
        expand_model_dir(model_dir).map(|p| p.join(model_name)).unwrap_or_default(),
        // 1. Current directory (for development)
        PathBuf::from("models").join(model_name),
        // 2. XDG data dir (Linux: ~/.local/share/jarvis)
        dirs::data_dir()
            .map(|p| p.join("jarvis").join("models").join(model_name))
            .unwrap_or_default(),
        // 3. Home dir fallback
        dirs::home_dir()
            .map(|p| p.join(".jarvis").join("models").join(model_name))
            .unwrap_or_default(),
    ];

    for path in candidates {
        if !path.as_os_str().is_empty() && path.exists() {
            return path;
        }
    }

    // Return the preferred install location if none exist (for error message)
    get_model_install_path(model_dir, model_name)
}

/// Expand `~` and `$VARS` in the configured model directory
fn expand_model_dir(model_dir: &str) -> Option<PathBuf> {
    let trimmed = model_dir.trim();
    if trimmed.is_empty() {
        return None;
    }
    match shellexpand::full(trimmed) {
        Ok(expanded) => Some(PathBuf::from(expanded.as_ref())),
        Err(e) => {
            tracing::warn!(model_dir = trimmed, error = %e, "could not expand model_dir");
            Some(PathBuf::from(trimmed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_dir_wins_when_model_exists() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("ggml-tiny.bin");
        fs::write(&model, b"model").unwrap();

        let dir_str = dir.path().to_string_lossy().to_string();
        assert_eq!(get_model_path(&dir_str, "ggml-tiny.bin"), model);
    }

    #[test]
    fn install_path_uses_configured_dir() {
        let path = get_model_install_path("/opt/models", "ggml-base.bin");
        assert_eq!(path, PathBuf::from("/opt/models/ggml-base.bin"));
    }

    #[test]
    fn empty_dir_falls_back_to_data_dir() {
        let path = get_model_install_path("", "ggml-base.bin");
        assert!(path.ends_with("jarvis/models/ggml-base.bin"));
    }
}
