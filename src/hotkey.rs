//! Global hotkeys
//!
//! One key toggles voice capture, another cancels the live turn. Key names
//! are re-read from the shared config on every event so edits apply at once.

use rdev::{listen, Event, EventType, Key as RdevKey};

use crate::config::SharedConfig;
use crate::dispatch::{AppEvent, Dispatcher};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    /// Start capture, or stop it early
    Capture,
    /// Cancel the live dialogue turn
    Cancel,
}

pub fn parse_hotkey(s: &str) -> Option<RdevKey> {
    match s.trim().to_uppercase().as_str() {
        "F1" => Some(RdevKey::F1),
        "F2" => Some(RdevKey::F2),
        "F3" => Some(RdevKey::F3),
        "F4" => Some(RdevKey::F4),
        "F5" => Some(RdevKey::F5),
        "F6" => Some(RdevKey::F6),
        "F7" => Some(RdevKey::F7),
        "F8" => Some(RdevKey::F8),
        "F9" => Some(RdevKey::F9),
        "F10" => Some(RdevKey::F10),
        "F11" => Some(RdevKey::F11),
        "F12" => Some(RdevKey::F12),
        "ESC" | "ESCAPE" => Some(RdevKey::Escape),
        "SCROLLLOCK" | "SCROLL_LOCK" | "SCROLL" => Some(RdevKey::ScrollLock),
        "PAUSE" | "BREAK" => Some(RdevKey::Pause),
        "PRINTSCREEN" | "PRINT_SCREEN" | "PRTSC" => Some(RdevKey::PrintScreen),
        "INSERT" | "INS" => Some(RdevKey::Insert),
        "HOME" => Some(RdevKey::Home),
        "END" => Some(RdevKey::End),
        "PAGEUP" | "PAGE_UP" | "PGUP" => Some(RdevKey::PageUp),
        "PAGEDOWN" | "PAGE_DOWN" | "PGDN" => Some(RdevKey::PageDown),
        "NUM0" | "NUMPAD0" => Some(RdevKey::Kp0),
        "NUM1" | "NUMPAD1" => Some(RdevKey::Kp1),
        "NUM2" | "NUMPAD2" => Some(RdevKey::Kp2),
        "NUM3" | "NUMPAD3" => Some(RdevKey::Kp3),
        "NUM4" | "NUMPAD4" => Some(RdevKey::Kp4),
        "NUM5" | "NUMPAD5" => Some(RdevKey::Kp5),
        "NUM6" | "NUMPAD6" => Some(RdevKey::Kp6),
        "NUM7" | "NUMPAD7" => Some(RdevKey::Kp7),
        "NUM8" | "NUMPAD8" => Some(RdevKey::Kp8),
        "NUM9" | "NUMPAD9" => Some(RdevKey::Kp9),
        _ => None,
    }
}

/// Turns raw key events into actions. Auto-repeat presses of a held key
/// are ignored, so holding the key toggles once.
#[derive(Debug, Default)]
pub struct HotkeyFilter {
    held: Vec<RdevKey>,
}

impl HotkeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &EventType, capture: Option<RdevKey>, cancel: Option<RdevKey>) -> Option<HotkeyAction> {
        match *event {
            EventType::KeyPress(key) => {
                let action = if Some(key) == capture {
                    HotkeyAction::Capture
                } else if Some(key) == cancel {
                    HotkeyAction::Cancel
                } else {
                    return None;
                };
                if self.held.contains(&key) {
                    return None;
                }
                self.held.push(key);
                Some(action)
            }
            EventType::KeyRelease(key) => {
                self.held.retain(|k| *k != key);
                None
            }
            _ => None,
        }
    }
}

/// Listen for the configured hotkeys on a dedicated thread. `rdev::listen`
/// blocks for the life of the process.
pub fn spawn_listener(config: SharedConfig, dispatcher: Dispatcher) {
    std::thread::spawn(move || {
        let mut filter = HotkeyFilter::new();
        let callback = move |event: Event| {
            let cfg = config.load();
            let capture = parse_hotkey(&cfg.hotkey).or(Some(RdevKey::F12));
            let cancel = parse_hotkey(&cfg.cancel_hotkey); // None if empty/invalid

            if let Some(action) = filter.on_event(&event.event_type, capture, cancel) {
                tracing::debug!(?action, "hotkey");
                dispatcher.post(AppEvent::Hotkey(action));
            }
        };

        if let Err(e) = listen(callback) {
            let e = Error::Hotkey(format!("{e:?}"));
            tracing::error!(error = %e, "global hotkey listener stopped, typed commands still work");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!(parse_hotkey("f12"), Some(RdevKey::F12));
        assert_eq!(parse_hotkey(" Escape "), Some(RdevKey::Escape));
        assert_eq!(parse_hotkey("pgdn"), Some(RdevKey::PageDown));
        assert_eq!(parse_hotkey(""), None);
        assert_eq!(parse_hotkey("ctrl+x"), None);
    }

    #[test]
    fn held_key_toggles_once() {
        let mut filter = HotkeyFilter::new();
        let capture = Some(RdevKey::F12);
        let cancel = Some(RdevKey::F11);

        assert_eq!(
            filter.on_event(&EventType::KeyPress(RdevKey::F12), capture, cancel),
            Some(HotkeyAction::Capture)
        );
        // auto-repeat
        assert_eq!(filter.on_event(&EventType::KeyPress(RdevKey::F12), capture, cancel), None);
        assert_eq!(filter.on_event(&EventType::KeyRelease(RdevKey::F12), capture, cancel), None);
        assert_eq!(
            filter.on_event(&EventType::KeyPress(RdevKey::F12), capture, cancel),
            Some(HotkeyAction::Capture)
        );
    }

    #[test]
    fn cancel_key_and_other_keys() {
        let mut filter = HotkeyFilter::new();
        assert_eq!(
            filter.on_event(&EventType::KeyPress(RdevKey::F11), Some(RdevKey::F12), Some(RdevKey::F11)),
            Some(HotkeyAction::Cancel)
        );
        assert_eq!(
            filter.on_event(&EventType::KeyPress(RdevKey::KeyA), Some(RdevKey::F12), Some(RdevKey::F11)),
            None
        );
        assert_eq!(
            filter.on_event(&EventType::KeyPress(RdevKey::F11), Some(RdevKey::F12), None),
            None
        );
    }
}
