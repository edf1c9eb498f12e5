//! Scroll-position continuity for the message list.
//!
//! The controller never touches a real view; it answers with a
//! [`ScrollCommand`] the UI applies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Snapshot of the scroll container, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ViewportMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.client_height - self.scroll_top).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "offset", rename_all = "camelCase")]
pub enum ScrollCommand {
    Stay,
    PinToBottom,
    ScrollTo(f64),
}

/// Per-conversation scroll bookkeeping.
#[derive(Debug)]
pub struct ViewportController {
    near_bottom_threshold: f64,
    saved: HashMap<String, f64>,
    active: Option<String>,
    was_near_bottom: bool,
    prepend_anchor: Option<ViewportMetrics>,
    storage: Option<PathBuf>,
}

impl ViewportController {
    pub fn new(near_bottom_threshold: f64) -> Self {
        Self {
            near_bottom_threshold,
            saved: HashMap::new(),
            active: None,
            was_near_bottom: true,
            prepend_anchor: None,
            storage: None,
        }
    }

    /// Controller whose saved offsets survive restarts in a JSON file.
    pub fn with_storage(near_bottom_threshold: f64, path: &Path) -> Self {
        let saved = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                log::warn!("Failed to parse scroll positions {:?}: {}", path, e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            saved,
            storage: Some(path.to_path_buf()),
            ..Self::new(near_bottom_threshold)
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn saved_offset(&self, conversation_id: &str) -> Option<f64> {
        self.saved.get(conversation_id).copied()
    }

    /// First successful load: restore the saved offset or pin to bottom.
    pub fn on_first_load(&mut self, conversation_id: &str) -> ScrollCommand {
        self.active = Some(conversation_id.to_string());
        match self.saved.get(conversation_id) {
            Some(offset) => {
                self.was_near_bottom = false;
                ScrollCommand::ScrollTo(*offset)
            }
            None => {
                self.was_near_bottom = true;
                ScrollCommand::PinToBottom
            }
        }
    }

    /// Call before applying a state change to the visible list.
    pub fn before_change(&mut self, metrics: ViewportMetrics) {
        self.was_near_bottom = metrics.distance_from_bottom() <= self.near_bottom_threshold;
    }

    /// Call after the change has rendered.
    pub fn after_change(&self, newest_is_own: bool) -> ScrollCommand {
        if self.was_near_bottom || newest_is_own {
            ScrollCommand::PinToBottom
        } else {
            ScrollCommand::Stay
        }
    }

    /// Call right before older messages are prepended.
    pub fn begin_prepend(&mut self, metrics: ViewportMetrics) {
        self.prepend_anchor = Some(metrics);
    }

    /// Offset that keeps the anchored message in place after a prepend.
    pub fn finish_prepend(&mut self, after: ViewportMetrics) -> ScrollCommand {
        match self.prepend_anchor.take() {
            Some(before) => {
                let delta = after.scroll_height - before.scroll_height;
                ScrollCommand::ScrollTo(before.scroll_top + delta)
            }
            None => ScrollCommand::Stay,
        }
    }

    /// Every scroll tick.
    pub fn record_scroll(&mut self, conversation_id: &str, offset: f64) {
        self.saved.insert(conversation_id.to_string(), offset);
    }

    /// Conversation switch or unmount: save the outgoing offset and flush.
    pub fn switch_to(&mut self, next: Option<&str>, current_offset: Option<f64>) -> Result<()> {
        if let (Some(active), Some(offset)) = (self.active.take(), current_offset) {
            self.saved.insert(active, offset);
        }
        self.active = next.map(String::from);
        self.prepend_anchor = None;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.storage else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string(&self.saved)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics(top: f64, height: f64) -> ViewportMetrics {
        ViewportMetrics {
            scroll_top: top,
            scroll_height: height,
            client_height: 500.0,
        }
    }

    #[test]
    fn test_first_load_pins_or_restores() {
        let mut vp = ViewportController::new(80.0);
        assert_eq!(vp.on_first_load("c1"), ScrollCommand::PinToBottom);

        vp.record_scroll("c2", 320.0);
        assert_eq!(vp.on_first_load("c2"), ScrollCommand::ScrollTo(320.0));
    }

    #[test]
    fn test_near_bottom_repins() {
        let mut vp = ViewportController::new(80.0);
        vp.before_change(metrics(1450.0, 2000.0));
        assert_eq!(vp.after_change(false), ScrollCommand::PinToBottom);
    }

    #[test]
    fn test_scrolled_up_stays_unless_own_message() {
        let mut vp = ViewportController::new(80.0);
        vp.before_change(metrics(200.0, 2000.0));
        assert_eq!(vp.after_change(false), ScrollCommand::Stay);
        assert_eq!(vp.after_change(true), ScrollCommand::PinToBottom);
    }

    #[test]
    fn test_prepend_keeps_anchor() {
        let mut vp = ViewportController::new(80.0);
        vp.begin_prepend(metrics(10.0, 2000.0));
        assert_eq!(
            vp.finish_prepend(metrics(10.0, 2600.0)),
            ScrollCommand::ScrollTo(610.0)
        );
        assert_eq!(vp.finish_prepend(metrics(10.0, 2600.0)), ScrollCommand::Stay);
    }

    #[test]
    fn test_switch_persists_offsets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scroll.json");
        {
            let mut vp = ViewportController::with_storage(80.0, &path);
            vp.on_first_load("c1");
            vp.switch_to(Some("c2"), Some(140.0)).unwrap();
            assert_eq!(vp.active(), Some("c2"));
        }
        let vp = ViewportController::with_storage(80.0, &path);
        assert_eq!(vp.saved_offset("c1"), Some(140.0));
    }
}
