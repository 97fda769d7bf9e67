//! Window and pane collaborator.
//!
//! Geometry, rendering and pane splitting live outside this crate; the
//! session only needs to count windows, rebuild them from a host snapshot,
//! and reattach pane substreams after a fast restore.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::transport::PeerLink;

pub type WindowId = usize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    #[serde(default)]
    pub windows: Vec<WindowSnapshot>,
}

impl LayoutSnapshot {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub layout: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub active: bool,
}

pub trait Workspace: Send {
    fn window_count(&self) -> usize;

    /// Drops every window and pane.
    fn clear(&mut self);

    /// Adds a window. With `with_pane` the window gets a single pane
    /// covering the whole available area.
    fn add_window(&mut self, name: &str, with_pane: bool) -> WindowId;

    fn restore_window(&mut self, snapshot: &WindowSnapshot) -> WindowId;

    fn set_active_window(&mut self, id: WindowId);

    fn active_window(&self) -> Option<WindowId>;

    /// Reopens every pane's data substream on a freshly negotiated link.
    fn reopen_pane_channels(&mut self, link: Arc<dyn PeerLink>);

    fn focus(&mut self);

    fn dump(&self) -> LayoutSnapshot;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessWindow {
    pub name: String,
    pub layout: Value,
    pub panes: Vec<u64>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    windows: Vec<HeadlessWindow>,
    active: Option<WindowId>,
    next_pane: u64,
    focus_count: usize,
    reopen_count: usize,
}

impl HeadlessState {
    fn allocate_pane(&mut self) -> u64 {
        self.next_pane += 1;
        self.next_pane
    }
}

/// In-memory workspace used by the CLI and tests. Clones share state.
#[derive(Clone)]
pub struct HeadlessWorkspace {
    state: Arc<Mutex<HeadlessState>>,
    max_tabs: usize,
}

impl HeadlessWorkspace {
    pub fn new(max_tabs: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeadlessState::default())),
            max_tabs,
        }
    }

    /// User-initiated new tab; refused once `max_tabs` windows are open.
    pub fn new_tab(&mut self) -> Option<WindowId> {
        if self.window_count() >= self.max_tabs {
            debug!(max_tabs = self.max_tabs, "tab limit reached");
            return None;
        }
        let id = self.add_window("", true);
        self.set_active_window(id);
        Some(id)
    }

    pub fn windows(&self) -> Vec<HeadlessWindow> {
        self.state.lock().windows.clone()
    }

    pub fn pane_count(&self) -> usize {
        self.state
            .lock()
            .windows
            .iter()
            .map(|window| window.panes.len())
            .sum()
    }

    pub fn focus_count(&self) -> usize {
        self.state.lock().focus_count
    }

    pub fn reopen_count(&self) -> usize {
        self.state.lock().reopen_count
    }
}

impl Workspace for HeadlessWorkspace {
    fn window_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    fn clear(&mut self) {
        let mut state = self.state.lock();
        state.windows.clear();
        state.active = None;
    }

    fn add_window(&mut self, name: &str, with_pane: bool) -> WindowId {
        let mut state = self.state.lock();
        let panes = if with_pane {
            vec![state.allocate_pane()]
        } else {
            Vec::new()
        };
        let layout = match panes.first() {
            Some(pane) => json!({"dir": "TBD", "cells": [{"pane": pane, "sx": 1.0, "sy": 1.0}]}),
            None => Value::Null,
        };
        state.windows.push(HeadlessWindow {
            name: name.to_string(),
            layout,
            panes,
        });
        state.windows.len() - 1
    }

    fn restore_window(&mut self, snapshot: &WindowSnapshot) -> WindowId {
        let mut state = self.state.lock();
        let pane = state.allocate_pane();
        state.windows.push(HeadlessWindow {
            name: snapshot.name.clone(),
            layout: snapshot.layout.clone(),
            panes: vec![pane],
        });
        state.windows.len() - 1
    }

    fn set_active_window(&mut self, id: WindowId) {
        let mut state = self.state.lock();
        if id < state.windows.len() {
            state.active = Some(id);
        } else {
            warn!(window = id, "ignoring activation of unknown window");
        }
    }

    fn active_window(&self) -> Option<WindowId> {
        self.state.lock().active
    }

    fn reopen_pane_channels(&mut self, link: Arc<dyn PeerLink>) {
        let panes: Vec<u64> = {
            let mut state = self.state.lock();
            state.reopen_count += 1;
            state
                .windows
                .iter()
                .flat_map(|window| window.panes.iter().copied())
                .collect()
        };
        for pane in panes {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                let label = format!("pane-{pane}");
                if let Err(err) = link.open_channel(&label).await {
                    warn!(pane, error = %err, "failed to reopen pane channel");
                }
            });
        }
    }

    fn focus(&mut self) {
        self.state.lock().focus_count += 1;
    }

    fn dump(&self) -> LayoutSnapshot {
        let state = self.state.lock();
        LayoutSnapshot {
            windows: state
                .windows
                .iter()
                .enumerate()
                .map(|(idx, window)| WindowSnapshot {
                    name: window.name.clone(),
                    layout: window.layout.clone(),
                    active: state.active == Some(idx),
                })
                .collect(),
        }
    }
}
