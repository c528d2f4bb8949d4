//! Hand-off from kernel workers to the UI.
//!
//! Workers never touch UI state. They push `UiEvent`s onto an unbounded
//! queue and the UI drains it from its own loop, either by awaiting
//! [`UiEvents::recv`] or by polling [`UiEvents::drain`] once per tick.

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::KernelError;
use crate::protocol::CellOutput;
use crate::{CellId, NotebookId};

/// Something the UI should render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    /// An output for a cell (`onOutput`).
    Output {
        notebook_id: NotebookId,
        output: CellOutput,
    },
    /// A one-line failure notice (`onError`), attached to a cell when the
    /// failure concerns one.
    Error {
        notebook_id: NotebookId,
        #[serde(skip_serializing_if = "Option::is_none")]
        cell_id: Option<CellId>,
        message: String,
    },
}

/// Sending half, cloned into every session and router.
#[derive(Debug, Clone)]
pub struct UiSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

/// Receiving half, owned by the UI loop.
#[derive(Debug)]
pub struct UiEvents {
    rx: mpsc::UnboundedReceiver<UiEvent>,
}

/// Create a connected sink/receiver pair.
pub fn channel() -> (UiSink, UiEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UiSink { tx }, UiEvents { rx })
}

impl UiSink {
    pub fn output(&self, notebook_id: &str, output: CellOutput) {
        self.emit(UiEvent::Output {
            notebook_id: notebook_id.to_string(),
            output,
        });
    }

    pub fn error(&self, notebook_id: &str, cell_id: Option<&str>, error: &KernelError) {
        self.emit(UiEvent::Error {
            notebook_id: notebook_id.to_string(),
            cell_id: cell_id.map(str::to_string),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            debug!("[sink] UI receiver dropped, discarding event");
        }
    }
}

impl UiEvents {
    /// Wait for the next event. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<UiEvent> {
        self.rx.recv().await
    }

    /// Take everything queued right now without waiting.
    pub fn drain(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
