//! kernel-bridge - Jupyter kernels for editor-hosted notebooks.
//!
//! Each open notebook document gets at most one kernel session. Cells are
//! sent to the session's kernel for execution and everything the kernel
//! broadcasts on iopub is routed back to the cell that triggered it, then
//! handed to the UI through an event queue the UI drains on its own loop.
//!
//! ```text
//! UI ──► KernelBridge ──► SessionRegistry ──► KernelSession ──► shell
//!  ▲                                             │
//!  │                                  ExecutionCorrelator
//!  │                                             │
//!  └──── UiEvents ◄──── MessageRouter ◄──────── iopub
//! ```
//!
//! The router is a single task per kernel process. Drains are serialized per
//! session; sessions for different notebooks run fully in parallel.

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod error;
pub mod jupyter;
pub mod kernelspec;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod sink;
pub mod transport;

pub use bridge::KernelBridge;
pub use config::{BridgeConfig, SessionMode};
pub use error::{KernelError, Result};
pub use kernelspec::KernelSpecInfo;
pub use protocol::{CellOutput, ExecutionState, MessageContent, ProtocolMessage};
pub use registry::SessionRegistry;
pub use session::{KernelSession, LifecycleState};
pub use sink::{UiEvent, UiEvents, UiSink};

/// Key identifying an open notebook document (its path, in practice).
pub type NotebookId = String;

/// Identifier of a cell within a notebook.
pub type CellId = String;

/// The `msg_id` of an `execute_request`; parent id of everything it causes.
pub type RequestId = String;
