//! Messages read from a kernel's iopub channel and their UI projection.
//!
//! The wire format is `jupyter_protocol::JupyterMessage`. Only the message
//! kinds that matter for cell outputs survive classification; everything
//! else (comm traffic, `clear_output`, `update_display_data`, ...) is
//! dropped at the transport boundary.

use std::collections::BTreeMap;

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use serde::{Deserialize, Serialize};

use crate::{CellId, RequestId};

/// Rendered data keyed by mime type (`text/plain`, `image/png`, ...).
pub type MimeBundle = BTreeMap<String, serde_json::Value>;

/// Kernel-reported execution state carried by `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    Restarting,
    Dead,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Starting => write!(f, "starting"),
            ExecutionState::Busy => write!(f, "busy"),
            ExecutionState::Idle => write!(f, "idle"),
            ExecutionState::Restarting => write!(f, "restarting"),
            ExecutionState::Dead => write!(f, "dead"),
        }
    }
}

impl From<&jupyter_protocol::ExecutionState> for ExecutionState {
    fn from(state: &jupyter_protocol::ExecutionState) -> Self {
        match state {
            jupyter_protocol::ExecutionState::Busy => ExecutionState::Busy,
            jupyter_protocol::ExecutionState::Idle => ExecutionState::Idle,
            jupyter_protocol::ExecutionState::Starting => ExecutionState::Starting,
            jupyter_protocol::ExecutionState::Restarting => ExecutionState::Restarting,
            _ => ExecutionState::Dead,
        }
    }
}

/// Which standard stream a `stream` message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Kind-specific payload of a classified iopub message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Status {
        execution_state: ExecutionState,
    },
    ExecuteInput {
        code: String,
        execution_count: usize,
    },
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        data: MimeBundle,
        execution_count: usize,
    },
    DisplayData {
        data: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl MessageContent {
    /// The Jupyter `msg_type` this content came from.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Status { .. } => "status",
            MessageContent::ExecuteInput { .. } => "execute_input",
            MessageContent::Stream { .. } => "stream",
            MessageContent::ExecuteResult { .. } => "execute_result",
            MessageContent::DisplayData { .. } => "display_data",
            MessageContent::Error { .. } => "error",
        }
    }
}

/// An iopub message reduced to its parent request id and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    /// `parent_header.msg_id`, if the kernel sent a parent header.
    pub parent_id: Option<RequestId>,
    pub content: MessageContent,
}

impl ProtocolMessage {
    pub fn new(parent_id: impl Into<RequestId>, content: MessageContent) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            content,
        }
    }

    /// Classify a wire message. Returns `None` for kinds that never become
    /// cell output.
    pub fn from_jupyter(message: &JupyterMessage) -> Option<Self> {
        let content = match &message.content {
            JupyterMessageContent::Status(status) => MessageContent::Status {
                execution_state: (&status.execution_state).into(),
            },
            JupyterMessageContent::ExecuteInput(input) => MessageContent::ExecuteInput {
                code: input.code.clone(),
                execution_count: input.execution_count.0,
            },
            JupyterMessageContent::StreamContent(stream) => MessageContent::Stream {
                name: match stream.name {
                    jupyter_protocol::Stdio::Stdout => StreamName::Stdout,
                    jupyter_protocol::Stdio::Stderr => StreamName::Stderr,
                },
                text: stream.text.clone(),
            },
            JupyterMessageContent::ExecuteResult(result) => MessageContent::ExecuteResult {
                data: mime_bundle(&result.data),
                execution_count: result.execution_count.0,
            },
            JupyterMessageContent::DisplayData(display) => MessageContent::DisplayData {
                data: mime_bundle(&display.data),
            },
            JupyterMessageContent::ErrorOutput(error) => MessageContent::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            },
            _ => return None,
        };

        Some(Self {
            parent_id: message.parent_header.as_ref().map(|h| h.msg_id.clone()),
            content,
        })
    }

    /// True for `status` with `execution_state: idle`.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.content,
            MessageContent::Status {
                execution_state: ExecutionState::Idle
            }
        )
    }

    /// Project onto what the UI renders.
    pub fn normalize(self) -> NormalizedOutput {
        match self.content {
            MessageContent::Status { execution_state } => {
                NormalizedOutput::Status { execution_state }
            }
            MessageContent::ExecuteInput {
                code,
                execution_count,
            } => NormalizedOutput::ExecuteInput {
                code,
                execution_count,
            },
            MessageContent::Stream { name, text } => NormalizedOutput::Stream { name, text },
            MessageContent::ExecuteResult {
                data,
                execution_count,
            } => NormalizedOutput::ExecuteResult {
                data,
                execution_count,
            },
            MessageContent::DisplayData { data } => NormalizedOutput::DisplayData { data },
            // evalue is already part of the rendered traceback
            MessageContent::Error {
                ename, traceback, ..
            } => NormalizedOutput::Error { ename, traceback },
        }
    }
}

/// Media bundles serialize as `{mime: payload}` maps.
fn mime_bundle(media: &jupyter_protocol::Media) -> MimeBundle {
    match serde_json::to_value(media) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => MimeBundle::new(),
    }
}

/// nbformat-shaped output handed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum NormalizedOutput {
    Status {
        execution_state: ExecutionState,
    },
    ExecuteInput {
        code: String,
        execution_count: usize,
    },
    Stream {
        name: StreamName,
        text: String,
    },
    ExecuteResult {
        data: MimeBundle,
        execution_count: usize,
    },
    DisplayData {
        data: MimeBundle,
    },
    Error {
        ename: String,
        traceback: Vec<String>,
    },
}

/// A normalized output attached to the cell it was resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellOutput {
    pub cell_id: CellId,
    #[serde(flatten)]
    pub output: NormalizedOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ErrorOutput, ExecuteRequest, Status, StreamContent};
    use serde_json::json;

    fn parent() -> JupyterMessage {
        ExecuteRequest::new("1+1".to_string()).into()
    }

    #[test]
    fn test_classifies_idle_status() {
        let parent = parent();
        let message = Status {
            execution_state: jupyter_protocol::ExecutionState::Idle,
        }
        .as_child_of(&parent);

        let classified = ProtocolMessage::from_jupyter(&message).unwrap();
        assert_eq!(classified.parent_id.as_deref(), Some(parent.header.msg_id.as_str()));
        assert!(classified.is_idle());
    }

    #[test]
    fn test_classifies_stream() {
        let parent = parent();
        let message = StreamContent {
            name: jupyter_protocol::Stdio::Stderr,
            text: "warning\n".to_string(),
        }
        .as_child_of(&parent);

        let classified = ProtocolMessage::from_jupyter(&message).unwrap();
        assert_eq!(
            classified.content,
            MessageContent::Stream {
                name: StreamName::Stderr,
                text: "warning\n".to_string()
            }
        );
        assert!(!classified.is_idle());
    }

    #[test]
    fn test_error_keeps_name_and_traceback_only() {
        let parent = parent();
        let message = ErrorOutput {
            ename: "ZeroDivisionError".to_string(),
            evalue: "division by zero".to_string(),
            traceback: vec!["line 1".to_string(), "line 2".to_string()],
        }
        .as_child_of(&parent);

        let output = ProtocolMessage::from_jupyter(&message).unwrap().normalize();
        assert_eq!(
            output,
            NormalizedOutput::Error {
                ename: "ZeroDivisionError".to_string(),
                traceback: vec!["line 1".to_string(), "line 2".to_string()],
            }
        );
    }

    #[test]
    fn test_unrouted_kinds_are_not_classified() {
        let message: JupyterMessage = jupyter_protocol::KernelInfoRequest::default().into();
        assert!(ProtocolMessage::from_jupyter(&message).is_none());
    }

    #[test]
    fn test_cell_output_serializes_like_nbformat() {
        let mut data = MimeBundle::new();
        data.insert("text/plain".to_string(), json!("2"));
        let output = CellOutput {
            cell_id: "3".to_string(),
            output: NormalizedOutput::ExecuteResult {
                data,
                execution_count: 1,
            },
        };

        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(
            value,
            json!({
                "cell_id": "3",
                "output_type": "execute_result",
                "data": {"text/plain": "2"},
                "execution_count": 1
            })
        );
    }

    #[test]
    fn test_status_normalizes_to_state_only() {
        let message = ProtocolMessage::new(
            "req-1",
            MessageContent::Status {
                execution_state: ExecutionState::Busy,
            },
        );
        let value = serde_json::to_value(message.normalize()).unwrap();
        assert_eq!(value, json!({"output_type": "status", "execution_state": "busy"}));
    }

    #[test]
    fn test_execution_state_display() {
        assert_eq!(ExecutionState::Idle.to_string(), "idle");
        assert_eq!(ExecutionState::Busy.to_string(), "busy");
        assert_eq!(ExecutionState::Dead.to_string(), "dead");
    }
}
