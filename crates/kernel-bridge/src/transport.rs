//! Seams between a session and the kernel it talks to.
//!
//! A launched kernel is three things: a request side (shell and control
//! sends), a broadcast side (classified iopub messages) and the process
//! itself. `jupyter.rs` implements these over ZeroMQ; tests substitute
//! in-process fakes.

use std::path::Path;

use async_trait::async_trait;
use jupyter_protocol::JupyterMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::kernelspec::KernelSpecInfo;
use crate::protocol::ProtocolMessage;

/// Request side of a kernel connection.
#[async_trait]
pub trait KernelTransport: Send + Sync {
    /// Send a request on the shell channel.
    async fn send_shell(&mut self, message: JupyterMessage) -> Result<()>;

    /// Interrupt whatever the kernel is running, using the kernel's
    /// declared interrupt mode.
    async fn interrupt(&mut self) -> Result<()>;

    /// Send `shutdown_request` on the control channel.
    async fn request_shutdown(&mut self) -> Result<()>;
}

/// The kernel subprocess.
#[async_trait]
pub trait KernelProcess: Send + Sync {
    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Wait until the process exits.
    async fn wait(&mut self) -> Result<()>;

    /// Terminate the process (and its process group, where supported).
    async fn kill(&mut self) -> Result<()>;
}

/// Receiving half of the broadcast (iopub) stream for one kernel process.
///
/// Backed by a channel so that a reader task can classify wire messages
/// while the router polls with a timeout. The reader task, if any, is
/// aborted when the channel is dropped.
pub struct OutputChannel {
    rx: mpsc::Receiver<ProtocolMessage>,
    reader: Option<JoinHandle<()>>,
}

impl OutputChannel {
    /// Create a channel pair with no reader task attached.
    pub fn pair(capacity: usize) -> (mpsc::Sender<ProtocolMessage>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx, reader: None })
    }

    /// Wrap a receiver fed by `reader`.
    pub fn with_reader(rx: mpsc::Receiver<ProtocolMessage>, reader: JoinHandle<()>) -> Self {
        Self {
            rx,
            reader: Some(reader),
        }
    }

    /// Next message, or `None` once the kernel side is gone.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        self.rx.recv().await
    }
}

impl Drop for OutputChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Everything produced by a successful launch.
pub struct LaunchedKernel {
    pub transport: Box<dyn KernelTransport>,
    pub outputs: OutputChannel,
    pub process: Box<dyn KernelProcess>,
}

/// Starts kernel processes from kernel specs.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Resolve a spec id to the spec used for launching.
    async fn resolve(&self, spec_id: &str) -> Result<KernelSpecInfo>;

    /// Every kernel spec this launcher can start.
    async fn list(&self) -> Vec<KernelSpecInfo>;

    /// Launch a kernel in `working_dir` and wait until it answers
    /// `kernel_info_request`.
    ///
    /// Callers bound this with the startup timeout.
    async fn launch(
        &self,
        spec: &KernelSpecInfo,
        working_dir: Option<&Path>,
    ) -> Result<LaunchedKernel>;
}
