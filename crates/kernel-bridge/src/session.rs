//! One kernel process (and its replacements) for one notebook.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use jupyter_protocol::{ExecuteRequest, JupyterMessage};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::BridgeConfig;
use crate::correlator::ExecutionRequest;
use crate::error::{KernelError, Result};
use crate::kernelspec::KernelSpecInfo;
use crate::router::{MessageRouter, RouterHandle};
use crate::sink::UiSink;
use crate::transport::{KernelLauncher, KernelProcess, KernelTransport, LaunchedKernel};
use crate::{CellId, NotebookId, RequestId};

/// Where a session is in its life.
///
/// `Uninitialized → Starting → Ready ⇄ Busy → ShuttingDown → Terminated`,
/// with `Restarting` re-entering `Starting` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Ready,
    Busy,
    Restarting,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    /// Whether `execute` is accepted in this state.
    pub fn accepts_execute(self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Busy)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::Busy => "busy",
            LifecycleState::Restarting => "restarting",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

struct RunningKernel {
    transport: Box<dyn KernelTransport>,
    process: Box<dyn KernelProcess>,
    router: RouterHandle,
}

/// A notebook's kernel: transport, process and the router reading its
/// iopub stream.
///
/// Lifecycle operations take `&mut self`; the registry wraps each session
/// in a mutex so commands for one notebook are applied in order.
pub struct KernelSession {
    notebook_id: NotebookId,
    spec: KernelSpecInfo,
    launcher: Arc<dyn KernelLauncher>,
    config: Arc<BridgeConfig>,
    sink: UiSink,
    state: Arc<watch::Sender<LifecycleState>>,
    kernel: Option<RunningKernel>,
}

impl KernelSession {
    pub fn new(
        notebook_id: impl Into<NotebookId>,
        spec: KernelSpecInfo,
        launcher: Arc<dyn KernelLauncher>,
        config: Arc<BridgeConfig>,
        sink: UiSink,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Self {
            notebook_id: notebook_id.into(),
            spec,
            launcher,
            config,
            sink,
            state: Arc::new(state),
            kernel: None,
        }
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub fn spec(&self) -> &KernelSpecInfo {
        &self.spec
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes without locking the session.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Requests sent to the current process whose output is still draining.
    pub fn pending_requests(&self) -> usize {
        self.kernel.as_ref().map_or(0, |k| k.router.pending())
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                "[session] {}: {} -> {}",
                self.notebook_id, previous, state
            );
        }
    }

    /// Kernels run next to the notebook file when it has a directory.
    fn working_dir(&self) -> Option<PathBuf> {
        Path::new(&self.notebook_id)
            .parent()
            .filter(|dir| dir.is_dir())
            .map(Path::to_path_buf)
    }

    /// Launch the kernel and wait until it is ready.
    pub async fn start(&mut self) -> Result<()> {
        if self.kernel.is_some() {
            return Err(KernelError::invalid_state("start", self.state()));
        }
        self.set_state(LifecycleState::Starting);
        info!(
            "[session] Starting {} kernel for {}",
            self.spec.name, self.notebook_id
        );

        let working_dir = self.working_dir();
        let startup_timeout = self.config.startup_timeout;
        let launch = self.launcher.launch(&self.spec, working_dir.as_deref());
        let launched = match tokio::time::timeout(startup_timeout, launch).await {
            Ok(Ok(launched)) => launched,
            Ok(Err(e)) => {
                error!(
                    "[session] Failed to start kernel for {}: {}",
                    self.notebook_id, e
                );
                self.set_state(LifecycleState::Terminated);
                return Err(match e {
                    KernelError::StartupFailure(_) => e,
                    other => KernelError::StartupFailure(other.to_string()),
                });
            }
            Err(_) => {
                error!(
                    "[session] Kernel for {} not ready after {:?}",
                    self.notebook_id, startup_timeout
                );
                self.set_state(LifecycleState::Terminated);
                return Err(KernelError::StartupTimeout(startup_timeout));
            }
        };

        let LaunchedKernel {
            transport,
            outputs,
            process,
        } = launched;
        let router = MessageRouter::spawn(
            self.notebook_id.clone(),
            outputs,
            self.sink.clone(),
            self.config.poll_timeout,
            self.state.clone(),
        );
        self.kernel = Some(RunningKernel {
            transport,
            process,
            router,
        });
        self.set_state(LifecycleState::Ready);
        info!("[session] Kernel ready for {}", self.notebook_id);
        Ok(())
    }

    /// Send `code` for `cell_id`. Returns the request id once the request
    /// is on the wire; outputs arrive through the UI sink.
    pub async fn execute(&mut self, cell_id: &str, code: &str) -> Result<RequestId> {
        let state = self.state();
        if !state.accepts_execute() {
            return Err(KernelError::invalid_state("execute", state));
        }
        let Some(kernel) = self.kernel.as_mut() else {
            return Err(KernelError::invalid_state("execute", state));
        };
        if !kernel.process.is_alive() || kernel.router.is_closed() {
            warn!("[session] Kernel for {} is gone", self.notebook_id);
            self.state.send_replace(LifecycleState::Terminated);
            return Err(KernelError::TransportError(
                "kernel process is not running".to_string(),
            ));
        }

        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let request_id = message.header.msg_id.clone();
        let cell_id: CellId = cell_id.to_string();

        // No router means nothing would ever drain this request
        if let Err(e) = kernel
            .router
            .track(ExecutionRequest::new(request_id.clone(), cell_id.clone()))
        {
            error!("[session] Router for {} is gone", self.notebook_id);
            self.state.send_replace(LifecycleState::Terminated);
            return Err(e);
        }
        self.state.send_replace(LifecycleState::Busy);
        if let Err(e) = kernel.transport.send_shell(message).await {
            error!(
                "[session] Failed to send execute_request for cell {}: {}",
                cell_id, e
            );
            kernel.router.abandon(request_id);
            return Err(e);
        }

        info!(
            "[session] Sent execute_request: msg_id={} cell_id={}",
            request_id, cell_id
        );
        Ok(request_id)
    }

    /// Interrupt the running cell. Does nothing unless the kernel is busy.
    pub async fn interrupt(&mut self) -> Result<()> {
        if self.state() != LifecycleState::Busy {
            debug!(
                "[session] Interrupt ignored for {}: kernel is {}",
                self.notebook_id,
                self.state()
            );
            return Ok(());
        }
        match self.kernel.as_mut() {
            Some(kernel) => kernel.transport.interrupt().await,
            None => Ok(()),
        }
    }

    /// Replace the kernel process with a fresh one.
    ///
    /// Every request id issued to the old process is dropped along with its
    /// router; the new process starts with an empty correlator.
    pub async fn restart(&mut self) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            LifecycleState::ShuttingDown | LifecycleState::Terminated
        ) {
            return Err(KernelError::invalid_state("restart", state));
        }
        info!("[session] Restarting kernel for {}", self.notebook_id);
        self.set_state(LifecycleState::Restarting);
        if let Some(kernel) = self.kernel.take() {
            self.stop(kernel).await;
        }
        self.start().await
    }

    /// Shut the kernel down. Idempotent.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state() == LifecycleState::Terminated && self.kernel.is_none() {
            return Ok(());
        }
        info!("[session] Shutting down kernel for {}", self.notebook_id);
        self.set_state(LifecycleState::ShuttingDown);
        if let Some(kernel) = self.kernel.take() {
            self.stop(kernel).await;
        }
        self.set_state(LifecycleState::Terminated);
        Ok(())
    }

    /// Abandon the router, ask the kernel to exit and kill it if it does
    /// not within the grace period.
    async fn stop(&self, kernel: RunningKernel) {
        let RunningKernel {
            mut transport,
            mut process,
            router,
        } = kernel;

        let abandoned = router.pending();
        if abandoned > 0 {
            info!(
                "[session] Abandoning {} in-flight request(s) for {}",
                abandoned, self.notebook_id
            );
        }
        drop(router);

        if process.is_alive() {
            if let Err(e) = transport.request_shutdown().await {
                warn!("[session] shutdown_request failed: {}", e);
            }
            let grace = self.config.shutdown_grace;
            if tokio::time::timeout(grace, process.wait()).await.is_err() {
                warn!(
                    "[session] Kernel for {} still running after {:?}, killing",
                    self.notebook_id, grace
                );
                if let Err(e) = process.kill().await {
                    error!("[session] Failed to kill kernel: {}", e);
                }
            }
        }
        drop(transport);
    }
}
