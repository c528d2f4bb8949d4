//! The command surface the UI layer calls.
//!
//! Every command is safe to run on a worker task; none of them touch UI
//! state. Failures are returned to the caller and also reported once on
//! the UI sink, attached to the cell when there is one.

use std::sync::Arc;

use log::{info, warn};

use crate::config::{BridgeConfig, SessionMode};
use crate::error::{KernelError, Result};
use crate::jupyter::JupyterLauncher;
use crate::kernelspec::KernelSpecInfo;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::LifecycleState;
use crate::sink::UiSink;
use crate::transport::KernelLauncher;
use crate::RequestId;

pub struct KernelBridge {
    registry: SessionRegistry,
    config: Arc<BridgeConfig>,
    sink: UiSink,
}

impl KernelBridge {
    pub fn new(config: BridgeConfig, launcher: Arc<dyn KernelLauncher>, sink: UiSink) -> Self {
        let config = Arc::new(config);
        Self {
            registry: SessionRegistry::new(launcher, config.clone(), sink.clone()),
            config,
            sink,
        }
    }

    /// A bridge that launches real Jupyter kernels from installed kernelspecs.
    pub fn jupyter(config: BridgeConfig, sink: UiSink) -> Self {
        let launcher = Arc::new(JupyterLauncher::new(config.connection_dir.clone()));
        Self::new(config, launcher, sink)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn report<T>(&self, notebook_id: &str, cell_id: Option<&str>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("[bridge] {}: {}", notebook_id, e);
            self.sink.error(notebook_id, cell_id, e);
        }
        result
    }

    /// Start a session for `notebook_id` running `spec_id`.
    ///
    /// An existing live session with the same spec is kept; one with a
    /// different spec is shut down and replaced.
    pub async fn initialize_session(
        &self,
        notebook_id: &str,
        spec_id: &str,
    ) -> Result<KernelSpecInfo> {
        let result = self.try_initialize(notebook_id, spec_id).await;
        self.report(notebook_id, None, result)
    }

    async fn try_initialize(&self, notebook_id: &str, spec_id: &str) -> Result<KernelSpecInfo> {
        let spec = self.registry.launcher().resolve(spec_id).await?;
        if let Some(existing) = self.registry.get(notebook_id) {
            if !existing.is_terminated() && existing.spec().name == spec.name {
                info!(
                    "[bridge] {} already has a {} session",
                    notebook_id, spec.name
                );
                return Ok(spec);
            }
            if let Some(old) = self.registry.remove(notebook_id) {
                info!(
                    "[bridge] Replacing {} session for {} with {}",
                    old.spec().name,
                    notebook_id,
                    spec.name
                );
                old.lock().await.shutdown().await?;
            }
        }
        let handle = self
            .registry
            .get_or_create(notebook_id, Some(&spec.name))
            .await?;
        Ok(handle.spec().clone())
    }

    /// Run `code` for `cell_id`. Returns once the request has been sent;
    /// outputs arrive on the UI sink.
    pub async fn execute(&self, notebook_id: &str, cell_id: &str, code: &str) -> Result<RequestId> {
        let result = self.try_execute(notebook_id, cell_id, code).await;
        self.report(notebook_id, Some(cell_id), result)
    }

    async fn try_execute(&self, notebook_id: &str, cell_id: &str, code: &str) -> Result<RequestId> {
        let handle = match self.registry.get(notebook_id) {
            Some(handle) if handle.is_terminated() => self.recreate(handle).await?,
            Some(handle) => handle,
            None => match self.config.session_mode {
                SessionMode::Lazy => self.registry.get_or_create(notebook_id, None).await?,
                SessionMode::Explicit => {
                    let state = if self.registry.contains(notebook_id) {
                        LifecycleState::Starting
                    } else {
                        LifecycleState::Uninitialized
                    };
                    return Err(KernelError::invalid_state("execute", state));
                }
            },
        };
        let mut session = handle.lock().await;
        session.execute(cell_id, code).await
    }

    /// A dead session comes back with the kernel it was started with.
    async fn recreate(&self, handle: SessionHandle) -> Result<SessionHandle> {
        info!(
            "[bridge] Session for {} terminated, starting a new {} kernel",
            handle.notebook_id(),
            handle.spec().name
        );
        self.registry
            .get_or_create(handle.notebook_id(), Some(&handle.spec().name))
            .await
    }

    /// Interrupt the running cell, if any.
    pub async fn interrupt(&self, notebook_id: &str) -> Result<()> {
        let result = match self.registry.get(notebook_id) {
            Some(handle) => handle.lock().await.interrupt().await,
            None => Ok(()),
        };
        self.report(notebook_id, None, result)
    }

    /// Restart the notebook's kernel. Outputs of requests sent before the
    /// restart are never delivered.
    pub async fn restart(&self, notebook_id: &str) -> Result<()> {
        let result = match self.registry.get(notebook_id) {
            Some(handle) if handle.is_terminated() => self.recreate(handle).await.map(|_| ()),
            Some(handle) => handle.lock().await.restart().await,
            None => Err(KernelError::NoSession(notebook_id.to_string())),
        };
        self.report(notebook_id, None, result)
    }

    /// Shut down and forget the notebook's session. No-op without one.
    pub async fn shutdown(&self, notebook_id: &str) -> Result<()> {
        let result = match self.registry.remove(notebook_id) {
            Some(handle) => handle.lock().await.shutdown().await,
            None => Ok(()),
        };
        self.report(notebook_id, None, result)
    }

    /// Kernel spec of the notebook's session.
    pub async fn get_spec(&self, notebook_id: &str) -> Result<KernelSpecInfo> {
        let result = self
            .registry
            .get(notebook_id)
            .map(|handle| handle.spec().clone())
            .ok_or_else(|| KernelError::NoSession(notebook_id.to_string()));
        self.report(notebook_id, None, result)
    }

    /// Lifecycle state of the notebook's session, if it has one.
    pub fn state(&self, notebook_id: &str) -> Option<LifecycleState> {
        self.registry.get(notebook_id).map(|handle| handle.state())
    }

    /// Outstanding requests for the notebook's current kernel.
    pub async fn pending_requests(&self, notebook_id: &str) -> usize {
        match self.registry.get(notebook_id) {
            Some(handle) => handle.lock().await.pending_requests(),
            None => 0,
        }
    }

    /// Kernel specs available to `initialize_session`.
    pub async fn list_kernels(&self) -> Vec<KernelSpecInfo> {
        self.registry.launcher().list().await
    }

    /// Shut every session down (host exit).
    pub async fn shutdown_all(&self) {
        for handle in self.registry.remove_all() {
            if let Err(e) = handle.lock().await.shutdown().await {
                warn!(
                    "[bridge] Failed to shut down {}: {}",
                    handle.notebook_id(),
                    e
                );
            }
        }
    }
}
