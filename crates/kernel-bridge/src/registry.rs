//! Notebook id → session map.
//!
//! Each notebook gets a slot holding a `OnceCell`. Concurrent callers for
//! the same notebook share the slot, so only one of them resolves the spec
//! and launches; the rest wait for that launch and get the same session.
//! Different notebooks never contend beyond the brief map lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use log::{info, warn};
use tokio::sync::{watch, Mutex, MutexGuard, OnceCell};

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::kernelspec::KernelSpecInfo;
use crate::session::{KernelSession, LifecycleState};
use crate::sink::UiSink;
use crate::transport::KernelLauncher;
use crate::NotebookId;

/// Shared reference to a registered session.
///
/// State and spec can be read without taking the session lock.
#[derive(Clone)]
pub struct SessionHandle {
    notebook_id: NotebookId,
    spec: KernelSpecInfo,
    state: watch::Receiver<LifecycleState>,
    session: Arc<Mutex<KernelSession>>,
}

impl SessionHandle {
    fn new(session: KernelSession) -> Self {
        Self {
            notebook_id: session.notebook_id().to_string(),
            spec: session.spec().clone(),
            state: session.subscribe_state(),
            session: Arc::new(Mutex::new(session)),
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

    pub fn is_terminated(&self) -> bool {
        self.state() == LifecycleState::Terminated
    }

    /// Lock the session for a lifecycle operation.
    pub async fn lock(&self) -> MutexGuard<'_, KernelSession> {
        self.session.lock().await
    }
}

type Slot = Arc<OnceCell<SessionHandle>>;

/// At most one live session per notebook.
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<NotebookId, Slot>>,
    launcher: Arc<dyn KernelLauncher>,
    config: Arc<BridgeConfig>,
    sink: UiSink,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn KernelLauncher>, config: Arc<BridgeConfig>, sink: UiSink) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            launcher,
            config,
            sink,
        }
    }

    pub fn launcher(&self) -> &Arc<dyn KernelLauncher> {
        &self.launcher
    }

    fn sessions(&self) -> StdMutexGuard<'_, HashMap<NotebookId, Slot>> {
        // Nothing panics while holding the lock, but don't cascade if it does
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, notebook_id: &str) -> Slot {
        self.sessions()
            .entry(notebook_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop `slot` from the map unless it has already been replaced.
    fn evict(&self, notebook_id: &str, slot: &Slot) {
        let mut sessions = self.sessions();
        if sessions
            .get(notebook_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(notebook_id);
        }
    }

    /// The live session for `notebook_id`, started with `spec_id` (or the
    /// configured default kernel) if there is none.
    ///
    /// A terminated session is replaced. A failed start leaves nothing
    /// registered.
    pub async fn get_or_create(
        &self,
        notebook_id: &str,
        spec_id: Option<&str>,
    ) -> Result<SessionHandle> {
        let mut replaced = false;
        loop {
            let slot = self.slot(notebook_id);
            let result = slot
                .get_or_try_init(|| self.create(notebook_id, spec_id))
                .await;
            match result {
                Ok(handle) if handle.is_terminated() && !replaced => {
                    info!(
                        "[registry] Replacing terminated session for {}",
                        notebook_id
                    );
                    self.evict(notebook_id, &slot);
                    replaced = true;
                }
                Ok(handle) => return Ok(handle.clone()),
                Err(e) => {
                    self.evict(notebook_id, &slot);
                    return Err(e);
                }
            }
        }
    }

    async fn create(&self, notebook_id: &str, spec_id: Option<&str>) -> Result<SessionHandle> {
        let spec_id = spec_id.unwrap_or(&self.config.default_kernel);
        let spec = self.launcher.resolve(spec_id).await?;
        info!(
            "[registry] Creating {} session for {}",
            spec.name, notebook_id
        );
        let mut session = KernelSession::new(
            notebook_id,
            spec,
            self.launcher.clone(),
            self.config.clone(),
            self.sink.clone(),
        );
        if let Err(e) = session.start().await {
            warn!(
                "[registry] Session for {} failed to start: {}",
                notebook_id, e
            );
            return Err(e);
        }
        Ok(SessionHandle::new(session))
    }

    /// The registered session, if one has finished starting.
    pub fn get(&self, notebook_id: &str) -> Option<SessionHandle> {
        self.sessions()
            .get(notebook_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Unregister a session. The caller shuts it down.
    pub fn remove(&self, notebook_id: &str) -> Option<SessionHandle> {
        self.sessions()
            .remove(notebook_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Unregister every session.
    pub fn remove_all(&self) -> Vec<SessionHandle> {
        self.sessions()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }

    /// True while a session is registered or still starting.
    pub fn contains(&self, notebook_id: &str) -> bool {
        self.sessions().contains_key(notebook_id)
    }

    pub fn notebook_ids(&self) -> Vec<NotebookId> {
        let mut ids: Vec<NotebookId> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }
}
