//! In-process fake kernels for driving sessions without Jupyter installed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use kernel_bridge::kernelspec::{InterruptMode, KernelSpecInfo};
use kernel_bridge::protocol::{ExecutionState, MessageContent, MimeBundle, StreamName};
use kernel_bridge::transport::{
    KernelLauncher, KernelProcess, KernelTransport, LaunchedKernel, OutputChannel,
};
use kernel_bridge::{BridgeConfig, KernelError, ProtocolMessage, Result, UiEvent, UiEvents};
use tokio::sync::{mpsc, watch};

/// Config with short timeouts so failure paths finish quickly.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        startup_timeout: Duration::from_secs(2),
        poll_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(100),
        connection_dir: std::env::temp_dir(),
        ..Default::default()
    }
}

/// What the fake kernel has been asked to run.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub msg_id: String,
    pub code: String,
}

struct KernelState {
    sent: Mutex<Vec<SentRequest>>,
    iopub: Mutex<Option<mpsc::Sender<ProtocolMessage>>>,
    alive: watch::Sender<bool>,
    execution_count: AtomicUsize,
    interrupts: AtomicUsize,
    shutdown_requests: AtomicUsize,
    kills: AtomicUsize,
    auto_reply: AtomicBool,
    exit_on_shutdown: AtomicBool,
    fail_sends: AtomicBool,
}

/// Control handle for one launched fake kernel.
#[derive(Clone)]
pub struct FakeKernel(Arc<KernelState>);

impl FakeKernel {
    fn new(iopub: mpsc::Sender<ProtocolMessage>, auto_reply: bool) -> Self {
        let (alive, _) = watch::channel(true);
        Self(Arc::new(KernelState {
            sent: Mutex::new(Vec::new()),
            iopub: Mutex::new(Some(iopub)),
            alive,
            execution_count: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            shutdown_requests: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            auto_reply: AtomicBool::new(auto_reply),
            exit_on_shutdown: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        }))
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.0.sent.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.0.interrupts.load(Ordering::SeqCst)
    }

    pub fn shutdown_requests(&self) -> usize {
        self.0.shutdown_requests.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.0.kills.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        *self.0.alive.borrow()
    }

    /// Keep running after `shutdown_request`, forcing a kill.
    pub fn ignore_shutdown(&self) {
        self.0.exit_on_shutdown.store(false, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.0.fail_sends.store(true, Ordering::SeqCst);
    }

    fn iopub(&self) -> Option<mpsc::Sender<ProtocolMessage>> {
        self.0.iopub.lock().unwrap().clone()
    }

    /// Publish a message on iopub.
    pub async fn emit(&self, message: ProtocolMessage) {
        if let Some(iopub) = self.iopub() {
            let _ = iopub.send(message).await;
        }
    }

    /// Close iopub while the process keeps running.
    pub fn close_iopub(&self) {
        self.0.iopub.lock().unwrap().take();
    }

    /// Process exits: iopub closes with it.
    pub fn crash(&self) {
        self.0.alive.send_replace(false);
        self.close_iopub();
    }

    /// Outputs a real kernel would publish for `code`.
    fn replies_for(&self, msg_id: &str, code: &str) -> Vec<ProtocolMessage> {
        let count = self.0.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut replies = vec![
            status(msg_id, ExecutionState::Busy),
            ProtocolMessage::new(
                msg_id,
                MessageContent::ExecuteInput {
                    code: code.to_string(),
                    execution_count: count,
                },
            ),
        ];
        if code == "1+1" {
            replies.push(execute_result(msg_id, "2", count));
        } else if let Some(ename) = code.strip_prefix("raise ") {
            replies.push(ProtocolMessage::new(
                msg_id,
                MessageContent::Error {
                    ename: ename.to_string(),
                    evalue: "boom".to_string(),
                    traceback: vec![format!("{ename}: boom")],
                },
            ));
        } else {
            replies.push(stream(msg_id, code));
        }
        replies.push(status(msg_id, ExecutionState::Idle));
        replies
    }
}

pub fn status(parent: &str, execution_state: ExecutionState) -> ProtocolMessage {
    ProtocolMessage::new(parent, MessageContent::Status { execution_state })
}

pub fn stream(parent: &str, text: &str) -> ProtocolMessage {
    ProtocolMessage::new(
        parent,
        MessageContent::Stream {
            name: StreamName::Stdout,
            text: text.to_string(),
        },
    )
}

pub fn execute_result(parent: &str, text: &str, execution_count: usize) -> ProtocolMessage {
    let mut data = MimeBundle::new();
    data.insert("text/plain".to_string(), serde_json::json!(text));
    ProtocolMessage::new(
        parent,
        MessageContent::ExecuteResult {
            data,
            execution_count,
        },
    )
}

struct FakeTransport {
    kernel: FakeKernel,
}

#[async_trait]
impl KernelTransport for FakeTransport {
    async fn send_shell(&mut self, message: JupyterMessage) -> Result<()> {
        if self.kernel.0.fail_sends.load(Ordering::SeqCst) {
            return Err(KernelError::TransportError("shell socket closed".to_string()));
        }
        let JupyterMessageContent::ExecuteRequest(request) = &message.content else {
            return Ok(());
        };
        let msg_id = message.header.msg_id.clone();
        self.kernel.0.sent.lock().unwrap().push(SentRequest {
            msg_id: msg_id.clone(),
            code: request.code.clone(),
        });
        if self.kernel.0.auto_reply.load(Ordering::SeqCst) {
            for reply in self.kernel.replies_for(&msg_id, &request.code) {
                self.kernel.emit(reply).await;
            }
        }
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.kernel.0.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_shutdown(&mut self) -> Result<()> {
        self.kernel.0.shutdown_requests.fetch_add(1, Ordering::SeqCst);
        if self.kernel.0.exit_on_shutdown.load(Ordering::SeqCst) {
            self.kernel.crash();
        }
        Ok(())
    }
}

struct FakeProcess {
    kernel: FakeKernel,
}

#[async_trait]
impl KernelProcess for FakeProcess {
    fn is_alive(&mut self) -> bool {
        self.kernel.is_alive()
    }

    async fn wait(&mut self) -> Result<()> {
        let mut alive = self.kernel.0.alive.subscribe();
        alive
            .wait_for(|alive| !*alive)
            .await
            .map(|_| ())
            .map_err(|e| KernelError::TransportError(e.to_string()))
    }

    async fn kill(&mut self) -> Result<()> {
        self.kernel.0.kills.fetch_add(1, Ordering::SeqCst);
        self.kernel.crash();
        Ok(())
    }
}

/// Launches fake kernels and keeps a control handle for each.
pub struct FakeLauncher {
    launches: AtomicUsize,
    kernels: Mutex<Vec<FakeKernel>>,
    working_dirs: Mutex<Vec<Option<PathBuf>>>,
    launch_delay: Duration,
    fail: bool,
    hang: bool,
    auto_reply: bool,
}

impl FakeLauncher {
    /// Kernels that answer every execute_request immediately.
    pub fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            kernels: Mutex::new(Vec::new()),
            working_dirs: Mutex::new(Vec::new()),
            launch_delay: Duration::ZERO,
            fail: false,
            hang: false,
            auto_reply: true,
        }
    }

    /// Kernels that publish nothing unless the test emits it.
    pub fn silent() -> Self {
        Self {
            auto_reply: false,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kernel(&self, index: usize) -> FakeKernel {
        self.kernels.lock().unwrap()[index].clone()
    }

    pub fn last_kernel(&self) -> FakeKernel {
        self.kernels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no kernel launched")
    }

    pub fn last_working_dir(&self) -> Option<PathBuf> {
        self.working_dirs.lock().unwrap().last().cloned().flatten()
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

fn known_spec(spec_id: &str) -> Option<KernelSpecInfo> {
    match spec_id {
        "python3" => Some(KernelSpecInfo::new("python3", "python")),
        "deno" => Some(KernelSpecInfo {
            display_name: "Deno".to_string(),
            interrupt_mode: InterruptMode::Message,
            ..KernelSpecInfo::new("deno", "typescript")
        }),
        _ => None,
    }
}

#[async_trait]
impl KernelLauncher for FakeLauncher {
    async fn resolve(&self, spec_id: &str) -> Result<KernelSpecInfo> {
        known_spec(spec_id).ok_or_else(|| KernelError::UnknownKernelSpec(spec_id.to_string()))
    }

    async fn list(&self) -> Vec<KernelSpecInfo> {
        ["deno", "python3"].into_iter().filter_map(known_spec).collect()
    }

    async fn launch(
        &self,
        _spec: &KernelSpecInfo,
        working_dir: Option<&Path>,
    ) -> Result<LaunchedKernel> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.working_dirs
            .lock()
            .unwrap()
            .push(working_dir.map(Path::to_path_buf));
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(KernelError::StartupFailure(
                "kernel exited during startup".to_string(),
            ));
        }

        let (iopub, outputs) = OutputChannel::pair(256);
        let kernel = FakeKernel::new(iopub, self.auto_reply);
        self.kernels.lock().unwrap().push(kernel.clone());
        Ok(LaunchedKernel {
            transport: Box::new(FakeTransport {
                kernel: kernel.clone(),
            }),
            outputs,
            process: Box::new(FakeProcess { kernel }),
        })
    }
}

/// Next UI event, failing the test if none arrives within two seconds.
pub async fn next_event(events: &mut UiEvents) -> UiEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for UI event")
        .expect("UI sink closed")
}

/// Collect events until `done` matches one (inclusive).
pub async fn events_until(events: &mut UiEvents, done: impl Fn(&UiEvent) -> bool) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// True for the idle status that closes a cell's output.
pub fn is_idle_output(event: &UiEvent) -> bool {
    matches!(
        event,
        UiEvent::Output { output, .. }
            if output.output
                == kernel_bridge::protocol::NormalizedOutput::Status {
                    execution_state: ExecutionState::Idle
                }
    )
}
