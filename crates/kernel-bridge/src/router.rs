//! Per-process iopub consumer that attributes kernel output to cells.
//!
//! One router task runs for each kernel process. The session feeds it the
//! requests it sends (in submission order) over a command channel; the
//! router owns the correlator and the queue of drains, so nothing else
//! ever reads the iopub stream.
//!
//! While a drain is pending every poll is bounded by `poll_timeout`. A poll
//! that times out fails the oldest drain with `NoResponseTimeout` but keeps
//! its mapping, so late output still lands on the right cell. With nothing
//! pending the router waits without a bound and only routes stragglers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::correlator::{ExecutionCorrelator, ExecutionRequest};
use crate::error::{KernelError, Result};
use crate::protocol::{CellOutput, ProtocolMessage};
use crate::session::LifecycleState;
use crate::sink::UiSink;
use crate::transport::OutputChannel;
use crate::{NotebookId, RequestId};

/// Commands from the owning session.
#[derive(Debug)]
pub enum RouterCommand {
    /// Start tracking a request; drained after every earlier request.
    Track(ExecutionRequest),
    /// The request never made it onto the wire.
    Abandon(RequestId),
}

/// Session-side handle to a running router task.
///
/// Dropping the handle aborts the task.
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterCommand>,
    pending: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Register a request before it is sent so no output can outrun it.
    pub fn track(&self, request: ExecutionRequest) -> Result<()> {
        self.tx
            .send(RouterCommand::Track(request))
            .map_err(|_| KernelError::TransportError("output channel is closed".to_string()))
    }

    pub fn abandon(&self, request_id: RequestId) {
        let _ = self.tx.send(RouterCommand::Abandon(request_id));
    }

    /// Number of requests whose drain has not finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// True once the router has stopped (output channel closed).
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Consumes one kernel process's iopub stream.
pub struct MessageRouter {
    notebook_id: NotebookId,
    outputs: OutputChannel,
    commands: mpsc::UnboundedReceiver<RouterCommand>,
    correlator: ExecutionCorrelator,
    drains: VecDeque<ExecutionRequest>,
    pending: Arc<AtomicUsize>,
    sink: UiSink,
    poll_timeout: Duration,
    state: Arc<watch::Sender<LifecycleState>>,
}

enum Polled {
    Message(ProtocolMessage),
    TimedOut,
    Closed,
}

async fn poll(outputs: &mut OutputChannel, bound: Option<Duration>) -> Polled {
    let next = match bound {
        Some(bound) => match tokio::time::timeout(bound, outputs.recv()).await {
            Ok(next) => next,
            Err(_) => return Polled::TimedOut,
        },
        None => outputs.recv().await,
    };
    match next {
        Some(message) => Polled::Message(message),
        None => Polled::Closed,
    }
}

impl MessageRouter {
    /// Spawn the router task for a freshly launched kernel.
    pub fn spawn(
        notebook_id: NotebookId,
        outputs: OutputChannel,
        sink: UiSink,
        poll_timeout: Duration,
        state: Arc<watch::Sender<LifecycleState>>,
    ) -> RouterHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let router = MessageRouter {
            notebook_id,
            outputs,
            commands,
            correlator: ExecutionCorrelator::new(),
            drains: VecDeque::new(),
            pending: pending.clone(),
            sink,
            poll_timeout,
            state,
        };
        let task = tokio::spawn(router.run());
        RouterHandle { tx, pending, task }
    }

    async fn run(mut self) {
        debug!("[router] Started for {}", self.notebook_id);
        loop {
            let bound = (!self.drains.is_empty()).then_some(self.poll_timeout);
            tokio::select! {
                // Commands first: a request is always tracked before its output is read
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                polled = poll(&mut self.outputs, bound) => match polled {
                    Polled::Message(message) => self.route(message),
                    Polled::TimedOut => self.fail_oldest_drain(),
                    Polled::Closed => {
                        self.channel_closed();
                        break;
                    }
                },
            }
        }
        debug!("[router] Stopped for {}", self.notebook_id);
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Track(request) => {
                let superseded = self.correlator.record(request.clone());
                if !superseded.is_empty() {
                    debug!(
                        "[router] cell {} re-run, dropping {:?}",
                        request.cell_id, superseded
                    );
                    // Their idle still arrives but no longer ends anything
                    self.drains.retain(|r| !superseded.contains(&r.request_id));
                }
                self.drains.push_back(request);
                self.mark_busy();
            }
            RouterCommand::Abandon(request_id) => {
                self.correlator.forget(&request_id);
                self.drains.retain(|r| r.request_id != request_id);
                if self.drains.is_empty() {
                    self.mark_ready();
                }
            }
        }
        self.publish_pending();
    }

    fn route(&mut self, message: ProtocolMessage) {
        let kind = message.content.kind();
        let Some(parent_id) = message.parent_id.clone() else {
            debug!("[router] Dropping {} without parent header", kind);
            return;
        };
        let idle = message.is_idle();

        match self.correlator.resolve(&parent_id).cloned() {
            Some(cell_id) => {
                debug!(
                    "[router] {} for cell {} (msg_id={})",
                    kind, cell_id, parent_id
                );
                self.sink.output(
                    &self.notebook_id,
                    CellOutput {
                        cell_id,
                        output: message.normalize(),
                    },
                );
            }
            None => {
                debug!("[router] Dropping {} for untracked msg_id={}", kind, parent_id);
            }
        }

        if idle {
            self.finish(&parent_id);
        }
    }

    /// The kernel went idle for `request_id`: its output is complete.
    fn finish(&mut self, request_id: &str) {
        self.correlator.forget(request_id);
        if let Some(pos) = self.drains.iter().position(|r| r.request_id == request_id) {
            if let Some(request) = self.drains.remove(pos) {
                info!(
                    "[router] Execution done: cell={} msg_id={}",
                    request.cell_id, request.request_id
                );
            }
        }
        self.publish_pending();
        if self.drains.is_empty() {
            self.mark_ready();
        }
    }

    fn fail_oldest_drain(&mut self) {
        let Some(request) = self.drains.pop_front() else {
            return;
        };
        warn!(
            "[router] No iopub message within {:?}, giving up on cell={} msg_id={}",
            self.poll_timeout, request.cell_id, request.request_id
        );
        self.sink.error(
            &self.notebook_id,
            Some(&request.cell_id),
            &KernelError::NoResponseTimeout(self.poll_timeout),
        );
        self.publish_pending();
    }

    fn channel_closed(&mut self) {
        error!("[router] iopub channel closed for {}", self.notebook_id);
        let abandoned: Vec<ExecutionRequest> = self.drains.drain(..).collect();
        if abandoned.is_empty() {
            self.sink
                .error(&self.notebook_id, None, &KernelError::ChannelClosed);
        }
        for request in abandoned {
            self.sink.error(
                &self.notebook_id,
                Some(&request.cell_id),
                &KernelError::ChannelClosed,
            );
        }
        self.correlator.clear();
        self.publish_pending();
        self.state.send_replace(LifecycleState::Terminated);
    }

    fn mark_busy(&self) {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Ready {
                *state = LifecycleState::Busy;
                true
            } else {
                false
            }
        });
    }

    fn mark_ready(&self) {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Busy {
                *state = LifecycleState::Ready;
                true
            } else {
                false
            }
        });
    }

    fn publish_pending(&self) {
        self.pending.store(self.drains.len(), Ordering::Relaxed);
    }
}
