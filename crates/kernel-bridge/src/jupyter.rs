//! ZeroMQ transport for real Jupyter kernels.
//!
//! Launching a kernel follows the usual Jupyter dance: reserve five ports,
//! write a connection file, spawn the kernelspec's argv against it, then
//! connect iopub and shell and wait for a `kernel_info_reply`.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::bail;
use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, InterruptRequest, JupyterMessage, JupyterMessageContent, KernelInfoRequest,
    ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::kernelspec::{self, InterruptMode, KernelSpecInfo};
use crate::protocol::ProtocolMessage;
use crate::transport::{KernelLauncher, KernelProcess, KernelTransport, LaunchedKernel, OutputChannel};

/// Buffer between the iopub socket reader and the router.
const IOPUB_BUFFER: usize = 256;

/// Launches kernels from installed kernelspecs.
pub struct JupyterLauncher {
    connection_dir: PathBuf,
}

impl JupyterLauncher {
    pub fn new(connection_dir: PathBuf) -> Self {
        Self { connection_dir }
    }

    async fn launch_kernel(
        &self,
        spec: &KernelSpecInfo,
        working_dir: Option<&Path>,
    ) -> anyhow::Result<LaunchedKernel> {
        let kernelspec = runtimelib::find_kernelspec(&spec.name).await?;

        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let ports = runtimelib::peek_ports(ip, 5).await?;
        let connection_info = connection_info(ip, &ports, &spec.name)?;
        let connection_file = ConnectionFile::write(&self.connection_dir, &connection_info).await?;

        info!(
            "[jupyter] Starting {} kernel at {:?}",
            spec.name, connection_file.0
        );

        let mut cmd =
            kernelspec.command(&connection_file.0, Some(Stdio::null()), Some(Stdio::null()))?;
        cmd.current_dir(kernel_cwd(working_dir));

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.kill_on_drop(true).spawn()?;
        let mut process = ChildProcess::watch(child);

        let session_id = Uuid::new_v4().to_string();

        let iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Readiness: kernel_info round-trip, unless the process dies first
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        tokio::select! {
            reply = shell.read() => {
                let msg = reply?;
                info!("[jupyter] Kernel alive: got {} reply", msg.header.msg_type);
            }
            _ = process_exit(&mut process.exited) => {
                bail!("kernel process exited during startup");
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();

        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => match msg.content {
                        JupyterMessageContent::ExecuteReply(ref reply)
                            if reply.status != jupyter_protocol::ReplyStatus::Ok =>
                        {
                            debug!(
                                "[jupyter] execute_reply {:?} for {:?}",
                                reply.status,
                                msg.parent_header.as_ref().map(|h| &h.msg_id)
                            );
                        }
                        _ => {
                            debug!("[jupyter] shell reply: type={}", msg.header.msg_type);
                        }
                    },
                    Err(e) => {
                        error!("[jupyter] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        let outputs = spawn_iopub_reader(iopub, process.exited.clone());

        let transport = ZmqTransport {
            interrupt_mode: spec.interrupt_mode,
            pid: process.pid,
            connection_info,
            session_id,
            shell_writer,
            shell_reader_task,
            _connection_file: connection_file,
        };

        info!("[jupyter] Kernel started: {}", spec.name);
        Ok(LaunchedKernel {
            transport: Box::new(transport),
            outputs,
            process: Box::new(process),
        })
    }
}

#[async_trait]
impl KernelLauncher for JupyterLauncher {
    async fn resolve(&self, spec_id: &str) -> Result<KernelSpecInfo> {
        kernelspec::resolve(spec_id).await
    }

    async fn list(&self) -> Vec<KernelSpecInfo> {
        kernelspec::list_available().await
    }

    async fn launch(
        &self,
        spec: &KernelSpecInfo,
        working_dir: Option<&Path>,
    ) -> Result<LaunchedKernel> {
        self.launch_kernel(spec, working_dir)
            .await
            .map_err(|e| KernelError::StartupFailure(e.to_string()))
    }
}

/// Classify iopub traffic on a task so the router can poll with a timeout.
///
/// The channel closes when the socket errors or the kernel process exits.
fn spawn_iopub_reader(
    mut iopub: runtimelib::ClientIoPubConnection,
    mut exited: watch::Receiver<bool>,
) -> OutputChannel {
    let (tx, rx) = mpsc::channel(IOPUB_BUFFER);
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = iopub.read() => match result {
                    Ok(message) => {
                        debug!(
                            "[jupyter] iopub: type={} parent_msg_id={:?}",
                            message.header.msg_type,
                            message.parent_header.as_ref().map(|h| &h.msg_id)
                        );
                        let Some(classified) = ProtocolMessage::from_jupyter(&message) else {
                            continue;
                        };
                        if tx.send(classified).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[jupyter] iopub read error: {}", e);
                        break;
                    }
                },
                _ = process_exit(&mut exited) => {
                    warn!("[jupyter] Kernel process exited, closing iopub");
                    break;
                }
            }
        }
    });
    OutputChannel::with_reader(rx, reader)
}

/// Resolves once the kernel process has exited.
///
/// Returns `()` so no `watch::Ref` outlives the wait inside a `select!`.
async fn process_exit(exited: &mut watch::Receiver<bool>) {
    // A dropped sender means the waiter task is gone, which only happens on exit
    let _ = exited.wait_for(|exited| *exited).await;
}

/// Connection info for a kernel on `ip`, with a fresh HMAC key.
///
/// `ports` are stdin, control, heartbeat, shell, iopub.
fn connection_info(ip: IpAddr, ports: &[u16], kernel_name: &str) -> anyhow::Result<ConnectionInfo> {
    let &[stdin_port, control_port, hb_port, shell_port, iopub_port] = ports else {
        bail!("expected 5 ports, got {}", ports.len());
    };
    Ok(ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port,
        control_port,
        hb_port,
        shell_port,
        iopub_port,
        signature_scheme: "hmac-sha256".to_string(),
        key: Uuid::new_v4().to_string(),
        kernel_name: Some(kernel_name.to_string()),
    })
}

/// Kernels start next to the notebook; unsaved notebooks fall back to home.
fn kernel_cwd(working_dir: Option<&Path>) -> PathBuf {
    working_dir
        .map(Path::to_path_buf)
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
}

/// A connection file in the bridge's connection dir, removed on drop.
struct ConnectionFile(PathBuf);

impl ConnectionFile {
    async fn write(dir: &Path, info: &ConnectionInfo) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let name = petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let file = ConnectionFile(dir.join(format!("kernel-bridge-{}.json", name)));
        tokio::fs::write(&file.0, serde_json::to_string_pretty(info)?).await?;
        Ok(file)
    }
}

impl Drop for ConnectionFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct ZmqTransport {
    connection_info: ConnectionInfo,
    session_id: String,
    shell_writer: runtimelib::DealerSendConnection,
    shell_reader_task: JoinHandle<()>,
    interrupt_mode: InterruptMode,
    pid: Option<u32>,
    _connection_file: ConnectionFile,
}

impl ZmqTransport {
    async fn send_control(&self, message: JupyterMessage) -> anyhow::Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        control.send(message).await?;
        Ok(())
    }
}

fn transport_error(e: impl std::fmt::Display) -> KernelError {
    KernelError::TransportError(e.to_string())
}

#[async_trait]
impl KernelTransport for ZmqTransport {
    async fn send_shell(&mut self, message: JupyterMessage) -> Result<()> {
        self.shell_writer.send(message).await.map_err(transport_error)
    }

    async fn interrupt(&mut self) -> Result<()> {
        #[cfg(unix)]
        if self.interrupt_mode == InterruptMode::Signal {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(transport_error)?;
                info!("[jupyter] Sent SIGINT to kernel pid {}", pid);
                return Ok(());
            }
        }

        let request: JupyterMessage = InterruptRequest {}.into();
        self.send_control(request).await.map_err(transport_error)?;
        info!("[jupyter] Sent interrupt_request");
        Ok(())
    }

    async fn request_shutdown(&mut self) -> Result<()> {
        let request: JupyterMessage = ShutdownRequest { restart: false }.into();
        self.send_control(request).await.map_err(transport_error)
    }
}

impl Drop for ZmqTransport {
    fn drop(&mut self) {
        self.shell_reader_task.abort();
    }
}

/// A spawned kernel process, reaped by a waiter task.
///
/// The waiter owns the `Child`; liveness is published on a watch channel so
/// the iopub reader can close the output channel when the kernel dies.
struct ChildProcess {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
    waiter: JoinHandle<()>,
}

impl ChildProcess {
    fn watch(mut child: tokio::process::Child) -> Self {
        let pid = child.id();
        let (exited_tx, exited) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let waiter = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    info!("[jupyter] Kernel process exited: {:?}", status);
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("[jupyter] Failed to kill kernel process: {}", e);
                    }
                }
            }
            let _ = exited_tx.send(true);
        });
        Self {
            pid,
            exited,
            kill_tx: Some(kill_tx),
            waiter,
        }
    }

    #[cfg(unix)]
    fn kill_process_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pgid) = self.pid {
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!("[jupyter] Failed to kill process group {}: {}", pgid, e);
                }
            }
        }
    }
}

#[async_trait]
impl KernelProcess for ChildProcess {
    fn is_alive(&mut self) -> bool {
        !*self.exited.borrow()
    }

    async fn wait(&mut self) -> Result<()> {
        self.exited
            .wait_for(|exited| *exited)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }

    async fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        self.kill_process_group();

        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        self.wait().await
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.kill_process_group();
        // Dropping the child inside the waiter kills it (kill_on_drop)
        self.waiter.abort();
    }
}
