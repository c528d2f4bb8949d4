//! `kernel-bridge`: hosts notebook kernels for an editor over stdio.
//!
//! The editor writes one JSON command per line on stdin and reads JSON
//! events from stdout. Logs go to stderr.
//!
//! ```text
//! {"command":"initialize","notebook_id":"/work/a.ipynb","spec_id":"python3"}
//! {"command":"execute","notebook_id":"/work/a.ipynb","cell_id":"3","code":"1+1"}
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kernel_bridge::sink;
use kernel_bridge::{BridgeConfig, KernelBridge, KernelSpecInfo, NotebookId, SessionMode};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "kernel-bridge")]
#[command(about = "Jupyter kernels for notebook editors, over JSON lines on stdio")]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds a kernel gets to answer kernel_info after launch
    #[arg(long, default_value = "30")]
    startup_timeout: u64,

    /// Seconds without iopub traffic before a running cell is reported as unresponsive
    #[arg(long, default_value = "5")]
    poll_timeout: u64,

    /// Seconds a kernel gets to exit after shutdown_request before it is killed
    #[arg(long, default_value = "2")]
    shutdown_grace: u64,

    /// explicit: cells fail until "initialize"; lazy: first execute starts the default kernel
    #[arg(long, default_value = "explicit")]
    session_mode: SessionMode,

    /// Kernelspec used for lazily created sessions
    #[arg(long, default_value = "python3")]
    default_kernel: String,

    /// Directory for kernel connection files (default: Jupyter runtime dir)
    #[arg(long)]
    connection_dir: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            startup_timeout: Duration::from_secs(self.startup_timeout),
            poll_timeout: Duration::from_secs(self.poll_timeout),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
            session_mode: self.session_mode,
            default_kernel: self.default_kernel.clone(),
            connection_dir: self
                .connection_dir
                .clone()
                .unwrap_or(defaults.connection_dir),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum HostCommand {
    Initialize {
        notebook_id: NotebookId,
        spec_id: String,
    },
    Execute {
        notebook_id: NotebookId,
        cell_id: String,
        code: String,
    },
    Interrupt {
        notebook_id: NotebookId,
    },
    Restart {
        notebook_id: NotebookId,
    },
    Shutdown {
        notebook_id: NotebookId,
    },
    GetSpec {
        notebook_id: NotebookId,
    },
    ListKernels,
}

impl HostCommand {
    fn notebook_id(&self) -> Option<&str> {
        match self {
            HostCommand::Initialize { notebook_id, .. }
            | HostCommand::Execute { notebook_id, .. }
            | HostCommand::Interrupt { notebook_id }
            | HostCommand::Restart { notebook_id }
            | HostCommand::Shutdown { notebook_id }
            | HostCommand::GetSpec { notebook_id } => Some(notebook_id),
            HostCommand::ListKernels => None,
        }
    }
}

/// Direct answers to queries. Outputs and errors travel as `UiEvent`s.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostReply {
    Spec {
        notebook_id: NotebookId,
        spec: KernelSpecInfo,
    },
    Kernels {
        kernels: Vec<KernelSpecInfo>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .target(env_logger::Target::Stderr)
        .init();

    let config = cli.config();
    info!("kernel-bridge starting");
    info!("  Session mode: {:?}", config.session_mode);
    info!("  Default kernel: {}", config.default_kernel);
    info!("  Connection dir: {:?}", config.connection_dir);

    let (sink, mut events) = sink::channel();
    let bridge = Arc::new(KernelBridge::jupyter(config, sink));
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<HostReply>();
    let mut workers: HashMap<NotebookId, mpsc::UnboundedSender<HostCommand>> = HashMap::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    // This loop is the UI side: it only parses, dispatches and writes
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => dispatch(&bridge, &reply_tx, &mut workers, &line),
                None => break,
            },
            Some(event) = events.recv() => write_line(&mut stdout, &event).await?,
            Some(reply) = replies.recv() => write_line(&mut stdout, &reply).await?,
        }
    }

    info!("stdin closed, shutting down kernels");
    drop(workers);
    bridge.shutdown_all().await;
    for event in events.drain() {
        write_line(&mut stdout, &event).await?;
    }
    Ok(())
}

/// Hand a command to the worker for its notebook, starting one if needed.
///
/// Commands for one notebook run in the order they arrived; notebooks
/// don't wait on each other.
fn dispatch(
    bridge: &Arc<KernelBridge>,
    replies: &mpsc::UnboundedSender<HostReply>,
    workers: &mut HashMap<NotebookId, mpsc::UnboundedSender<HostCommand>>,
    line: &str,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let command: HostCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring malformed command: {}", e);
            return;
        }
    };
    debug!("Command: {:?}", command);

    let Some(notebook_id) = command.notebook_id().map(str::to_string) else {
        let bridge = bridge.clone();
        let replies = replies.clone();
        tokio::spawn(async move { run_command(&bridge, command, &replies).await });
        return;
    };

    let worker = workers.entry(notebook_id).or_insert_with(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(notebook_worker(bridge.clone(), rx, replies.clone()));
        tx
    });
    if let Err(mpsc::error::SendError(command)) = worker.send(command) {
        warn!("Notebook worker gone, dropping {:?}", command);
    }
}

async fn notebook_worker(
    bridge: Arc<KernelBridge>,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    replies: mpsc::UnboundedSender<HostReply>,
) {
    while let Some(command) = commands.recv().await {
        run_command(&bridge, command, &replies).await;
    }
}

/// Failures are already reported on the UI sink by the bridge.
async fn run_command(
    bridge: &KernelBridge,
    command: HostCommand,
    replies: &mpsc::UnboundedSender<HostReply>,
) {
    match command {
        HostCommand::Initialize {
            notebook_id,
            spec_id,
        } => {
            if let Ok(spec) = bridge.initialize_session(&notebook_id, &spec_id).await {
                let _ = replies.send(HostReply::Spec { notebook_id, spec });
            }
        }
        HostCommand::Execute {
            notebook_id,
            cell_id,
            code,
        } => {
            let _ = bridge.execute(&notebook_id, &cell_id, &code).await;
        }
        HostCommand::Interrupt { notebook_id } => {
            let _ = bridge.interrupt(&notebook_id).await;
        }
        HostCommand::Restart { notebook_id } => {
            let _ = bridge.restart(&notebook_id).await;
        }
        HostCommand::Shutdown { notebook_id } => {
            let _ = bridge.shutdown(&notebook_id).await;
        }
        HostCommand::GetSpec { notebook_id } => {
            if let Ok(spec) = bridge.get_spec(&notebook_id).await {
                let _ = replies.send(HostReply::Spec { notebook_id, spec });
            }
        }
        HostCommand::ListKernels => {
            let kernels = bridge.list_kernels().await;
            let _ = replies.send(HostReply::Kernels { kernels });
        }
    }
}

async fn write_line<T: Serialize>(out: &mut tokio::io::Stdout, value: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}
