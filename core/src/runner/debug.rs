use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use maplit::hashmap;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};

use crate::config::DebuggerConfig;
use crate::error::RunError;
use crate::str_interp::interp_args;

/// Attaches a debugger to a process that has been suspended right after spawn.
#[async_trait]
pub trait Debugger: Send + Sync {
    async fn attach(&self, pid: u32) -> Result<DebugSession, RunError>;
}

/// Keeps the debugger alive for the duration of a run; dropping it kills it.
#[derive(Debug, Default)]
pub struct DebugSession {
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
}

impl DebugSession {
    /// A session with nothing to tear down.
    pub fn detached() -> Self {
        Self::default()
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        for r in &self.readers {
            r.abort();
        }
    }
}

/// Runs a command template such as `gdbserver :2345 --attach #{pid}` and
/// waits until it prints `ready_marker`.
#[derive(Debug, Clone)]
pub struct ExternalDebugger {
    command: String,
    ready_marker: String,
    timeout: Duration,
}

impl ExternalDebugger {
    pub fn new(command: impl Into<String>, ready_marker: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            ready_marker: ready_marker.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &DebuggerConfig) -> Self {
        Self::new(&cfg.command, &cfg.ready_marker, cfg.attach_timeout())
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!("[debugger] {}", line);
            // nobody listens after attach; keep draining so the debugger never blocks
            let _ = tx.send(line);
        }
    })
}

#[async_trait]
impl Debugger for ExternalDebugger {
    async fn attach(&self, pid: u32) -> Result<DebugSession, RunError> {
        let vars = hashmap! { "pid" => pid.to_string() };
        let argv = interp_args(&self.command, &vars)
            .map_err(|e| RunError::new(format!("Invalid debugger command: {}", e), &self.command))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RunError::new("Debugger command is empty", &self.command))?;
        let program = PathBuf::from(program);

        log::info!("Attaching debugger to pid {}: {}", pid, argv.join(" "));
        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::io("Failed to launch debugger", &program, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(forward_lines(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(forward_lines(err, tx));
        } else {
            drop(tx);
        }
        let session = DebugSession {
            child: Some(child),
            readers,
        };

        let ready = tokio::time::timeout(self.timeout, async {
            while let Some(line) = rx.recv().await {
                if line.contains(&self.ready_marker) {
                    return true;
                }
            }
            false
        })
        .await;

        match ready {
            Ok(true) => Ok(session),
            Ok(false) => Err(RunError::new(
                "Debugger exited before it was ready",
                &program,
            )),
            Err(_) => Err(RunError::new(
                format!(
                    "Debugger did not attach within {}s",
                    self.timeout.as_secs_f64()
                ),
                &program,
            )),
        }
    }
}
