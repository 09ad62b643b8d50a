/**
 * Transport to a local MCP server spawned as a child process.
 *
 * Frames are newline-delimited JSON on the child's stdin/stdout; stderr is
 * logged and its tail kept for diagnostics.
 */
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{JsonRpcMessage, Transport, TransportError, TransportHooks};

const STDERR_TAIL_LINES: usize = 50;
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Fully resolved parameters for spawning a stdio server.
#[derive(Debug, Clone)]
pub struct StdioServerParameters {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// The complete child environment; nothing else is inherited.
    pub env: HashMap<String, String>,
}

pub struct StdioTransport {
    params: StdioServerParameters,
    hooks: TransportHooks,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    ct: CancellationToken,
    started: AtomicBool,
}

impl StdioTransport {
    pub fn new(params: StdioServerParameters) -> Self {
        Self {
            params,
            hooks: TransportHooks::new(),
            stdin: tokio::sync::Mutex::new(None),
            child: Arc::new(tokio::sync::Mutex::new(None)),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            ct: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &StdioServerParameters {
        &self.params
    }

    /// The most recent stderr lines of the child.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    fn program_label(&self) -> String {
        self.params.program.display().to_string()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &'static str {
        "stdio"
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Protocol(
                "stdio transport already started".to_string(),
            ));
        }
        let program = self.program_label();

        let mut command = Command::new(&self.params.program);
        command
            .args(&self.params.args)
            .env_clear()
            .envs(&self.params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Create child process
        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: program.clone(),
            source,
        })?;
        let missing =
            |stream: &str| TransportError::Protocol(format!("child {stream} unavailable"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        info!(
            "Spawned stdio server {} {:?} (pid {:?})",
            program,
            self.params.args,
            child.id()
        );

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // Capture stderr for diagnostics
        let tail = self.stderr_tail.clone();
        let label = program.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                debug!("[{}] stderr: {}", label, line);
                let mut tail = tail.lock();
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        // Read frames from stdout until EOF or close
        let hooks = self.hooks.clone();
        let child = self.child.clone();
        let tail = self.stderr_tail.clone();
        let ct = self.ct.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            loop {
                let line = tokio::select! {
                    line = lines.next() => line,
                    _ = ct.cancelled() => break,
                };
                match line {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(line) {
                            Ok(message) => hooks.emit_message(message),
                            Err(e) => {
                                warn!("Discarding non-JSON line from {}: {}", program, line);
                                hooks.emit_error(&TransportError::Json(e));
                            }
                        }
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        hooks.emit_error(&TransportError::Io(e));
                        break;
                    }
                    Some(Err(e)) => {
                        hooks.emit_error(&TransportError::Protocol(e.to_string()));
                    }
                    None => {
                        debug!("stdout of {} reached EOF", program);
                        break;
                    }
                }
            }

            let exited = child.lock().await.take();
            if let Some(mut child) = exited {
                let status = match child.try_wait() {
                    Ok(Some(status)) => Some(status),
                    _ => {
                        let _ = child.start_kill();
                        tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
                            .await
                            .ok()
                            .and_then(Result::ok)
                    }
                };
                match status {
                    Some(status) if status.success() => {
                        info!("Stdio server {} exited", program)
                    }
                    status => {
                        let tail = tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                        warn!(
                            "Stdio server {} exited with {:?}. Recent stderr:\n{}",
                            program, status, tail
                        );
                    }
                }
            }
            hooks.emit_close();
        });

        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = match guard.as_mut() {
            Some(stdin) => stdin,
            None if self.started.load(Ordering::SeqCst) => return Err(TransportError::Closed),
            None => return Err(TransportError::NotStarted),
        };

        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ct.cancel();
        // Dropping stdin signals EOF to the child
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!("Kill of {} failed: {}", self.program_label(), e);
            }
            if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
                .await
                .is_err()
            {
                warn!(
                    "Stdio server {} did not exit within {:?}",
                    self.program_label(),
                    KILL_GRACE_PERIOD
                );
            }
        }

        self.hooks.emit_close();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
