//! Process supervisor — spawn/signal/reap of the hosted pseudo-terminal
//! process.
//!
//! Each incarnation owns three blocking-pool tasks: a reader pumping PTY
//! output into the owning session's command queue, a writer draining the
//! input channel, and a waiter that posts the exit event exactly once.
//! Signals go to the process group (portable-pty makes the child a session
//! leader), so children spawned by the hosted process are covered too.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session_command::SessionCommand;

const READ_BUF_SIZE: usize = 8192;

/// What to run inside the PTY
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: String,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnSpec {
    /// Default command line for a named assistant. An explicit `cmd`
    /// override wins; otherwise the assistant name doubles as the program.
    pub fn command_for(assistant: &str, cmd_override: Option<&str>) -> (String, Vec<String>) {
        if let Some(cmd) = cmd_override {
            let mut parts = cmd.split_whitespace().map(String::from);
            let program = parts
                .next()
                .unwrap_or_else(|| fallback_shell());
            return (program, parts.collect());
        }
        match assistant {
            "shell" => (fallback_shell(), Vec::new()),
            other => (other.to_string(), Vec::new()),
        }
    }
}

fn fallback_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Handle to one incarnation of a session's hosted process.
///
/// Owned exclusively by the session actor; replacing it is a plain swap of
/// the owning field, which is atomic because only the actor touches it.
pub struct PtyProcess {
    incarnation: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Bytes>,
    exited: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Start the hosted process. Output and exit events are posted into
    /// `events` — the owning session's command queue — tagged with this
    /// incarnation's id so events from a replaced process can be told apart.
    pub fn spawn(
        spec: &SpawnSpec,
        events: mpsc::Sender<SessionCommand>,
    ) -> Result<Self, SessionError> {
        let incarnation = gangway_protocol::new_id();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.workdir);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // Close our copy of the slave end so reader EOF tracks child exit.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let pid = child.process_id();
        let exited = Arc::new(AtomicBool::new(false));

        // Reader: PTY output → session command queue. blocking_send gives
        // the actor natural backpressure against a firehose process.
        {
            let events = events.clone();
            let incarnation = incarnation.clone();
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let bytes = Bytes::copy_from_slice(&buf[..n]);
                            let cmd = SessionCommand::PtyOutput {
                                incarnation: incarnation.clone(),
                                bytes,
                            };
                            if events.blocking_send(cmd).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Writer: input channel → PTY. Exits when the channel closes or the
        // PTY fd goes away.
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(256);
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Waiter: posts the exit event exactly once per incarnation.
        {
            let incarnation = incarnation.clone();
            let exited = exited.clone();
            tokio::task::spawn_blocking(move || {
                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(e) => {
                        warn!(
                            component = "supervisor",
                            event = "pty.wait_failed",
                            error = %e,
                            "Failed to wait on hosted process"
                        );
                        None
                    }
                };
                exited.store(true, Ordering::SeqCst);
                let _ = events.blocking_send(SessionCommand::PtyExit { incarnation, code });
            });
        }

        Ok(Self {
            incarnation,
            pid,
            master: Mutex::new(pair.master),
            input_tx,
            exited,
        })
    }

    pub fn incarnation(&self) -> &str {
        &self.incarnation
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Queue bytes for the hosted process's stdin.
    pub async fn write(&self, bytes: Bytes) {
        if self.input_tx.send(bytes).await.is_err() {
            debug!(
                component = "supervisor",
                event = "pty.write_after_exit",
                incarnation = %self.incarnation,
                "Dropping input for exited process"
            );
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let result = self
            .master
            .lock()
            .expect("PTY master mutex poisoned")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        if let Err(e) = result {
            warn!(
                component = "supervisor",
                event = "pty.resize_failed",
                error = %e,
                "Failed to resize PTY"
            );
        }
    }

    /// Graceful-then-forceful termination of the process group. Idempotent:
    /// an already-exited process is a no-op, never an error.
    pub async fn terminate(&self, grace: Duration) {
        if self.has_exited() {
            // Benign race between termination and natural exit.
            debug!(
                component = "supervisor",
                event = "pty.terminate_noop",
                incarnation = %self.incarnation,
                error = %SessionError::AlreadyExited,
                "Process already exited"
            );
            return;
        }

        self.signal_group(libc::SIGTERM);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.has_exited() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.has_exited() {
            self.signal_group(libc::SIGKILL);
        }
    }

    fn signal_group(&self, signal: i32) {
        let Some(pid) = self.pid else {
            return;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            warn!(
                component = "supervisor",
                event = "pty.bad_pid",
                pid,
                "PID out of range, cannot signal"
            );
            return;
        }
        // Guard against signalling a recycled PID.
        if self.has_exited() {
            return;
        }
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}
