use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::handle::{HandleError, HandleEvent, Listeners, PlaybackHandle, PlayerOptions, Subscription};
use crate::types::{BridgeCommand, BridgeMessage, ExternalState};

#[derive(Debug)]
struct Ack {
    ok: bool,
    connected: Option<bool>,
    error: Option<String>,
}

struct BridgeShared {
    // Lines queued for the stdin writer thread. `None` when not running.
    writer: Mutex<Option<Sender<String>>>,
    listeners: Listeners,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    options: PlayerOptions,
}

impl BridgeShared {
    fn send(&self, command: &BridgeCommand) -> Result<(), HandleError> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');

        let writer = self.writer.lock();
        let lines = writer.as_ref().ok_or(HandleError::NotRunning)?;
        lines.send(line).map_err(|_| HandleError::NotRunning)
    }

    fn handle_message(&self, message: BridgeMessage) {
        match message {
            BridgeMessage::Ready { device_id } => {
                self.listeners.emit(HandleEvent::Ready { device_id });
            }
            BridgeMessage::NotReady { device_id } => {
                self.listeners.emit(HandleEvent::NotReady { device_id });
            }
            BridgeMessage::PlayerStateChanged { state } => {
                self.listeners
                    .emit(HandleEvent::StateChanged(state.map(ExternalState::from)));
            }
            BridgeMessage::TokenRequest => {
                let token = (self.options.token)();
                if let Err(e) = self.send(&BridgeCommand::Token { token }) {
                    log::error!("Failed to hand token to bridge: {}", e);
                }
            }
            BridgeMessage::Ack {
                id,
                ok,
                connected,
                error,
            } => match self.pending.lock().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Ack { ok, connected, error });
                }
                None => log::warn!("Bridge acknowledged unknown command {}", id),
            },
            BridgeMessage::Error { kind, message } => {
                self.listeners.emit(HandleEvent::Error { kind, message });
            }
        }
    }

    /// Fail every outstanding command; their receivers see a closed channel.
    fn abandon_pending(&self) {
        self.pending.lock().clear();
    }
}

/// Playback handle backed by an external bridge process that speaks
/// newline-delimited JSON on stdin/stdout.
pub struct BridgeHandle {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    shared: Arc<BridgeShared>,
    next_id: AtomicU64,
}

impl BridgeHandle {
    pub fn new(program: impl Into<String>, args: Vec<String>, options: PlayerOptions) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
            shared: Arc::new(BridgeShared {
                writer: Mutex::new(None),
                listeners: Listeners::new(),
                pending: Mutex::new(HashMap::new()),
                options,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn the bridge process and start reading its output
    pub fn spawn(&self) -> Result<()> {
        log::info!("Spawning playback bridge: {} {:?}", self.program, self.args);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn playback bridge {:?}", self.program))?;

        log::info!("Playback bridge spawned with PID: {}", child.id());

        let stdin = child.stdin.take().context("Failed to capture bridge stdin")?;
        let stdout = child.stdout.take().context("Failed to capture bridge stdout")?;
        let stderr = child.stderr.take().context("Failed to capture bridge stderr")?;

        let (lines, queued) = channel();
        *self.shared.writer.lock() = Some(lines);
        *self.child.lock() = Some(child);

        thread::spawn(move || {
            Self::write_stdin(stdin, queued);
        });

        let shared = self.shared.clone();
        thread::spawn(move || {
            Self::read_stdout(stdout, shared);
        });

        thread::spawn(move || {
            Self::read_stderr(stderr);
        });

        Ok(())
    }

    /// Write queued command lines to the bridge. Ends when the queue is
    /// closed or the pipe breaks; dropping `stdin` then closes the pipe.
    fn write_stdin(mut stdin: ChildStdin, lines: Receiver<String>) {
        for line in lines {
            if let Err(e) = stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
                log::error!("Error writing bridge stdin: {}", e);
                break;
            }
        }

        log::debug!("Bridge stdin writer stopped");
    }

    /// Read stdout from the bridge (JSON messages)
    fn read_stdout(stdout: std::process::ChildStdout, shared: Arc<BridgeShared>) {
        let reader = BufReader::new(stdout);

        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    log::debug!("Bridge stdout: {}", line);

                    match serde_json::from_str::<BridgeMessage>(&line) {
                        Ok(message) => shared.handle_message(message),
                        Err(e) => {
                            log::error!("Failed to parse bridge message: {} - {}", e, line);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Error reading bridge stdout: {}", e);
                    break;
                }
            }
        }

        shared.abandon_pending();
        shared.listeners.emit(HandleEvent::Error {
            kind: "bridge_exited".to_string(),
            message: "playback bridge closed its output".to_string(),
        });
        log::warn!("Bridge stdout reader stopped");
    }

    /// Read stderr from the bridge (debug logs)
    fn read_stderr(stderr: std::process::ChildStderr) {
        let reader = BufReader::new(stderr);

        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        log::info!("[Bridge] {}", line);
                    }
                }
                Err(e) => {
                    log::error!("Error reading bridge stderr: {}", e);
                    break;
                }
            }
        }

        log::warn!("Bridge stderr reader stopped");
    }

    /// Send a command and wait for its acknowledgement.
    async fn request(&self, build: impl FnOnce(u64) -> BridgeCommand) -> Result<Ack, HandleError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        if let Err(e) = self.shared.send(&build(id)) {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| HandleError::NotRunning)
    }

    /// Check if the bridge is still running
    pub fn is_running(&self) -> bool {
        let mut child_guard = self.child.lock();
        if let Some(child) = child_guard.as_mut() {
            match child.try_wait() {
                Ok(Some(_status)) => {
                    log::warn!("Playback bridge has exited");
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    log::error!("Error checking bridge status: {}", e);
                    false
                }
            }
        } else {
            false
        }
    }

    /// Stop the bridge process
    pub fn stop(&self) -> Result<()> {
        // Closing the queue closes stdin, the bridge's first hint to exit.
        drop(self.shared.writer.lock().take());
        self.shared.abandon_pending();

        let child_option = self.child.lock().take();
        if let Some(mut child) = child_option {
            log::info!("Stopping playback bridge with PID {}...", child.id());

            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let pid = Pid::from_raw(child.id() as i32);
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    log::debug!("SIGTERM to bridge {} failed: {}", pid, e);
                }
            }

            #[cfg(windows)]
            {
                child.kill().ok();
            }

            // Wait for graceful shutdown (up to 2 seconds)
            let max_wait_ms = 2000;
            let check_interval_ms = 100;
            let mut waited_ms = 0;

            while waited_ms < max_wait_ms {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::info!("Playback bridge exited with status: {:?}", status);
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("Error checking bridge status: {}", e);
                        break;
                    }
                }
                thread::sleep(Duration::from_millis(check_interval_ms));
                waited_ms += check_interval_ms;
            }

            log::warn!("Bridge didn't stop after {}ms, sending SIGKILL...", max_wait_ms);
            child.kill().context("Failed to kill playback bridge")?;
            child.wait().context("Failed to wait for playback bridge")?;
            log::info!("Playback bridge forcefully terminated");
        }

        Ok(())
    }
}

#[async_trait]
impl PlaybackHandle for BridgeHandle {
    fn subscribe(&self, sink: UnboundedSender<HandleEvent>) -> Subscription {
        self.shared.listeners.add(sink)
    }

    async fn connect(&self) -> Result<bool, HandleError> {
        let name = self.shared.options.name.clone();
        let volume = self.shared.options.volume;
        let ack = self
            .request(|id| BridgeCommand::Connect { id, name, volume })
            .await?;

        if ack.ok {
            Ok(ack.connected.unwrap_or(true))
        } else {
            Err(HandleError::Rejected(
                ack.error.unwrap_or_else(|| "connect refused".to_string()),
            ))
        }
    }

    fn disconnect(&self) {
        if let Err(e) = self.shared.send(&BridgeCommand::Disconnect) {
            log::debug!("Disconnect not delivered: {}", e);
        }
    }

    async fn toggle_play(&self) -> Result<(), HandleError> {
        let ack = self.request(|id| BridgeCommand::TogglePlay { id }).await?;
        if ack.ok {
            Ok(())
        } else {
            Err(HandleError::Rejected(
                ack.error.unwrap_or_else(|| "toggle refused".to_string()),
            ))
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Error stopping playback bridge in Drop: {}", e);
        }
    }
}
