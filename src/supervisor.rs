//! Companion process supervision.
//!
//! Some deployments run a local TCP service next to the relay (the relay's
//! fixed target). The supervisor keeps that process alive: it forwards the
//! child's output to the log, and restarts it after a fixed delay whenever
//! it exits, regardless of exit status.
//!
//! # Lifecycle
//!
//! ```text
//! spawn ──► running ──exit──► wait restart_delay ──► spawn ...
//!              │
//!           cancel ──► kill child ──► return
//! ```

// Rust guideline compliant 2026-02

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::HelperConfig;
use crate::constants::HELPER_OUTPUT_GRACE;

/// Observable helper lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperEvent {
    /// Child spawned with this PID.
    Started {
        /// OS process ID, if available.
        pid: Option<u32>,
    },
    /// One line of standard output.
    Stdout(String),
    /// One line of standard error.
    Stderr(String),
    /// Child exited with this code (`None` if killed by a signal).
    Exited(Option<i32>),
    /// Spawning the child failed.
    SpawnFailed(String),
}

/// Restarting supervisor for one helper process.
#[derive(Debug)]
pub struct Supervisor {
    config: HelperConfig,
    events: Option<UnboundedSender<HelperEvent>>,
}

impl Supervisor {
    /// Supervise the process described by `config`.
    pub fn new(config: HelperConfig) -> Self {
        Self { config, events: None }
    }

    /// Also publish lifecycle events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: UnboundedSender<HelperEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Keep the helper running until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let delay = self.config.restart_delay();
        loop {
            log::info!("[Helper] Starting {} {}", self.config.program, self.config.args.join(" "));

            match self.spawn() {
                Ok(mut child) => {
                    self.emit(HelperEvent::Started { pid: child.id() });
                    let output = self.forward_output(&mut child);

                    tokio::select! {
                        () = shutdown.cancelled() => {
                            log::info!("[Helper] Stopping {}", self.config.program);
                            if let Err(e) = child.kill().await {
                                log::warn!("[Helper] Failed to kill {}: {}", self.config.program, e);
                            }
                            output.abort();
                            return;
                        }
                        status = child.wait() => {
                            // Let the readers flush the child's final lines
                            output.finish(HELPER_OUTPUT_GRACE).await;
                            let code = status.ok().and_then(|s| s.code());
                            log::info!(
                                "[Helper] Exited with code {}. Restarting in {:?}",
                                code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                                delay
                            );
                            self.emit(HelperEvent::Exited(code));
                        }
                    }
                }
                Err(e) => {
                    log::error!("[Helper] Failed to start {}: {}", self.config.program, e);
                    self.emit(HelperEvent::SpawnFailed(e.to_string()));
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Spawn tasks that log the child's output line by line.
    fn forward_output(&self, child: &mut Child) -> OutputForwarders {
        let stdout = child.stdout.take().map(|out| {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::info!("[Helper] {}", line.trim_end());
                    if let Some(tx) = &events {
                        let _ = tx.send(HelperEvent::Stdout(line));
                    }
                }
            })
        });
        let stderr = child.stderr.take().map(|err| {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::error!("[Helper] {}", line.trim_end());
                    if let Some(tx) = &events {
                        let _ = tx.send(HelperEvent::Stderr(line));
                    }
                }
            })
        });
        OutputForwarders { stdout, stderr }
    }

    fn emit(&self, event: HelperEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Join handles for the stdout and stderr forwarders.
struct OutputForwarders {
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
}

impl OutputForwarders {
    /// Wait up to `grace` for both readers to hit EOF, then stop them.
    async fn finish(mut self, grace: Duration) {
        let drained = tokio::time::timeout(grace, async {
            for handle in [&mut self.stdout, &mut self.stderr].into_iter().flatten() {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            log::debug!("[Helper] Output still open after exit, detaching readers");
            self.abort();
        }
    }

    fn abort(&self) {
        for handle in [&self.stdout, &self.stderr].into_iter().flatten() {
            handle.abort();
        }
    }
}
