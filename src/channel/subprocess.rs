use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::error::BridgeError;

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Something the subprocess's stdout/stderr produced, or its own exit.
/// The design note's "callback registries" become a single channel of
/// events here — there is exactly one consumer, matching the source's
/// one-slot-last-registration-wins callback discipline.
#[derive(Debug)]
pub enum SubprocessEvent {
    Line(String),
    StderrLine(String),
    Closed(Option<i32>),
}

/// One owned child process plus a line-oriented write half. Output is
/// delivered on the paired `mpsc::UnboundedReceiver<SubprocessEvent>`
/// returned by `spawn`.
pub struct SubprocessChannel {
    child: Child,
    stdin: ChildStdin,
    alive: bool,
}

impl SubprocessChannel {
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: &str,
        env: &[(String, String)],
    ) -> Result<(Self, mpsc::UnboundedReceiver<SubprocessEvent>), BridgeError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(BridgeError::SpawnFailed)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, rx) = mpsc::unbounded_channel();

        // stdout reader: BufReader::lines() already implements the
        // partial-tail-concatenation NDJSON framing the source hand-rolls.
        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if stdout_tx.send(SubprocessEvent::Line(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = stdout_tx.send(SubprocessEvent::Closed(None));
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "subprocess stdout read error");
                        let _ = stdout_tx.send(SubprocessEvent::Closed(None));
                        break;
                    }
                }
            }
        });

        // stderr is forwarded to the logger only, never surfaced as a message.
        let stderr_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                tracing::debug!(stderr = %line, "subprocess stderr");
                let _ = stderr_tx.send(SubprocessEvent::StderrLine(line));
            }
        });

        Ok((
            SubprocessChannel {
                child,
                stdin,
                alive: true,
            },
            rx,
        ))
    }

    /// Writes `line + "\n"` exactly once. Silently dropped if the channel
    /// is no longer alive.
    pub async fn send(&mut self, line: &str) {
        if !self.alive {
            return;
        }
        if self.stdin.write_all(line.as_bytes()).await.is_err()
            || self.stdin.write_all(b"\n").await.is_err()
        {
            self.alive = false;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// SIGTERM, then SIGKILL after a 5-second grace window if the process
    /// hasn't exited. Mirrors the source's shell-out kill sequence, minus
    /// process-group semantics the source uses for a different subprocess
    /// tree shape (see DESIGN.md).
    pub async fn kill(mut self) {
        self.alive = false;
        if let Some(pid) = self.child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
        }

        match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}
