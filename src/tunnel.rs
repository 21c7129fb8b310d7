use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::Config;

const URL_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Environment override for the tunnel binary name, matching the source's
/// general pattern of env-overridable external tool locations.
const TUNNEL_BIN_ENV: &str = "COPILOT_TUNNEL_BIN";
const DEFAULT_TUNNEL_BIN: &str = "cloudflared";

pub struct TunnelSupervisor {
    child: Child,
    pub url: String,
}

impl TunnelSupervisor {
    /// Spawns the external tunnel CLI, reads its combined stdout+stderr for
    /// the first `https://` URL, and resolves with it. Never retried
    /// automatically on failure or on later exit — callers decide whether
    /// to start a new one.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let bin = std::env::var(TUNNEL_BIN_ENV).unwrap_or_else(|_| DEFAULT_TUNNEL_BIN.to_string());

        let mut args = vec!["--port".to_string(), config.port.to_string()];
        if let Some(name) = &config.tunnel_id {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        if config.allow_anonymous {
            args.push("--allow-anonymous".to_string());
        }

        let mut child = Command::new(&bin)
            .args(&args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("tunnel executable '{bin}' not found — install it and retry"))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx_out.send(line);
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line);
            }
        });

        let mut tail: Vec<String> = Vec::new();
        let search = async {
            while let Some(line) = rx.recv().await {
                if let Some(url) = extract_url(&line) {
                    return Some(url);
                }
                tail.push(line);
                if tail.len() > 20 {
                    tail.remove(0);
                }
            }
            None
        };

        match tokio::time::timeout(URL_TIMEOUT, search).await {
            Ok(Some(url)) => Ok(TunnelSupervisor { child, url }),
            Ok(None) => {
                let _ = child.start_kill();
                Err(anyhow!("tunnel process exited before a URL appeared: {}", tail.join("\n")))
            }
            Err(_) => {
                let _ = child.start_kill();
                Err(anyhow!("timed out after {URL_TIMEOUT:?} waiting for the tunnel URL"))
            }
        }
    }

    /// SIGINT, then SIGKILL after 5 s if the process hasn't exited. Never
    /// re-spawns.
    pub async fn shutdown(mut self) {
        if let Some(pid) = self.child.id() {
            let _ = Command::new("kill")
                .args(["-INT", &pid.to_string()])
                .status()
                .await;
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}

fn extract_url(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|tok| tok.starts_with("https://"))
        .map(|tok| tok.trim_end_matches(['.', ',']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_https_token_from_noisy_line() {
        let line = "Your quick tunnel has been created! Visit it at https://example.trycloudflare.com";
        assert_eq!(extract_url(line).as_deref(), Some("https://example.trycloudflare.com"));
    }

    #[test]
    fn returns_none_without_a_url() {
        assert_eq!(extract_url("still starting up..."), None);
    }
}
