//! Unix-domain JSON-RPC control surface.
//!
//! Requests are single JSON messages `{"cmd": ..., "args": {...}}` of at
//! most 2048 bytes; replies carry `status: "OK" | "ERROR"`. The server
//! forwards each command to the control loop over an in-process channel, so
//! configuration changes become visible to the next tick, never a running
//! one.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{EcoError, Result};

/// Default socket location.
pub const IPC_FILE: &str = "/var/run/ecofreq.sock";
/// Maximum request size; larger messages are truncated and rejected.
pub const BUF_SIZE: usize = 2048;

/// Wire shape of one request.
#[derive(Debug, Serialize, Deserialize)]
pub struct IpcRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// One command in flight from the IPC server to the control loop.
pub struct ControlRequest {
    pub cmd: String,
    pub args: serde_json::Value,
    pub reply: oneshot::Sender<serde_json::Value>,
}

pub type ControlSender = mpsc::Sender<ControlRequest>;
pub type ControlReceiver = mpsc::Receiver<ControlRequest>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel(16)
}

/// The daemon-side socket server.
pub struct EcoServer {
    path: PathBuf,
    group: String,
    mode: u32,
    tx: ControlSender,
}

impl EcoServer {
    pub fn from_config(cfg: &Config, tx: ControlSender) -> Self {
        let group = cfg.get("server", "filegroup").unwrap_or("ecofreq").to_string();
        let mode = cfg
            .get("server", "filemode")
            .and_then(|m| u32::from_str_radix(m.trim_start_matches("0o"), 8).ok())
            .unwrap_or(0o660);
        Self {
            path: PathBuf::from(IPC_FILE),
            group,
            mode,
            tx,
        }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    fn apply_permissions(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(Some(group)) = nix::unistd::Group::from_name(&self.group) {
                if let Err(e) = nix::unistd::chown(&self.path, None, Some(group.gid)) {
                    warn!("ipc: chown to group {} failed: {}", self.group, e);
                }
            }
            let perms = std::fs::Permissions::from_mode(self.mode);
            if let Err(e) = std::fs::set_permissions(&self.path, perms) {
                warn!("ipc: chmod failed: {}", e);
            }
        }
    }

    /// Accept loop; runs until the daemon shuts down.
    pub async fn run(self) -> Result<()> {
        // a stale socket from an unclean shutdown blocks the bind
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let listener = UnixListener::bind(&self.path)
            .map_err(|e| EcoError::Ipc(format!("bind {}: {}", self.path.display(), e)))?;
        self.apply_permissions();
        info!("ipc: listening on {}", self.path.display());
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if let Err(e) = handle_connection(stream, &self.tx).await {
                        warn!("ipc: connection error: {}", e);
                    }
                }
                Err(e) => warn!("ipc: accept failed: {}", e),
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, tx: &ControlSender) -> Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    let n = stream.read(&mut buf).await?;
    let response = dispatch(&buf[..n], tx).await;
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn dispatch(raw: &[u8], tx: &ControlSender) -> String {
    let Ok(msg) = std::str::from_utf8(raw) else {
        return "Invalid message".into();
    };
    let Ok(req) = serde_json::from_str::<IpcRequest>(msg) else {
        return "Invalid message".into();
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let ctrl = ControlRequest {
        cmd: req.cmd,
        args: req.args,
        reply: reply_tx,
    };
    if tx.send(ctrl).await.is_err() {
        return error_reply("daemon is shutting down");
    }
    match reply_rx.await {
        Ok(res) => res.to_string(),
        Err(_) => error_reply("command dropped"),
    }
}

pub(crate) fn error_reply(msg: &str) -> String {
    serde_json::json!({"status": "ERROR", "error": msg}).to_string()
}

/// Client side of the control socket.
pub struct EcoClient {
    path: PathBuf,
}

impl Default for EcoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EcoClient {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(IPC_FILE),
        }
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn send_cmd(
        &self,
        cmd: &str,
        args: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| EcoError::Ipc(format!("connect {}: {}", self.path.display(), e)))?;
        let msg = serde_json::to_string(&IpcRequest {
            cmd: cmd.to_string(),
            args: args.unwrap_or(serde_json::Value::Null),
        })?;
        stream.write_all(msg.as_bytes()).await?;
        stream.shutdown().await?;
        let mut buf = Vec::with_capacity(BUF_SIZE);
        stream.read_to_end(&mut buf).await?;
        let resp = String::from_utf8_lossy(&buf);
        serde_json::from_str(&resp).map_err(|_| EcoError::Ipc(resp.to_string()))
    }

    pub async fn info(&self) -> Result<serde_json::Value> {
        self.send_cmd("info", None).await
    }

    pub async fn get_policy(&self) -> Result<serde_json::Value> {
        self.send_cmd("get_policy", None).await
    }

    pub async fn set_policy(&self, policy: serde_json::Value) -> Result<serde_json::Value> {
        self.send_cmd("set_policy", Some(policy)).await
    }

    pub async fn get_provider(&self) -> Result<serde_json::Value> {
        self.send_cmd("get_provider", None).await
    }

    pub async fn set_provider(&self, provider: serde_json::Value) -> Result<serde_json::Value> {
        self.send_cmd("set_provider", Some(provider)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_loop(mut rx: ControlReceiver) {
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let res = match req.cmd.as_str() {
                    "info" => serde_json::json!({"status": "OK", "total_co2": 0.5}),
                    other => serde_json::json!({
                        "status": "ERROR",
                        "error": format!("Unknown command: {}", other)
                    }),
                };
                let _ = req.reply.send(res);
            }
        });
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ecofreq.sock");
        let (tx, rx) = control_channel();
        echo_loop(rx);
        let server = EcoServer::from_config(&Config::with_defaults(), tx).with_path(&sock);
        tokio::spawn(server.run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = EcoClient::with_path(&sock);
        let res = client.info().await.unwrap();
        assert_eq!(res["status"], "OK");
        assert_eq!(res["total_co2"], 0.5);

        let res = client.send_cmd("reboot", None).await.unwrap();
        assert_eq!(res["status"], "ERROR");
        assert!(res["error"].as_str().unwrap().contains("Unknown command"));
    }

    #[tokio::test]
    async fn test_invalid_json_reply() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ecofreq.sock");
        let (tx, rx) = control_channel();
        echo_loop(rx);
        let server = EcoServer::from_config(&Config::with_defaults(), tx).with_path(&sock);
        tokio::spawn(server.run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        stream.write_all(b"{ not json }").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), "Invalid message");
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ecofreq.sock");
        std::fs::write(&sock, b"stale").unwrap();
        let (tx, rx) = control_channel();
        echo_loop(rx);
        let server = EcoServer::from_config(&Config::with_defaults(), tx).with_path(&sock);
        tokio::spawn(server.run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let client = EcoClient::with_path(&sock);
        assert_eq!(client.info().await.unwrap()["status"], "OK");
    }
}
