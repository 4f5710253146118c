//! Operator control plane: line-delimited JSON over a local TCP socket.

use std::net::SocketAddr;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vigil_engine::{EngineHandle, ShutdownSignal};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    ListPositions {
        #[serde(default)]
        profile: Option<String>,
    },
    ForceClose {
        pos_key: String,
    },
    ResumeAfterCircuitBreaker {
        profile: String,
    },
    ReloadConfig,
    Shutdown,
}

/// Start the control listener. One JSON request per line, one JSON response
/// per line.
pub fn spawn_control_plane(
    addr: SocketAddr,
    handle: EngineHandle,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%addr, error = %err, "control plane failed to bind");
                return;
            }
        };
        info!(%addr, "control plane listening");
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = shutdown.wait() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "control accept failed");
                    continue;
                }
            };
            let handle = handle.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = dispatch(&handle, &line).await;
                    let mut payload = response.to_string();
                    payload.push('\n');
                    if write.write_all(payload.as_bytes()).await.is_err() {
                        break;
                    }
                }
                info!(%peer, "control session closed");
            });
        }
    })
}

async fn dispatch(handle: &EngineHandle, line: &str) -> Value {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(err) => return json!({ "ok": false, "error": format!("bad request: {err}") }),
    };
    match command {
        Command::ListPositions { profile } => match handle.list_positions(profile.as_deref()) {
            Ok(positions) => json!({ "ok": true, "positions": positions }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        },
        Command::ForceClose { pos_key } => match handle.force_close(&pos_key).await {
            Ok(closed) => json!({ "ok": true, "closed": closed }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        },
        Command::ResumeAfterCircuitBreaker { profile } => {
            match handle.resume_after_circuit_breaker(&profile).await {
                Ok(found) => json!({ "ok": found, "profile": profile }),
                Err(err) => json!({ "ok": false, "error": err.to_string() }),
            }
        }
        Command::ReloadConfig => {
            let reloaded = handle.reload_config();
            json!({ "ok": true, "reloaded": reloaded })
        }
        Command::Shutdown => {
            handle.shutdown();
            json!({ "ok": true })
        }
    }
}
