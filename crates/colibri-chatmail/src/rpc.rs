//! Line-delimited JSON-RPC 2.0 client over the stdio of a spawned
//! `deltachat-rpc-server` process.
//!
//! Core events are pulled with `get_next_event` long-poll calls, so the
//! reader task only routes call responses.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

pub struct RpcClient {
    stdin: Mutex<ChildStdin>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    // Held so the server dies with the client.
    _child: Child,
}

pub fn build_request(id: u64, method: &str, params: Value) -> String {
    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    format!("{}\n", request)
}

/// Extracts `(id, result-or-error)` from a raw server line. Lines without
/// an id (notifications, garbage) yield `None` and are ignored upstream.
pub fn parse_response_line(line: &str) -> Option<(u64, Result<Value>)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let id = value.get("id").and_then(Value::as_u64)?;
    let payload = if let Some(error) = value.get("error") {
        Err(anyhow!(
            "rpc error: {}",
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
        ))
    } else {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    };
    Some((id, payload))
}

impl RpcClient {
    /// Spawns the server binary and starts the response reader task.
    pub fn spawn(rpc_bin: &str, accounts_dir: &Path) -> Result<Arc<Self>> {
        let mut child = Command::new(rpc_bin)
            .env("DC_ACCOUNTS_PATH", accounts_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {}: {}", rpc_bin, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("rpc server stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("rpc server stdout unavailable"))?;

        let client = Arc::new(Self {
            stdin: Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            _child: child,
        });

        let reader_client = client.clone();
        tokio::spawn(async move {
            reader_client.read_loop(stdout).await;
        });

        Ok(client)
    }

    async fn read_loop(&self, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some((id, payload)) = parse_response_line(&line) else {
                        debug!("ignoring rpc line without call id");
                        continue;
                    };
                    match self.pending.lock().await.remove(&id) {
                        Some(sender) => {
                            let _ = sender.send(payload);
                        }
                        None => debug!(id, "response for unknown call id"),
                    }
                }
                Ok(None) => {
                    warn!("rpc server closed its stdout");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "rpc server read failed");
                    break;
                }
            }
        }
        // Fail every in-flight call so nobody waits on a dead server.
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(anyhow!("rpc server exited")));
        }
    }

    /// One request/response round trip. `get_next_event` blocks server-side
    /// until an event exists, so there is deliberately no client timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = build_request(id, method, params);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(err) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(anyhow!("rpc write failed: {}", err));
            }
            if let Err(err) = stdin.flush().await {
                self.pending.lock().await.remove(&id);
                return Err(anyhow!("rpc flush failed: {}", err));
            }
        }

        match rx.await {
            Ok(payload) => payload,
            Err(_) => Err(anyhow!("rpc call {} dropped", method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_one_json_line() {
        let line = build_request(7, "get_all_account_ids", serde_json::json!([]));
        assert!(line.ends_with('\n'));
        assert!(!line.trim().contains('\n'));
        let value: Value = serde_json::from_str(line.trim()).expect("valid json");
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "get_all_account_ids");
        assert!(value["params"].as_array().expect("array").is_empty());
    }

    #[test]
    fn response_line_routes_by_id() {
        let (id, payload) =
            parse_response_line(r#"{"jsonrpc":"2.0","id":3,"result":[1,2]}"#).expect("parsed");
        assert_eq!(id, 3);
        assert_eq!(payload.expect("ok"), serde_json::json!([1, 2]));
    }

    #[test]
    fn error_response_surfaces_the_message() {
        let (_, payload) = parse_response_line(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-1,"message":"no such chat"}}"#,
        )
        .expect("parsed");
        let err = payload.expect_err("error expected");
        assert!(err.to_string().contains("no such chat"));
    }

    #[test]
    fn null_result_maps_to_null() {
        let (_, payload) =
            parse_response_line(r#"{"jsonrpc":"2.0","id":9,"result":null}"#).expect("parsed");
        assert_eq!(payload.expect("ok"), Value::Null);
    }

    #[test]
    fn non_response_lines_are_ignored() {
        assert!(parse_response_line("not json").is_none());
        assert!(parse_response_line(r#"{"jsonrpc":"2.0","method":"event","params":{}}"#).is_none());
    }
}
