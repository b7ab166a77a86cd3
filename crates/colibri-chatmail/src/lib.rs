//! Colibri Chatmail Adapter
//!
//! Bridges a `deltachat-rpc-server` child process to the bot core: pulls
//! incoming-message events onto the event bus and implements the
//! outbound `Transport` operations over JSON-RPC.

mod rpc;

pub use rpc::RpcClient;

use anyhow::{anyhow, Context, Result};
use colibri_config::Config;
use colibri_core::{ChatInfo, Transport};
use colibri_ipc::{Attachment, EventBus, InboundEvent, OutboundMessage};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_ERROR_BACKOFF_SECS: u64 = 2;
const MAX_CONSECUTIVE_EVENT_ERRORS: u32 = 10;

/// Chat type constants from the Delta Chat core.
fn chat_kind_label(chat_type: u64) -> &'static str {
    match chat_type {
        100 => "privado",
        120 => "grupo",
        130 => "lista de correo",
        140 => "difusión",
        _ => "desconocido",
    }
}

fn chat_number(chat_id: &str) -> Result<u32> {
    chat_id
        .parse::<u32>()
        .with_context(|| format!("invalid chat id: {}", chat_id))
}

/// Resolves a fetched message object into an inbound event. Info
/// messages and messages from other bots yield `None`.
fn inbound_from_message(
    account_id: u32,
    chat_id: u32,
    message_id: i64,
    message: &Value,
) -> Option<InboundEvent> {
    if message.get("isInfo").and_then(Value::as_bool) == Some(true) {
        return None;
    }
    if message.get("isBot").and_then(Value::as_bool) == Some(true) {
        return None;
    }

    let text = message
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let timestamp = message
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_default();

    let mut event = InboundEvent::new(account_id, chat_id.to_string(), message_id)
        .with_text(text)
        .with_timestamp(timestamp);

    if let Some(path) = message.get("file").and_then(Value::as_str) {
        let filename = message
            .get("fileName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                std::path::Path::new(path)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            });
        // A file without any derivable name is delivered as plain text.
        if let Some(filename) = filename {
            event = event.with_attachment(Attachment {
                path: PathBuf::from(path),
                filename,
                mime_hint: message
                    .get("fileMime")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }

    Some(event)
}

pub struct ChatmailAdapter {
    rpc: Arc<RpcClient>,
    spool_dir: PathBuf,
}

impl ChatmailAdapter {
    /// Spawns the RPC server and prepares the outbound spool directory.
    /// Account provisioning is external: the accounts directory is shared
    /// with the regular Delta Chat tooling.
    pub fn new(config: &Config) -> Result<Self> {
        let data_dir = config.data_dir();
        let accounts_dir = match &config.chatmail.accounts_dir {
            Some(dir) => PathBuf::from(dir),
            None => data_dir.join("accounts"),
        };
        std::fs::create_dir_all(&accounts_dir)?;

        let spool_dir = data_dir.join("outbox");
        std::fs::create_dir_all(&spool_dir)?;

        let rpc = RpcClient::spawn(&config.chatmail.rpc_bin, &accounts_dir)?;
        Ok(Self { rpc, spool_dir })
    }

    fn spool_path(&self, filename: &str) -> PathBuf {
        self.spool_dir
            .join(format!("{}-{}", uuid::Uuid::new_v4(), filename))
    }

    /// Event pump: starts IO on every configured account and forwards
    /// incoming messages to the bus until the RPC server goes away.
    pub async fn run(&self, bus: EventBus) -> Result<()> {
        let accounts = self
            .rpc
            .call("get_all_account_ids", json!([]))
            .await?
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_u64)
                    .map(|id| id as u32)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if accounts.is_empty() {
            return Err(anyhow!(
                "no chatmail accounts configured; add one to the accounts directory first"
            ));
        }

        self.rpc
            .call("start_io_for_all_accounts", json!([]))
            .await?;
        info!(accounts = accounts.len(), "Chatmail adapter started");

        let mut consecutive_errors = 0u32;
        loop {
            let notification = match self.rpc.call("get_next_event", json!([])).await {
                Ok(value) => {
                    consecutive_errors = 0;
                    value
                }
                Err(err) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_EVENT_ERRORS {
                        return Err(anyhow!("event stream failed repeatedly: {}", err));
                    }
                    warn!(error = %err, "get_next_event failed");
                    tokio::time::sleep(Duration::from_secs(EVENT_ERROR_BACKOFF_SECS)).await;
                    continue;
                }
            };

            let account_id = notification
                .get("contextId")
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32;
            let event = &notification["event"];
            match event.get("kind").and_then(Value::as_str) {
                Some("IncomingMsg") => {
                    let chat_id = event.get("chatId").and_then(Value::as_u64).unwrap_or(0) as u32;
                    let msg_id = event.get("msgId").and_then(Value::as_i64).unwrap_or(0);
                    if let Err(err) = self
                        .forward_incoming(&bus, account_id, chat_id, msg_id)
                        .await
                    {
                        warn!(chat_id, msg_id, error = %err, "failed to forward incoming message");
                    }
                }
                Some(kind) => debug!(kind, "ignoring core event"),
                None => debug!("event without kind"),
            }
        }
    }

    async fn forward_incoming(
        &self,
        bus: &EventBus,
        account_id: u32,
        chat_id: u32,
        msg_id: i64,
    ) -> Result<()> {
        let message = self
            .rpc
            .call("get_message", json!([account_id, msg_id]))
            .await?;

        match inbound_from_message(account_id, chat_id, msg_id, &message) {
            Some(event) => bus.publish(event),
            None => {
                debug!(msg_id, "skipping info/bot message");
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for ChatmailAdapter {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let chat = chat_number(&message.chat_id)?;

        let Some(file) = message.file else {
            let text = message.text.unwrap_or_default();
            self.rpc
                .call(
                    "misc_send_text_message",
                    json!([message.account_id, chat, text]),
                )
                .await?;
            return Ok(());
        };

        // The RPC takes a path, so the bytes go through a spool file that
        // is removed on every exit path; the core copies it into the blob
        // directory during the call.
        let path = self.spool_path(&file.filename);
        tokio::fs::write(&path, &file.bytes).await?;

        let result = self
            .rpc
            .call(
                "send_msg",
                json!([
                    message.account_id,
                    chat,
                    {
                        "text": message.text,
                        "file": path,
                    }
                ]),
            )
            .await;

        let _ = tokio::fs::remove_file(&path).await;
        result.map(|_| ())
    }

    async fn chat_info(&self, account_id: u32, chat_id: &str) -> Result<ChatInfo> {
        let chat = chat_number(chat_id)?;
        let info = self
            .rpc
            .call("get_basic_chat_info", json!([account_id, chat]))
            .await?;

        let title = info
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let kind = chat_kind_label(
            info.get("chatType")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
        );
        Ok(ChatInfo {
            title,
            kind: kind.to_string(),
        })
    }

    async fn chat_members(&self, account_id: u32, chat_id: &str) -> Result<Vec<u32>> {
        let chat = chat_number(chat_id)?;
        let contacts = self
            .rpc
            .call("get_chat_contacts", json!([account_id, chat]))
            .await?;
        Ok(contacts
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_u64)
                    .map(|id| id as u32)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_read(&self, account_id: u32, message_id: i64) -> Result<()> {
        self.rpc
            .call("markseen_msgs", json!([account_id, [message_id]]))
            .await?;
        Ok(())
    }

    async fn send_typing(&self, _account_id: u32, _chat_id: &str) -> Result<()> {
        // Chatmail has no typing indicator on the wire.
        Ok(())
    }
}
