//! Colibri IPC
//!
//! Event bus between the chatmail transport and the bot core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// A file attached to an inbound message, already downloaded by the
/// transport to a local path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub filename: String,
    #[serde(default)]
    pub mime_hint: Option<String>,
}

impl Attachment {
    /// Lowercased filename extension, without the dot.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// One chat event as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub account_id: u32,
    pub chat_id: String,
    pub message_id: i64,
    pub text: String,
    pub timestamp: i64,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl InboundEvent {
    pub fn new(account_id: u32, chat_id: impl Into<String>, message_id: i64) -> Self {
        Self {
            account_id,
            chat_id: chat_id.into(),
            message_id,
            text: String::new(),
            timestamp: 0,
            attachment: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// An outbound send. Exactly one of `text` / `file` is the primary
/// content; `text` doubles as the caption when a file is present.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub account_id: u32,
    pub chat_id: String,
    pub text: Option<String>,
    pub file: Option<FilePayload>,
}

#[derive(Debug, Clone)]
pub struct FilePayload {
    pub bytes: Vec<u8>,
    pub filename: String,
}

impl OutboundMessage {
    pub fn text(account_id: u32, chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            account_id,
            chat_id: chat_id.into(),
            text: Some(text.into()),
            file: None,
        }
    }

    pub fn file(
        account_id: u32,
        chat_id: impl Into<String>,
        bytes: Vec<u8>,
        filename: impl Into<String>,
        caption: Option<String>,
    ) -> Self {
        Self {
            account_id,
            chat_id: chat_id.into(),
            text: caption,
            file: Some(FilePayload {
                bytes,
                filename: filename.into(),
            }),
        }
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

/// Broadcast channel carrying inbound events from the transport to the
/// runtime. Cloneable; every subscriber sees every event.
#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<InboundEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, event: InboundEvent) -> anyhow::Result<()> {
        self.inbound.send(event)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_extension_is_lowercased() {
        let att = Attachment {
            path: PathBuf::from("/tmp/x"),
            filename: "Nota.MP3".to_string(),
            mime_hint: None,
        };
        assert_eq!(att.extension().as_deref(), Some("mp3"));
    }

    #[test]
    fn attachment_without_extension() {
        let att = Attachment {
            path: PathBuf::from("/tmp/x"),
            filename: "README".to_string(),
            mime_hint: None,
        };
        assert_eq!(att.extension(), None);
    }

    #[test]
    fn inbound_event_roundtrip() {
        let event = InboundEvent::new(1, "chat-42", 7)
            .with_text("hola")
            .with_timestamp(1_700_000_000);
        let json = serde_json::to_string(&event).expect("serialize");
        let parsed: InboundEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.chat_id, "chat-42");
        assert_eq!(parsed.text, "hola");
        assert!(parsed.attachment.is_none());
    }

    #[test]
    fn inbound_event_deserializes_without_attachment_field() {
        let json = r#"{"account_id":1,"chat_id":"c","message_id":2,"text":"x","timestamp":0}"#;
        let parsed: InboundEvent = serde_json::from_str(json).expect("deserialize");
        assert!(parsed.attachment.is_none());
    }

    #[tokio::test]
    async fn bus_delivers_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(InboundEvent::new(1, "c", 1).with_text("ping"))
            .expect("publish");
        let got = rx.recv().await.expect("recv");
        assert_eq!(got.text, "ping");
    }
}
