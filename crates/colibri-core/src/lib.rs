//! Colibri Core
//!
//! Command router, conversation assembler and bot runtime: classifies
//! every inbound chat event, maintains per-chat configuration and
//! history, and drives the generative adapters.

use anyhow::Result;
use colibri_config::Config;
use colibri_ipc::{EventBus, InboundEvent, OutboundMessage};
use colibri_providers::{audio, voices, GenerativeBackend, ImageReference, Turn};
use colibri_storage::{ChatConfig, Role, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Replies longer than this are delivered as a text-file attachment when
/// the chat has textfile mode enabled.
pub const TEXTFILE_THRESHOLD_CHARS: usize = 1000;
/// Chunk size for long listings such as `/voices`.
pub const LISTING_CHUNK_CHARS: usize = 2000;
/// Pause between listing chunks, to respect transport rate limits.
pub const LISTING_CHUNK_DELAY_MS: u64 = 500;

/// The transport's contact id for the bot's own account.
pub const SELF_CONTACT_ID: u32 = 1;

const HELP_TEXT: &str = "\
🤖 *Colibri* — asistente con IA para chatmail

Comandos disponibles:
/help — muestra esta ayuda
/voices — lista las voces disponibles
/set_voice <nombre> — cambia la voz de las respuestas de audio
/audio on|off — responde con audio en lugar de texto
/textfile on|off — respuestas largas como archivo de texto
/clear — borra el historial de la conversación
/info — muestra la configuración del chat
/imagen <descripción> — genera una imagen

Cualquier otro mensaje se responde con el modelo de texto.
También puedes enviar una nota de voz: se transcribe y se responde
como si la hubieras escrito.";

/// Chat metadata the router reads opportunistically.
#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub title: Option<String>,
    pub kind: String,
}

/// The operations the core needs from the messaging transport. Everything
/// else about message delivery stays on the other side of this seam.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;
    async fn chat_info(&self, account_id: u32, chat_id: &str) -> Result<ChatInfo>;
    async fn chat_members(&self, account_id: u32, chat_id: &str) -> Result<Vec<u32>>;
    /// Best-effort; failures are logged at debug level by callers.
    async fn mark_read(&self, account_id: u32, message_id: i64) -> Result<()>;
    /// Best-effort typing indicator.
    async fn send_typing(&self, account_id: u32, chat_id: &str) -> Result<()>;
}

/// Inbound text classified against the fixed command table. Matching on
/// the leading token is case-sensitive; argument validation happens in
/// the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Voices,
    SetVoice(&'a str),
    TextFile(&'a str),
    Audio(&'a str),
    Clear,
    Info,
    Imagen(&'a str),
    /// Leading `/` but no known token: silently ignored.
    Unrecognized,
    /// Free-form conversational turn.
    Chat(&'a str),
    Empty,
}

/// Splits `text` into `token` plus trimmed argument, requiring a word
/// boundary after the token.
fn strip_command<'a>(text: &'a str, token: &str) -> Option<&'a str> {
    if text == token {
        return Some("");
    }
    text.strip_prefix(token)
        .and_then(|rest| rest.strip_prefix(' '))
        .map(str::trim)
}

pub fn classify(text: &str) -> Command<'_> {
    let text = text.trim();
    if text.is_empty() {
        return Command::Empty;
    }
    if !text.starts_with('/') {
        return Command::Chat(text);
    }
    if text == "/help" {
        return Command::Help;
    }
    if text == "/voices" {
        return Command::Voices;
    }
    if text == "/clear" {
        return Command::Clear;
    }
    if text == "/info" {
        return Command::Info;
    }
    if let Some(arg) = strip_command(text, "/set_voice") {
        return Command::SetVoice(arg);
    }
    if let Some(arg) = strip_command(text, "/textfile") {
        return Command::TextFile(arg);
    }
    if let Some(arg) = strip_command(text, "/audio") {
        return Command::Audio(arg);
    }
    if let Some(arg) = strip_command(text, "/imagen") {
        return Command::Imagen(arg);
    }
    Command::Unrecognized
}

/// Output modality for a successful reply. Textfile mode takes precedence
/// over audio mode once the length threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyModality {
    Text,
    TextFile,
    Audio,
}

pub fn select_modality(config: &ChatConfig, reply_chars: usize) -> ReplyModality {
    if config.textfile_mode && reply_chars > TEXTFILE_THRESHOLD_CHARS {
        ReplyModality::TextFile
    } else if config.audio_mode {
        ReplyModality::Audio
    } else {
        ReplyModality::Text
    }
}

/// Splits text into chunks of at most `max_chars` characters, preferring
/// to break at whitespace or sentence boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());

        if end < chars.len() {
            let mut split = end;
            for i in (start..end).rev() {
                let c = chars[i];
                if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                    split = i + 1;
                    break;
                }
            }
            if split > start {
                end = split;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}

/// Numbered voice catalog listing with a marker on the chat's current
/// voice.
pub fn render_voice_listing(current_voice: &str) -> String {
    let mut out = String::from("🎙️ Voces disponibles:\n\n");
    for (idx, voice) in voices::CATALOG.iter().enumerate() {
        let marker = if voice.name.eq_ignore_ascii_case(current_voice) {
            " ← actual"
        } else {
            ""
        };
        out.push_str(&format!(
            "{}. *{}* — {} ({}, {}){}\n",
            idx + 1,
            voice.name,
            voice.description,
            voice.gender,
            voice.style,
            marker
        ));
    }
    out.push_str("\nUsa /set_voice <nombre> para cambiar la voz.");
    out
}

struct RuntimeInner {
    config: Config,
    storage: Mutex<Storage>,
    backend: Arc<dyn GenerativeBackend>,
    transport: Arc<dyn Transport>,
    bus: EventBus,
}

/// The bot runtime: consumes inbound events from the bus, one task per
/// event, so separate chats are processed concurrently. Two rapid events
/// in the *same* chat can interleave their config/history writes; there
/// is no per-chat lock.
#[derive(Clone)]
pub struct BotRuntime {
    inner: Arc<RuntimeInner>,
}

impl BotRuntime {
    pub fn new(
        config: Config,
        storage: Storage,
        backend: Arc<dyn GenerativeBackend>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                storage: Mutex::new(storage),
                backend,
                transport,
                bus,
            }),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut receiver = self.inner.bus.subscribe();
        info!("Bot runtime started");

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        runtime.handle_event(event).await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, runtime stopping");
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Runtime lagged behind the event bus; skipped {} events", skipped);
                }
            }
        }
    }

    /// Top-level handler: nothing propagates out of here. A dispatch
    /// failure produces exactly one generic error reply; failures of the
    /// reply send itself are only logged.
    pub async fn handle_event(&self, event: InboundEvent) {
        if let Err(err) = self
            .inner
            .transport
            .mark_read(event.account_id, event.message_id)
            .await
        {
            debug!(error = %err, "mark_read failed");
        }

        if let Err(err) = self.dispatch(&event).await {
            error!(chat_id = %event.chat_id, error = %err, "Event handling failed");
            let notice = format!("❌ Error: {}", err);
            if let Err(send_err) = self
                .inner
                .transport
                .send(OutboundMessage::text(event.account_id, &event.chat_id, notice))
                .await
            {
                warn!(error = %send_err, "Failed to deliver error reply");
            }
        }
    }

    async fn dispatch(&self, event: &InboundEvent) -> Result<()> {
        let mut working_text = event.text.trim().to_string();

        // Voice notes are transcribed first; the transcript then goes
        // through the normal text path.
        if let Some(attachment) = &event.attachment {
            if audio::is_supported_audio(&attachment.filename) {
                match self.inner.backend.transcribe(&attachment.path).await {
                    Err(err) => {
                        self.send_text(event, format!("❌ {}", err)).await;
                        return Ok(());
                    }
                    Ok(transcript) if transcript.trim().is_empty() => {
                        self.send_text(event, "🔇 No se detectó voz en el audio.")
                            .await;
                        return Ok(());
                    }
                    Ok(transcript) => {
                        let transcript = transcript.trim().to_string();
                        self.send_text(event, format!("🎤 Transcripción: {}", transcript))
                            .await;
                        working_text = transcript;
                    }
                }
            }
        }

        match classify(&working_text) {
            Command::Help => {
                self.send_text(event, HELP_TEXT).await;
                Ok(())
            }
            Command::Voices => self.handle_voices(event).await,
            Command::SetVoice(arg) => self.handle_set_voice(event, arg).await,
            Command::TextFile(arg) => self.handle_mode_toggle(event, ModeKind::TextFile, arg).await,
            Command::Audio(arg) => self.handle_mode_toggle(event, ModeKind::Audio, arg).await,
            Command::Clear => self.handle_clear(event).await,
            Command::Info => self.handle_info(event).await,
            Command::Imagen(description) => self.handle_imagen(event, description).await,
            Command::Unrecognized => {
                debug!(chat_id = %event.chat_id, "Ignoring unrecognized command");
                Ok(())
            }
            Command::Chat(prompt) => {
                let prompt = prompt.to_string();
                self.handle_chat_turn(event, &prompt).await
            }
            Command::Empty => Ok(()),
        }
    }

    /// Best-effort plain-text send; failures are logged, never retried.
    async fn send_text(&self, event: &InboundEvent, text: impl Into<String>) {
        let message = OutboundMessage::text(event.account_id, &event.chat_id, text);
        if let Err(err) = self.inner.transport.send(message).await {
            warn!(chat_id = %event.chat_id, error = %err, "Failed to send reply");
        }
    }

    /// Reads the chat's config row, or materializes one with defaults
    /// (create-on-first-write) when the caller is about to mutate state.
    async fn load_or_materialize_config(&self, event: &InboundEvent) -> Result<ChatConfig> {
        if let Some(config) = self
            .inner
            .storage
            .lock()
            .await
            .get_config(&event.chat_id)?
        {
            return Ok(config);
        }

        let title = match self
            .inner
            .transport
            .chat_info(event.account_id, &event.chat_id)
            .await
        {
            Ok(info) => info.title.unwrap_or_else(|| "Chat privado".to_string()),
            Err(err) => {
                debug!(error = %err, "chat_info lookup failed, using default title");
                "Chat privado".to_string()
            }
        };

        let mut config = ChatConfig::with_defaults(&event.chat_id, title);
        config.system_prompt = self.inner.config.assistant.system_prompt.clone();
        self.inner.storage.lock().await.save_config(&config)?;
        Ok(config)
    }

    async fn handle_voices(&self, event: &InboundEvent) -> Result<()> {
        let current = self
            .inner
            .storage
            .lock()
            .await
            .get_config(&event.chat_id)?
            .map(|config| config.voice_name)
            .unwrap_or_else(|| voices::DEFAULT_VOICE.to_string());

        let listing = render_voice_listing(&current);
        let chunks = chunk_text(&listing, LISTING_CHUNK_CHARS);
        let last = chunks.len() - 1;
        for (idx, chunk) in chunks.into_iter().enumerate() {
            self.send_text(event, chunk).await;
            if idx < last {
                tokio::time::sleep(Duration::from_millis(LISTING_CHUNK_DELAY_MS)).await;
            }
        }
        Ok(())
    }

    async fn handle_set_voice(&self, event: &InboundEvent, arg: &str) -> Result<()> {
        let Some(voice) = voices::find(arg) else {
            let sample = voices::sample_names(5).join(", ");
            self.send_text(
                event,
                format!(
                    "❌ Voz no válida. Algunos ejemplos: {}. Usa /voices para ver la lista completa.",
                    sample
                ),
            )
            .await;
            return Ok(());
        };

        let mut config = self.load_or_materialize_config(event).await?;
        config.voice_name = voice.name.to_string();
        self.inner.storage.lock().await.save_config(&config)?;

        self.send_text(
            event,
            format!("✅ Voz cambiada a {}: {}", voice.name, voice.description),
        )
        .await;
        Ok(())
    }

    async fn handle_mode_toggle(
        &self,
        event: &InboundEvent,
        kind: ModeKind,
        arg: &str,
    ) -> Result<()> {
        let enabled = match arg.to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            _ => {
                self.send_text(event, format!("❌ Uso: {} on|off", kind.token()))
                    .await;
                return Ok(());
            }
        };

        let mut config = self.load_or_materialize_config(event).await?;
        match kind {
            ModeKind::Audio => config.audio_mode = enabled,
            ModeKind::TextFile => config.textfile_mode = enabled,
        }
        self.inner.storage.lock().await.save_config(&config)?;

        let state = if enabled { "activado" } else { "desactivado" };
        let confirmation = match kind {
            ModeKind::Audio => format!("🔊 Modo audio {}.", state),
            ModeKind::TextFile => format!("📄 Modo archivo de texto {}.", state),
        };
        self.send_text(event, confirmation).await;
        Ok(())
    }

    async fn handle_clear(&self, event: &InboundEvent) -> Result<()> {
        self.inner
            .storage
            .lock()
            .await
            .clear_history(&event.chat_id)?;
        self.send_text(event, "🗑️ Historial de conversación borrado.")
            .await;
        Ok(())
    }

    async fn handle_info(&self, event: &InboundEvent) -> Result<()> {
        // Read-only: /info never materializes a config row.
        let config = self
            .inner
            .storage
            .lock()
            .await
            .get_config(&event.chat_id)?
            .unwrap_or_else(|| ChatConfig::with_defaults(&event.chat_id, "Chat privado"));

        let kind = match self
            .inner
            .transport
            .chat_info(event.account_id, &event.chat_id)
            .await
        {
            Ok(info) => info.kind,
            Err(_) => "desconocido".to_string(),
        };

        let summary = format!(
            "ℹ️ Configuración del chat\n\
             Tipo: {}\n\
             Título: {}\n\
             Modo audio: {}\n\
             Modo archivo de texto: {}\n\
             Voz: {}\n\
             Prompt personalizado: {}",
            kind,
            config.title,
            if config.audio_mode { "activado" } else { "desactivado" },
            if config.textfile_mode { "activado" } else { "desactivado" },
            config.voice_name,
            if config.has_custom_prompt() { "sí" } else { "no" },
        );
        self.send_text(event, summary).await;
        Ok(())
    }

    async fn handle_imagen(&self, event: &InboundEvent, description: &str) -> Result<()> {
        if description.is_empty() {
            self.send_text(
                event,
                "❌ Debes proporcionar una descripción para la imagen. \
                 Ejemplo: /imagen un paisaje montañoso al atardecer",
            )
            .await;
            return Ok(());
        }

        self.send_text(event, "🎨 Generando imagen...").await;

        let reference = match &event.attachment {
            Some(attachment) => Self::load_image_reference(attachment).await,
            None => None,
        };

        match self
            .inner
            .backend
            .generate_image(description, reference.as_ref())
            .await
        {
            Ok(image) => {
                let caption = image
                    .caption
                    .clone()
                    .unwrap_or_else(|| "Imagen generada por Gemini IA".to_string());
                let filename = format!("imagen.{}", image.extension());
                let message = OutboundMessage::file(
                    event.account_id,
                    &event.chat_id,
                    image.bytes,
                    filename,
                    Some(caption),
                );
                if let Err(err) = self.inner.transport.send(message).await {
                    warn!(error = %err, "Failed to send generated image");
                }
            }
            Err(err) => {
                self.send_text(event, format!("❌ Error al generar la imagen: {}", err))
                    .await;
            }
        }
        Ok(())
    }

    async fn load_image_reference(
        attachment: &colibri_ipc::Attachment,
    ) -> Option<ImageReference> {
        let mime_type = attachment
            .mime_hint
            .clone()
            .filter(|mime| mime.starts_with("image/"))
            .or_else(|| match attachment.extension()?.as_str() {
                "png" => Some("image/png".to_string()),
                "jpg" | "jpeg" => Some("image/jpeg".to_string()),
                "gif" => Some("image/gif".to_string()),
                "webp" => Some("image/webp".to_string()),
                _ => None,
            })?;

        match tokio::fs::read(&attachment.path).await {
            Ok(bytes) => Some(ImageReference { mime_type, bytes }),
            Err(err) => {
                debug!(error = %err, "Failed to read reference image");
                None
            }
        }
    }

    async fn handle_chat_turn(&self, event: &InboundEvent, prompt: &str) -> Result<()> {
        // Membership gate: drop silently when the bot's own contact is no
        // longer in the chat or the lookup fails.
        match self
            .inner
            .transport
            .chat_members(event.account_id, &event.chat_id)
            .await
        {
            Ok(members) if members.contains(&SELF_CONTACT_ID) => {}
            Ok(_) => {
                debug!(chat_id = %event.chat_id, "Bot no longer a chat member, dropping event");
                return Ok(());
            }
            Err(err) => {
                debug!(chat_id = %event.chat_id, error = %err, "Membership check failed, dropping event");
                return Ok(());
            }
        }

        let config = self.load_or_materialize_config(event).await?;

        // Assemble the turn sequence; the user turn is persisted before
        // the adapter call and the whole sequence is saved as the pending
        // retry for this chat.
        let contents = {
            let storage = self.inner.storage.lock().await;

            let pending = storage
                .get_pending_request(&event.chat_id)?
                .and_then(|json| serde_json::from_str::<Vec<Turn>>(&json).ok());

            let mut contents = match pending {
                Some(sequence) => sequence,
                None => {
                    let history = storage
                        .get_history(&event.chat_id, self.inner.config.assistant.history_limit)?;
                    let mut contents = vec![Turn::user(&config.system_prompt)];
                    for message in history.into_iter().rev() {
                        contents.push(match message.role {
                            Role::User => Turn::user(message.content),
                            Role::Assistant => Turn::model(message.content),
                        });
                    }
                    contents
                }
            };
            contents.push(Turn::user(prompt));

            storage.append_message(&event.chat_id, prompt, Role::User)?;
            storage.save_pending_request(&event.chat_id, &serde_json::to_string(&contents)?)?;
            contents
        };

        if let Err(err) = self
            .inner
            .transport
            .send_typing(event.account_id, &event.chat_id)
            .await
        {
            debug!(error = %err, "typing indicator failed");
        }

        let reply = match self.inner.backend.generate_text(&contents).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(chat_id = %event.chat_id, error = %err, "Text generation failed");
                self.send_text(event, format!("❌ {}", err)).await;
                return Ok(());
            }
        };

        {
            let storage = self.inner.storage.lock().await;
            storage.append_message(&event.chat_id, &reply, Role::Assistant)?;
            storage.clear_pending_request(&event.chat_id)?;
        }

        self.deliver_reply(event, &config, &reply).await;
        Ok(())
    }

    async fn deliver_reply(&self, event: &InboundEvent, config: &ChatConfig, reply: &str) {
        match select_modality(config, reply.chars().count()) {
            ReplyModality::Text => self.send_text(event, reply).await,
            ReplyModality::TextFile => {
                let message = OutboundMessage::file(
                    event.account_id,
                    &event.chat_id,
                    reply.as_bytes().to_vec(),
                    "respuesta.txt",
                    None,
                );
                if let Err(err) = self.inner.transport.send(message).await {
                    warn!(error = %err, "Failed to send text-file reply");
                }
            }
            ReplyModality::Audio => {
                match self
                    .inner
                    .backend
                    .synthesize_speech(reply, &config.voice_name)
                    .await
                {
                    Ok(wav) => {
                        let message = OutboundMessage::file(
                            event.account_id,
                            &event.chat_id,
                            wav,
                            "respuesta.wav",
                            None,
                        );
                        if let Err(err) = self.inner.transport.send(message).await {
                            warn!(error = %err, "Failed to send audio reply");
                        }
                    }
                    Err(err) => {
                        // Degrade to plain text rather than losing the reply.
                        warn!(error = %err, "Speech synthesis failed, sending plain text");
                        self.send_text(event, reply).await;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ModeKind {
    Audio,
    TextFile,
}

impl ModeKind {
    fn token(&self) -> &'static str {
        match self {
            ModeKind::Audio => "/audio",
            ModeKind::TextFile => "/textfile",
        }
    }
}
