//! Colibri Generative Adapters
//!
//! Thin stateless clients for the Gemini REST surface: text completion,
//! image synthesis, speech synthesis and transcription, each with its own
//! timeout/retry policy.

pub mod audio;
pub mod voices;

use base64::Engine as _;
use colibri_config::GeminiConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

const TEXT_MAX_ATTEMPTS: u32 = 3;
const TEXT_BASE_TIMEOUT_SECS: u64 = 45;
const TEXT_TIMEOUT_INCREMENT_SECS: u64 = 15;
const TEXT_CONNECT_BACKOFF_SECS: u64 = 2;
const IMAGE_TIMEOUT_SECS: u64 = 30;
const TTS_TIMEOUT_SECS: u64 = 60;
const TTS_SAMPLE_RATE_HZ: u32 = 24_000;

/// Adapter failure taxonomy. The router maps each variant to a distinct
/// user-visible message and retry decision.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Falta la credencial de la API (GEMINI_API_KEY)")]
    MissingCredential,
    #[error("Error de conexión: {0}")]
    Network(String),
    #[error("Tiempo de espera agotado después de {attempts} intentos")]
    Timeout { attempts: u32 },
    #[error("Respuesta inválida del servidor: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    Content(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One role-tagged turn in the Gemini wire format. Roles are "user" and
/// "model"; the system prompt travels as a leading user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        rename = "inlineData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

/// A reference image passed to the image adapter as conditioning input.
#[derive(Debug, Clone)]
pub struct ImageReference {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub caption: Option<String>,
}

impl GeneratedImage {
    /// Filename extension derived from the mime type.
    pub fn extension(&self) -> &str {
        self.mime_type.rsplit('/').next().unwrap_or("png")
    }
}

/// The generative capabilities the router depends on. Implemented by
/// [`GeminiClient`]; mocked in core tests.
#[async_trait::async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn generate_text(&self, contents: &[Turn]) -> AdapterResult<String>;
    async fn generate_image(
        &self,
        prompt: &str,
        reference: Option<&ImageReference>,
    ) -> AdapterResult<GeneratedImage>;
    /// Returns WAV bytes ready for delivery.
    async fn synthesize_speech(&self, text: &str, voice: &str) -> AdapterResult<Vec<u8>>;
    async fn transcribe(&self, audio_path: &Path) -> AdapterResult<String>;
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    api_base: String,
    text_model: String,
    image_model: String,
    tts_model: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
            tts_model: config.tts_model.clone(),
        }
    }

    fn require_key(&self) -> AdapterResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(AdapterError::MissingCredential);
        }
        Ok(())
    }

    /// The key travels in the `x-goog-api-key` header, never in the URL:
    /// reqwest error strings embed the URL and those strings end up in
    /// user-visible error replies.
    fn endpoint(&self, version: &str, model: &str) -> String {
        format!(
            "{}/{}/models/{}:generateContent",
            self.api_base, version, model
        )
    }

    fn text_request_body(contents: &[Turn]) -> serde_json::Value {
        serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": 0.9,
                "topP": 1,
                "topK": 40
            },
            "safetySettings": [
                { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_ONLY_HIGH" },
                { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_ONLY_HIGH" },
                { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_ONLY_HIGH" },
                { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_ONLY_HIGH" }
            ]
        })
    }

    fn truncate_for_error(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
    }

    fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
    }

    /// Pulls `candidates[0].content.parts[0].text` out of a response body.
    fn extract_text(response: &serde_json::Value) -> AdapterResult<String> {
        let candidate = response
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .ok_or_else(|| {
                AdapterError::MalformedResponse("la respuesta no contiene candidatos".to_string())
            })?;

        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                AdapterError::MalformedResponse("el candidato no contiene contenido".to_string())
            })?;

        let text = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(AdapterError::MalformedResponse(
                "no hay texto en el contenido".to_string(),
            ));
        }
        Ok(text)
    }

    /// Scans the parts for an `image/*` inline payload; the text part, if
    /// any, becomes the caption.
    fn parse_image_response(response: &serde_json::Value) -> AdapterResult<GeneratedImage> {
        let parts = response
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                AdapterError::MalformedResponse(
                    "la respuesta no contiene partes de contenido".to_string(),
                )
            })?;

        let caption = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|text| !text.is_empty())
            .map(|text| text.to_string());

        for part in parts {
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !mime_type.starts_with("image/") {
                continue;
            }
            let data = inline
                .get("data")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    AdapterError::MalformedResponse("inlineData sin campo data".to_string())
                })?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| {
                    AdapterError::MalformedResponse(format!("base64 inválido: {}", e))
                })?;
            return Ok(GeneratedImage {
                bytes,
                mime_type: mime_type.to_string(),
                caption,
            });
        }

        Err(AdapterError::Content(
            "No se encontró imagen en la respuesta.".to_string(),
        ))
    }

    /// Transcript extraction: a candidate with no text means the model
    /// heard silence and is an empty transcript; a response without
    /// candidates is a broken shape and stays an error.
    fn transcript_from_response(response: &serde_json::Value) -> AdapterResult<String> {
        let has_candidate = response
            .get("candidates")
            .and_then(|v| v.as_array())
            .is_some_and(|items| !items.is_empty());

        match Self::extract_text(response) {
            Ok(text) => Ok(text),
            Err(AdapterError::MalformedResponse(_)) if has_candidate => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    /// Pulls the base64 PCM payload out of a TTS response.
    fn extract_inline_audio(response: &serde_json::Value) -> AdapterResult<Vec<u8>> {
        let data = response
            .get("candidates")
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|v| v.as_array())
            .and_then(|parts| parts.first())
            .and_then(|part| part.get("inlineData"))
            .and_then(|inline| inline.get("data"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::MalformedResponse("la respuesta no contiene audio".to_string())
            })?;

        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| AdapterError::MalformedResponse(format!("base64 inválido: {}", e)))
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
    }

    async fn gemini_tts(&self, text: &str, voice: &str) -> AdapterResult<Vec<u8>> {
        self.require_key()?;
        let url = self.endpoint("v1beta", &self.tts_model);
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": text }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": voice }
                    }
                }
            }
        });

        let response = self
            .post_json(&url, &body, Duration::from_secs(TTS_TIMEOUT_SECS))
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(AdapterError::Network(format!(
                "HTTP {}: {}",
                status,
                Self::truncate_for_error(&raw, 300)
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;
        let pcm = Self::extract_inline_audio(&parsed)?;
        Ok(audio::wrap_pcm_s16le_wav(&pcm, TTS_SAMPLE_RATE_HZ, 1))
    }
}

#[async_trait::async_trait]
impl GenerativeBackend for GeminiClient {
    /// Up to 3 attempts; the per-attempt timeout grows by 15 s from a 45 s
    /// baseline, with a 2 s pause after connection errors. Malformed or
    /// empty response shapes are retried like transient failures.
    async fn generate_text(&self, contents: &[Turn]) -> AdapterResult<String> {
        self.require_key()?;
        let url = self.endpoint("v1", &self.text_model);
        let body = Self::text_request_body(contents);

        let mut last_error = AdapterError::Timeout {
            attempts: TEXT_MAX_ATTEMPTS,
        };

        for attempt in 1..=TEXT_MAX_ATTEMPTS {
            let per_attempt = Duration::from_secs(
                TEXT_BASE_TIMEOUT_SECS + TEXT_TIMEOUT_INCREMENT_SECS * (attempt as u64 - 1),
            );

            let response = match self.post_json(&url, &body, per_attempt).await {
                Ok(response) => response,
                Err(err) if err.is_timeout() => {
                    tracing::warn!(attempt, timeout_secs = per_attempt.as_secs(), "Gemini text timeout");
                    last_error = AdapterError::Timeout {
                        attempts: TEXT_MAX_ATTEMPTS,
                    };
                    continue;
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Gemini text connection error");
                    last_error = AdapterError::Network(err.to_string());
                    if attempt < TEXT_MAX_ATTEMPTS {
                        sleep(Duration::from_secs(TEXT_CONNECT_BACKOFF_SECS)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            let raw = match response.text().await {
                Ok(raw) => raw,
                Err(err) => {
                    last_error = AdapterError::Network(err.to_string());
                    if attempt < TEXT_MAX_ATTEMPTS {
                        sleep(Duration::from_secs(TEXT_CONNECT_BACKOFF_SECS)).await;
                    }
                    continue;
                }
            };

            if !status.is_success() {
                let detail = format!(
                    "HTTP {}: {}",
                    status,
                    Self::truncate_for_error(&raw, 300)
                );
                if !Self::is_retryable_status(status.as_u16()) {
                    return Err(AdapterError::Network(detail));
                }
                tracing::warn!(attempt, status = %status, "Gemini text transient HTTP error");
                last_error = AdapterError::Network(detail);
                if attempt < TEXT_MAX_ATTEMPTS {
                    sleep(Duration::from_secs(TEXT_CONNECT_BACKOFF_SECS)).await;
                }
                continue;
            }

            match serde_json::from_str::<serde_json::Value>(&raw)
                .map_err(|e| AdapterError::MalformedResponse(e.to_string()))
                .and_then(|parsed| Self::extract_text(&parsed))
            {
                Ok(text) => return Ok(text),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Gemini text malformed response");
                    last_error = err;
                    continue;
                }
            }
        }

        Err(last_error)
    }

    /// Single attempt, fixed 30 s timeout. An HTTP 200 without an image
    /// payload is still a failure.
    async fn generate_image(
        &self,
        prompt: &str,
        reference: Option<&ImageReference>,
    ) -> AdapterResult<GeneratedImage> {
        self.require_key()?;
        let url = self.endpoint("v1beta", &self.image_model);

        let mut parts = vec![serde_json::json!({ "text": prompt })];
        if let Some(reference) = reference {
            parts.push(serde_json::json!({
                "inlineData": {
                    "mimeType": reference.mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(&reference.bytes)
                }
            }));
        }

        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] }
        });

        let response = self
            .post_json(&url, &body, Duration::from_secs(IMAGE_TIMEOUT_SECS))
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(AdapterError::Network(format!(
                "HTTP {}: {}",
                status,
                Self::truncate_for_error(&raw, 300)
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;
        Self::parse_image_response(&parsed)
    }

    /// Primary Gemini TTS path; any failure falls back to local espeak-ng
    /// synthesis.
    async fn synthesize_speech(&self, text: &str, voice: &str) -> AdapterResult<Vec<u8>> {
        match self.gemini_tts(text, voice).await {
            Ok(wav) => Ok(wav),
            Err(err) => {
                tracing::warn!(error = %err, "Gemini TTS failed, falling back to espeak-ng");
                audio::espeak_synthesize(text).await
            }
        }
    }

    /// Normalizes the input with ffmpeg, then submits the WAV inline to
    /// the text model with a verbatim-transcription instruction.
    async fn transcribe(&self, audio_path: &Path) -> AdapterResult<String> {
        self.require_key()?;
        let wav = audio::normalize_to_wav(audio_path).await?;

        let url = self.endpoint("v1beta", &self.text_model);
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": "Transcribe el audio de forma literal. Responde únicamente con la transcripción, sin comentarios. Si no hay voz, responde con una cadena vacía." },
                    {
                        "inlineData": {
                            "mimeType": "audio/wav",
                            "data": base64::engine::general_purpose::STANDARD.encode(&wav)
                        }
                    }
                ]
            }]
        });

        let response = self
            .post_json(&url, &body, Duration::from_secs(TTS_TIMEOUT_SECS))
            .await
            .map_err(|e| AdapterError::Network(format!("servicio de reconocimiento: {}", e)))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(AdapterError::Network(format!(
                "servicio de reconocimiento HTTP {}: {}",
                status,
                Self::truncate_for_error(&raw, 300)
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;
        Self::transcript_from_response(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_reads_candidate_text() {
        let response = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "¡Hola!" }] }
            }]
        });
        assert_eq!(GeminiClient::extract_text(&response).expect("text"), "¡Hola!");
    }

    #[test]
    fn extract_text_rejects_missing_candidates() {
        let response = serde_json::json!({ "promptFeedback": {} });
        assert!(matches!(
            GeminiClient::extract_text(&response),
            Err(AdapterError::MalformedResponse(_))
        ));
    }

    #[test]
    fn extract_text_rejects_empty_parts() {
        let response = serde_json::json!({
            "candidates": [{ "content": { "parts": [] } }]
        });
        assert!(GeminiClient::extract_text(&response).is_err());
    }

    #[test]
    fn image_response_without_image_is_a_content_error() {
        let response = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "descripción sin imagen" }] }
            }]
        });
        assert!(matches!(
            GeminiClient::parse_image_response(&response),
            Err(AdapterError::Content(_))
        ));
    }

    #[test]
    fn image_response_decodes_inline_data_and_caption() {
        let data = base64::engine::general_purpose::STANDARD.encode(b"fakepng");
        let response = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "un paisaje" },
                    { "inlineData": { "mimeType": "image/png", "data": data } }
                ] }
            }]
        });
        let image = GeminiClient::parse_image_response(&response).expect("image");
        assert_eq!(image.bytes, b"fakepng");
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.extension(), "png");
        assert_eq!(image.caption.as_deref(), Some("un paisaje"));
    }

    #[test]
    fn image_response_accepts_snake_case_inline_data() {
        let data = base64::engine::general_purpose::STANDARD.encode(b"x");
        let response = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "inline_data": { "mime_type": "image/jpeg", "data": data } }
                ] }
            }]
        });
        let image = GeminiClient::parse_image_response(&response).expect("image");
        assert_eq!(image.mime_type, "image/jpeg");
        assert!(image.caption.is_none());
    }

    #[test]
    fn image_response_skips_non_image_inline_parts() {
        let data = base64::engine::general_purpose::STANDARD.encode(b"x");
        let response = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "inlineData": { "mimeType": "audio/wav", "data": data } }
                ] }
            }]
        });
        assert!(matches!(
            GeminiClient::parse_image_response(&response),
            Err(AdapterError::Content(_))
        ));
    }

    #[test]
    fn tts_response_yields_pcm_bytes() {
        let data = base64::engine::general_purpose::STANDARD.encode([0u8, 1, 2, 3]);
        let response = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "inlineData": { "mimeType": "audio/L16;rate=24000", "data": data } }
                ] }
            }]
        });
        let pcm = GeminiClient::extract_inline_audio(&response).expect("pcm");
        assert_eq!(pcm, vec![0, 1, 2, 3]);
    }

    #[test]
    fn turn_constructors_use_gemini_roles() {
        let user = Turn::user("hola");
        assert_eq!(user.role, "user");
        assert_eq!(user.parts[0].text.as_deref(), Some("hola"));
        assert_eq!(Turn::model("ok").role, "model");
    }

    #[test]
    fn turn_serializes_without_empty_inline_data() {
        let json = serde_json::to_string(&Turn::user("hola")).expect("serialize");
        assert!(!json.contains("inlineData"));
        let roundtrip: Turn = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(roundtrip, Turn::user("hola"));
    }

    #[test]
    fn retryable_statuses_match_policy() {
        for status in [408u16, 429, 500, 502, 503, 504] {
            assert!(GeminiClient::is_retryable_status(status));
        }
        for status in [400u16, 401, 403, 404] {
            assert!(!GeminiClient::is_retryable_status(status));
        }
    }

    #[tokio::test]
    async fn missing_credential_is_terminal_without_network() {
        let client = GeminiClient::new(&GeminiConfig::default());
        let err = client
            .generate_text(&[Turn::user("hola")])
            .await
            .expect_err("no key");
        assert!(matches!(err, AdapterError::MissingCredential));

        let err = client
            .generate_image("x", None)
            .await
            .expect_err("no key");
        assert!(matches!(err, AdapterError::MissingCredential));
    }

    fn client_for(base: &str, api_key: &str) -> GeminiClient {
        let config = GeminiConfig {
            api_key: api_key.to_string(),
            api_base: base.to_string(),
            ..GeminiConfig::default()
        };
        GeminiClient::new(&config)
    }

    #[test]
    fn endpoint_carries_no_credentials() {
        let client = client_for("https://example.test", "SECRET-KEY-12345");
        let url = client.endpoint("v1", "gemini-2.5-flash");
        assert_eq!(
            url,
            "https://example.test/v1/models/gemini-2.5-flash:generateContent"
        );
        assert!(!url.contains("SECRET-KEY-12345"));
    }

    #[tokio::test]
    async fn connection_error_text_does_not_expose_the_api_key() {
        // Unroutable port: the request fails before any I/O and the error
        // string embeds the URL, which must not carry the key.
        let client = client_for("http://127.0.0.1:1", "SECRET-KEY-12345");
        let err = client.generate_image("x", None).await.expect_err("refused");
        let visible = err.to_string();
        assert!(matches!(err, AdapterError::Network(_)));
        assert!(!visible.contains("SECRET-KEY-12345"), "leaked: {}", visible);
        assert!(!visible.contains("key="), "leaked: {}", visible);
    }

    async fn spawn_stub_server(
        response: &'static [u8],
    ) -> (String, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    const STUB_500: &[u8] =
        b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const STUB_404: &[u8] =
        b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const STUB_EMPTY_OK: &[u8] =
        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";

    #[tokio::test]
    async fn text_retries_transient_errors_three_times_then_fails_once() {
        let (base, hits) = spawn_stub_server(STUB_500).await;
        let client = client_for(&base, "k");

        let err = client
            .generate_text(&[Turn::user("hola")])
            .await
            .expect_err("exhausted");

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
        match err {
            AdapterError::Network(detail) => assert!(detail.contains("HTTP 500")),
            other => panic!("expected terminal network error, got {}", other),
        }
    }

    #[tokio::test]
    async fn text_malformed_response_is_retried_then_terminal() {
        let (base, hits) = spawn_stub_server(STUB_EMPTY_OK).await;
        let client = client_for(&base, "k");

        let err = client
            .generate_text(&[Turn::user("hola")])
            .await
            .expect_err("exhausted");

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(matches!(err, AdapterError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn text_non_retryable_status_fails_on_the_first_attempt() {
        let (base, hits) = spawn_stub_server(STUB_404).await;
        let client = client_for(&base, "k");

        let err = client
            .generate_text(&[Turn::user("hola")])
            .await
            .expect_err("terminal");

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        match err {
            AdapterError::Network(detail) => assert!(detail.contains("HTTP 404")),
            other => panic!("expected terminal network error, got {}", other),
        }
    }

    #[test]
    fn empty_transcript_needs_a_candidate() {
        let silence = serde_json::json!({
            "candidates": [{ "content": { "parts": [] }, "finishReason": "STOP" }]
        });
        assert_eq!(
            GeminiClient::transcript_from_response(&silence).expect("silence"),
            ""
        );

        let spoken = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "qué hora es" }] } }]
        });
        assert_eq!(
            GeminiClient::transcript_from_response(&spoken).expect("text"),
            "qué hora es"
        );

        let broken = serde_json::json!({ "promptFeedback": {} });
        assert!(matches!(
            GeminiClient::transcript_from_response(&broken),
            Err(AdapterError::MalformedResponse(_))
        ));
    }
}
