//! Audio helpers: WAV container wrapping, ffmpeg normalization and the
//! local espeak-ng fallback synthesis.

use crate::AdapterError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Filename extensions the transcription path accepts.
pub const SUPPORTED_AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac", "aac"];

const FFMPEG_TIMEOUT_SECS: u64 = 30;
const ESPEAK_TIMEOUT_SECS: u64 = 30;

pub fn is_supported_audio(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Wraps raw s16le PCM in a minimal WAV container.
pub fn wrap_pcm_s16le_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * 2;
    let block_align = channels * 2;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

fn scratch_path(ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("colibri-{}.{}", uuid::Uuid::new_v4(), ext))
}

/// Converts any supported container to mono 16 kHz s16le WAV via ffmpeg.
/// The scratch file is removed on every exit path.
pub async fn normalize_to_wav(input: &Path) -> Result<Vec<u8>, AdapterError> {
    let output = scratch_path("wav");

    let result = run_normalize(input, &output).await;
    let bytes = match result {
        Ok(()) => tokio::fs::read(&output).await.map_err(|e| {
            AdapterError::Content(format!(
                "No se pudo convertir el audio a un formato compatible: {}",
                e
            ))
        }),
        Err(err) => Err(err),
    };

    let _ = tokio::fs::remove_file(&output).await;
    bytes
}

async fn run_normalize(input: &Path, output: &Path) -> Result<(), AdapterError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-acodec", "pcm_s16le", "-ac", "1", "-ar", "16000"])
        .arg(output)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped());

    let run = timeout(Duration::from_secs(FFMPEG_TIMEOUT_SECS), cmd.output())
        .await
        .map_err(|_| {
            AdapterError::Content(
                "No se pudo convertir el audio: tiempo de espera agotado".to_string(),
            )
        })?;

    let out = run.map_err(|e| {
        AdapterError::Content(format!(
            "No se pudo convertir el audio a un formato compatible: {}",
            e
        ))
    })?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let detail = stderr.lines().last().unwrap_or("ffmpeg failed");
        return Err(AdapterError::Content(format!(
            "No se pudo convertir el audio a un formato compatible: {}",
            detail
        )));
    }
    Ok(())
}

/// Degraded local synthesis path used when the Gemini TTS call fails.
pub async fn espeak_synthesize(text: &str) -> Result<Vec<u8>, AdapterError> {
    let output = scratch_path("wav");

    let result = run_espeak(text, &output).await;
    let bytes = match result {
        Ok(()) => tokio::fs::read(&output)
            .await
            .map_err(|e| AdapterError::Content(format!("La síntesis de voz local falló: {}", e))),
        Err(err) => Err(err),
    };

    let _ = tokio::fs::remove_file(&output).await;
    bytes
}

async fn run_espeak(text: &str, output: &Path) -> Result<(), AdapterError> {
    let mut cmd = Command::new("espeak-ng");
    cmd.args(["-v", "es"])
        .arg("-w")
        .arg(output)
        .arg(text)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let run = timeout(Duration::from_secs(ESPEAK_TIMEOUT_SECS), cmd.output())
        .await
        .map_err(|_| {
            AdapterError::Content(
                "La síntesis de voz local falló: tiempo de espera agotado".to_string(),
            )
        })?;

    let out = run
        .map_err(|e| AdapterError::Content(format!("La síntesis de voz local falló: {}", e)))?;

    if !out.status.success() {
        return Err(AdapterError::Content(format!(
            "La síntesis de voz local falló: espeak-ng exit {}",
            out.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_extensions_match_the_fixed_set() {
        for name in ["a.mp3", "b.WAV", "c.m4a", "d.ogg", "e.flac", "f.aac"] {
            assert!(is_supported_audio(name), "{} should be supported", name);
        }
        assert!(!is_supported_audio("notes.txt"));
        assert!(!is_supported_audio("clip.opus"));
        assert!(!is_supported_audio("noextension"));
    }

    #[test]
    fn wav_header_fields_for_24khz_mono() {
        let pcm = vec![0u8; 480];
        let wav = wrap_pcm_s16le_wav(&pcm, 24_000, 1);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 480);
        // channels
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1);
        // sample rate
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 24_000);
        // byte rate = rate * channels * 2
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 48_000);
        // data chunk length
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 480);
    }

    #[test]
    fn wav_data_follows_header() {
        let pcm = [1u8, 2, 3, 4];
        let wav = wrap_pcm_s16le_wav(&pcm, 16_000, 1);
        assert_eq!(&wav[44..], &pcm);
    }
}
