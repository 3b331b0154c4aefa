//! **Speech-to-Text** — turn one endpointed utterance into text for the turn controller.
//!
//! Implement [`TranscriptionGateway`] for a local recognition engine ([`ProcessTranscriber`])
//! or a hosted OpenAI-compatible API ([`HttpTranscriber`]). Every call is bounded by a
//! fixed maximum wait; an empty result is not an error here, the controller decides
//! what counts as too short.

use crate::audio::wav_from_pcm16;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Placeholder in the engine arguments replaced by the artifact path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Converts raw PCM16 mono audio into text.
#[async_trait]
pub trait TranscriptionGateway: Send + Sync {
    async fn transcribe(&self, pcm: &[u8]) -> VoiceResult<String>;
}

/// Which transcription backend the deployment uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionBackend {
    #[default]
    Process,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub backend: TranscriptionBackend,

    /// Engine executable (default: python)
    pub program: String,

    /// Engine arguments; `{input}` is replaced by the WAV path, or the path is appended
    pub args: Vec<String>,

    /// Extra environment for the engine process
    pub env: HashMap<String, String>,

    /// Directory for the temporary WAV artifact (default: system temp dir)
    pub scratch_dir: Option<PathBuf>,

    /// Maximum wait for one transcription (default: 30000ms)
    pub timeout_ms: u64,

    /// Sample rate written into the WAV header (default: 16000)
    pub sample_rate: u32,

    /// Hosted API base URL, used by the HTTP backend
    pub api_url: String,

    /// Hosted model name, used by the HTTP backend
    pub model: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: TranscriptionBackend::Process,
            program: "python".to_string(),
            args: vec![
                "-m".to_string(),
                "moshi_mlx.run_inference".to_string(),
                "--hf-repo".to_string(),
                "kyutai/stt-1b-en_fr-mlx".to_string(),
                INPUT_PLACEHOLDER.to_string(),
                "--temp".to_string(),
                "0".to_string(),
            ],
            env: HashMap::new(),
            scratch_dir: None,
            timeout_ms: 30_000,
            sample_rate: 16_000,
            api_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
        }
    }
}

impl TranscriptionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

const LOG_MARKERS: &[&str] = &[
    "Info:",
    "[Info]",
    "steps:",
    "token per sec",
    "loading",
    "warming up",
];

/// Keep only the spoken-text lines of raw engine output.
///
/// Strips ANSI escapes, then drops blank lines, JSON config dumps and progress/log
/// lines. Remaining lines are joined with single spaces.
pub fn clean_transcript(raw: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(raw, "");
    stripped
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('{'))
        .filter(|line| !LOG_MARKERS.iter().any(|marker| line.contains(marker)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs a local recognition engine once per utterance.
///
/// The utterance is written as a WAV file to a [`tempfile::NamedTempFile`], which is
/// removed when it goes out of scope: after success, after a failed exit and after a
/// timeout alike. The child is spawned with `kill_on_drop`, so a timed-out or
/// cancelled engine does not outlive the call.
#[derive(Debug, Clone)]
pub struct ProcessTranscriber {
    config: TranscriptionConfig,
}

impl ProcessTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }

    fn write_artifact(&self, pcm: &[u8]) -> VoiceResult<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("utterance-").suffix(".wav");
        let mut artifact = match &self.config.scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        artifact.write_all(&wav_from_pcm16(pcm, self.config.sample_rate))?;
        artifact.flush()?;
        Ok(artifact)
    }

    fn command_for(&self, input: &str) -> Command {
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, input))
            .collect();
        if !self.config.args.iter().any(|a| a.contains(INPUT_PLACEHOLDER)) {
            args.push(input.to_string());
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TranscriptionGateway for ProcessTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> VoiceResult<String> {
        let artifact = self.write_artifact(pcm)?;
        let input = artifact.path().to_string_lossy().into_owned();
        debug!("📝 Transcribing {} bytes via {}", pcm.len(), input);

        let mut cmd = self.command_for(&input);
        let output = match tokio::time::timeout(self.config.timeout(), cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                VoiceError::Transcription(format!(
                    "failed to launch {}: {}",
                    self.config.program, e
                ))
            })?,
            Err(_) => {
                warn!("⏱️ Transcription timed out after {}ms", self.config.timeout_ms);
                return Err(VoiceError::Transcription(format!(
                    "engine timed out after {}ms",
                    self.config.timeout_ms
                )));
            }
        };
        drop(artifact);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(VoiceError::Transcription(format!(
                "engine exited with {}: {}",
                output.status, stderr
            )));
        }

        let text = clean_transcript(&String::from_utf8_lossy(&output.stdout));
        info!("📝 Transcript: \"{}\"", text);
        Ok(text)
    }
}

/// Hosted STT backend: OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Model: whisper-1 or gpt-4o-transcribe, etc.
    pub model: String,
    sample_rate: u32,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(config: &TranscriptionConfig, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            sample_rate: config.sample_rate,
            client,
        })
    }
}

#[async_trait]
impl TranscriptionGateway for HttpTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> VoiceResult<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        let wav = wav_from_pcm16(pcm, self.sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        info!("📝 Transcript: \"{}\"", text);
        Ok(text)
    }
}

/// Placeholder STT: returns a fixed string. Use for exercising the call loop without an engine.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl TranscriptionGateway for PlaceholderTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!("placeholder transcript for {} bytes", pcm.len()))
    }
}
