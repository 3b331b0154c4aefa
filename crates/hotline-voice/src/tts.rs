//! **Speech synthesis cache** — text in, playable URL out.
//!
//! Audio comes from a [`SynthesisProvider`] and is persisted under
//! `<audio_dir>/<key>.mp3`, served by the gateway at `<public_base_url>/audio/<key>.mp3`.
//! Stable keys name reusable phrases (greeting, cues, apologies, goodbye): they are
//! rendered afresh by [`SpeechSynthesisCache::precache`] at startup and served from
//! disk after that. Per-turn keys are unique and never reused. Sweeping old per-turn files is left to
//! an external job, which must skip stable keys (see [`ArtifactKey::is_stable`]).

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend that turns text into encoded audio bytes (MP3).
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub stability: f64,
    pub similarity_boost: f64,
    pub style: f64,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.3,
            similarity_boost: 0.75,
            style: 0.4,
            use_speaker_boost: true,
        }
    }
}

/// Fixed lines synthesized once and reused across calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhraseBook {
    pub greeting: String,
    /// `{name}` is replaced by the known caller's name
    pub known_greeting: String,
    pub timeout: String,
    pub thinking: String,
    pub goodbye: String,
    /// Spoken when reply generation fails
    pub fallback_apology: String,
    /// Spoken when generation times out or the worker never answers
    pub timeout_apology: String,
}

impl Default for PhraseBook {
    fn default() -> Self {
        Self {
            greeting: "Hey, it's Viktor. What do you need?".to_string(),
            known_greeting: "Hey {name}, what's up?".to_string(),
            timeout: "Still there?".to_string(),
            thinking: "One moment.".to_string(),
            goodbye: "Alright, talk later!".to_string(),
            fallback_apology: "Sorry, can you say that again?".to_string(),
            timeout_apology: "Sorry, I'm taking too long. Can you ask again?".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Where artifacts are written (default: audio)
    pub audio_dir: PathBuf,

    /// Externally reachable base URL of the gateway
    pub public_base_url: String,

    pub api_url: String,
    pub model_id: String,
    pub voice_settings: VoiceSettings,

    /// Per-request HTTP timeout (default: 15000ms)
    pub timeout_ms: u64,

    pub phrases: PhraseBook,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            audio_dir: PathBuf::from("audio"),
            public_base_url: "http://localhost:3000".to_string(),
            api_url: "https://api.elevenlabs.io/v1".to_string(),
            model_id: "eleven_flash_v2_5".to_string(),
            voice_settings: VoiceSettings::default(),
            timeout_ms: 15_000,
            phrases: PhraseBook::default(),
        }
    }
}

/// ElevenLabs streaming text-to-speech.
#[derive(Debug, Clone)]
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    voice_id: String,
    model_id: String,
    voice_settings: VoiceSettings,
}

impl ElevenLabsTts {
    pub fn new(
        config: &SynthesisConfig,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: config.model_id.clone(),
            voice_settings: config.voice_settings.clone(),
        })
    }
}

#[async_trait]
impl SynthesisProvider for ElevenLabsTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let url = format!("{}/text-to-speech/{}/stream", self.api_url, self.voice_id);
        let body = serde_json::json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": self.voice_settings,
        });
        let res = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// File stem of a synthesized artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    name: String,
    stable: bool,
}

impl ArtifactKey {
    /// Reusable key for a canned phrase; the same name always maps to the same file.
    pub fn stable(name: &str) -> Self {
        Self {
            name: sanitize(name),
            stable: true,
        }
    }

    /// Fresh key for one turn: `<prefix>-<unix millis>-<random>`.
    pub fn per_turn(prefix: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self {
            name: format!("{}-{}-{}", sanitize(prefix), millis, &nonce[..8]),
            stable: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn file_name(&self) -> String {
        format!("{}.mp3", self.name)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "audio".to_string()
    } else {
        cleaned
    }
}

/// Canned phrases pre-synthesized at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CannedPhrase {
    Greeting,
    /// Re-prompt after the caller said nothing
    Timeout,
    Thinking,
    Goodbye,
    Apology,
    TimeoutApology,
}

impl CannedPhrase {
    pub const ALL: [CannedPhrase; 6] = [
        CannedPhrase::Greeting,
        CannedPhrase::Timeout,
        CannedPhrase::Thinking,
        CannedPhrase::Goodbye,
        CannedPhrase::Apology,
        CannedPhrase::TimeoutApology,
    ];

    pub fn key(self) -> ArtifactKey {
        ArtifactKey::stable(match self {
            CannedPhrase::Greeting => "greeting",
            CannedPhrase::Timeout => "timeout",
            CannedPhrase::Thinking => "thinking",
            CannedPhrase::Goodbye => "goodbye",
            CannedPhrase::Apology => "apology",
            CannedPhrase::TimeoutApology => "apology-timeout",
        })
    }

    pub fn text(self, phrases: &PhraseBook) -> &str {
        match self {
            CannedPhrase::Greeting => &phrases.greeting,
            CannedPhrase::Timeout => &phrases.timeout,
            CannedPhrase::Thinking => &phrases.thinking,
            CannedPhrase::Goodbye => &phrases.goodbye,
            CannedPhrase::Apology => &phrases.fallback_apology,
            CannedPhrase::TimeoutApology => &phrases.timeout_apology,
        }
    }
}

/// Synthesizes text and persists it as a retrievable artifact.
pub struct SpeechSynthesisCache {
    provider: Arc<dyn SynthesisProvider>,
    audio_dir: PathBuf,
    public_base_url: String,
    phrases: PhraseBook,
    canned: RwLock<HashMap<CannedPhrase, String>>,
}

impl SpeechSynthesisCache {
    pub fn new(provider: Arc<dyn SynthesisProvider>, config: &SynthesisConfig) -> Self {
        Self {
            provider,
            audio_dir: config.audio_dir.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            phrases: config.phrases.clone(),
            canned: RwLock::new(HashMap::new()),
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    pub fn phrases(&self) -> &PhraseBook {
        &self.phrases
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.audio_dir.join(key.file_name())
    }

    pub fn url_for(&self, key: &ArtifactKey) -> String {
        format!("{}/audio/{}", self.public_base_url, key.file_name())
    }

    /// Return the URL for `text` under `key`. A stable key whose file already
    /// exists is served as is; anything else is synthesized and persisted.
    pub async fn synthesize(&self, text: &str, key: &ArtifactKey) -> VoiceResult<String> {
        if key.is_stable() {
            let existing = self.path_for(key);
            if tokio::fs::try_exists(&existing).await.unwrap_or(false) {
                debug!("🔊 Reusing {}", existing.display());
                return Ok(self.url_for(key));
            }
        }
        self.render(text, key).await
    }

    /// Synthesize `text` and persist it under `key`, replacing any existing file.
    async fn render(&self, text: &str, key: &ArtifactKey) -> VoiceResult<String> {
        let audio = self.provider.synthesize(text).await?;
        if audio.is_empty() {
            return Err(VoiceError::Synthesis("provider returned no audio".to_string()));
        }

        tokio::fs::create_dir_all(&self.audio_dir)
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        // Write then rename so a fetch never sees a half-written file.
        let target = self.path_for(key);
        let staging = self.audio_dir.join(format!(".{}.part", key.file_name()));
        let written = match tokio::fs::write(&staging, &audio).await {
            Ok(()) => tokio::fs::rename(&staging, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                debug!("🔊 Staging file {} not removed: {}", staging.display(), cleanup);
            }
            return Err(VoiceError::Synthesis(e.to_string()));
        }

        debug!("🔊 Wrote {} ({} bytes)", target.display(), audio.len());
        Ok(self.url_for(key))
    }

    /// Render every canned phrase under its stable key, so edited phrase text takes
    /// effect on restart. Failures are logged and leave that phrase unavailable;
    /// returns how many succeeded.
    pub async fn precache(&self) -> usize {
        let mut ready = 0;
        for phrase in CannedPhrase::ALL {
            let text = phrase.text(&self.phrases).to_string();
            match self.render(&text, &phrase.key()).await {
                Ok(url) => {
                    self.canned.write().insert(phrase, url);
                    ready += 1;
                }
                Err(e) => warn!("🔊 Could not cache {:?}: {}", phrase, e),
            }
        }
        info!("🔊 Cached {}/{} canned phrases", ready, CannedPhrase::ALL.len());
        ready
    }

    pub fn canned(&self, phrase: CannedPhrase) -> Option<String> {
        self.canned.read().get(&phrase).cloned()
    }

    /// URL of a canned phrase, synthesizing it on first use if precache missed it.
    pub async fn phrase(&self, phrase: CannedPhrase) -> VoiceResult<String> {
        if let Some(url) = self.canned(phrase) {
            return Ok(url);
        }
        let url = self
            .synthesize(phrase.text(&self.phrases), &phrase.key())
            .await?;
        self.canned.write().insert(phrase, url.clone());
        Ok(url)
    }

    /// Personalised greeting for a known caller, or the canned greeting.
    pub async fn greeting_for(&self, name: Option<&str>) -> Option<String> {
        let Some(name) = name else {
            return self.canned(CannedPhrase::Greeting);
        };
        let text = self.phrases.known_greeting.replace("{name}", name);
        match self.synthesize(&text, &ArtifactKey::per_turn("greet")).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("🔊 Personal greeting failed, using default: {}", e);
                self.canned(CannedPhrase::Greeting)
            }
        }
    }
}
