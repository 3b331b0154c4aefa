//! Gateway configuration: defaults, then an optional TOML file, then `HOTLINE__*`
//! environment overrides. Secrets never live here; see [`Secrets`].

use hotline_voice::{
    EndpointConfig, PlaybackChannel, PlaybackConfig, ResponseConfig, ResponseStrategy,
    SynthesisConfig, TranscriptionBackend, TranscriptionConfig, TurnConfig,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// How caller speech reaches the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Raw audio over a duplex socket, endpointed and transcribed here
    #[default]
    Stream,
    /// The telephony provider recognises speech and posts text webhooks
    Recognition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mode: CallMode,
    pub host: String,
    pub port: u16,

    /// Externally reachable base URL (webhooks, socket URI, audio files)
    pub public_base_url: String,

    /// Caller id → first name, for personalised greetings and prompt labels
    pub known_callers: HashMap<String, String>,

    pub endpoint: EndpointConfig,
    pub turn: TurnConfig,
    pub transcription: TranscriptionConfig,
    pub response: ResponseConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: CallMode::Stream,
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_base_url: "http://localhost:3000".to_string(),
            known_callers: HashMap::new(),
            endpoint: EndpointConfig::default(),
            turn: TurnConfig::default(),
            transcription: TranscriptionConfig::default(),
            response: ResponseConfig::default(),
            synthesis: SynthesisConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from file and environment. Precedence: `HOTLINE__*` env >
    /// `HOTLINE_CONFIG` path (default `config/hotline.toml`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("HOTLINE_CONFIG").unwrap_or_else(|_| "config/hotline.toml".to_string());
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("HOTLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = built.try_deserialize()?;
        Ok(loaded.normalized())
    }

    /// Derive the settings that follow from others.
    pub fn normalized(mut self) -> Self {
        self.public_base_url = self.public_base_url.trim_end_matches('/').to_string();
        self.synthesis.public_base_url = self.public_base_url.clone();
        self
    }

    /// Playback channel for new sessions. Recognition-mode calls have no audio
    /// socket, so replies always ride on the webhook response.
    pub fn session_channel(&self) -> PlaybackChannel {
        match self.mode {
            CallMode::Stream => self.playback.channel,
            CallMode::Recognition => PlaybackChannel::Control,
        }
    }

    /// Friendly label for prompts and logs; unknown callers are labelled by number.
    pub fn caller_label(&self, caller_id: &str) -> String {
        self.known_callers
            .get(caller_id)
            .cloned()
            .unwrap_or_else(|| caller_id.to_string())
    }

    pub fn known_name(&self, caller_id: &str) -> Option<&str> {
        self.known_callers.get(caller_id).map(String::as_str)
    }

    /// `wss://host/socket/<call_id>` for the provider's connect action.
    pub fn socket_uri(&self, call_id: &str) -> String {
        let (scheme, host) = match self.public_base_url.split_once("://") {
            Some(("http", host)) => ("ws", host),
            Some((_, host)) => ("wss", host),
            None => ("wss", self.public_base_url.as_str()),
        };
        format!("{}://{}/socket/{}", scheme, host, call_id)
    }

    pub fn webhook_url(&self, path: &str) -> String {
        format!("{}{}", self.public_base_url, path)
    }
}

/// Credentials read from the environment only.
#[derive(Clone)]
pub struct Secrets {
    pub elevenlabs_api_key: String,
    pub elevenlabs_voice_id: String,
    pub anthropic_api_key: Option<String>,
    pub transcription_api_key: Option<String>,
    pub vonage_api_token: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("elevenlabs_voice_id", &self.elevenlabs_voice_id)
            .finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn from_env(config: &GatewayConfig) -> anyhow::Result<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Collect secrets through `lookup`, failing on any the configuration needs.
    pub fn from_lookup(
        config: &GatewayConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &str| {
            get(name).ok_or_else(|| anyhow::anyhow!("{} is required but not set", name))
        };

        let anthropic_api_key = match config.response.strategy {
            ResponseStrategy::Direct => Some(require("ANTHROPIC_API_KEY")?),
            ResponseStrategy::Queued => get("ANTHROPIC_API_KEY"),
        };
        let transcription_api_key = match (config.mode, config.transcription.backend) {
            (CallMode::Stream, TranscriptionBackend::Http) => Some(require("OPENAI_API_KEY")?),
            _ => get("OPENAI_API_KEY"),
        };
        let vonage_api_token = match config.session_channel() {
            PlaybackChannel::Rest => Some(require("VONAGE_API_TOKEN")?),
            _ => get("VONAGE_API_TOKEN"),
        };

        Ok(Self {
            elevenlabs_api_key: require("ELEVENLABS_API_KEY")?,
            elevenlabs_voice_id: require("ELEVENLABS_VOICE_ID")?,
            anthropic_api_key,
            transcription_api_key,
            vonage_api_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn socket_uri_follows_the_public_scheme() {
        let mut config = GatewayConfig {
            public_base_url: "https://abc.ngrok.app/".to_string(),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.socket_uri("u1"), "wss://abc.ngrok.app/socket/u1");
        assert_eq!(config.synthesis.public_base_url, "https://abc.ngrok.app");

        config.public_base_url = "http://localhost:3000".to_string();
        assert_eq!(config.socket_uri("u1"), "ws://localhost:3000/socket/u1");
    }

    #[test]
    fn direct_strategy_needs_the_model_key() {
        let config = GatewayConfig::default();
        let err = Secrets::from_lookup(
            &config,
            env(&[("ELEVENLABS_API_KEY", "k"), ("ELEVENLABS_VOICE_ID", "v")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn queued_strategy_runs_without_the_model_key() {
        let mut config = GatewayConfig::default();
        config.response.strategy = ResponseStrategy::Queued;
        let secrets = Secrets::from_lookup(
            &config,
            env(&[("ELEVENLABS_API_KEY", "k"), ("ELEVENLABS_VOICE_ID", "v")]),
        )
        .unwrap();
        assert!(secrets.anthropic_api_key.is_none());
        assert!(!format!("{:?}", secrets).contains("\"k\""));
    }

    #[test]
    fn rest_playback_needs_a_token_and_blank_values_do_not_count() {
        let mut config = GatewayConfig::default();
        config.response.strategy = ResponseStrategy::Queued;
        config.playback.channel = PlaybackChannel::Rest;
        assert!(Secrets::from_lookup(
            &config,
            env(&[
                ("ELEVENLABS_API_KEY", "k"),
                ("ELEVENLABS_VOICE_ID", "v"),
                ("VONAGE_API_TOKEN", "  "),
            ]),
        )
        .is_err());

        config.mode = CallMode::Recognition;
        assert_eq!(config.session_channel(), PlaybackChannel::Control);
    }

    #[test]
    fn unknown_callers_are_labelled_by_number() {
        let mut config = GatewayConfig::default();
        config
            .known_callers
            .insert("+15550001111".to_string(), "Sam".to_string());
        assert_eq!(config.caller_label("+15550001111"), "Sam");
        assert_eq!(config.caller_label("+15559999999"), "+15559999999");
        assert_eq!(config.known_name("+15559999999"), None);
    }
}
