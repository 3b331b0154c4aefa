//! Delivering synthesized audio to the caller.
//!
//! Each session uses one [`PlaybackChannel`] for its whole lifetime. A rejected
//! delivery is retried once on the alternate channel (socket and REST back each
//! other up); control-instruction playback has no alternate. Playback failures are
//! reported to the caller of [`PlaybackDispatcher::play`] and never end a session.

use crate::error::{VoiceError, VoiceResult};
use crate::turn::CallSession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How audio reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackChannel {
    /// JSON play command over the open duplex audio socket
    #[default]
    Socket,
    /// Push through the telephony provider's REST API
    Rest,
    /// Embed the URL in the next call-control response
    Control,
}

impl PlaybackChannel {
    pub fn alternate(self) -> Option<PlaybackChannel> {
        match self {
            PlaybackChannel::Socket => Some(PlaybackChannel::Rest),
            PlaybackChannel::Rest => Some(PlaybackChannel::Socket),
            PlaybackChannel::Control => None,
        }
    }
}

/// Result of a successful [`PlaybackDispatcher::play`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Audio was pushed over the given channel.
    Delivered(PlaybackChannel),
    /// The URL must be returned in the call-control response.
    Instruction(String),
}

/// Outbound JSON frames on the duplex audio socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OutboundFrame {
    PlayAudio {
        #[serde(rename = "audioUrl")]
        audio_url: String,
    },
}

/// Supplies the Authorization header value for provider REST calls.
///
/// Minting provider tokens (e.g. signed JWTs) happens outside this crate.
pub trait RequestSigner: Send + Sync {
    fn authorization(&self) -> VoiceResult<String>;
}

/// A pre-issued bearer token.
#[derive(Clone)]
pub struct StaticBearer(String);

impl StaticBearer {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl RequestSigner for StaticBearer {
    fn authorization(&self) -> VoiceResult<String> {
        Ok(format!("Bearer {}", self.0))
    }
}

impl std::fmt::Debug for StaticBearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticBearer(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub channel: PlaybackChannel,

    /// Telephony provider REST base (default: https://api.nexmo.com)
    pub api_base: String,

    /// REST request timeout (default: 10000ms)
    pub timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            channel: PlaybackChannel::Socket,
            api_base: "https://api.nexmo.com".to_string(),
            timeout_ms: 10_000,
        }
    }
}

pub struct PlaybackDispatcher {
    client: reqwest::Client,
    api_base: String,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl PlaybackDispatcher {
    pub fn new(config: &PlaybackConfig, signer: Option<Arc<dyn RequestSigner>>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            signer,
        })
    }

    /// Play `audio_url` to the session's caller over its channel, retrying once on
    /// the alternate channel if the first attempt is rejected.
    pub async fn play(&self, session: &CallSession, audio_url: &str) -> VoiceResult<PlaybackOutcome> {
        let channel = session.playback_channel();
        let first = match self.deliver(channel, session, audio_url).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };
        let Some(alternate) = channel.alternate() else {
            warn!("🔇 Playback on {:?} failed for {}: {}", channel, session.call_id(), first);
            return Err(first);
        };

        warn!(
            "🔇 Playback on {:?} failed for {} ({}); retrying on {:?}",
            channel,
            session.call_id(),
            first,
            alternate
        );
        match self.deliver(alternate, session, audio_url).await {
            Ok(outcome) => {
                info!("🔈 Playback recovered on {:?} for {}", alternate, session.call_id());
                Ok(outcome)
            }
            Err(e) => {
                warn!("🔇 Playback retry failed for {}: {}", session.call_id(), e);
                Err(e)
            }
        }
    }

    async fn deliver(
        &self,
        channel: PlaybackChannel,
        session: &CallSession,
        audio_url: &str,
    ) -> VoiceResult<PlaybackOutcome> {
        match channel {
            PlaybackChannel::Socket => {
                session
                    .send_frame(OutboundFrame::PlayAudio {
                        audio_url: audio_url.to_string(),
                    })
                    .await?;
                debug!("🔈 Sent playAudio to {}", session.call_id());
                Ok(PlaybackOutcome::Delivered(PlaybackChannel::Socket))
            }
            PlaybackChannel::Rest => {
                self.push_stream(session.call_id(), audio_url).await?;
                Ok(PlaybackOutcome::Delivered(PlaybackChannel::Rest))
            }
            PlaybackChannel::Control => Ok(PlaybackOutcome::Instruction(audio_url.to_string())),
        }
    }

    async fn push_stream(&self, call_id: &str, audio_url: &str) -> VoiceResult<()> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| VoiceError::Playback("no REST credentials configured".to_string()))?;
        let url = format!("{}/v1/calls/{}/stream", self.api_base, call_id);
        let res = self
            .client
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, signer.authorization()?)
            .json(&serde_json::json!({ "stream_url": [audio_url], "loop": 1 }))
            .send()
            .await
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Playback(format!(
                "stream push rejected {}: {}",
                status, body
            )));
        }
        debug!("🔈 Pushed stream to {}", call_id);
        Ok(())
    }
}
