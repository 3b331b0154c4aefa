//! Shared handler state and startup wiring.

use crate::config::{CallMode, GatewayConfig, Secrets};
use anyhow::Context;
use dashmap::DashMap;
use hotline_voice::{
    AnthropicProvider, CallSessionRegistry, CommandWake, DirectInferenceClient, ElevenLabsTts,
    HttpTranscriber, NoopWake, PlaceholderTranscriber, PlaybackDispatcher, ProcessTranscriber,
    QueueStore, QueuedBridgeClient, RequestSigner, ResponseGateway, ResponseStrategy,
    SpeechSynthesisCache, StaticBearer, TranscriptionBackend, TranscriptionGateway,
    TurnController, TurnOutcome, WakeSignal,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A recognition-mode turn started on `/speech` and collected on `/check-response`.
pub struct DeferredTurn {
    pub ticket: String,
    pub handle: JoinHandle<TurnOutcome>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<CallSessionRegistry>,
    pub controller: Arc<TurnController>,
    /// At most one pending deferred turn per call id
    pub deferred: Arc<DashMap<String, DeferredTurn>>,
}

impl AppState {
    pub fn new(config: GatewayConfig, controller: Arc<TurnController>) -> Self {
        let registry = Arc::new(CallSessionRegistry::new(config.endpoint.clone()));
        Self {
            config: Arc::new(config),
            registry,
            controller,
            deferred: Arc::new(DashMap::new()),
        }
    }

    /// Build the production collaborators selected by `config`.
    pub fn from_config(config: GatewayConfig, secrets: &Secrets) -> anyhow::Result<Self> {
        let stt: Arc<dyn TranscriptionGateway> = match (config.mode, config.transcription.backend) {
            (CallMode::Recognition, _) => Arc::new(PlaceholderTranscriber::new()),
            (CallMode::Stream, TranscriptionBackend::Process) => {
                Arc::new(ProcessTranscriber::new(config.transcription.clone()))
            }
            (CallMode::Stream, TranscriptionBackend::Http) => Arc::new(HttpTranscriber::new(
                &config.transcription,
                secrets.transcription_api_key.clone().unwrap_or_default(),
            )?),
        };

        let responder: Arc<dyn ResponseGateway> = match config.response.strategy {
            ResponseStrategy::Direct => {
                let direct = &config.response.direct;
                let provider = AnthropicProvider::new(
                    direct,
                    secrets.anthropic_api_key.clone().unwrap_or_default(),
                )?;
                Arc::new(DirectInferenceClient::new(
                    Arc::new(provider),
                    direct.tool_registry()?,
                    direct,
                )?)
            }
            ResponseStrategy::Queued => {
                let queued = &config.response.queued;
                let wake: Arc<dyn WakeSignal> =
                    match CommandWake::from_command(&queued.wake_command, queued.wake_timeout()) {
                        Some(wake) => Arc::new(wake),
                        None => Arc::new(NoopWake),
                    };
                let store = Arc::new(QueueStore::new(&queued.path));
                Arc::new(QueuedBridgeClient::new(store, wake, queued))
            }
        };
        info!(
            target: "hotline::gateway",
            "🧠 Reply strategy: {} ({:?} mode)",
            responder.name(),
            config.mode
        );

        let voice = ElevenLabsTts::new(
            &config.synthesis,
            secrets.elevenlabs_api_key.clone(),
            secrets.elevenlabs_voice_id.clone(),
        )?;
        let tts = Arc::new(SpeechSynthesisCache::new(Arc::new(voice), &config.synthesis));

        let signer = secrets
            .vonage_api_token
            .clone()
            .map(|token| Arc::new(StaticBearer::new(token)) as Arc<dyn RequestSigner>);
        let playback = Arc::new(
            PlaybackDispatcher::new(&config.playback, signer).context("building playback client")?,
        );

        let controller = Arc::new(TurnController::new(
            stt,
            responder,
            tts,
            playback,
            config.turn.clone(),
        ));
        Ok(Self::new(config, controller))
    }

    pub fn tts(&self) -> &Arc<SpeechSynthesisCache> {
        self.controller.tts()
    }

    /// End the call: drop its session (cancelling in-flight work) and any turn
    /// still waiting to be collected.
    pub fn release(&self, call_id: &str) {
        self.registry.remove(call_id);
        self.deferred.remove(call_id);
    }
}
