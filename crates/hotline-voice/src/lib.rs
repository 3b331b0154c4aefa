//! # Hotline Voice - per-call turn-taking engine
//!
//! Answers a live phone call and keeps a spoken conversation going: caller audio
//! is endpointed, transcribed, answered (directly by a model or via a queued
//! hand-off to an external worker), synthesized and played back, turn after turn
//! until hangup.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      CallSessionRegistry                         │
//! │   call id ─▶ CallSession { TurnState, Endpointer, history }      │
//! │                                                                  │
//! │  ┌────────────┐   ┌───────────────┐   ┌─────────────────────┐    │
//! │  │ PCM frames │ → │  Endpointer   │ → │   TurnController    │    │
//! │  │ (socket)   │   │ (RMS/silence) │   │                     │    │
//! │  └────────────┘   └───────────────┘   │ TranscriptionGateway│    │
//! │                                       │ ResponseGateway     │    │
//! │                                       │  ├ direct (model)   │    │
//! │                                       │  └ queued (worker)  │    │
//! │                                       │ SpeechSynthesisCache│    │
//! │                                       │ PlaybackDispatcher  │    │
//! │                                       └─────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod endpoint;
pub mod error;
pub mod playback;
pub mod queue;
pub mod registry;
pub mod response;
pub mod stt;
pub mod tts;
pub mod turn;

pub use audio::{rms_energy, wav_from_pcm16, AudioConfig};
pub use endpoint::{EndpointConfig, Endpointer, IngestOutcome};
pub use error::{VoiceError, VoiceResult};
pub use playback::{
    OutboundFrame, PlaybackChannel, PlaybackConfig, PlaybackDispatcher, PlaybackOutcome,
    RequestSigner, StaticBearer,
};
pub use queue::{OutgoingResponse, PendingMessage, QueueConfig, QueueDocument, QueueStore};
pub use registry::CallSessionRegistry;
pub use response::{
    AnthropicProvider, CommandWake, ConversationTurn, DirectConfig, DirectInferenceClient,
    InferenceProvider, NoopWake, QueuedBridgeClient, Reply, ResponseConfig, ResponseGateway,
    ResponseRequest, ResponseStrategy, Role, ToolRegistry, WakeSignal,
};
pub use stt::{
    HttpTranscriber, PlaceholderTranscriber, ProcessTranscriber, TranscriptionBackend,
    TranscriptionConfig, TranscriptionGateway,
};
pub use tts::{
    ArtifactKey, CannedPhrase, ElevenLabsTts, PhraseBook, SpeechSynthesisCache, SynthesisConfig,
    SynthesisProvider,
};
pub use turn::{CallSession, TurnConfig, TurnController, TurnOutcome, TurnState};
