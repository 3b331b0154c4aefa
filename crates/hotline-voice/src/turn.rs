//! Per-call turn state machine.
//!
//! ```text
//! Idle → Listening → Endpointed → Transcribing → Generating → Synthesizing → Playing ─┐
//!            ▲            (empty / failed transcript)  │  (synthesis failed)            │
//!            └─────────────────────────────────────────┴────────────────────────────────┘
//! any state ──hangup──▶ Ended
//! ```
//!
//! Audio is only accepted while `Listening`; chunks that arrive in any other state
//! are dropped, not queued. A follow-up spoken over the assistant is lost, but the
//! buffer stays bounded and no reply is ever generated for stale audio. The
//! in-flight request id is set exactly while `Transcribing` or `Generating`.
//!
//! Every external await in a turn races the session's cancellation token, so a
//! hangup abandons the turn at the next suspension point and late results are
//! dropped without playback.

use crate::endpoint::{EndpointConfig, Endpointer, IngestOutcome};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{OutboundFrame, PlaybackChannel, PlaybackDispatcher, PlaybackOutcome};
use crate::response::{ConversationTurn, ResponseGateway, ResponseRequest};
use crate::stt::TranscriptionGateway;
use crate::tts::{ArtifactKey, CannedPhrase, SpeechSynthesisCache};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TurnState {
    Idle,
    Listening,
    Endpointed,
    Transcribing,
    Generating,
    Synthesizing,
    Playing,
    Ended,
}

impl TurnState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Idle, Listening) => true,
            (Listening, Endpointed) => true,
            // Provider-transcribed speech skips straight to generation.
            (Listening, Generating) => true,
            (Endpointed, Transcribing) => true,
            (Transcribing, Generating) | (Transcribing, Listening) => true,
            (Generating, Synthesizing) => true,
            (Synthesizing, Playing) | (Synthesizing, Listening) => true,
            (Playing, Listening) => true,
            _ => false,
        }
    }

    /// States during which exactly one external request is outstanding.
    pub fn holds_request(self) -> bool {
        matches!(self, TurnState::Transcribing | TurnState::Generating)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: TurnState,
    endpointer: Endpointer,
    history: Vec<ConversationTurn>,
    in_flight_request_id: Option<String>,
    dropped_chunks: u64,
}

/// One active call.
#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    caller_id: String,
    caller_label: String,
    channel: PlaybackChannel,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    cancel: CancellationToken,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        caller_label: impl Into<String>,
        channel: PlaybackChannel,
        endpoint: EndpointConfig,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            caller_id: caller_id.into(),
            caller_label: caller_label.into(),
            channel,
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: TurnState::Idle,
                endpointer: Endpointer::new(endpoint),
                history: Vec::new(),
                in_flight_request_id: None,
                dropped_chunks: 0,
            }),
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn caller_label(&self) -> &str {
        &self.caller_label
    }

    pub fn playback_channel(&self) -> PlaybackChannel {
        self.channel
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TurnState {
        self.inner.lock().state
    }

    pub fn is_ended(&self) -> bool {
        self.state() == TurnState::Ended
    }

    pub fn in_flight_request_id(&self) -> Option<String> {
        self.inner.lock().in_flight_request_id.clone()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.inner.lock().history.clone()
    }

    /// Chunks discarded because a turn was in progress.
    pub fn dropped_chunks(&self) -> u64 {
        self.inner.lock().dropped_chunks
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Idle → Listening`. Returns false if the session already left `Idle`.
    pub fn start_listening(&self) -> bool {
        self.transition(TurnState::Listening).is_ok()
    }

    /// Feed caller audio. Only `Listening` sessions accept audio; anything else is
    /// dropped. When the endpointer fires, the session moves to `Endpointed` under
    /// the same lock, so no later chunk can join or start another utterance.
    pub fn ingest(&self, chunk: &[u8]) -> IngestOutcome {
        let mut inner = self.inner.lock();
        if inner.state != TurnState::Listening {
            inner.dropped_chunks += 1;
            return IngestOutcome::Continue;
        }
        let outcome = inner.endpointer.ingest(chunk);
        if matches!(outcome, IngestOutcome::Endpointed(_)) {
            inner.state = TurnState::Endpointed;
            debug!("🔁 {} Listening → Endpointed", self.call_id);
        }
        outcome
    }

    /// Move to `next`, maintaining the in-flight request id.
    ///
    /// Entering `Transcribing` or `Generating` mints a fresh id; every other state
    /// clears it.
    pub fn transition(&self, next: TurnState) -> VoiceResult<()> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from == TurnState::Ended {
            return Err(VoiceError::SessionEnded(self.call_id.clone()));
        }
        if !from.can_transition_to(next) {
            return Err(VoiceError::Config(format!(
                "illegal turn transition {:?} → {:?}",
                from, next
            )));
        }
        inner.state = next;
        inner.in_flight_request_id = next
            .holds_request()
            .then(|| uuid::Uuid::new_v4().to_string());
        if next == TurnState::Listening {
            inner.endpointer.reset();
        }
        debug!("🔁 {} {:?} → {:?}", self.call_id, from, next);
        Ok(())
    }

    /// Replace history with a successful reply's history. Ignored once ended.
    fn commit_history(&self, history: Vec<ConversationTurn>) {
        let mut inner = self.inner.lock();
        if inner.state != TurnState::Ended {
            inner.history = history;
        }
    }

    /// Tear the session down: `Ended`, cancel in-flight work, release buffers.
    pub fn end(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != TurnState::Ended {
                debug!("🔁 {} {:?} → Ended", self.call_id, inner.state);
            }
            inner.state = TurnState::Ended;
            inner.in_flight_request_id = None;
            inner.endpointer.reset();
        }
        self.outbound.lock().take();
        self.cancel.cancel();
    }

    /// Attach the duplex socket's outbound frame sender.
    pub fn attach_outbound(&self, tx: mpsc::Sender<OutboundFrame>) {
        if !self.is_ended() {
            *self.outbound.lock() = Some(tx);
        }
    }

    pub fn detach_outbound(&self) {
        self.outbound.lock().take();
    }

    pub(crate) async fn send_frame(&self, frame: OutboundFrame) -> VoiceResult<()> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| VoiceError::Playback("no audio socket attached".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| VoiceError::Playback("audio socket closed".to_string()))
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// A transcript must be longer than this many characters (default: 3)
    pub min_transcript_chars: usize,

    /// Upper bound on reply acquisition (default: 45000ms)
    pub generation_timeout_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            min_transcript_chars: 3,
            generation_timeout_ms: 45_000,
        }
    }
}

impl TurnConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

/// How a turn finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// A reply (or a fallback apology) was synthesized and handed to playback.
    Spoken {
        text: String,
        audio_url: String,
        fallback: bool,
        /// `None` when both playback channels failed
        playback: Option<PlaybackOutcome>,
    },
    /// Nothing usable was heard; back to listening without a word.
    Discarded,
    /// The reply could not be synthesized; back to listening in silence.
    Unspoken { text: String },
    /// The call ended mid-turn; any late results were dropped.
    Abandoned,
    /// The session was not listening, so the input was dropped.
    Busy,
}

/// Drives one session through its turns.
pub struct TurnController {
    stt: Arc<dyn TranscriptionGateway>,
    responder: Arc<dyn ResponseGateway>,
    tts: Arc<SpeechSynthesisCache>,
    playback: Arc<PlaybackDispatcher>,
    config: TurnConfig,
}

impl TurnController {
    pub fn new(
        stt: Arc<dyn TranscriptionGateway>,
        responder: Arc<dyn ResponseGateway>,
        tts: Arc<SpeechSynthesisCache>,
        playback: Arc<PlaybackDispatcher>,
        config: TurnConfig,
    ) -> Self {
        Self {
            stt,
            responder,
            tts,
            playback,
            config,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.responder.is_deferred()
    }

    pub fn tts(&self) -> &Arc<SpeechSynthesisCache> {
        &self.tts
    }

    pub fn playback(&self) -> &Arc<PlaybackDispatcher> {
        &self.playback
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Full turn for an endpointed utterance (duplex audio mode).
    pub async fn run_audio_turn(&self, session: &CallSession, utterance: Vec<u8>) -> TurnOutcome {
        if let Err(outcome) = enter(session, TurnState::Transcribing) {
            return outcome;
        }

        let transcript = match session.cancellable(self.stt.transcribe(&utterance)).await {
            None => return TurnOutcome::Abandoned,
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                warn!("📝 {} transcription failed: {}", session.call_id(), e);
                return back_to_listening(session, TurnOutcome::Discarded);
            }
        };
        drop(utterance);

        let transcript = match self.usable_transcript(&transcript) {
            Ok(text) => text,
            Err(e) => {
                debug!("📝 {} {}: \"{}\"", session.call_id(), e, transcript.trim());
                return back_to_listening(session, TurnOutcome::Discarded);
            }
        };
        info!("🗣️ [{}] {}", session.caller_label(), transcript);

        if let Err(outcome) = enter(session, TurnState::Generating) {
            return outcome;
        }
        if self.responder.is_deferred() {
            self.play_cue(session, CannedPhrase::Thinking).await;
        }
        self.respond_and_speak(session, &transcript).await
    }

    /// Trimmed transcript, if it is long enough to be worth answering.
    fn usable_transcript(&self, raw: &str) -> VoiceResult<String> {
        let text = raw.trim();
        if text.chars().count() <= self.config.min_transcript_chars {
            return Err(VoiceError::EmptyTranscript);
        }
        Ok(text.to_string())
    }

    /// Turn for text the telephony provider already recognised.
    pub async fn run_text_turn(&self, session: &CallSession, text: &str) -> TurnOutcome {
        let text = text.trim();
        if text.is_empty() {
            return TurnOutcome::Discarded;
        }
        match session.state() {
            TurnState::Ended => return TurnOutcome::Abandoned,
            TurnState::Listening => {}
            other => {
                debug!("🔁 {} busy in {:?}; dropping text turn", session.call_id(), other);
                return TurnOutcome::Busy;
            }
        }
        if let Err(outcome) = enter(session, TurnState::Generating) {
            return outcome;
        }
        info!("🗣️ [{}] {}", session.caller_label(), text);
        self.respond_and_speak(session, text).await
    }

    async fn respond_and_speak(&self, session: &CallSession, said: &str) -> TurnOutcome {
        let request_id = session.in_flight_request_id().unwrap_or_default();
        let history = session.history();
        let request = ResponseRequest {
            request_id: &request_id,
            caller_id: session.caller_id(),
            caller_label: session.caller_label(),
            text: said,
            history: &history,
        };

        let generation = tokio::time::timeout(
            self.config.generation_timeout(),
            self.responder.respond(request),
        );
        let (text, apology) = match session.cancellable(generation).await {
            None => return TurnOutcome::Abandoned,
            Some(Ok(Ok(reply))) => {
                session.commit_history(reply.history);
                (reply.text, None)
            }
            Some(Ok(Err(VoiceError::GenerationTimeout))) | Some(Err(_)) => {
                warn!("🧠 {} generation timed out", session.call_id());
                self.apology(CannedPhrase::TimeoutApology)
            }
            Some(Ok(Err(e))) => {
                warn!("🧠 {} generation failed: {}", session.call_id(), e);
                self.apology(CannedPhrase::Apology)
            }
        };
        let fallback = apology.is_some();

        if let Err(outcome) = enter(session, TurnState::Synthesizing) {
            return outcome;
        }
        // Apologies are canned and reused; replies get a fresh artifact.
        let synthesis = async {
            match apology {
                Some(phrase) => self.tts.phrase(phrase).await,
                None => {
                    self.tts
                        .synthesize(&text, &ArtifactKey::per_turn("resp"))
                        .await
                }
            }
        };
        let audio_url = match session.cancellable(synthesis).await {
            None => return TurnOutcome::Abandoned,
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                warn!("🔊 {} synthesis failed: {}", session.call_id(), e);
                return back_to_listening(session, TurnOutcome::Unspoken { text });
            }
        };

        if let Err(outcome) = enter(session, TurnState::Playing) {
            return outcome;
        }
        let playback = match session.cancellable(self.playback.play(session, &audio_url)).await {
            None => return TurnOutcome::Abandoned,
            Some(Ok(outcome)) => Some(outcome),
            Some(Err(_)) => None,
        };

        back_to_listening(
            session,
            TurnOutcome::Spoken {
                text,
                audio_url,
                fallback,
                playback,
            },
        )
    }

    fn apology(&self, phrase: CannedPhrase) -> (String, Option<CannedPhrase>) {
        (phrase.text(self.tts.phrases()).to_string(), Some(phrase))
    }

    /// Best-effort canned cue; failures are only logged.
    async fn play_cue(&self, session: &CallSession, phrase: CannedPhrase) {
        let Some(url) = self.tts.canned(phrase) else {
            return;
        };
        if let Some(Err(e)) = session.cancellable(self.playback.play(session, &url)).await {
            debug!("🔈 {} cue {:?} not played: {}", session.call_id(), phrase, e);
        }
    }
}

/// Transition or explain why the turn cannot continue.
fn enter(session: &CallSession, next: TurnState) -> Result<(), TurnOutcome> {
    match session.transition(next) {
        Ok(()) => Ok(()),
        Err(VoiceError::SessionEnded(_)) => Err(TurnOutcome::Abandoned),
        Err(e) => {
            warn!("🔁 {}: {}", session.call_id(), e);
            Err(TurnOutcome::Busy)
        }
    }
}

fn back_to_listening(session: &CallSession, outcome: TurnOutcome) -> TurnOutcome {
    match session.transition(TurnState::Listening) {
        Ok(()) => outcome,
        Err(_) => TurnOutcome::Abandoned,
    }
}
