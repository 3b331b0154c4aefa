//! Fakes shared by the integration tests. No network, no audio hardware.

#![allow(dead_code)]

use async_trait::async_trait;
use hotline_voice::{
    CallSessionRegistry, EndpointConfig, PlaybackConfig, PlaybackDispatcher, Reply,
    ResponseGateway, ResponseRequest, SpeechSynthesisCache, SynthesisConfig, SynthesisProvider,
    TranscriptionGateway, TurnConfig, TurnController, VoiceError, VoiceResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hotline_voice=debug")
        .with_test_writer()
        .try_init();
}

/// Tracks how many gateway calls are running at once.
#[derive(Debug, Default)]
pub struct OverlapProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    total: AtomicUsize,
}

pub struct ProbeGuard<'a>(&'a OverlapProbe);

impl OverlapProbe {
    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        ProbeGuard(self)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transcriber returning a fixed result after an optional delay.
pub struct FakeStt {
    pub result: Result<String, String>,
    pub delay: Duration,
    pub probe: Arc<OverlapProbe>,
}

impl FakeStt {
    pub fn says(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            delay: Duration::ZERO,
            probe: Arc::default(),
        }
    }

    pub fn fails(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            delay: Duration::ZERO,
            probe: Arc::default(),
        }
    }
}

#[async_trait]
impl TranscriptionGateway for FakeStt {
    async fn transcribe(&self, _pcm: &[u8]) -> VoiceResult<String> {
        let _guard = self.probe.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone().map_err(VoiceError::Transcription)
    }
}

pub enum Behaviour {
    Reply(String),
    Fail,
    /// Never answers on its own; waits for `release`.
    Hang,
}

/// Response gateway with scripted behaviour.
pub struct FakeResponder {
    pub behaviour: Behaviour,
    pub delay: Duration,
    pub deferred: bool,
    pub probe: Arc<OverlapProbe>,
    /// Signalled when `respond` is entered.
    pub entered: Arc<Notify>,
    /// Lets a hanging responder finish.
    pub release: Arc<Notify>,
}

impl FakeResponder {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            deferred: false,
            probe: Arc::default(),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl ResponseGateway for FakeResponder {
    async fn respond(&self, request: ResponseRequest<'_>) -> VoiceResult<Reply> {
        let _guard = self.probe.enter();
        self.entered.notify_one();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behaviour {
            Behaviour::Reply(text) => Ok(Reply::extending(
                request.history,
                request.text,
                text.clone(),
            )),
            Behaviour::Fail => Err(VoiceError::Generation("provider down".into())),
            Behaviour::Hang => {
                self.release.notified().await;
                Ok(Reply::extending(
                    request.history,
                    request.text,
                    "too late".into(),
                ))
            }
        }
    }

    fn is_deferred(&self) -> bool {
        self.deferred
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Synthesis provider that echoes text as bytes and counts calls.
#[derive(Default)]
pub struct CountingTts {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl CountingTts {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisProvider for CountingTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(VoiceError::Synthesis("voice service down".into()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

pub struct Harness {
    pub controller: Arc<TurnController>,
    pub registry: Arc<CallSessionRegistry>,
    pub tts: Arc<CountingTts>,
    pub cache: Arc<SpeechSynthesisCache>,
    pub audio_dir: tempfile::TempDir,
}

pub fn harness(
    stt: Arc<dyn TranscriptionGateway>,
    responder: Arc<dyn ResponseGateway>,
    tts: CountingTts,
    endpoint: EndpointConfig,
    turn: TurnConfig,
) -> Harness {
    let audio_dir = tempfile::tempdir().unwrap();
    let tts = Arc::new(tts);
    let cache = Arc::new(SpeechSynthesisCache::new(
        tts.clone(),
        &SynthesisConfig {
            audio_dir: audio_dir.path().to_path_buf(),
            public_base_url: "https://voice.test".into(),
            ..Default::default()
        },
    ));
    let playback = Arc::new(
        PlaybackDispatcher::new(
            &PlaybackConfig {
                api_base: "http://127.0.0.1:9".into(),
                timeout_ms: 1_000,
                ..Default::default()
            },
            None,
        )
        .unwrap(),
    );
    let controller = Arc::new(TurnController::new(
        stt,
        responder,
        cache.clone(),
        playback,
        turn,
    ));
    Harness {
        controller,
        registry: Arc::new(CallSessionRegistry::new(endpoint)),
        tts,
        cache,
        audio_dir,
    }
}
