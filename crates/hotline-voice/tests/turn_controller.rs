//! Turn controller behaviour end to end, with fake collaborators.

mod common;

use common::{harness, init_tracing, Behaviour, CountingTts, FakeResponder, FakeStt, OverlapProbe};
use hotline_voice::{
    audio::tone, CannedPhrase, ConversationTurn, EndpointConfig, IngestOutcome, OutboundFrame,
    PlaybackChannel, PlaybackOutcome, TurnConfig, TurnOutcome, TurnState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

fn utterance() -> Vec<u8> {
    tone(&Default::default(), Duration::from_millis(500), 800)
}

fn spoken_text(outcome: &TurnOutcome) -> &str {
    match outcome {
        TurnOutcome::Spoken { text, .. } => text,
        other => panic!("expected a spoken turn, got {other:?}"),
    }
}

#[tokio::test]
async fn full_turn_speaks_the_reply_and_returns_to_listening() {
    init_tracing();
    let h = harness(
        Arc::new(FakeStt::says("what time is it")),
        Arc::new(FakeResponder::new(Behaviour::Reply("It's half past four.".into()))),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+971", "JV", PlaybackChannel::Socket);
    let (tx, mut rx) = mpsc::channel(8);
    session.attach_outbound(tx);
    assert_ok!(session.transition(TurnState::Endpointed));

    let outcome = h.controller.run_audio_turn(&session, utterance()).await;

    match &outcome {
        TurnOutcome::Spoken {
            text,
            audio_url,
            fallback,
            playback,
        } => {
            assert_eq!(text, "It's half past four.");
            assert!(!fallback);
            assert!(audio_url.starts_with("https://voice.test/audio/resp-"));
            assert_eq!(
                *playback,
                Some(PlaybackOutcome::Delivered(PlaybackChannel::Socket))
            );
            assert_eq!(
                rx.recv().await,
                Some(OutboundFrame::PlayAudio {
                    audio_url: audio_url.clone()
                })
            );
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(session.state(), TurnState::Listening);
    assert!(session.in_flight_request_id().is_none());
    assert_eq!(
        session.history(),
        vec![
            ConversationTurn::caller("what time is it"),
            ConversationTurn::assistant("It's half past four."),
        ]
    );
}

#[tokio::test]
async fn failed_transcription_stays_quiet() {
    let h = harness(
        Arc::new(FakeStt::fails("engine crashed")),
        Arc::new(FakeResponder::new(Behaviour::Reply("unused".into()))),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Socket);
    session.transition(TurnState::Endpointed).unwrap();

    let outcome = h.controller.run_audio_turn(&session, utterance()).await;

    assert_eq!(outcome, TurnOutcome::Discarded);
    assert_eq!(session.state(), TurnState::Listening);
    assert!(session.history().is_empty());
    assert_eq!(h.tts.calls(), 0);
}

#[tokio::test]
async fn too_short_transcript_is_not_a_turn() {
    let h = harness(
        Arc::new(FakeStt::says(" uh ")),
        Arc::new(FakeResponder::new(Behaviour::Reply("unused".into()))),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Socket);
    session.transition(TurnState::Endpointed).unwrap();

    assert_eq!(
        h.controller.run_audio_turn(&session, utterance()).await,
        TurnOutcome::Discarded
    );
    assert!(session.history().is_empty());
    assert_eq!(h.tts.calls(), 0);
}

#[tokio::test]
async fn generation_failure_apologises_and_keeps_history() {
    let h = harness(
        Arc::new(FakeStt::says("book me a table")),
        Arc::new(FakeResponder::new(Behaviour::Fail)),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Control);
    session.transition(TurnState::Endpointed).unwrap();

    let outcome = h.controller.run_audio_turn(&session, utterance()).await;

    assert_eq!(spoken_text(&outcome), "Sorry, can you say that again?");
    assert!(matches!(
        outcome,
        TurnOutcome::Spoken {
            fallback: true,
            playback: Some(PlaybackOutcome::Instruction(_)),
            ..
        }
    ));
    assert!(session.history().is_empty());
    assert_eq!(session.state(), TurnState::Listening);

    // The apology is a canned artifact: synthesized once, then reused.
    let again = h.controller.run_text_turn(&session, "book me a table").await;
    match again {
        TurnOutcome::Spoken { audio_url, .. } => {
            assert_eq!(audio_url, "https://voice.test/audio/apology.mp3")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.tts.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn generation_timeout_uses_the_timeout_apology() {
    let mut responder = FakeResponder::new(Behaviour::Reply("eventually".into()));
    responder.delay = Duration::from_secs(120);
    let h = harness(
        Arc::new(FakeStt::says("unused")),
        Arc::new(responder),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Control);

    let outcome = h.controller.run_text_turn(&session, "are you there").await;

    assert_eq!(
        spoken_text(&outcome),
        "Sorry, I'm taking too long. Can you ask again?"
    );
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn synthesis_failure_skips_playback() {
    let h = harness(
        Arc::new(FakeStt::says("hello there")),
        Arc::new(FakeResponder::new(Behaviour::Reply("Hi!".into()))),
        CountingTts {
            fail: true,
            ..Default::default()
        },
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Socket);
    let (tx, mut rx) = mpsc::channel(8);
    session.attach_outbound(tx);
    session.transition(TurnState::Endpointed).unwrap();

    let outcome = h.controller.run_audio_turn(&session, utterance()).await;

    assert_eq!(outcome, TurnOutcome::Unspoken { text: "Hi!".into() });
    assert_eq!(session.state(), TurnState::Listening);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn deferred_strategy_plays_the_thinking_cue_first() {
    let mut responder = FakeResponder::new(Behaviour::Reply("Done.".into()));
    responder.deferred = true;
    let h = harness(
        Arc::new(FakeStt::says("check my calendar")),
        Arc::new(responder),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    h.cache.precache().await;
    let thinking = h.cache.canned(CannedPhrase::Thinking).unwrap();

    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Socket);
    let (tx, mut rx) = mpsc::channel(8);
    session.attach_outbound(tx);
    session.transition(TurnState::Endpointed).unwrap();

    let outcome = h.controller.run_audio_turn(&session, utterance()).await;

    assert_eq!(spoken_text(&outcome), "Done.");
    assert_eq!(
        rx.recv().await,
        Some(OutboundFrame::PlayAudio {
            audio_url: thinking
        })
    );
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn text_turn_while_busy_is_dropped() {
    let h = harness(
        Arc::new(FakeStt::says("unused")),
        Arc::new(FakeResponder::new(Behaviour::Reply("unused".into()))),
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Control);
    session.transition(TurnState::Generating).unwrap();

    assert_eq!(
        h.controller.run_text_turn(&session, "hello again").await,
        TurnOutcome::Busy
    );
    assert_eq!(h.tts.calls(), 0);
}

#[tokio::test]
async fn hangup_while_generating_drops_the_late_reply() {
    init_tracing();
    let responder = Arc::new(FakeResponder::new(Behaviour::Hang));
    let entered = responder.entered.clone();
    let release = responder.release.clone();
    let h = harness(
        Arc::new(FakeStt::says("what's the weather like")),
        responder,
        CountingTts::default(),
        EndpointConfig::default(),
        TurnConfig::default(),
    );
    let session = h.registry.create("call-d", "+1", "+1", PlaybackChannel::Socket);
    let (tx, mut rx) = mpsc::channel(8);
    session.attach_outbound(tx);
    session.transition(TurnState::Endpointed).unwrap();

    let turn = {
        let controller = h.controller.clone();
        let session = session.clone();
        tokio::spawn(async move { controller.run_audio_turn(&session, utterance()).await })
    };

    entered.notified().await;
    assert_eq!(session.state(), TurnState::Generating);
    assert!(session.in_flight_request_id().is_some());

    h.registry.remove("call-d");
    assert!(!h.registry.contains("call-d"));
    // The worker answers after teardown; nobody is listening anymore.
    release.notify_one();

    assert_eq!(turn.await.unwrap(), TurnOutcome::Abandoned);
    assert_eq!(session.state(), TurnState::Ended);
    assert!(session.history().is_empty());
    assert_eq!(h.tts.calls(), 0);
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn no_two_gateway_calls_overlap_for_one_call() {
    init_tracing();
    let probe = Arc::new(OverlapProbe::default());
    let mut stt = FakeStt::says("tell me something");
    stt.delay = Duration::from_millis(30);
    stt.probe = probe.clone();
    let mut responder = FakeResponder::new(Behaviour::Reply("Something.".into()));
    responder.delay = Duration::from_millis(30);
    responder.probe = probe.clone();

    // Every loud chunk completes an utterance.
    let endpoint = EndpointConfig {
        silence_timeout_ms: 0,
        min_utterance_ms: 0,
        ..Default::default()
    };
    let h = harness(
        Arc::new(stt),
        Arc::new(responder),
        CountingTts::default(),
        endpoint,
        TurnConfig::default(),
    );
    let session = h.registry.create("c1", "+1", "+1", PlaybackChannel::Socket);
    let (tx, mut rx) = mpsc::channel(256);
    session.attach_outbound(tx);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let audio = Default::default();
    let loud = tone(&audio, Duration::from_millis(20), 800);
    let quiet = tone(&audio, Duration::from_millis(20), 0);

    let mut turns = Vec::new();
    for i in 0..200 {
        let chunk = if i % 2 == 0 { &loud } else { &quiet };
        if let IngestOutcome::Endpointed(utterance) = session.ingest(chunk) {
            let controller = h.controller.clone();
            let session = session.clone();
            turns.push(tokio::spawn(async move {
                controller.run_audio_turn(&session, utterance).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for turn in turns {
        turn.await.unwrap();
    }

    assert!(probe.total() >= 2, "expected several turns to run");
    assert_eq!(probe.max(), 1, "gateway calls overlapped");
    assert!(session.dropped_chunks() > 0);

    h.registry.remove("c1");
    drain.await.unwrap();
}
