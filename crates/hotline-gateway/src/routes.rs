//! HTTP and WebSocket surface: provider webhooks, the duplex audio socket and
//! static serving of synthesized audio.

use crate::config::{CallMode, GatewayConfig};
use crate::ncco::Action;
use crate::state::{AppState, DeferredTurn};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use hotline_voice::{
    CallSession, CannedPhrase, IngestOutcome, OutboundFrame, PlaybackOutcome, TurnOutcome,
    TurnState,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type ApiError = (StatusCode, String);

/// Call statuses after which the provider sends nothing more for the call.
const TERMINAL_STATUSES: [&str; 7] = [
    "completed",
    "failed",
    "rejected",
    "busy",
    "cancelled",
    "timeout",
    "unanswered",
];

const SOMETHING_WENT_WRONG: &str = "Sorry, something went wrong.";

pub fn router(state: AppState) -> Router {
    let audio_dir = state.tts().audio_dir().to_path_buf();
    Router::new()
        .route("/health", get(health))
        .route("/answer", get(answer))
        .route("/socket/:call_id", get(socket))
        .route("/speech", post(speech))
        .route("/check-response", post(check_response))
        .route("/event", post(event))
        .nest_service("/audio", ServeDir::new(audio_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "hotline",
        "mode": match state.config.mode {
            CallMode::Stream => "stream",
            CallMode::Recognition => "recognition",
        },
        "active_calls": state.registry.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct AnswerParams {
    from: Option<String>,
    uuid: Option<String>,
}

/// GET /answer: register the call and greet the caller.
async fn answer(
    State(state): State<AppState>,
    Query(params): Query<AnswerParams>,
) -> Result<Json<Vec<Action>>, ApiError> {
    let call_id = required_call_id(params.uuid)?;
    let caller = params.from.unwrap_or_else(|| "unknown".to_string());
    let config = &state.config;
    info!(target: "hotline::gateway", "📞 Call from {} ({})", caller, call_id);

    state.registry.create(
        &call_id,
        &caller,
        &config.caller_label(&caller),
        config.session_channel(),
    );

    let known = config.known_name(&caller);
    let phrases = state.tts().phrases();
    let greeting_text = match known {
        Some(name) => phrases.known_greeting.replace("{name}", name),
        None => phrases.greeting.clone(),
    };
    let greeting = state.tts().greeting_for(known).await;

    let mut actions = vec![Action::stream_or_talk(greeting, &greeting_text)];
    actions.push(match config.mode {
        CallMode::Stream => Action::connect_socket(
            config.socket_uri(&call_id),
            config.endpoint.audio.sample_rate,
        ),
        CallMode::Recognition => listen(config),
    });
    Ok(Json(actions))
}

/// GET /socket/:call_id: the duplex audio channel for an answered call.
async fn socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .registry
        .get(&call_id)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown call {}", call_id)))?;
    Ok(ws.on_upgrade(move |socket| run_socket(socket, session, state)))
}

async fn run_socket(socket: WebSocket, session: Arc<CallSession>, state: AppState) {
    let call_id = session.call_id().to_string();
    info!(target: "hotline::socket", "🔌 Audio socket open for {}", call_id);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(32);
    session.attach_outbound(tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "hotline::socket", "Unencodable frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(chunk)) => {
                if let IngestOutcome::Endpointed(utterance) = session.ingest(&chunk) {
                    let controller = state.controller.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        let outcome = controller.run_audio_turn(&session, utterance).await;
                        debug!(target: "hotline::socket", "Turn on {} finished: {:?}", session.call_id(), outcome);
                    });
                }
            }
            Ok(Message::Text(text)) => {
                debug!(target: "hotline::socket", "📨 {}: {}", call_id, text);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(target: "hotline::socket", "Socket error on {}: {}", call_id, e);
                break;
            }
        }
    }

    session.detach_outbound();
    // A re-answered call may already own this id.
    let current = state
        .registry
        .get(&call_id)
        .is_some_and(|registered| Arc::ptr_eq(&registered, &session));
    if current {
        state.release(&call_id);
    }
    writer.abort();
    info!(target: "hotline::socket", "🔌 Audio socket closed for {}", call_id);
}

#[derive(Debug, Deserialize)]
struct SpeechEvent {
    uuid: Option<String>,
    #[serde(default)]
    speech: SpeechResult,
}

#[derive(Debug, Default, Deserialize)]
struct SpeechResult {
    #[serde(default)]
    results: Vec<SpeechAlternative>,
    timeout_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpeechAlternative {
    #[serde(default)]
    text: String,
}

/// POST /speech: the provider's recognition result for the last input action.
async fn speech(
    State(state): State<AppState>,
    Json(event): Json<SpeechEvent>,
) -> Result<Json<Vec<Action>>, ApiError> {
    let call_id = required_call_id(event.uuid)?;
    let Some(session) = registered(&state, &call_id) else {
        return Ok(Json(Vec::new()));
    };
    let config = &state.config;
    let tts = state.tts();

    let heard = event
        .speech
        .results
        .first()
        .map(|r| r.text.trim())
        .filter(|text| !text.is_empty());

    if let Some(text) = heard {
        if state.controller.is_deferred() {
            if session.state() != TurnState::Listening {
                debug!(target: "hotline::gateway", "🔁 {} busy; dropping \"{}\"", call_id, text);
                return Ok(Json(vec![listen(config)]));
            }
            // Start the turn now so the worker gets the message while the caller
            // hears the cue; the notify callback collects the reply.
            let ticket = uuid::Uuid::new_v4().to_string();
            let handle = {
                let controller = state.controller.clone();
                let session = session.clone();
                let text = text.to_string();
                tokio::spawn(async move { controller.run_text_turn(&session, &text).await })
            };
            state.deferred.insert(
                call_id.clone(),
                DeferredTurn {
                    ticket: ticket.clone(),
                    handle,
                },
            );
            return Ok(Json(vec![
                Action::stream_or_talk(
                    tts.canned(CannedPhrase::Thinking),
                    &tts.phrases().thinking,
                ),
                Action::notify(
                    json!({ "ticket": ticket }),
                    config.webhook_url("/check-response"),
                ),
            ]));
        }
        let outcome = state.controller.run_text_turn(&session, text).await;
        return Ok(Json(actions_after_turn(config, outcome)));
    }

    if let Some(reason) = event.speech.timeout_reason {
        debug!(target: "hotline::gateway", "⏳ {} input timed out: {}", call_id, reason);
        return Ok(Json(vec![
            Action::stream_or_talk(tts.canned(CannedPhrase::Timeout), &tts.phrases().timeout),
            Action::listen(config.webhook_url("/speech"), 2.0, None),
        ]));
    }

    let url = match tts.phrase(CannedPhrase::Goodbye).await {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(target: "hotline::gateway", "Goodbye not synthesized: {}", e);
            None
        }
    };
    state.release(&call_id);
    Ok(Json(vec![Action::stream_or_talk(url, &tts.phrases().goodbye)]))
}

#[derive(Debug, Deserialize)]
struct NotifyEvent {
    uuid: Option<String>,
    payload: Option<NotifyPayload>,
}

#[derive(Debug, Deserialize)]
struct NotifyPayload {
    ticket: Option<String>,
}

/// POST /check-response: collect the deferred turn started by /speech.
async fn check_response(
    State(state): State<AppState>,
    Json(event): Json<NotifyEvent>,
) -> Result<Json<Vec<Action>>, ApiError> {
    let call_id = required_call_id(event.uuid)?;
    if registered(&state, &call_id).is_none() {
        return Ok(Json(Vec::new()));
    }
    let config = &state.config;

    let ticket = event.payload.and_then(|p| p.ticket);
    let pending = ticket.as_deref().and_then(|ticket| {
        state
            .deferred
            .remove_if(&call_id, |_, turn| turn.ticket == ticket)
            .map(|(_, turn)| turn)
    });
    let Some(pending) = pending else {
        warn!(target: "hotline::gateway", "No pending turn for {} (ticket {:?})", call_id, ticket);
        return Ok(Json(vec![Action::talk(SOMETHING_WENT_WRONG), listen(config)]));
    };

    match pending.handle.await {
        Ok(outcome) => Ok(Json(actions_after_turn(config, outcome))),
        Err(e) => {
            warn!(target: "hotline::gateway", "Deferred turn for {} failed: {}", call_id, e);
            Ok(Json(vec![Action::talk(SOMETHING_WENT_WRONG), listen(config)]))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallEvent {
    uuid: Option<String>,
    status: Option<String>,
}

/// POST /event: call status updates; terminal ones tear the session down.
async fn event(State(state): State<AppState>, Json(event): Json<CallEvent>) -> StatusCode {
    let (Some(call_id), Some(status)) = (event.uuid, event.status) else {
        return StatusCode::OK;
    };
    info!(target: "hotline::gateway", "📟 {} status {}", call_id, status);
    if TERMINAL_STATUSES.contains(&status.as_str()) {
        state.release(&call_id);
    }
    StatusCode::OK
}

fn required_call_id(uuid: Option<String>) -> Result<String, ApiError> {
    uuid.filter(|id| !id.trim().is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing call uuid".to_string()))
}

/// The live session for `call_id`. Sessions only come from /answer, so a webhook
/// for an unknown or released call gets nothing and the provider ends the call.
fn registered(state: &AppState, call_id: &str) -> Option<Arc<CallSession>> {
    let session = state.registry.get(call_id);
    if session.is_none() {
        debug!(target: "hotline::gateway", "Ignoring webhook for inactive call {}", call_id);
    }
    session
}

fn listen(config: &GatewayConfig) -> Action {
    Action::listen(config.webhook_url("/speech"), 1.5, Some(30))
}

/// Webhook actions that carry a finished turn to the caller and keep listening.
fn actions_after_turn(config: &GatewayConfig, outcome: TurnOutcome) -> Vec<Action> {
    match outcome {
        TurnOutcome::Spoken {
            playback: Some(PlaybackOutcome::Instruction(url)),
            ..
        } => vec![Action::stream(url), listen(config)],
        // Both channels failed; the webhook response is the last way out.
        TurnOutcome::Spoken {
            audio_url,
            playback: None,
            ..
        } => vec![Action::stream(audio_url), listen(config)],
        TurnOutcome::Spoken { .. } => vec![listen(config)],
        TurnOutcome::Unspoken { .. } => vec![listen(config)],
        TurnOutcome::Discarded | TurnOutcome::Busy => vec![listen(config)],
        TurnOutcome::Abandoned => Vec::new(),
    }
}
