//! Call-control action lists returned from the provider webhooks.

use serde::Serialize;
use serde_json::Value;

const SPEECH_LANGUAGE: &str = "en-US";
const FALLBACK_VOICE: &str = "Brian";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Stream {
        #[serde(rename = "streamUrl")]
        stream_url: Vec<String>,
    },
    Talk {
        text: String,
        #[serde(rename = "voiceName")]
        voice_name: String,
    },
    Input {
        #[serde(rename = "type")]
        kind: Vec<String>,
        speech: SpeechSettings,
        #[serde(rename = "eventUrl")]
        event_url: Vec<String>,
    },
    Connect {
        endpoint: Vec<SocketEndpoint>,
    },
    Notify {
        payload: Value,
        #[serde(rename = "eventUrl")]
        event_url: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechSettings {
    pub end_on_silence: f64,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocketEndpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
}

impl Action {
    pub fn stream(url: impl Into<String>) -> Self {
        Action::Stream {
            stream_url: vec![url.into()],
        }
    }

    /// Provider-voiced text, used when no synthesized artifact exists.
    pub fn talk(text: impl Into<String>) -> Self {
        Action::Talk {
            text: text.into(),
            voice_name: FALLBACK_VOICE.to_string(),
        }
    }

    /// Play `url` if there is one, otherwise have the provider read `text`.
    pub fn stream_or_talk(url: Option<String>, text: &str) -> Self {
        match url {
            Some(url) => Self::stream(url),
            None => Self::talk(text),
        }
    }

    /// Wait for the caller's next utterance.
    pub fn listen(event_url: impl Into<String>, end_on_silence: f64, max_duration: Option<u32>) -> Self {
        Action::Input {
            kind: vec!["speech".to_string()],
            speech: SpeechSettings {
                end_on_silence,
                language: SPEECH_LANGUAGE.to_string(),
                max_duration,
            },
            event_url: vec![event_url.into()],
        }
    }

    /// Open the duplex audio socket, 16 kHz linear PCM.
    pub fn connect_socket(uri: impl Into<String>, sample_rate: u32) -> Self {
        Action::Connect {
            endpoint: vec![SocketEndpoint {
                kind: "websocket".to_string(),
                uri: uri.into(),
                content_type: format!("audio/l16;rate={}", sample_rate),
            }],
        }
    }

    pub fn notify(payload: Value, event_url: impl Into<String>) -> Self {
        Action::Notify {
            payload,
            event_url: vec![event_url.into()],
        }
    }
}
