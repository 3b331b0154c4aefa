//! Process-wide repository of active calls.
//!
//! Owned by the top-level wiring and passed to whoever needs it. Removing a call
//! ends its session, which cancels any in-flight transcription, generation or poll.

use crate::endpoint::{EndpointConfig, IngestOutcome};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::PlaybackChannel;
use crate::turn::CallSession;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct CallSessionRegistry {
    sessions: DashMap<String, Arc<CallSession>>,
    endpoint: EndpointConfig,
}

impl CallSessionRegistry {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            endpoint,
        }
    }

    /// Create a listening session for `call_id`. A session already registered under
    /// the same id is ended and replaced.
    pub fn create(
        &self,
        call_id: &str,
        caller_id: &str,
        caller_label: &str,
        channel: PlaybackChannel,
    ) -> Arc<CallSession> {
        let session = Arc::new(CallSession::new(
            call_id,
            caller_id,
            caller_label,
            channel,
            self.endpoint.clone(),
        ));
        session.start_listening();
        if let Some(previous) = self.sessions.insert(call_id.to_string(), session.clone()) {
            previous.end();
        }
        info!(
            "📞 Session {} created for {} ({} active)",
            call_id,
            caller_label,
            self.sessions.len()
        );
        session
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.sessions.contains_key(call_id)
    }

    /// Remove and end the session. Safe to call more than once.
    pub fn remove(&self, call_id: &str) -> Option<Arc<CallSession>> {
        let (_, session) = self.sessions.remove(call_id)?;
        session.end();
        info!(
            "📴 Session {} released ({} active)",
            call_id,
            self.sessions.len()
        );
        Some(session)
    }

    /// Feed a chunk of caller audio to the call's session.
    pub fn ingest(&self, call_id: &str, chunk: &[u8]) -> VoiceResult<IngestOutcome> {
        let session = self
            .get(call_id)
            .ok_or_else(|| VoiceError::SessionNotFound(call_id.to_string()))?;
        Ok(session.ingest(chunk))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for CallSessionRegistry {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}
