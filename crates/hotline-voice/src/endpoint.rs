//! Audio ingest buffer and energy endpointer.
//!
//! Accumulates the caller's PCM for one call and decides when an utterance has
//! ended: continuous silence of at least `silence_timeout_ms` after speech, with
//! at least `min_utterance_ms` of audio buffered. On firing the whole buffer is
//! handed out and the ingest state is reset in the same call, so no chunk can
//! belong to two utterances.
//!
//! The endpointer itself never drops audio. Dropping chunks that arrive while a
//! turn is being processed is the session's job (see [`crate::turn`]).

use crate::audio::{rms_energy, AudioConfig};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Endpointing parameters. Call-quality tuning, not correctness-critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Inbound PCM format
    pub audio: AudioConfig,

    /// RMS below this counts as silence (default: 100)
    pub energy_threshold: f64,

    /// Continuous silence that ends an utterance (default: 1500ms)
    pub silence_timeout_ms: u64,

    /// Minimum buffered audio before an endpoint may fire (default: 1500ms)
    pub min_utterance_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            energy_threshold: 100.0,
            silence_timeout_ms: 1500,
            min_utterance_ms: 1500,
        }
    }
}

impl EndpointConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn min_utterance(&self) -> Duration {
        Duration::from_millis(self.min_utterance_ms)
    }
}

/// Result of feeding one chunk to the endpointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Keep listening.
    Continue,
    /// End of utterance: the full buffered audio, now owned by the caller.
    Endpointed(Vec<u8>),
}

/// Per-call ingest buffer with silence tracking.
#[derive(Debug)]
pub struct Endpointer {
    config: EndpointConfig,
    buffer: Vec<u8>,
    silence_started_at: Option<Instant>,
    heard_speech: bool,
}

impl Endpointer {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            silence_started_at: None,
            heard_speech: false,
        }
    }

    /// Feed one chunk using the wall clock.
    pub fn ingest(&mut self, chunk: &[u8]) -> IngestOutcome {
        self.ingest_at(chunk, Instant::now())
    }

    /// Feed one chunk observed at `now`.
    pub fn ingest_at(&mut self, chunk: &[u8], now: Instant) -> IngestOutcome {
        if chunk.is_empty() {
            return IngestOutcome::Continue;
        }

        self.buffer.extend_from_slice(chunk);

        let energy = rms_energy(chunk);
        if energy < self.config.energy_threshold {
            if self.silence_started_at.is_none() {
                debug!("🤫 Silence started (rms {:.1})", energy);
                self.silence_started_at = Some(now);
            }
        } else {
            if self.silence_started_at.is_some() {
                debug!("🎤 Speech resumed (rms {:.1})", energy);
            }
            self.silence_started_at = None;
            self.heard_speech = true;
        }

        if !self.heard_speech {
            // Nothing to endpoint yet: keep only a short pre-roll so a quiet
            // line cannot grow the buffer without bound.
            self.trim_preroll();
            return IngestOutcome::Continue;
        }

        let silence = self
            .silence_started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        let buffered = self.buffered();

        if silence >= self.config.silence_timeout() && buffered >= self.config.min_utterance() {
            info!(
                "🎯 Endpoint: {}ms of audio after {}ms silence",
                buffered.as_millis(),
                silence.as_millis()
            );
            let utterance = std::mem::take(&mut self.buffer);
            self.silence_started_at = None;
            self.heard_speech = false;
            return IngestOutcome::Endpointed(utterance);
        }

        IngestOutcome::Continue
    }

    /// Discard everything buffered so far.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.silence_started_at = None;
        self.heard_speech = false;
    }

    /// Duration of audio currently buffered.
    pub fn buffered(&self) -> Duration {
        self.config.audio.duration_of(self.buffer.len())
    }

    pub fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn trim_preroll(&mut self) {
        let keep = self.config.audio.bytes_for(self.config.silence_timeout());
        if self.buffer.len() > keep {
            let excess = self.buffer.len() - keep;
            self.buffer.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tone;

    const CHUNK: Duration = Duration::from_millis(20);

    fn feed(
        ep: &mut Endpointer,
        start: Instant,
        offset: &mut Duration,
        total: Duration,
        rms: i16,
    ) -> Vec<(Duration, Vec<u8>)> {
        let audio = ep.config().audio;
        let chunk = tone(&audio, CHUNK, rms);
        let mut fired = Vec::new();
        let end = *offset + total;
        while *offset < end {
            if let IngestOutcome::Endpointed(buf) = ep.ingest_at(&chunk, start + *offset) {
                fired.push((*offset, buf));
            }
            *offset += CHUNK;
        }
        fired
    }

    fn config(min_utterance_ms: u64) -> EndpointConfig {
        EndpointConfig {
            energy_threshold: 100.0,
            silence_timeout_ms: 1500,
            min_utterance_ms,
            ..Default::default()
        }
    }

    #[test]
    fn flat_quiet_stream_never_endpoints() {
        let mut ep = Endpointer::new(config(1500));
        let start = Instant::now();
        let mut offset = Duration::ZERO;

        let fired = feed(&mut ep, start, &mut offset, Duration::from_millis(2000), 50);
        assert!(fired.is_empty());
        // Pre-roll is bounded by the silence timeout.
        assert!(ep.buffered() <= Duration::from_millis(1500));
    }

    #[test]
    fn speech_then_silence_endpoints_once() {
        let mut ep = Endpointer::new(config(1500));
        let start = Instant::now();
        let mut offset = Duration::ZERO;

        let mut fired = feed(&mut ep, start, &mut offset, Duration::from_millis(2000), 500);
        assert!(fired.is_empty(), "no endpoint while speaking");
        fired.extend(feed(&mut ep, start, &mut offset, Duration::from_millis(1600), 20));

        assert_eq!(fired.len(), 1);
        let (at, utterance) = &fired[0];
        assert_eq!(*at, Duration::from_millis(3500));
        let dur = ep.config().audio.duration_of(utterance.len());
        assert!(
            dur >= Duration::from_millis(3400) && dur <= Duration::from_millis(3600),
            "utterance was {:?}",
            dur
        );
    }

    #[test]
    fn fires_exactly_when_both_conditions_hold() {
        // Short speech: silence timeout is reached before the minimum length.
        let mut ep = Endpointer::new(config(2500));
        let start = Instant::now();
        let mut offset = Duration::ZERO;

        assert!(feed(&mut ep, start, &mut offset, Duration::from_millis(400), 800).is_empty());
        let fired = feed(&mut ep, start, &mut offset, Duration::from_millis(3000), 0);

        assert_eq!(fired.len(), 1);
        let (at, utterance) = &fired[0];
        // Buffered reaches 2500ms with the chunk arriving at 2480ms.
        assert_eq!(*at, Duration::from_millis(2480));
        assert_eq!(
            ep.config().audio.duration_of(utterance.len()),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn speech_resets_the_silence_timer() {
        let mut ep = Endpointer::new(config(500));
        let start = Instant::now();
        let mut offset = Duration::ZERO;

        assert!(feed(&mut ep, start, &mut offset, Duration::from_millis(600), 500).is_empty());
        assert!(feed(&mut ep, start, &mut offset, Duration::from_millis(1400), 10).is_empty());
        assert!(ep.silence_started_at().is_some());
        assert!(feed(&mut ep, start, &mut offset, Duration::from_millis(20), 500).is_empty());
        assert!(ep.silence_started_at().is_none());
        assert!(feed(&mut ep, start, &mut offset, Duration::from_millis(1400), 10).is_empty());
    }

    #[test]
    fn consumed_audio_is_not_retained() {
        let mut ep = Endpointer::new(config(500));
        let start = Instant::now();
        let mut offset = Duration::ZERO;

        feed(&mut ep, start, &mut offset, Duration::from_millis(600), 500);
        let fired = feed(&mut ep, start, &mut offset, Duration::from_millis(1500), 10);
        assert_eq!(fired.len(), 1);
        assert_eq!(ep.buffered(), Duration::ZERO);
        assert!(ep.silence_started_at().is_none());
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut ep = Endpointer::new(EndpointConfig::default());
        assert_eq!(ep.ingest(&[]), IngestOutcome::Continue);
        assert!(ep.silence_started_at().is_none());
        assert_eq!(ep.buffered(), Duration::ZERO);
    }
}
