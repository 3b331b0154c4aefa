//! Queued strategy: enqueue, wake the worker, poll for the correlated reply.

use super::{Reply, ResponseGateway, ResponseRequest};
use crate::error::{VoiceError, VoiceResult};
use crate::queue::{PendingMessage, QueueConfig, QueueStore};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Out-of-band nudge telling the worker to drain `incoming`.
#[async_trait]
pub trait WakeSignal: Send + Sync {
    async fn wake(&self) -> VoiceResult<()>;
}

/// Wake by running a local command under a fixed budget.
#[derive(Debug, Clone)]
pub struct CommandWake {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandWake {
    /// `None` when the command line is empty.
    pub fn from_command(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl WakeSignal for CommandWake {
    async fn wake(&self) -> VoiceResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = tokio::time::timeout(self.timeout, cmd.status())
            .await
            .map_err(|_| VoiceError::QueueUnavailable("wake command timed out".to_string()))??;
        if !status.success() {
            return Err(VoiceError::QueueUnavailable(format!(
                "wake command exited with {}",
                status
            )));
        }
        Ok(())
    }
}

/// For workers that poll on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWake;

#[async_trait]
impl WakeSignal for NoopWake {
    async fn wake(&self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Hand-off to an out-of-process worker through the shared [`QueueStore`].
///
/// Each request is enqueued under its own request id and only this call polls for
/// that id, which is what makes consumption exactly-once (see [`crate::queue`]).
pub struct QueuedBridgeClient {
    store: Arc<QueueStore>,
    wake: Arc<dyn WakeSignal>,
    poll_interval: Duration,
    timeout: Duration,
}

impl QueuedBridgeClient {
    pub fn new(store: Arc<QueueStore>, wake: Arc<dyn WakeSignal>, config: &QueueConfig) -> Self {
        Self {
            store,
            wake,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    fn signal_worker(&self) {
        let wake = self.wake.clone();
        tokio::spawn(async move {
            match wake.wake().await {
                Ok(()) => debug!("🔔 Worker woken"),
                Err(e) => warn!("🔔 Wake failed (worker may still poll): {}", e),
            }
        });
    }

    /// Poll for `id` until it appears or the timeout elapses.
    ///
    /// If this future is dropped or gives up before the reply arrives, the id is
    /// abandoned in the store so a late reply does not linger.
    async fn await_reply(&self, id: &str) -> VoiceResult<String> {
        let mut pending = PendingReply {
            store: &self.store,
            id,
            settled: false,
        };
        let text = self.poll_store(id).await?;
        pending.settled = true;
        Ok(text)
    }

    async fn poll_store(&self, id: &str) -> VoiceResult<String> {
        let deadline = Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.store.take_response(id).await {
                Ok(Some(text)) => return Ok(text),
                Ok(None) => {}
                Err(e) => warn!("📭 Poll for {} failed: {}", id, e),
            }
            if Instant::now() >= deadline {
                info!("⏱️ No reply for {} within {:?}", id, self.timeout);
                return Err(VoiceError::GenerationTimeout);
            }
        }
    }
}

/// Abandons its request on drop unless the reply was collected.
struct PendingReply<'a> {
    store: &'a QueueStore,
    id: &'a str,
    settled: bool,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.store.abandon(self.id);
        }
    }
}

#[async_trait]
impl ResponseGateway for QueuedBridgeClient {
    async fn respond(&self, request: ResponseRequest<'_>) -> VoiceResult<Reply> {
        let message = PendingMessage::new(request.request_id, request.caller_id, request.text);
        self.store.enqueue(message).await?;
        self.signal_worker();

        let text = self.await_reply(request.request_id).await?;
        info!("📬 Reply for {}: \"{}\"", request.request_id, text);
        Ok(Reply::extending(request.history, request.text, text))
    }

    fn is_deferred(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "queued"
    }
}
