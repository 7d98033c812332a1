//! Keeps the MCU's `streaming_active` flag in step with MPD's playback state.

use crate::backend::{self, Playback};
use crate::link::McuLink;
use crate::power::SharedState;
use mynd_proto::protocol;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(1);
const FAILURE_WARN_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// MCU not initialized; nothing polled.
    Idle,
    Unavailable,
    Unchanged,
    Sent(bool),
}

pub struct Reconciler {
    state: SharedState,
    playback: Arc<dyn Playback>,
    mcu: Arc<McuLink>,
    consecutive_failures: u32,
}

impl Reconciler {
    pub fn new(state: SharedState, playback: Arc<dyn Playback>, mcu: Arc<McuLink>) -> Self {
        Self {
            state,
            playback,
            mcu,
            consecutive_failures: 0,
        }
    }

    pub async fn tick(&mut self) -> Tick {
        if !self.state.lock().await.mcu_initialized {
            return Tick::Idle;
        }

        let state = self.playback.playback_state().await;
        let Some(active) = backend::streaming_active(state.as_deref()) else {
            self.consecutive_failures += 1;
            if self.consecutive_failures % FAILURE_WARN_EVERY == 0 {
                warn!(
                    "Could not determine MPD playback state ({} consecutive failures)",
                    self.consecutive_failures
                );
            }
            return Tick::Unavailable;
        };
        if self.consecutive_failures > 0 {
            debug!(
                "MPD playback state available again after {} failures",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }

        if self.state.lock().await.last_streaming_active == Some(active) {
            return Tick::Unchanged;
        }

        // Only record the flag once the MCU has it, so a failed write is retried.
        match self.mcu.send(&protocol::streaming_active_command(active)).await {
            Ok(()) => {
                info!("Updated MCU streaming_active={}", u8::from(active));
                self.state.lock().await.last_streaming_active = Some(active);
                Tick::Sent(active)
            }
            Err(e) => {
                warn!("Failed to send streaming state to MCU: {}", e);
                Tick::Unchanged
            }
        }
    }
}

/// Background task running [`Reconciler::tick`] on a fixed interval.
pub struct StreamingMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: SharedState,
}

impl StreamingMonitor {
    pub fn start(mut reconciler: Reconciler, poll_interval: Duration) -> Self {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let cancel = CancellationToken::new();
        let state = Arc::clone(&reconciler.state);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Streaming monitor started (interval {:?})", poll_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = reconciler.tick() => {}
                }
            }
            debug!("Streaming monitor stopped");
        });

        Self {
            cancel,
            task,
            state,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel, wait briefly for the task, and forget the last flag sent so
    /// the next monitor re-announces it.
    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, self.task).await.is_err() {
            warn!("Streaming monitor did not stop within {:?}", STOP_TIMEOUT);
        }
        self.state.lock().await.last_streaming_active = None;
    }
}
