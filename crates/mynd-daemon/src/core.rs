//! Wires the serial link, power state machine and playback backend together
//! and owns the daemon's lifetime.

use crate::backend::Playback;
use crate::buttons;
use crate::link::{LinkError, McuLink, MessageHandler, PortOpener, TransportLink};
use crate::power::{self, PowerSettings, PowerStateMachine};
use async_trait::async_trait;
use mynd_proto::codec::{McuMessage, Payload};
use mynd_proto::protocol::{PowerState, RpiStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settle time between starting ingestion and the first MCU init.
const STARTUP_DELAY: Duration = Duration::from_millis(200);
const MAIN_LOOP_TICK: Duration = Duration::from_secs(1);

/// Routes decoded MCU messages.  Runs on the ingestion task only.
pub struct Dispatcher {
    power: Arc<PowerStateMachine>,
    playback: Arc<dyn Playback>,
}

impl Dispatcher {
    pub fn new(power: Arc<PowerStateMachine>, playback: Arc<dyn Playback>) -> Self {
        Self { power, playback }
    }

    async fn handle_notify(&self, key: &str, payload: &Payload) {
        match key {
            "state" => {
                let state = match payload.as_int() {
                    Some(raw) => PowerState::from_raw(raw),
                    None => PowerState::NotNumeric,
                };
                debug!("Power state notification: {} ({:?})", state, payload);
                self.power.handle_power_state(state).await;
            }
            "button" => match payload.list() {
                Some([bits, phase]) => match (bits.as_int(), phase.as_int()) {
                    (Some(bits), Some(phase)) => {
                        buttons::dispatch(self.playback.as_ref(), bits, phase).await;
                    }
                    _ => debug!("Ignoring malformed button event: {:?}", payload),
                },
                _ => debug!("Ignoring button event without exactly two values: {:?}", payload),
            },
            "battery" | "charging" | "aux" | "bfc" => match payload.as_int() {
                Some(value) => self.power.record_telemetry(key, value).await,
                None => debug!("Ignoring non-numeric {} value: {:?}", key, payload),
            },
            _ => debug!("Unhandled notification: {}={:?}", key, payload),
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle_message(&self, message: McuMessage) {
        match message {
            McuMessage::Notify { key, payload } => self.handle_notify(&key, &payload).await,
            McuMessage::Response { id, key, payload } if key == "bfc" => {
                debug!("Response {}: bfc={:?}", id, payload);
                if let Some(value) = payload.as_int() {
                    self.power.record_telemetry("bfc", value).await;
                }
            }
            McuMessage::Response { id, key, payload } => {
                debug!("Response {}: {}={:?}", id, key, payload);
            }
            McuMessage::ErrorResponse { id, message } => {
                warn!("MCU error response for request {}: {}", id, message);
            }
        }
    }

    async fn link_fault(&self) {
        self.power.link_fault().await;
    }
}

pub struct DaemonCore {
    link: TransportLink,
    mcu: Arc<McuLink>,
    power: Arc<PowerStateMachine>,
    dispatcher: Arc<Dispatcher>,
}

impl DaemonCore {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        playback: Arc<dyn Playback>,
        settings: PowerSettings,
    ) -> Self {
        let mcu = Arc::new(McuLink::new());
        let power = Arc::new(PowerStateMachine::new(mcu.clone(), playback.clone(), settings));
        Self {
            link: TransportLink::new(opener, mcu.clone()),
            dispatcher: Arc::new(Dispatcher::new(power.clone(), playback)),
            mcu,
            power,
        }
    }

    #[cfg(test)]
    pub fn power(&self) -> Arc<PowerStateMachine> {
        self.power.clone()
    }

    /// Run until `shutdown` is cancelled.  Fails only when the serial device
    /// cannot be opened at startup.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), LinkError> {
        let DaemonCore {
            mut link,
            mcu,
            power,
            dispatcher,
        } = self;

        link.open().await?;

        let ingest_token = shutdown.child_token();
        let ingestion = tokio::spawn(async move {
            link.run(dispatcher.as_ref(), &ingest_token).await;
            link
        });

        tokio::time::sleep(STARTUP_DELAY).await;
        power.initialize_mcu().await;
        info!("Daemon running");

        while !shutdown.is_cancelled() {
            tokio::time::sleep(MAIN_LOOP_TICK).await;
        }

        info!("Shutting down");
        debug!("State at shutdown: {:?}", power.snapshot().await);
        let link = match ingestion.await {
            Ok(link) => Some(link),
            Err(e) => {
                error!("Ingestion task failed: {}", e);
                None
            }
        };

        let _ = mcu.send_status(RpiStatus::NotReady).await;
        power.stop_streaming_monitor().await;
        power::turn_off_led(&mcu, power.command_gap()).await;
        match link {
            Some(mut link) => link.close(),
            None => {
                mcu.detach();
            }
        }
        info!("Daemon stopped");
        Ok(())
    }
}
