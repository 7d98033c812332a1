//! Power-state machine and shutdown sequencing.
//!
//! The MCU reports the *target* power state; the daemon looks up the action
//! list for that state in [`TRANSITIONS`] and runs it in order.  Shutdown
//! prep and poweroff run as transient tasks; the poweroff task always waits
//! for the prep task before cutting power.

use crate::backend::{self, Playback};
use crate::link::{LinkError, McuLink};
use crate::streaming::{Reconciler, StreamingMonitor};
use anyhow::Context;
use mynd_proto::config::Config;
use mynd_proto::protocol::{self as proto, PowerState, RpiStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Gap after each MCU command in a sequence, so the firmware keeps up.
pub const COMMAND_GAP: Duration = Duration::from_millis(100);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);
pub const POWEROFF_TIMEOUT: Duration = Duration::from_secs(10);
/// Volume applied at init when the backend sits at 0, so the ready chime is audible.
pub const AUDIBLE_DEFAULT_VOLUME: i64 = 5;

/// The single shared daemon record.  Always accessed through [`SharedState`].
#[derive(Debug, Clone, Default)]
pub struct DaemonState {
    pub power_state: PowerState,
    pub mcu_initialized: bool,
    pub poweroff_scheduled: bool,
    pub preparing_shutdown: bool,
    pub charging_active: bool,
    pub aux_jack_connected: bool,
    pub battery_level: i64,
    pub bfc_state: Option<bool>,
    /// Last streaming flag sent to the MCU; owned by the streaming monitor.
    pub last_streaming_active: Option<bool>,
}

pub type SharedState = Arc<Mutex<DaemonState>>;

/// Slot holding the in-flight shutdown-prep task, if any.
type PrepSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Halts the transition when a shutdown prep is already under way.
    EnterShutdownPrep,
    PauseIfPlaying,
    ClearInitialized,
    SpawnShutdownPrep,
    /// Skipped as a duplicate when a poweroff is already scheduled.
    SpawnPoweroff,
    ClearShutdownFlags,
    InitializeMcu,
}

use PowerAction::*;

/// Target state → ordered actions.  States not listed (Transition and
/// anything unrecognized) only get recorded.
pub const TRANSITIONS: [(PowerState, &[PowerAction]); 4] = [
    (
        PowerState::PreOff,
        &[EnterShutdownPrep, PauseIfPlaying, ClearInitialized, SpawnShutdownPrep],
    ),
    (PowerState::Off, &[ClearInitialized, SpawnPoweroff]),
    (PowerState::PreOn, &[ClearShutdownFlags, InitializeMcu]),
    (PowerState::On, &[ClearShutdownFlags, InitializeMcu]),
];

pub fn plan(target: PowerState) -> &'static [PowerAction] {
    TRANSITIONS
        .iter()
        .find(|(state, _)| *state == target)
        .map(|(_, actions)| *actions)
        .unwrap_or(&[])
}

enum Step {
    Done,
    Skipped,
    Halt,
}

pub struct PowerSettings {
    pub poweroff_command: String,
    pub sync_command: String,
    pub poll_interval: Duration,
    pub command_gap: Duration,
}

impl PowerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poweroff_command: config.power.poweroff_command.clone(),
            sync_command: "sync".to_string(),
            poll_interval: config.moode.streaming_poll_interval(),
            command_gap: COMMAND_GAP,
        }
    }
}

pub struct PowerStateMachine {
    state: SharedState,
    mcu: Arc<McuLink>,
    playback: Arc<dyn Playback>,
    settings: PowerSettings,
    shutdown_prep: PrepSlot,
    poweroff: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<StreamingMonitor>>,
    /// Held for a whole MCU init so concurrent requests run it once.
    init_gate: Mutex<()>,
}

impl PowerStateMachine {
    pub fn new(mcu: Arc<McuLink>, playback: Arc<dyn Playback>, settings: PowerSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(DaemonState::default())),
            mcu,
            playback,
            settings,
            shutdown_prep: Arc::new(Mutex::new(None)),
            poweroff: Mutex::new(None),
            monitor: Mutex::new(None),
            init_gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub async fn snapshot(&self) -> DaemonState {
        self.state.lock().await.clone()
    }

    pub fn command_gap(&self) -> Duration {
        self.settings.command_gap
    }

    /// Apply the MCU-reported target state.  Returns the actions that
    /// actually ran, in order.
    pub async fn handle_power_state(&self, target: PowerState) -> Vec<PowerAction> {
        self.state.lock().await.power_state = target;

        let actions = plan(target);
        if actions.is_empty() {
            warn!("Unknown power state received: {}", target);
            return Vec::new();
        }
        info!("Power state {} received", target);

        let mut performed = Vec::with_capacity(actions.len());
        for &action in actions {
            match self.perform(action).await {
                Step::Done => performed.push(action),
                Step::Skipped => {}
                Step::Halt => break,
            }
        }
        performed
    }

    async fn perform(&self, action: PowerAction) -> Step {
        match action {
            EnterShutdownPrep => {
                let mut state = self.state.lock().await;
                if state.preparing_shutdown {
                    debug!("Shutdown preparation already in progress, ignoring PreOff");
                    return Step::Halt;
                }
                state.preparing_shutdown = true;
                info!("PreOff state received - preparing for shutdown");
            }
            PauseIfPlaying => self.pause_if_playing().await,
            ClearInitialized => self.state.lock().await.mcu_initialized = false,
            SpawnShutdownPrep => {
                let task = tokio::spawn(shutdown_prep(
                    self.mcu.clone(),
                    self.settings.sync_command.clone(),
                    self.settings.command_gap,
                ));
                *self.shutdown_prep.lock().await = Some(task);
            }
            SpawnPoweroff => {
                if !self.schedule_poweroff().await {
                    debug!("Power off already scheduled, ignoring duplicate request");
                    return Step::Skipped;
                }
            }
            ClearShutdownFlags => {
                let mut state = self.state.lock().await;
                state.poweroff_scheduled = false;
                state.preparing_shutdown = false;
            }
            InitializeMcu => {
                if !self.initialize_mcu().await {
                    return Step::Skipped;
                }
            }
        }
        Step::Done
    }

    async fn pause_if_playing(&self) {
        if self.playback.playback_state().await.as_deref() != Some("play") {
            debug!("Playback not active, skipping pause");
            return;
        }
        match self.playback.command(backend::CMD_PAUSE).await {
            Ok(()) => info!("Playback paused"),
            Err(e) => warn!("Failed to pause playback: {}", e),
        }
    }

    /// Spawn the poweroff task unless one is already scheduled.
    async fn schedule_poweroff(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.poweroff_scheduled {
                return false;
            }
            state.poweroff_scheduled = true;
        }

        let task = tokio::spawn(poweroff(
            self.mcu.clone(),
            Arc::clone(&self.shutdown_prep),
            self.settings.poweroff_command.clone(),
            self.settings.command_gap,
        ));
        *self.poweroff.lock().await = Some(task);
        true
    }

    /// Bring the MCU into the running configuration unless it already is.
    /// Returns false when skipped.  Failures are reported to the MCU as an
    /// error status and never propagate.
    pub async fn initialize_mcu(&self) -> bool {
        let _gate = self.init_gate.lock().await;
        if self.state.lock().await.mcu_initialized {
            debug!("MCU already initialized");
            return false;
        }

        info!("Initializing MCU: enabling periodic updates and setting LED 2 to Raspberry Pi color");
        if let Err(e) = self.run_init_sequence().await {
            error!("Error during MCU initialization: {}", e);
            let _ = self.mcu.send_status(RpiStatus::Error).await;
        }
        true
    }

    async fn run_init_sequence(&self) -> Result<(), LinkError> {
        for (command, what) in [
            (proto::CMD_SYSTEM_SNAPSHOTS_ON, "periodic system updates"),
            (proto::CMD_BUTTON_EVENTS_ON, "button event forwarding"),
            (proto::CMD_LED_ON, "LED 2 color"),
        ] {
            match self.mcu.send(command).await {
                Ok(()) => info!("Enabled {}", what),
                Err(e) if e.is_transient() => warn!("Failed to enable {}: {}", what, e),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.settings.command_gap).await;
        }

        match self.playback.volume().await {
            Some(0) => {
                info!("Moode volume is 0%, setting to {}%", AUDIBLE_DEFAULT_VOLUME);
                let command = backend::set_volume_command(AUDIBLE_DEFAULT_VOLUME);
                if let Err(e) = self.playback.command(&command).await {
                    warn!("Failed to set Moode volume to {}%: {}", AUDIBLE_DEFAULT_VOLUME, e);
                }
            }
            Some(_) => {}
            None => warn!("Failed to get Moode volume, skipping volume check"),
        }

        self.state.lock().await.mcu_initialized = true;
        info!("MCU initialization complete");

        if let Err(e) = self.mcu.send_status(RpiStatus::Ready).await {
            warn!("Failed to send RPiReady status update: {}", e);
        }
        tokio::time::sleep(self.settings.command_gap).await;

        self.start_streaming_monitor().await;
        Ok(())
    }

    async fn start_streaming_monitor(&self) {
        let mut slot = self.monitor.lock().await;
        if slot.as_ref().is_some_and(StreamingMonitor::is_running) {
            return;
        }
        let reconciler = Reconciler::new(self.state(), self.playback.clone(), self.mcu.clone());
        *slot = Some(StreamingMonitor::start(reconciler, self.settings.poll_interval));
    }

    pub async fn stop_streaming_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.stop().await;
        }
    }

    /// The serial link faulted: the MCU must be initialized again once it
    /// reports On/PreOn over the reopened link.
    pub async fn link_fault(&self) {
        self.state.lock().await.mcu_initialized = false;
        self.stop_streaming_monitor().await;
    }

    /// Mirror one telemetry notification (`battery`, `charging`, `aux`, `bfc`).
    pub async fn record_telemetry(&self, key: &str, value: i64) {
        debug!("System status notification: {}={}", key, value);
        let charging_lost = {
            let mut state = self.state.lock().await;
            match key {
                "battery" => {
                    state.battery_level = value;
                    false
                }
                "charging" => {
                    let active = value != 0;
                    let lost = !active && state.charging_active && !state.mcu_initialized;
                    state.charging_active = active;
                    lost
                }
                "aux" => {
                    state.aux_jack_connected = value != 0;
                    false
                }
                "bfc" => {
                    state.bfc_state = Some(value != 0);
                    false
                }
                _ => false,
            }
        };

        // Best effort only: the MCU may report the unplug too late, or not at all.
        if charging_lost {
            info!("Charging stopped while in standby - powering off");
            if !self.schedule_poweroff().await {
                debug!("Power off already scheduled, ignoring charging loss");
            }
        }
    }

    #[cfg(test)]
    pub async fn join_workers(&self) {
        if let Some(task) = self.poweroff.lock().await.take() {
            task.await.unwrap();
        }
        if let Some(task) = self.shutdown_prep.lock().await.take() {
            task.await.unwrap();
        }
    }
}

/// Turn the status LED off, then give the MCU a moment.
pub async fn turn_off_led(mcu: &McuLink, gap: Duration) {
    match mcu.send(proto::CMD_LED_OFF).await {
        Ok(()) => info!("Turned off LED 2"),
        Err(e) => warn!("Failed to turn off LED 2: {}", e),
    }
    tokio::time::sleep(gap).await;
}

async fn shutdown_prep(mcu: Arc<McuLink>, sync_command: String, gap: Duration) {
    if let Err(e) = run_command(&sync_command, SYNC_TIMEOUT).await {
        error!("Failed to prepare shutdown: {:#}", e);
        return;
    }
    info!("Filesystems synced");
    turn_off_led(&mcu, gap).await;
    info!("Shutdown preparation complete");
}

async fn poweroff(mcu: Arc<McuLink>, prep_slot: PrepSlot, command: String, gap: Duration) {
    // Silence the MCU first; individual failures do not matter here.
    let _ = mcu.send(proto::CMD_SYSTEM_SNAPSHOTS_OFF).await;
    tokio::time::sleep(gap).await;
    let _ = mcu.send(proto::CMD_BUTTON_EVENTS_OFF).await;
    tokio::time::sleep(gap).await;

    // Read the slot only now: a PreOff handled after Off still gets waited on.
    let prep = prep_slot.lock().await.take();
    if let Some(prep) = prep {
        info!("Waiting for shutdown preparation to complete...");
        if let Err(e) = prep.await {
            error!("Shutdown preparation task failed: {}", e);
        }
        info!("Shutdown preparation completed, proceeding with poweroff");
    }
    if let Err(e) = mcu.send(proto::CMD_SHUTDOWN_READY).await {
        warn!("Failed to send shutdown confirmation to MCU: {}", e);
    }

    info!("Power off command received - executing shutdown");
    if let Err(e) = run_command(&command, POWEROFF_TIMEOUT).await {
        error!("Failed to execute poweroff: {:#}", e);
    }
}

/// Run a whitespace-separated command line under a hard timeout.
async fn run_command(command_line: &str, limit: Duration) -> anyhow::Result<()> {
    let mut parts = command_line.split_whitespace();
    let program = parts.next().context("empty command")?;
    let status = tokio::time::timeout(
        limit,
        tokio::process::Command::new(program)
            .args(parts)
            .kill_on_drop(true)
            .status(),
    )
    .await
    .with_context(|| format!("`{}` timed out after {:?}", command_line, limit))?
    .with_context(|| format!("failed to run `{}`", command_line))?;

    if !status.success() {
        anyhow::bail!("`{}` exited with {}", command_line, status);
    }
    Ok(())
}
