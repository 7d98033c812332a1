//! Button events → playback commands.

use crate::backend::{self, Playback};
use mynd_proto::protocol::{
    InputState, BUTTON_BT, BUTTON_MINUS, BUTTON_PLAY, BUTTON_PLUS, BUTTON_POWER,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    VolumeUp,
    VolumeDown,
    TogglePlayPause,
    Next,
    Previous,
    /// Reserved; logged only.
    Bluetooth,
    /// Reserved; logged only.
    Power,
}

impl ButtonAction {
    fn command(self) -> Option<&'static str> {
        match self {
            ButtonAction::VolumeUp => Some(backend::CMD_VOLUME_UP),
            ButtonAction::VolumeDown => Some(backend::CMD_VOLUME_DOWN),
            ButtonAction::TogglePlayPause => Some(backend::CMD_TOGGLE_PLAY_PAUSE),
            ButtonAction::Next => Some(backend::CMD_NEXT),
            ButtonAction::Previous => Some(backend::CMD_PREVIOUS),
            ButtonAction::Bluetooth | ButtonAction::Power => None,
        }
    }
}

/// Buttons in dispatch priority order.
const PRIORITY: [i64; 5] = [BUTTON_PLUS, BUTTON_MINUS, BUTTON_PLAY, BUTTON_BT, BUTTON_POWER];

/// Pick the action for a button bitfield and press phase.  Only the
/// highest-priority held button is considered; if its phase has no mapping
/// the event is dropped, even when another held button would match.
pub fn resolve(bits: i64, phase: InputState) -> Option<ButtonAction> {
    let button = PRIORITY.into_iter().find(|bit| bits & bit != 0)?;
    match (button, phase) {
        (BUTTON_PLUS, InputState::ShortPress | InputState::Hold) => Some(ButtonAction::VolumeUp),
        (BUTTON_MINUS, InputState::ShortPress | InputState::Hold) => Some(ButtonAction::VolumeDown),
        (BUTTON_PLAY, InputState::ShortPress) => Some(ButtonAction::TogglePlayPause),
        (BUTTON_PLAY, InputState::DoubleRelease) => Some(ButtonAction::Next),
        (BUTTON_PLAY, InputState::TripleRelease) => Some(ButtonAction::Previous),
        (BUTTON_BT, InputState::ShortPress) => Some(ButtonAction::Bluetooth),
        (BUTTON_POWER, InputState::ShortPress) => Some(ButtonAction::Power),
        _ => None,
    }
}

/// Handle one `button=<bits>,<phase>` notification.
pub async fn dispatch(playback: &dyn Playback, bits: i64, phase: i64) -> Option<ButtonAction> {
    let input = InputState::from_raw(phase);
    let Some(action) = resolve(bits, input) else {
        debug!("Ignoring button event bits={} phase={:?}", bits, input);
        return None;
    };

    match action.command() {
        Some(command) => match playback.command(command).await {
            Ok(()) => info!("Button {:?} -> {}", action, command),
            Err(e) => warn!("Button {:?} failed: {}", action, e),
        },
        None => debug!("Button {:?} pressed, no action configured", action),
    }
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlayback;
    use mynd_proto::codec::{self, McuMessage};

    #[test]
    fn volume_buttons_repeat_on_hold() {
        assert_eq!(resolve(BUTTON_PLUS, InputState::ShortPress), Some(ButtonAction::VolumeUp));
        assert_eq!(resolve(BUTTON_PLUS, InputState::Hold), Some(ButtonAction::VolumeUp));
        assert_eq!(resolve(BUTTON_MINUS, InputState::Hold), Some(ButtonAction::VolumeDown));
        assert_eq!(resolve(BUTTON_MINUS, InputState::LongPress), None);
    }

    #[test]
    fn play_button_phases() {
        assert_eq!(
            resolve(BUTTON_PLAY, InputState::ShortPress),
            Some(ButtonAction::TogglePlayPause)
        );
        assert_eq!(resolve(BUTTON_PLAY, InputState::DoubleRelease), Some(ButtonAction::Next));
        assert_eq!(resolve(BUTTON_PLAY, InputState::TripleRelease), Some(ButtonAction::Previous));
        assert_eq!(resolve(BUTTON_PLAY, InputState::DoublePress), None);
        assert_eq!(resolve(BUTTON_PLAY, InputState::Unknown(42)), None);
    }

    #[test]
    fn highest_priority_button_wins() {
        assert_eq!(
            resolve(BUTTON_PLUS | BUTTON_PLAY, InputState::ShortPress),
            Some(ButtonAction::VolumeUp)
        );
        // PLUS is held, so PLAY's double-release mapping is never reached
        assert_eq!(resolve(BUTTON_PLUS | BUTTON_PLAY, InputState::DoubleRelease), None);
        assert_eq!(
            resolve(BUTTON_BT | BUTTON_POWER, InputState::ShortPress),
            Some(ButtonAction::Bluetooth)
        );
        assert_eq!(resolve(0, InputState::ShortPress), None);
        assert_eq!(resolve(32, InputState::ShortPress), None);
    }

    #[tokio::test]
    async fn plus_short_press_notification_steps_volume_up() {
        let Some(McuMessage::Notify { key, payload }) = codec::decode("mcu:notify:button=8,0")
        else {
            panic!("button notification did not decode");
        };
        assert_eq!(key, "button");
        let values = payload.list().unwrap();
        let bits = values[0].as_int().unwrap();
        let phase = values[1].as_int().unwrap();

        let playback = FakePlayback::default();
        assert_eq!(dispatch(&playback, bits, phase).await, Some(ButtonAction::VolumeUp));
        assert_eq!(playback.sent(), vec!["set_volume -up 5"]);
    }

    #[tokio::test]
    async fn reserved_buttons_send_nothing() {
        let playback = FakePlayback::default();
        assert_eq!(dispatch(&playback, BUTTON_POWER, 0).await, Some(ButtonAction::Power));
        assert_eq!(dispatch(&playback, BUTTON_BT, 0).await, Some(ButtonAction::Bluetooth));
        assert!(playback.sent().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_is_swallowed() {
        let playback = FakePlayback {
            reject_commands: true,
            ..FakePlayback::default()
        };
        assert_eq!(dispatch(&playback, BUTTON_PLAY, 0).await, Some(ButtonAction::TogglePlayPause));
        assert_eq!(playback.sent(), vec!["toggle_play_pause"]);
    }
}
